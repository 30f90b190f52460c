use std::{
    cell::{Ref, RefCell},
    fmt,
    rc::Rc,
};

use crate::alloc::{AllocError, Allocator, Charge};
use crate::class::RClass;
use crate::exception::Unwind;
use crate::{Irep, Symbol, Vm};

/// A register value.
///
/// Immediate kinds are stored inline; heap kinds hold a reference-counted
/// handle, so overwriting or clearing a register releases its reference.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    True,
    False,
    Integer(i64),
    Float(f64),
    Symbol(Symbol),
    String(Rc<RString>),
    Array(Rc<RArray>),
    Hash(Rc<RHash>),
    Range(Rc<RRange>),
    Class(Rc<RClass>),
    Object(Rc<RInstance>),
    Proc(Rc<RProc>),
    Exception(Rc<RException>),
    /// A return, break or unwinding jump parked by an ensure clause until
    /// the clause finishes. Only ever held by the register an ensure landing
    /// pad reserves.
    Unwind(Rc<Unwind>),
}

impl Value {
    #[inline]
    pub fn bool(b: bool) -> Value {
        if b { Value::True } else { Value::False }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value widened to float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Identity comparison: same immediate, or same heap object.
    pub fn same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::True, Value::True) | (Value::False, Value::False) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Unwind(a), Value::Unwind(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Hash-key equality: like `==` but `1` and `1.0` differ.
    pub fn eql(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => false,
            _ => self == other,
        }
    }

    /// Textual form used by `to_s` and string interpolation.
    pub fn to_s(&self) -> String {
        match self {
            Value::Nil => String::new(),
            Value::String(s) => s.to_string_lossy(),
            Value::Symbol(sym) => sym.name().to_string(),
            Value::Exception(e) => e.message(),
            other => other.inspect(),
        }
    }

    /// Textual form used by `inspect` and `p`.
    pub fn inspect(&self) -> String {
        let mut out = String::new();
        write_inspect(&mut out, self, 0);
        out
    }
}

const INSPECT_DEPTH: usize = 16;

fn write_inspect(out: &mut String, value: &Value, depth: usize) {
    use fmt::Write;
    if depth > INSPECT_DEPTH {
        out.push_str("...");
        return;
    }
    match value {
        Value::Nil => out.push_str("nil"),
        Value::True => out.push_str("true"),
        Value::False => out.push_str("false"),
        Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => out.push_str(&format_float(*f)),
        Value::Symbol(sym) => {
            let _ = write!(out, ":{sym}");
        }
        Value::String(s) => write_quoted(out, &s.bytes()),
        Value::Array(a) => {
            out.push('[');
            for (i, item) in a.items().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_inspect(out, item, depth + 1);
            }
            out.push(']');
        }
        Value::Hash(h) => {
            out.push('{');
            for (i, (k, v)) in h.entries().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_inspect(out, k, depth + 1);
                out.push_str("=>");
                write_inspect(out, v, depth + 1);
            }
            out.push('}');
        }
        Value::Range(r) => {
            write_inspect(out, &r.first, depth + 1);
            out.push_str(if r.exclusive { "..." } else { ".." });
            write_inspect(out, &r.last, depth + 1);
        }
        Value::Class(c) => out.push_str(&c.name()),
        Value::Object(o) => {
            let _ = write!(out, "#<{}>", o.class.name());
        }
        Value::Proc(p) => out.push_str(if p.lambda { "#<Proc (lambda)>" } else { "#<Proc>" }),
        Value::Exception(e) => {
            let _ = write!(out, "#<{}: {}>", e.class.name(), e.message());
        }
        Value::Unwind(_) => out.push_str("#<unwind>"),
    }
}

fn write_quoted(out: &mut String, bytes: &[u8]) {
    use fmt::Write;
    out.push('"');
    for ch in String::from_utf8_lossy(bytes).chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\x1b' => out.push_str("\\e"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".into()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        eq_guarded(self, other, &mut Vec::new())
    }
}

/// Structural equality. `active` holds the container pairs being compared
/// further up; meeting one again compares equal, so self-referencing
/// arrays and hashes terminate.
fn eq_guarded(lhs: &Value, rhs: &Value, active: &mut Vec<(usize, usize)>) -> bool {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
            *a as f64 == *b
        }
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b) || *a.bytes() == *b.bytes(),
        (Value::Array(a), Value::Array(b)) => {
            if Rc::ptr_eq(a, b) {
                return true;
            }
            let pair = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
            if active.contains(&pair) {
                return true;
            }
            active.push(pair);
            let (x, y) = (a.items(), b.items());
            let equal =
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(v, w)| eq_guarded(v, w, active));
            active.pop();
            equal
        }
        (Value::Hash(a), Value::Hash(b)) => {
            if Rc::ptr_eq(a, b) {
                return true;
            }
            let pair = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
            if active.contains(&pair) {
                return true;
            }
            active.push(pair);
            let (x, y) = (a.entries(), b.entries());
            let equal = x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter().any(|(k2, v2)| k.eql(k2) && eq_guarded(v, v2, active))
                });
            active.pop();
            equal
        }
        (Value::Range(a), Value::Range(b)) => {
            a.exclusive == b.exclusive
                && eq_guarded(&a.first, &b.first, active)
                && eq_guarded(&a.last, &b.last, active)
        }
        _ => lhs.same_object(rhs),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<Symbol> for Value {
    fn from(sym: Symbol) -> Self {
        Value::Symbol(sym)
    }
}

/// Instance variables of an object, class or exception.
#[derive(Default)]
pub struct IvarTable(RefCell<Vec<(Symbol, Value)>>);

impl IvarTable {
    pub fn get(&self, name: Symbol) -> Value {
        self.0
            .borrow()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, name: Symbol, value: Value) {
        let mut ivars = self.0.borrow_mut();
        match ivars.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => ivars.push((name, value)),
        }
    }

    pub fn names(&self) -> Vec<Symbol> {
        self.0.borrow().iter().map(|(n, _)| *n).collect()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

pub struct RString {
    bytes: RefCell<Vec<u8>>,
    _charge: Charge,
}

impl RString {
    pub fn new(allocator: &Rc<dyn Allocator>, bytes: Vec<u8>) -> Result<Rc<Self>, AllocError> {
        let charge = Charge::new(allocator, size_of::<Self>() + bytes.len())?;
        Ok(Rc::new(Self {
            bytes: RefCell::new(bytes),
            _charge: charge,
        }))
    }

    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.bytes.borrow()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes.borrow()).into_owned()
    }

    pub fn push_bytes(&self, more: &[u8]) {
        self.bytes.borrow_mut().extend_from_slice(more);
    }

    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RArray {
    items: RefCell<Vec<Value>>,
    _charge: Charge,
}

impl RArray {
    pub fn new(allocator: &Rc<dyn Allocator>, items: Vec<Value>) -> Result<Rc<Self>, AllocError> {
        let bytes = size_of::<Self>() + items.capacity() * size_of::<Value>();
        let charge = Charge::new(allocator, bytes)?;
        Ok(Rc::new(Self {
            items: RefCell::new(items),
            _charge: charge,
        }))
    }

    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    pub fn with_items<T>(&self, f: impl FnOnce(&mut Vec<Value>) -> T) -> T {
        f(&mut self.items.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `idx`, counting from the end when negative.
    pub fn get(&self, idx: i64) -> Value {
        let items = self.items.borrow();
        let idx = if idx < 0 { idx + items.len() as i64 } else { idx };
        if idx < 0 {
            return Value::Nil;
        }
        items.get(idx as usize).cloned().unwrap_or_default()
    }

    /// Store at `idx`, padding with nil. Returns false for a negative index
    /// before the start.
    pub fn set(&self, idx: i64, value: Value) -> bool {
        let mut items = self.items.borrow_mut();
        let idx = if idx < 0 { idx + items.len() as i64 } else { idx };
        if idx < 0 {
            return false;
        }
        let idx = idx as usize;
        if idx >= items.len() {
            items.resize(idx + 1, Value::Nil);
        }
        items[idx] = value;
        true
    }

    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }
}

/// Insertion-ordered hash with linear key search.
pub struct RHash {
    entries: RefCell<Vec<(Value, Value)>>,
    _charge: Charge,
}

impl RHash {
    pub fn new(
        allocator: &Rc<dyn Allocator>,
        entries: Vec<(Value, Value)>,
    ) -> Result<Rc<Self>, AllocError> {
        let bytes = size_of::<Self>() + entries.capacity() * 2 * size_of::<Value>();
        let charge = Charge::new(allocator, bytes)?;
        let hash = Self {
            entries: RefCell::new(Vec::with_capacity(entries.len())),
            _charge: charge,
        };
        for (k, v) in entries {
            hash.insert(k, v);
        }
        Ok(Rc::new(hash))
    }

    pub fn entries(&self) -> Ref<'_, Vec<(Value, Value)>> {
        self.entries.borrow()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| k.eql(key))
            .map(|(_, v)| v.clone())
    }

    pub fn insert(&self, key: Value, value: Value) {
        let mut entries = self.entries.borrow_mut();
        match entries.iter_mut().find(|(k, _)| k.eql(&key)) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn remove(&self, key: &Value) -> Option<Value> {
        let mut entries = self.entries.borrow_mut();
        let idx = entries.iter().position(|(k, _)| k.eql(key))?;
        Some(entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RRange {
    pub first: Value,
    pub last: Value,
    pub exclusive: bool,
    _charge: Charge,
}

impl RRange {
    pub fn new(
        allocator: &Rc<dyn Allocator>,
        first: Value,
        last: Value,
        exclusive: bool,
    ) -> Result<Rc<Self>, AllocError> {
        let charge = Charge::new(allocator, size_of::<Self>())?;
        Ok(Rc::new(Self {
            first,
            last,
            exclusive,
            _charge: charge,
        }))
    }

    /// Integer bounds as a half-open range, when both ends are integers.
    pub fn int_bounds(&self) -> Option<(i64, i64)> {
        let first = self.first.as_int()?;
        let last = self.last.as_int()?;
        Some((first, if self.exclusive { last } else { last.saturating_add(1) }))
    }
}

/// An instance of a user-defined (or `Object`) class.
pub struct RInstance {
    pub class: Rc<RClass>,
    pub ivars: IvarTable,
    pub(crate) singleton: RefCell<Option<Rc<RClass>>>,
    _charge: Option<Charge>,
}

impl RInstance {
    pub fn new(allocator: &Rc<dyn Allocator>, class: Rc<RClass>) -> Result<Rc<Self>, AllocError> {
        let charge = Charge::new(allocator, size_of::<Self>())?;
        Ok(Rc::new(Self {
            class,
            ivars: IvarTable::default(),
            singleton: RefCell::new(None),
            _charge: Some(charge),
        }))
    }

    /// An object outside allocator accounting, such as the top-level self.
    pub(crate) fn unaccounted(class: Rc<RClass>) -> Rc<Self> {
        Rc::new(Self {
            class,
            ivars: IvarTable::default(),
            singleton: RefCell::new(None),
            _charge: None,
        })
    }

    pub fn singleton(&self) -> Option<Rc<RClass>> {
        self.singleton.borrow().clone()
    }
}

/// The frame a block was created in. Blocks reach their free variables by
/// reading that frame's register window while it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Env {
    pub base: usize,
    pub serial: u64,
}

pub struct RProc {
    pub irep: Rc<Irep>,
    pub self_value: Value,
    pub env: Option<Env>,
    /// The proc the creating frame was running, for deeper upvar levels.
    pub outer: Option<Rc<RProc>>,
    /// Serial of the method frame a `return` inside the block leaves.
    pub home: u64,
    pub target_class: Rc<RClass>,
    /// Method the block was written in, for `super` inside blocks.
    pub method: Option<(Symbol, Rc<RClass>)>,
    pub lambda: bool,
    _charge: Charge,
}

pub struct ProcParts {
    pub irep: Rc<Irep>,
    pub self_value: Value,
    pub env: Option<Env>,
    pub outer: Option<Rc<RProc>>,
    pub home: u64,
    pub target_class: Rc<RClass>,
    pub method: Option<(Symbol, Rc<RClass>)>,
    pub lambda: bool,
}

impl RProc {
    pub fn new(allocator: &Rc<dyn Allocator>, parts: ProcParts) -> Result<Rc<Self>, AllocError> {
        let charge = Charge::new(allocator, size_of::<Self>())?;
        Ok(Rc::new(Self {
            irep: parts.irep,
            self_value: parts.self_value,
            env: parts.env,
            outer: parts.outer,
            home: parts.home,
            target_class: parts.target_class,
            method: parts.method,
            lambda: parts.lambda,
            _charge: charge,
        }))
    }

    pub fn parts(&self) -> ProcParts {
        ProcParts {
            irep: self.irep.clone(),
            self_value: self.self_value.clone(),
            env: self.env,
            outer: self.outer.clone(),
            home: self.home,
            target_class: self.target_class.clone(),
            method: self.method.clone(),
            lambda: self.lambda,
        }
    }
}

/// An exception object. Exceptions are not charged to the allocator, so
/// raising `NoMemoryError` cannot itself fail.
pub struct RException {
    pub class: Rc<RClass>,
    message: RefCell<Option<String>>,
    pub ivars: IvarTable,
}

impl RException {
    pub fn new(class: Rc<RClass>, message: Option<String>) -> Rc<Self> {
        Rc::new(Self {
            class,
            message: RefCell::new(message),
            ivars: IvarTable::default(),
        })
    }

    /// The message, or the class name when none was given.
    pub fn message(&self) -> String {
        match &*self.message.borrow() {
            Some(m) => m.clone(),
            None => self.class.name(),
        }
    }

    pub fn set_message(&self, message: Option<String>) {
        *self.message.borrow_mut() = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemAllocator;

    fn allocator() -> Rc<dyn Allocator> {
        Rc::new(SystemAllocator::new())
    }

    fn string(alloc: &Rc<dyn Allocator>, s: &str) -> Value {
        Value::String(RString::new(alloc, s.as_bytes().to_vec()).expect("alloc"))
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::False.is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::True.is_truthy());
    }

    #[test]
    fn numeric_equality_crosses_kinds_but_eql_does_not() {
        assert_eq!(Value::Integer(1), Value::Float(1.0));
        assert!(!Value::Integer(1).eql(&Value::Float(1.0)));
        assert!(Value::Integer(1).eql(&Value::Integer(1)));
    }

    #[test]
    fn strings_compare_by_content_and_identity_separately() {
        let alloc = allocator();
        let a = string(&alloc, "abc");
        let b = string(&alloc, "abc");
        assert_eq!(a, b);
        assert!(!a.same_object(&b));
        assert!(a.same_object(&a.clone()));
    }

    #[test]
    fn self_referencing_containers_compare_without_overflow() {
        let alloc = allocator();
        let a = RArray::new(&alloc, vec![]).expect("alloc");
        a.push(Value::Array(a.clone()));
        let b = RArray::new(&alloc, vec![]).expect("alloc");
        b.push(Value::Array(b.clone()));
        assert_eq!(Value::Array(a.clone()), Value::Array(b.clone()));

        let wrapped = RArray::new(&alloc, vec![Value::Array(a.clone())]).expect("alloc");
        assert_eq!(Value::Array(a.clone()), Value::Array(wrapped));
        let other = RArray::new(&alloc, vec![Value::Integer(1)]).expect("alloc");
        assert_ne!(Value::Array(a.clone()), Value::Array(other));

        let key = Value::Symbol(crate::Symbol::intern("k"));
        let h = RHash::new(&alloc, vec![]).expect("alloc");
        h.insert(key.clone(), Value::Hash(h.clone()));
        let g = RHash::new(&alloc, vec![]).expect("alloc");
        g.insert(key.clone(), Value::Hash(g.clone()));
        assert_eq!(Value::Hash(h.clone()), Value::Hash(g.clone()));

        // Break the cycles so the charges are released.
        a.with_items(|items| items.clear());
        b.with_items(|items| items.clear());
        h.remove(&key);
        g.remove(&key);
    }

    #[test]
    fn inspect_forms() {
        let alloc = allocator();
        let arr = RArray::new(&alloc, vec![
            Value::Integer(1),
            string(&alloc, "a\"b\n"),
            Value::Symbol(Symbol::intern("k")),
            Value::Nil,
            Value::Float(2.0),
        ])
        .expect("alloc");
        assert_eq!(
            Value::Array(arr).inspect(),
            r#"[1, "a\"b\n", :k, nil, 2.0]"#
        );
        let hash = RHash::new(&alloc, vec![(Value::Integer(1), Value::True)]).expect("alloc");
        assert_eq!(Value::Hash(hash).inspect(), "{1=>true}");
        assert_eq!(Value::Float(0.1).inspect(), "0.1");
        assert_eq!(Value::Float(f64::INFINITY).inspect(), "Infinity");
        assert_eq!(Value::Nil.to_s(), "");
    }

    #[test]
    fn hash_keys_replace_in_place() {
        let alloc = allocator();
        let hash = RHash::new(&alloc, Vec::new()).expect("alloc");
        hash.insert(string(&alloc, "a"), Value::Integer(1));
        hash.insert(Value::Integer(2), Value::Integer(2));
        hash.insert(string(&alloc, "a"), Value::Integer(3));
        assert_eq!(hash.len(), 2);
        assert_eq!(hash.get(&string(&alloc, "a")), Some(Value::Integer(3)));
        assert_eq!(hash.get(&Value::Float(2.0)), None);
        assert_eq!(hash.remove(&Value::Integer(2)), Some(Value::Integer(2)));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    fn array_indexing() {
        let alloc = allocator();
        let arr = RArray::new(&alloc, vec![Value::Integer(1), Value::Integer(2)]).expect("alloc");
        assert_eq!(arr.get(-1), Value::Integer(2));
        assert_eq!(arr.get(5), Value::Nil);
        assert!(arr.set(3, Value::True));
        assert_eq!(arr.len(), 4);
        assert_eq!(arr.get(2), Value::Nil);
        assert!(!arr.set(-9, Value::True));
    }

    #[test]
    fn dropping_values_returns_their_bytes() {
        let alloc = allocator();
        let s = string(&alloc, "hello");
        let arr = RArray::new(&alloc, vec![s.clone()]).expect("alloc");
        assert!(alloc.in_use() > 0);
        drop(s);
        drop(arr);
        assert_eq!(alloc.in_use(), 0);
    }
}

impl Vm {
    fn out_of_memory(&self, err: AllocError) -> Unwind {
        self.no_memory_error(err.to_string())
    }

    pub fn new_string(&self, bytes: impl Into<Vec<u8>>) -> Result<Value, Unwind> {
        RString::new(self.system.allocator(), bytes.into())
            .map(Value::String)
            .map_err(|e| self.out_of_memory(e))
    }

    pub fn new_array(&self, items: Vec<Value>) -> Result<Value, Unwind> {
        RArray::new(self.system.allocator(), items)
            .map(Value::Array)
            .map_err(|e| self.out_of_memory(e))
    }

    pub fn new_hash(&self, entries: Vec<(Value, Value)>) -> Result<Value, Unwind> {
        RHash::new(self.system.allocator(), entries)
            .map(Value::Hash)
            .map_err(|e| self.out_of_memory(e))
    }

    pub fn new_range(&self, first: Value, last: Value, exclusive: bool) -> Result<Value, Unwind> {
        RRange::new(self.system.allocator(), first, last, exclusive)
            .map(Value::Range)
            .map_err(|e| self.out_of_memory(e))
    }

    pub fn new_instance(&self, class: Rc<RClass>) -> Result<Value, Unwind> {
        RInstance::new(self.system.allocator(), class)
            .map(Value::Object)
            .map_err(|e| self.out_of_memory(e))
    }

    pub fn new_proc(&self, parts: ProcParts) -> Result<Rc<RProc>, Unwind> {
        RProc::new(self.system.allocator(), parts).map_err(|e| self.out_of_memory(e))
    }
}
