use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use crate::exception::Unwind;
use crate::value::{IvarTable, Value};
use crate::{Irep, Symbol, Vm};

/// Arguments passed to a native method, copied out of the caller's window.
#[derive(Debug, Default)]
pub struct Args {
    pub values: Vec<Value>,
    /// The block, or nil.
    pub block: Value,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            block: Value::Nil,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument `n`, or nil when absent.
    pub fn get(&self, n: usize) -> Value {
        self.values.get(n).cloned().unwrap_or_default()
    }
}

pub type NativeFn = fn(&mut Vm, Value, &Args) -> Result<Value, Unwind>;

/// Methods the dispatcher implements itself rather than through a native.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `Proc#call`: enter the block in the dispatch loop.
    CallBlock,
    /// `Class#new`: allocate, then run `initialize`.
    New,
    /// `Object#send`: dispatch on the first argument.
    Send,
}

#[derive(Clone)]
pub enum Method {
    Native(NativeFn),
    Irep(Rc<Irep>),
    Builtin(Builtin),
    Reader(Symbol),
    Writer(Symbol),
    /// Stops lookup, as left by `undef_method`.
    Undefined,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Native(_) => f.write_str("Native"),
            Method::Irep(irep) => write!(f, "Irep({irep:?})"),
            Method::Builtin(b) => write!(f, "Builtin({b:?})"),
            Method::Reader(name) => write!(f, "Reader({name})"),
            Method::Writer(name) => write!(f, "Writer({name})"),
            Method::Undefined => f.write_str("Undefined"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Module,
    /// The metaclass of a class, or the singleton class of one object.
    Singleton,
}

/// What `new` allocates for instances of a class. Subclasses inherit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Object,
    Exception,
    String,
    Array,
    Hash,
    /// Values that only exist as literals or immediates.
    None,
}

/// A class or module.
pub struct RClass {
    name: RefCell<Option<String>>,
    pub kind: ClassKind,
    pub instance_kind: InstanceKind,
    superclass: Option<Rc<RClass>>,
    outer: RefCell<Option<Weak<RClass>>>,
    includes: RefCell<Vec<Rc<RClass>>>,
    methods: RefCell<HashMap<Symbol, Method>>,
    consts: RefCell<HashMap<Symbol, Value>>,
    class_vars: RefCell<HashMap<Symbol, Value>>,
    pub ivars: IvarTable,
    pub(crate) metaclass: RefCell<Option<Rc<RClass>>>,
}

impl RClass {
    pub fn new(
        name: Option<String>,
        kind: ClassKind,
        superclass: Option<Rc<RClass>>,
        instance_kind: InstanceKind,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: RefCell::new(name),
            kind,
            instance_kind,
            superclass,
            outer: RefCell::new(None),
            includes: RefCell::new(Vec::new()),
            methods: RefCell::new(HashMap::new()),
            consts: RefCell::new(HashMap::new()),
            class_vars: RefCell::new(HashMap::new()),
            ivars: IvarTable::default(),
            metaclass: RefCell::new(None),
        })
    }

    /// A subclass of `superclass` inheriting its instance kind.
    pub fn subclass(name: Option<String>, superclass: &Rc<RClass>) -> Rc<Self> {
        Self::new(name, ClassKind::Class, Some(superclass.clone()), superclass.instance_kind)
    }

    pub fn module(name: Option<String>) -> Rc<Self> {
        Self::new(name, ClassKind::Module, None, InstanceKind::None)
    }

    pub fn name(&self) -> String {
        match &*self.name.borrow() {
            Some(name) => name.clone(),
            None => match self.kind {
                ClassKind::Module => "#<Module>".into(),
                _ => "#<Class>".into(),
            },
        }
    }

    pub fn is_named(&self) -> bool {
        self.name.borrow().is_some()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.borrow_mut() = Some(name);
    }

    pub fn is_module(&self) -> bool {
        self.kind == ClassKind::Module
    }

    pub fn superclass(&self) -> Option<&Rc<RClass>> {
        self.superclass.as_ref()
    }

    /// The lexically enclosing class, for nested constant lookup.
    pub fn outer(&self) -> Option<Rc<RClass>> {
        self.outer.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_outer(&self, outer: &Rc<RClass>) {
        *self.outer.borrow_mut() = Some(Rc::downgrade(outer));
    }

    pub fn define_method(&self, name: Symbol, method: Method) {
        self.methods.borrow_mut().insert(name, method);
    }

    pub fn own_method(&self, name: Symbol) -> Option<Method> {
        self.methods.borrow().get(&name).cloned()
    }

    pub fn method_names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self
            .methods
            .borrow()
            .iter()
            .filter(|(_, m)| !matches!(m, Method::Undefined))
            .map(|(n, _)| *n)
            .collect();
        names.sort();
        names
    }

    /// Mix `module` in. Re-including is a no-op.
    pub fn include(&self, module: &Rc<RClass>) {
        let mut includes = self.includes.borrow_mut();
        if !includes.iter().any(|m| Rc::ptr_eq(m, module)) {
            includes.push(module.clone());
        }
    }

    pub fn const_get(&self, name: Symbol) -> Option<Value> {
        self.consts.borrow().get(&name).cloned()
    }

    pub fn const_set(&self, name: Symbol, value: Value) {
        self.consts.borrow_mut().insert(name, value);
    }

    pub fn class_var_get(&self, name: Symbol) -> Option<Value> {
        self.class_vars.borrow().get(&name).cloned()
    }

    pub fn class_var_set(&self, name: Symbol, value: Value) -> bool {
        match self.class_vars.borrow_mut().get_mut(&name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn class_var_define(&self, name: Symbol, value: Value) {
        self.class_vars.borrow_mut().insert(name, value);
    }

    /// Find `name` in this class, its included modules (latest first), and
    /// then its superclasses. Returns the method with the class that owns it.
    pub fn find_method(self: &Rc<Self>, name: Symbol) -> Option<(Method, Rc<RClass>)> {
        let mut cur = Some(self.clone());
        while let Some(class) = cur {
            if let Some(found) = class.find_own_or_included(name) {
                return match found.0 {
                    Method::Undefined => None,
                    _ => Some(found),
                };
            }
            cur = class.superclass.clone();
        }
        None
    }

    fn find_own_or_included(self: &Rc<Self>, name: Symbol) -> Option<(Method, Rc<RClass>)> {
        if let Some(m) = self.own_method(name) {
            return Some((m, self.clone()));
        }
        let includes = self.includes.borrow().clone();
        includes.iter().rev().find_map(|m| m.find_own_or_included(name))
    }

    /// Linearized ancestors: each class followed by its modules, latest
    /// include first.
    pub fn ancestors(self: &Rc<Self>) -> Vec<Rc<RClass>> {
        fn push_with_includes(out: &mut Vec<Rc<RClass>>, class: &Rc<RClass>) {
            out.push(class.clone());
            let includes = class.includes.borrow().clone();
            for m in includes.iter().rev() {
                if !out.iter().any(|c| Rc::ptr_eq(c, m)) {
                    push_with_includes(out, m);
                }
            }
        }
        let mut out = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(class) = cur {
            push_with_includes(&mut out, &class);
            cur = class.superclass.clone();
        }
        out
    }

    /// Look `name` up past `owner` in this class's ancestors, for `super`.
    pub fn find_super_method(
        self: &Rc<Self>,
        owner: &Rc<RClass>,
        name: Symbol,
    ) -> Option<(Method, Rc<RClass>)> {
        let ancestors = self.ancestors();
        let start = ancestors.iter().position(|c| Rc::ptr_eq(c, owner))? + 1;
        for class in &ancestors[start..] {
            match class.own_method(name) {
                Some(Method::Undefined) => return None,
                Some(m) => return Some((m, class.clone())),
                None => {}
            }
        }
        None
    }

    /// Whether `other` is this class or one of its ancestors.
    pub fn inherits(self: &Rc<Self>, other: &Rc<RClass>) -> bool {
        if Rc::ptr_eq(self, other) {
            return true;
        }
        if other.is_module() {
            return self.ancestors().iter().any(|c| Rc::ptr_eq(c, other));
        }
        let mut cur = self.superclass.clone();
        while let Some(class) = cur {
            if Rc::ptr_eq(&class, other) {
                return true;
            }
            cur = class.superclass.clone();
        }
        false
    }

    /// Drop every value this class holds so reference cycles through
    /// constants and variables come apart.
    pub(crate) fn clear_values(&self) {
        self.consts.borrow_mut().clear();
        self.class_vars.borrow_mut().clear();
        self.ivars.clear();
        self.metaclass.borrow_mut().take();
    }

    pub(crate) fn nested_classes(&self) -> Vec<Rc<RClass>> {
        self.consts
            .borrow()
            .values()
            .filter_map(|v| match v {
                Value::Class(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn metaclass(&self) -> Option<Rc<RClass>> {
        self.metaclass.borrow().clone()
    }
}

impl std::fmt::Debug for RClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RClass({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Vm, recv: Value, _: &Args) -> Result<Value, Unwind> {
        Ok(recv)
    }

    fn class(name: &str, superclass: Option<&Rc<RClass>>) -> Rc<RClass> {
        RClass::new(
            Some(name.into()),
            ClassKind::Class,
            superclass.cloned(),
            InstanceKind::Object,
        )
    }

    #[test]
    fn lookup_walks_modules_before_superclass() {
        let name = Symbol::intern("greet");
        let base = class("Base", None);
        base.define_method(name, Method::Reader(Symbol::intern("@base")));
        let mixin = RClass::module(Some("Mixin".into()));
        mixin.define_method(name, Method::Reader(Symbol::intern("@mixin")));
        let derived = class("Derived", Some(&base));
        derived.include(&mixin);

        let (method, owner) = derived.find_method(name).expect("method");
        assert!(Rc::ptr_eq(&owner, &mixin));
        assert!(matches!(method, Method::Reader(s) if s == Symbol::intern("@mixin")));

        let (_, owner) = derived.find_super_method(&mixin, name).expect("super");
        assert!(Rc::ptr_eq(&owner, &base));
        assert!(derived.find_super_method(&base, name).is_none());
    }

    #[test]
    fn latest_include_wins() {
        let name = Symbol::intern("which");
        let a = RClass::module(Some("A".into()));
        a.define_method(name, Method::Native(noop));
        let b = RClass::module(Some("B".into()));
        b.define_method(name, Method::Native(noop));
        let c = class("C", None);
        c.include(&a);
        c.include(&b);
        c.include(&a);

        let (_, owner) = c.find_method(name).expect("method");
        assert!(Rc::ptr_eq(&owner, &b));
        let names: Vec<String> = c.ancestors().iter().map(|k| k.name()).collect();
        assert_eq!(names, ["C", "B", "A"]);
    }

    #[test]
    fn undefined_stops_lookup() {
        let name = Symbol::intern("gone");
        let base = class("Base", None);
        base.define_method(name, Method::Native(noop));
        let derived = class("Derived", Some(&base));
        assert!(derived.find_method(name).is_some());
        derived.define_method(name, Method::Undefined);
        assert!(derived.find_method(name).is_none());
        assert!(derived.method_names().is_empty());
    }

    #[test]
    fn inheritance_checks() {
        let base = class("Base", None);
        let derived = class("Derived", Some(&base));
        let mixin = RClass::module(Some("Mixin".into()));
        base.include(&mixin);
        assert!(derived.inherits(&base));
        assert!(derived.inherits(&mixin));
        assert!(!base.inherits(&derived));
        assert_eq!(derived.instance_kind, InstanceKind::Object);
        assert_eq!(RClass::subclass(None, &derived).name(), "#<Class>");
    }

    #[test]
    fn class_variables_need_definition_before_assignment() {
        let c = class("C", None);
        let name = Symbol::intern("@@count");
        assert!(!c.class_var_set(name, Value::Integer(1)));
        c.class_var_define(name, Value::Integer(1));
        assert!(c.class_var_set(name, Value::Integer(2)));
        assert_eq!(c.class_var_get(name), Some(Value::Integer(2)));
    }
}
