use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Write},
    rc::Rc,
};

use crate::alloc::{Allocator, SystemAllocator};
use crate::class::{ClassKind, InstanceKind, Method, NativeFn, RClass};
use crate::special::{self, Builtins};
use crate::value::Value;
use crate::Symbol;

/// Classes, constants, globals, the allocator and the output sink shared by
/// the VMs of one thread.
pub struct ObjectSystem {
    pub builtins: Builtins,
    globals: RefCell<HashMap<Symbol, Value>>,
    allocator: Rc<dyn Allocator>,
    output: RefCell<Box<dyn Write>>,
}

impl ObjectSystem {
    pub fn new() -> Rc<Self> {
        Self::with(Rc::new(SystemAllocator::new()), Box::new(io::stdout()))
    }

    pub fn with(allocator: Rc<dyn Allocator>, output: Box<dyn Write>) -> Rc<Self> {
        Rc::new(Self {
            builtins: special::bootstrap(),
            globals: RefCell::new(HashMap::new()),
            allocator,
            output: RefCell::new(output),
        })
    }

    pub fn allocator(&self) -> &Rc<dyn Allocator> {
        &self.allocator
    }

    pub fn main(&self) -> Value {
        Value::Object(self.builtins.main.clone())
    }

    pub fn global_get(&self, name: Symbol) -> Value {
        self.globals.borrow().get(&name).cloned().unwrap_or_default()
    }

    pub fn global_set(&self, name: Symbol, value: Value) {
        self.globals.borrow_mut().insert(name, value);
    }

    /// The class named `name` at the top level, if any.
    pub fn class(&self, name: &str) -> Option<Rc<RClass>> {
        self.builtins.lookup(name)
    }

    /// Define (or reopen) a top-level class.
    pub fn define_class(&self, name: &str, superclass: &Rc<RClass>) -> Rc<RClass> {
        if let Some(existing) = self.class(name) {
            return existing;
        }
        let class = RClass::subclass(Some(name.into()), superclass);
        self.builtins
            .object
            .const_set(Symbol::intern(name), Value::Class(class.clone()));
        class
    }

    pub fn define_module(&self, name: &str) -> Rc<RClass> {
        if let Some(existing) = self.class(name) {
            return existing;
        }
        let module = RClass::module(Some(name.into()));
        self.builtins
            .object
            .const_set(Symbol::intern(name), Value::Class(module.clone()));
        module
    }

    /// Register a native instance method.
    pub fn define_native(&self, class: &Rc<RClass>, name: &str, func: NativeFn) {
        class.define_method(Symbol::intern(name), Method::Native(func));
    }

    /// Register a native class method.
    pub fn define_singleton_native(&self, class: &Rc<RClass>, name: &str, func: NativeFn) {
        self.singleton_of_class(class)
            .define_method(Symbol::intern(name), Method::Native(func));
    }

    pub fn singleton_of_class(&self, class: &Rc<RClass>) -> Rc<RClass> {
        special::singleton_of_class(&self.builtins, class)
    }

    /// The singleton class of `value`, created on first use. Immediates and
    /// built-in values have none.
    pub fn singleton_of(&self, value: &Value) -> Option<Rc<RClass>> {
        match value {
            Value::Class(c) => Some(self.singleton_of_class(c)),
            Value::Object(o) => {
                if let Some(s) = o.singleton() {
                    return Some(s);
                }
                let singleton = RClass::new(
                    Some(format!("#<Class:{}>", o.class.name())),
                    ClassKind::Singleton,
                    Some(o.class.clone()),
                    InstanceKind::None,
                );
                *o.singleton.borrow_mut() = Some(singleton.clone());
                Some(singleton)
            }
            _ => None,
        }
    }

    /// The class method lookup starts from: singleton classes included.
    pub fn class_of(&self, value: &Value) -> Rc<RClass> {
        match value {
            Value::Class(c) => self.singleton_of_class(c),
            Value::Object(o) => o.singleton().unwrap_or_else(|| o.class.clone()),
            other => self.real_class_of(other),
        }
    }

    /// The class `value.class` reports.
    pub fn real_class_of(&self, value: &Value) -> Rc<RClass> {
        let b = &self.builtins;
        match value {
            Value::Nil => b.nil.clone(),
            Value::True => b.true_class.clone(),
            Value::False => b.false_class.clone(),
            Value::Integer(_) => b.integer.clone(),
            Value::Float(_) => b.float.clone(),
            Value::Symbol(_) => b.symbol.clone(),
            Value::String(_) => b.string.clone(),
            Value::Array(_) => b.array.clone(),
            Value::Hash(_) => b.hash.clone(),
            Value::Range(_) => b.range.clone(),
            Value::Proc(_) => b.proc_class.clone(),
            Value::Class(c) if c.is_module() => b.module.clone(),
            Value::Class(_) => b.class.clone(),
            Value::Object(o) => o.class.clone(),
            Value::Exception(e) => e.class.clone(),
            Value::Unwind(_) => b.object.clone(),
        }
    }

    /// `value.is_a?(class)`.
    pub fn is_a(&self, value: &Value, class: &Rc<RClass>) -> bool {
        self.class_of(value).inherits(class)
    }

    pub fn write_output(&self, bytes: &[u8]) -> io::Result<()> {
        self.output.borrow_mut().write_all(bytes)
    }

    pub fn flush_output(&self) -> io::Result<()> {
        self.output.borrow_mut().flush()
    }
}

impl Drop for ObjectSystem {
    fn drop(&mut self) {
        let _ = self.output.get_mut().flush();
        self.globals.get_mut().clear();
        self.builtins.main.ivars.clear();
        self.builtins.main.singleton.borrow_mut().take();

        // Constants hold classes and classes hold their enclosing tables, so
        // clear every reachable class.
        let mut seen: Vec<Rc<RClass>> = Vec::new();
        let mut stack = vec![self.builtins.object.clone()];
        while let Some(class) = stack.pop() {
            if seen.iter().any(|c| Rc::ptr_eq(c, &class)) {
                continue;
            }
            stack.extend(class.nested_classes());
            if let Some(meta) = class.metaclass() {
                stack.push(meta);
            }
            seen.push(class);
        }
        for class in &seen {
            class.clear_values();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RString;

    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn classes_of_values() {
        let system = ObjectSystem::new();
        let b = &system.builtins;
        assert!(Rc::ptr_eq(&system.class_of(&Value::Integer(1)), &b.integer));
        assert!(Rc::ptr_eq(&system.real_class_of(&Value::Class(b.kernel.clone())), &b.module));
        let meta = system.class_of(&Value::Class(b.string.clone()));
        assert_eq!(meta.kind, ClassKind::Singleton);
        assert!(system.is_a(&Value::Float(1.5), &b.numeric));
        assert!(!system.is_a(&Value::Nil, &b.numeric));
        assert!(system.singleton_of(&Value::Integer(3)).is_none());
    }

    #[test]
    fn object_singletons_shadow_their_class() {
        let system = ObjectSystem::new();
        let main = system.main();
        let singleton = system.singleton_of(&main).expect("singleton");
        assert!(Rc::ptr_eq(&system.class_of(&main), &singleton));
        assert!(Rc::ptr_eq(&system.real_class_of(&main), &system.builtins.object));
    }

    #[test]
    fn globals_and_classes() {
        let system = ObjectSystem::new();
        let name = Symbol::intern("$answer");
        assert_eq!(system.global_get(name), Value::Nil);
        system.global_set(name, Value::Integer(42));
        assert_eq!(system.global_get(name), Value::Integer(42));

        let point = system.define_class("Point", &system.builtins.object);
        assert!(Rc::ptr_eq(&system.define_class("Point", &system.builtins.object), &point));
        assert_eq!(system.class("Point").map(|c| c.name()), Some("Point".into()));
    }

    #[test]
    fn output_goes_to_the_sink() {
        let sink = Sink::default();
        let system = ObjectSystem::with(Rc::new(SystemAllocator::new()), Box::new(sink.clone()));
        system.write_output(b"hi\n").expect("write");
        assert_eq!(&*sink.0.borrow(), b"hi\n");
    }

    #[test]
    fn dropping_the_system_releases_global_values() {
        let allocator: Rc<dyn Allocator> = Rc::new(SystemAllocator::new());
        let system = ObjectSystem::with(allocator.clone(), Box::new(io::sink()));
        let s = RString::new(&allocator, b"kept".to_vec()).expect("alloc");
        system.global_set(Symbol::intern("$kept"), Value::String(s));
        system
            .builtins
            .object
            .const_set(Symbol::intern("Kept"), Value::Class(system.builtins.object.clone()));
        assert!(allocator.in_use() > 0);
        drop(system);
        assert_eq!(allocator.in_use(), 0);
    }
}
