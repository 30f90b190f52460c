use std::rc::Rc;

use crate::class::{Builtin, ClassKind, InstanceKind, Method, RClass};
use crate::primitives::{self, NativeDesc};
use crate::value::{RInstance, Value};
use crate::Symbol;

/// The classes the runtime itself needs to name.
pub struct Builtins {
    pub basic_object: Rc<RClass>,
    pub object: Rc<RClass>,
    pub module: Rc<RClass>,
    pub class: Rc<RClass>,
    pub kernel: Rc<RClass>,
    pub comparable: Rc<RClass>,
    pub nil: Rc<RClass>,
    pub true_class: Rc<RClass>,
    pub false_class: Rc<RClass>,
    pub numeric: Rc<RClass>,
    pub integer: Rc<RClass>,
    pub float: Rc<RClass>,
    pub symbol: Rc<RClass>,
    pub string: Rc<RClass>,
    pub array: Rc<RClass>,
    pub hash: Rc<RClass>,
    pub range: Rc<RClass>,
    pub proc_class: Rc<RClass>,
    pub exception: Rc<RClass>,
    pub standard_error: Rc<RClass>,
    pub runtime_error: Rc<RClass>,
    pub script_error: Rc<RClass>,
    pub not_implemented_error: Rc<RClass>,
    pub argument_error: Rc<RClass>,
    pub index_error: Rc<RClass>,
    pub key_error: Rc<RClass>,
    pub range_error: Rc<RClass>,
    pub type_error: Rc<RClass>,
    pub name_error: Rc<RClass>,
    pub no_method_error: Rc<RClass>,
    pub zero_division_error: Rc<RClass>,
    pub local_jump_error: Rc<RClass>,
    pub stop_iteration: Rc<RClass>,
    pub system_stack_error: Rc<RClass>,
    pub no_memory_error: Rc<RClass>,
    /// The top-level `self`.
    pub main: Rc<RInstance>,
}

impl Builtins {
    pub fn lookup(&self, name: &str) -> Option<Rc<RClass>> {
        match self.object.const_get(Symbol::lookup(name)?)? {
            Value::Class(c) => Some(c),
            _ => None,
        }
    }
}

fn named(object: &Rc<RClass>, class: Rc<RClass>) -> Rc<RClass> {
    object.const_set(Symbol::intern(&class.name()), Value::Class(class.clone()));
    class
}

/// Build the class tree, register every built-in class as a constant of
/// `Object`, and install the default natives.
pub fn bootstrap() -> Builtins {
    // 1. The roots of the hierarchy. Everything else hangs off Object.
    let basic_object = RClass::new(
        Some("BasicObject".into()),
        ClassKind::Class,
        None,
        InstanceKind::Object,
    );
    let object = RClass::subclass(Some("Object".into()), &basic_object);
    let module = RClass::new(
        Some("Module".into()),
        ClassKind::Class,
        Some(object.clone()),
        InstanceKind::None,
    );
    let class = RClass::new(
        Some("Class".into()),
        ClassKind::Class,
        Some(module.clone()),
        InstanceKind::None,
    );
    for c in [&basic_object, &object, &module, &class] {
        object.const_set(Symbol::intern(&c.name()), Value::Class(c.clone()));
    }

    let kernel = named(&object, RClass::module(Some("Kernel".into())));
    object.include(&kernel);
    let comparable = named(&object, RClass::module(Some("Comparable".into())));

    // 2. Value classes. Instances only come from literals and immediates.
    let value_class = |name: &str, superclass: &Rc<RClass>, kind: InstanceKind| {
        named(
            &object,
            RClass::new(Some(name.into()), ClassKind::Class, Some(superclass.clone()), kind),
        )
    };
    let nil = value_class("NilClass", &object, InstanceKind::None);
    let true_class = value_class("TrueClass", &object, InstanceKind::None);
    let false_class = value_class("FalseClass", &object, InstanceKind::None);
    let numeric = value_class("Numeric", &object, InstanceKind::None);
    numeric.include(&comparable);
    let integer = value_class("Integer", &numeric, InstanceKind::None);
    let float = value_class("Float", &numeric, InstanceKind::None);
    let symbol = value_class("Symbol", &object, InstanceKind::None);
    let string = value_class("String", &object, InstanceKind::String);
    string.include(&comparable);
    let array = value_class("Array", &object, InstanceKind::Array);
    let hash = value_class("Hash", &object, InstanceKind::Hash);
    let range = value_class("Range", &object, InstanceKind::None);
    let proc_class = value_class("Proc", &object, InstanceKind::None);

    // 3. Exceptions.
    let exception = value_class("Exception", &object, InstanceKind::Exception);
    let error = |name: &str, superclass: &Rc<RClass>| {
        named(&object, RClass::subclass(Some(name.into()), superclass))
    };
    let standard_error = error("StandardError", &exception);
    let runtime_error = error("RuntimeError", &standard_error);
    let script_error = error("ScriptError", &exception);
    let not_implemented_error = error("NotImplementedError", &script_error);
    let argument_error = error("ArgumentError", &standard_error);
    let index_error = error("IndexError", &standard_error);
    let key_error = error("KeyError", &index_error);
    let stop_iteration = error("StopIteration", &index_error);
    let range_error = error("RangeError", &standard_error);
    let type_error = error("TypeError", &standard_error);
    let name_error = error("NameError", &standard_error);
    let no_method_error = error("NoMethodError", &name_error);
    let zero_division_error = error("ZeroDivisionError", &standard_error);
    let local_jump_error = error("LocalJumpError", &standard_error);
    let system_stack_error = error("SystemStackError", &exception);
    let no_memory_error = error("NoMemoryError", &exception);

    // 4. Methods the dispatcher handles itself.
    class.define_method(Symbol::intern("new"), Method::Builtin(Builtin::New));
    for name in ["call", "[]", "yield", "==="] {
        proc_class.define_method(Symbol::intern(name), Method::Builtin(Builtin::CallBlock));
    }
    for name in ["send", "__send__", "public_send"] {
        kernel.define_method(Symbol::intern(name), Method::Builtin(Builtin::Send));
    }

    let main = RInstance::unaccounted(object.clone());
    let builtins = Builtins {
        basic_object,
        object,
        module,
        class,
        kernel,
        comparable,
        nil,
        true_class,
        false_class,
        numeric,
        integer,
        float,
        symbol,
        string,
        array,
        hash,
        range,
        proc_class,
        exception,
        standard_error,
        runtime_error,
        script_error,
        not_implemented_error,
        argument_error,
        index_error,
        key_error,
        range_error,
        type_error,
        name_error,
        no_method_error,
        zero_division_error,
        local_jump_error,
        stop_iteration,
        system_stack_error,
        no_memory_error,
        main,
    };

    // 5. Natives.
    for desc in primitives::default_natives() {
        install(&builtins, &desc);
    }
    builtins
}

fn install(builtins: &Builtins, desc: &NativeDesc) {
    let Some(class) = builtins.lookup(desc.class) else {
        log::warn!("native {}#{}: no class {}", desc.class, desc.name, desc.class);
        return;
    };
    let target = if desc.singleton {
        singleton_of_class(builtins, &class)
    } else {
        class
    };
    target.define_method(Symbol::intern(desc.name), Method::Native(desc.func));
}

/// The metaclass of `class`, created on first use. Its superclass is the
/// metaclass of the superclass, so class methods are inherited; the chain
/// ends at `Class` (or `Module` for modules).
pub fn singleton_of_class(builtins: &Builtins, class: &Rc<RClass>) -> Rc<RClass> {
    if class.kind == ClassKind::Singleton {
        return builtins.class.clone();
    }
    if let Some(meta) = class.metaclass() {
        return meta;
    }
    let parent = match class.superclass() {
        Some(sup) if !class.is_module() => singleton_of_class(builtins, sup),
        _ if class.is_module() => builtins.module.clone(),
        _ => builtins.class.clone(),
    };
    let meta = RClass::new(
        Some(format!("#<Class:{}>", class.name())),
        ClassKind::Singleton,
        Some(parent),
        InstanceKind::None,
    );
    // Constants seen from class methods resolve through the class.
    meta.set_outer(class);
    *class.metaclass.borrow_mut() = Some(meta.clone());
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_is_wired() {
        let b = bootstrap();
        assert!(b.no_method_error.inherits(&b.name_error));
        assert!(b.key_error.inherits(&b.standard_error));
        assert!(!b.system_stack_error.inherits(&b.standard_error));
        assert!(b.integer.inherits(&b.object));
        assert!(b.object.inherits(&b.kernel));
        assert!(b.class.inherits(&b.module));
        assert_eq!(b.lookup("ZeroDivisionError").map(|c| c.name()), Some("ZeroDivisionError".into()));
        assert!(b.lookup("NoSuchClass").is_none());
    }

    #[test]
    fn metaclasses_follow_superclasses() {
        let b = bootstrap();
        let meta = singleton_of_class(&b, &b.runtime_error);
        let parent = singleton_of_class(&b, &b.standard_error);
        assert!(Rc::ptr_eq(meta.superclass().expect("superclass"), &parent));
        assert!(meta.inherits(&b.class));
        assert!(Rc::ptr_eq(&meta, &singleton_of_class(&b, &b.runtime_error)));
        let kernel_meta = singleton_of_class(&b, &b.kernel);
        assert!(Rc::ptr_eq(kernel_meta.superclass().expect("superclass"), &b.module));
    }

    #[test]
    fn natives_are_installed() {
        let b = bootstrap();
        assert!(b.integer.find_method(Symbol::intern("+")).is_some());
        assert!(b.object.find_method(Symbol::intern("puts")).is_some());
        assert!(matches!(
            b.class.find_method(Symbol::intern("new")),
            Some((Method::Builtin(Builtin::New), _))
        ));
    }
}
