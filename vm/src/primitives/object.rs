use std::rc::Rc;

use crate::class::{Args, Method, RClass};
use crate::exception::Unwind;
use crate::primitives::{NativeDesc, arity, type_name};
use crate::value::Value;
use crate::{Symbol, Vm, sym};

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::new("Kernel", "puts", kernel_puts),
        NativeDesc::new("Kernel", "print", kernel_print),
        NativeDesc::new("Kernel", "p", kernel_p),
        NativeDesc::new("Kernel", "raise", kernel_raise),
        NativeDesc::new("Kernel", "lambda", kernel_lambda),
        NativeDesc::new("Kernel", "proc", kernel_proc),
        NativeDesc::new("Kernel", "loop", kernel_loop),
        NativeDesc::new("Kernel", "block_given?", kernel_block_given),
        NativeDesc::new("Kernel", "pass", kernel_pass),
        NativeDesc::new("Kernel", "==", object_eq),
        NativeDesc::new("Kernel", "equal?", object_eq),
        NativeDesc::new("Kernel", "eql?", object_eql),
        NativeDesc::new("Kernel", "===", object_case_eq),
        NativeDesc::new("Kernel", "!=", object_ne),
        NativeDesc::new("Kernel", "!", object_not),
        NativeDesc::new("Kernel", "class", object_class),
        NativeDesc::new("Kernel", "singleton_class", object_singleton_class),
        NativeDesc::new("Kernel", "is_a?", object_is_a),
        NativeDesc::new("Kernel", "kind_of?", object_is_a),
        NativeDesc::new("Kernel", "instance_of?", object_instance_of),
        NativeDesc::new("Kernel", "nil?", object_nil),
        NativeDesc::new("Kernel", "respond_to?", object_respond_to),
        NativeDesc::new("Kernel", "to_s", object_to_s),
        NativeDesc::new("Kernel", "inspect", object_inspect),
        NativeDesc::new("Kernel", "object_id", object_id),
        NativeDesc::new("Kernel", "hash", object_id),
        NativeDesc::new("Kernel", "instance_variable_get", object_ivar_get),
        NativeDesc::new("Kernel", "instance_variable_set", object_ivar_set),
        NativeDesc::new("Kernel", "instance_variables", object_ivars),
        NativeDesc::new("Kernel", "freeze", object_itself),
        NativeDesc::new("Kernel", "itself", object_itself),
        NativeDesc::new("Kernel", "frozen?", object_frozen),
        NativeDesc::new("Kernel", "dup", object_dup),
        NativeDesc::new("Kernel", "clone", object_dup),
        NativeDesc::new("NilClass", "nil?", nil_nil),
        NativeDesc::new("NilClass", "to_a", nil_to_a),
        NativeDesc::new("Comparable", "<", comparable_lt),
        NativeDesc::new("Comparable", "<=", comparable_le),
        NativeDesc::new("Comparable", ">", comparable_gt),
        NativeDesc::new("Comparable", ">=", comparable_ge),
        NativeDesc::new("Comparable", "between?", comparable_between),
        NativeDesc::new("Module", "name", module_name),
        NativeDesc::new("Module", "to_s", module_to_s),
        NativeDesc::new("Module", "inspect", module_to_s),
        NativeDesc::new("Module", "===", module_case_eq),
        NativeDesc::new("Module", "include", module_include),
        NativeDesc::new("Module", "include?", module_includes),
        NativeDesc::new("Module", "attr_reader", module_attr_reader),
        NativeDesc::new("Module", "attr_writer", module_attr_writer),
        NativeDesc::new("Module", "attr_accessor", module_attr_accessor),
        NativeDesc::new("Module", "alias_method", module_alias_method),
        NativeDesc::new("Module", "const_get", module_const_get),
        NativeDesc::new("Module", "const_set", module_const_set),
        NativeDesc::new("Module", "const_defined?", module_const_defined),
        NativeDesc::new("Module", "instance_methods", module_instance_methods),
        NativeDesc::new("Module", "method_defined?", module_method_defined),
        NativeDesc::new("Module", "ancestors", module_ancestors),
        NativeDesc::new("Module", "private", module_visibility),
        NativeDesc::new("Module", "public", module_visibility),
        NativeDesc::new("Module", "protected", module_visibility),
        NativeDesc::new("Module", "module_function", module_visibility),
        NativeDesc::new("Class", "superclass", class_superclass),
        NativeDesc::new("Class", "allocate", class_allocate),
        NativeDesc::singleton("Class", "new", class_new),
        NativeDesc::singleton("Module", "new", module_new),
    ]
}

fn write(vm: &Vm, text: &str) -> Result<(), Unwind> {
    vm.system
        .write_output(text.as_bytes())
        .map_err(|e| vm.runtime_error(format!("write failed: {e}")))
}

fn puts_lines(vm: &mut Vm, value: &Value, out: &mut String, depth: usize) -> Result<(), Unwind> {
    match value {
        Value::Array(arr) if depth < 16 => {
            let items = arr.items().clone();
            if items.is_empty() && depth == 0 {
                out.push('\n');
            }
            for item in &items {
                puts_lines(vm, item, out, depth + 1)?;
            }
        }
        other => {
            let text = vm.to_s_value(other)?;
            out.push_str(&text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    Ok(())
}

pub fn kernel_puts(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let mut out = String::new();
    if args.is_empty() {
        out.push('\n');
    }
    for arg in &args.values {
        puts_lines(vm, arg, &mut out, 0)?;
    }
    write(vm, &out)?;
    Ok(Value::Nil)
}

pub fn kernel_print(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let mut out = String::new();
    for arg in &args.values {
        out.push_str(&vm.to_s_value(arg)?);
    }
    write(vm, &out)?;
    Ok(Value::Nil)
}

pub fn kernel_p(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let mut out = String::new();
    for arg in &args.values {
        out.push_str(&vm.inspect_value(arg)?);
        out.push('\n');
    }
    write(vm, &out)?;
    Ok(match args.len() {
        0 => Value::Nil,
        1 => args.get(0),
        _ => vm.new_array(args.values.clone())?,
    })
}

pub fn kernel_raise(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 2)?;
    let message = match args.get(1) {
        Value::Nil => None,
        m => Some(vm.to_s_value(&m)?),
    };
    Err(vm.make_exception(args.get(0), message))
}

fn block_proc(vm: &Vm, args: &Args) -> Result<Rc<crate::RProc>, Unwind> {
    match &args.block {
        Value::Proc(p) => Ok(p.clone()),
        _ => Err(vm.argument_error("tried to create Proc object without a block")),
    }
}

pub fn kernel_lambda(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let block = block_proc(vm, args)?;
    if block.lambda {
        return Ok(Value::Proc(block));
    }
    let mut parts = block.parts();
    parts.lambda = true;
    Ok(Value::Proc(vm.new_proc(parts)?))
}

pub fn kernel_proc(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    block_proc(vm, args).map(Value::Proc)
}

/// Repeat the block until it breaks or raises `StopIteration`.
pub fn kernel_loop(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    loop {
        match vm.yield_block(&args.block, &[]) {
            Ok(_) => {}
            Err(Unwind::Raise(e)) if e.class.inherits(&vm.system.builtins.stop_iteration) => {
                return Ok(e.ivars.get(Symbol::intern("result")));
            }
            Err(other) => return Err(other),
        }
    }
}

pub fn kernel_block_given(vm: &mut Vm, _receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(vm.frames.last().is_some_and(|f| !f.block.is_nil())))
}

/// Give up the rest of this time slice.
pub fn kernel_pass(vm: &mut Vm, _receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    vm.request_preemption();
    Ok(Value::Nil)
}

pub fn object_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(receiver.same_object(&args.get(0))))
}

pub fn object_eql(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(receiver.eql(&args.get(0))))
}

pub fn object_case_eq(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let eq = vm.funcall(receiver, sym::EQ, &[args.get(0)], Value::Nil)?;
    Ok(Value::bool(eq.is_truthy()))
}

pub fn object_ne(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let eq = vm.funcall(receiver, sym::EQ, &[args.get(0)], Value::Nil)?;
    Ok(Value::bool(!eq.is_truthy()))
}

pub fn object_not(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(!receiver.is_truthy()))
}

pub fn object_class(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::Class(vm.system.real_class_of(&receiver)))
}

pub fn object_singleton_class(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    vm.system
        .singleton_of(&receiver)
        .map(Value::Class)
        .ok_or_else(|| vm.type_error("can't define singleton"))
}

fn class_arg(vm: &Vm, args: &Args) -> Result<Rc<RClass>, Unwind> {
    arity(vm, args, 1, 1)?;
    match args.get(0) {
        Value::Class(c) => Ok(c),
        _ => Err(vm.type_error("class or module required")),
    }
}

pub fn object_is_a(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let class = class_arg(vm, args)?;
    Ok(Value::bool(vm.system.is_a(&receiver, &class)))
}

pub fn object_instance_of(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let class = class_arg(vm, args)?;
    Ok(Value::bool(Rc::ptr_eq(&vm.system.real_class_of(&receiver), &class)))
}

pub fn object_nil(_vm: &mut Vm, _receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::False)
}

/// A symbol or string argument as a symbol.
pub(crate) fn name_arg(vm: &Vm, v: &Value) -> Result<Symbol, Unwind> {
    match v {
        Value::Symbol(s) => Ok(*s),
        Value::String(s) => Ok(Symbol::intern(&s.to_string_lossy())),
        other => Err(vm.type_error(format!("{} is not a symbol nor a string", other.inspect()))),
    }
}

pub fn object_respond_to(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 2)?;
    let name = name_arg(vm, &args.get(0))?;
    let found = vm.system.class_of(&receiver).find_method(name);
    Ok(Value::bool(found.is_some()))
}

pub fn object_to_s(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let text = match &receiver {
        Value::Object(o) if Rc::ptr_eq(o, &vm.system.builtins.main) => "main".to_string(),
        other => other.to_s(),
    };
    vm.new_string(text)
}

pub fn object_inspect(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let text = match &receiver {
        Value::Object(o) if Rc::ptr_eq(o, &vm.system.builtins.main) => "main".to_string(),
        Value::Object(o) => {
            let names = o.ivars.names();
            if names.is_empty() {
                receiver.inspect()
            } else {
                let mut fields = Vec::with_capacity(names.len());
                for name in names {
                    let v = o.ivars.get(name);
                    fields.push(format!("{name}={}", vm.inspect_value(&v)?));
                }
                format!("#<{} {}>", o.class.name(), fields.join(", "))
            }
        }
        other => other.inspect(),
    };
    vm.new_string(text)
}

pub fn object_id(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let id = match &receiver {
        Value::Nil => 8,
        Value::True => 20,
        Value::False => 0,
        Value::Integer(i) => i.wrapping_mul(2).wrapping_add(1),
        Value::Float(f) => f.to_bits() as i64,
        Value::Symbol(s) => (s.id() as i64) << 8 | 0xc,
        Value::String(r) => Rc::as_ptr(r) as usize as i64,
        Value::Array(r) => Rc::as_ptr(r) as usize as i64,
        Value::Hash(r) => Rc::as_ptr(r) as usize as i64,
        Value::Range(r) => Rc::as_ptr(r) as usize as i64,
        Value::Class(r) => Rc::as_ptr(r) as usize as i64,
        Value::Object(r) => Rc::as_ptr(r) as usize as i64,
        Value::Proc(r) => Rc::as_ptr(r) as usize as i64,
        Value::Exception(r) => Rc::as_ptr(r) as usize as i64,
        Value::Unwind(r) => Rc::as_ptr(r) as usize as i64,
    };
    Ok(Value::Integer(id))
}

fn ivar_name(vm: &Vm, v: &Value) -> Result<Symbol, Unwind> {
    let name = name_arg(vm, v)?;
    if !name.name().starts_with('@') {
        return Err(vm.name_error(format!("'{name}' is not allowed as an instance variable name")));
    }
    Ok(name)
}

pub fn object_ivar_get(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let name = ivar_name(vm, &args.get(0))?;
    Ok(vm.ivar_get(&receiver, name))
}

pub fn object_ivar_set(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 2)?;
    let name = ivar_name(vm, &args.get(0))?;
    let value = args.get(1);
    vm.ivar_set(&receiver, name, value.clone())?;
    Ok(value)
}

pub fn object_ivars(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let names = match &receiver {
        Value::Object(o) => o.ivars.names(),
        Value::Class(c) => c.ivars.names(),
        Value::Exception(e) => e.ivars.names(),
        _ => Vec::new(),
    };
    vm.new_array(names.into_iter().map(Value::Symbol).collect())
}

pub fn object_itself(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver)
}

pub fn object_frozen(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(!matches!(
        receiver,
        Value::String(_) | Value::Array(_) | Value::Hash(_) | Value::Object(_)
    )))
}

/// A shallow copy.
pub fn object_dup(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    match &receiver {
        Value::String(s) => vm.new_string(s.bytes().clone()),
        Value::Array(a) => vm.new_array(a.items().clone()),
        Value::Hash(h) => vm.new_hash(h.entries().clone()),
        Value::Object(o) => {
            let copy = vm.new_instance(o.class.clone())?;
            if let Value::Object(c) = &copy {
                for name in o.ivars.names() {
                    c.ivars.set(name, o.ivars.get(name));
                }
            }
            Ok(copy)
        }
        _ => Ok(receiver),
    }
}

pub fn nil_nil(_vm: &mut Vm, _receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::True)
}

pub fn nil_to_a(vm: &mut Vm, _receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    vm.new_array(Vec::new())
}

/// `receiver <=> other` as an ordering, raising when they don't compare.
fn spaceship(vm: &mut Vm, receiver: &Value, other: &Value) -> Result<i64, Unwind> {
    let cmp = vm.funcall(receiver.clone(), sym::CMP, &[other.clone()], Value::Nil)?;
    match cmp {
        Value::Integer(i) => Ok(i.signum()),
        _ => Err(vm.argument_error(format!(
            "comparison of {} with {} failed",
            type_name(vm, receiver),
            type_name(vm, other)
        ))),
    }
}

fn comparable(vm: &mut Vm, receiver: &Value, args: &Args, test: fn(i64) -> bool) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let ord = spaceship(vm, receiver, &args.get(0))?;
    Ok(Value::bool(test(ord)))
}

pub fn comparable_lt(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    comparable(vm, &receiver, args, |o| o < 0)
}

pub fn comparable_le(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    comparable(vm, &receiver, args, |o| o <= 0)
}

pub fn comparable_gt(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    comparable(vm, &receiver, args, |o| o > 0)
}

pub fn comparable_ge(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    comparable(vm, &receiver, args, |o| o >= 0)
}

pub fn comparable_between(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 2)?;
    let low = spaceship(vm, &receiver, &args.get(0))?;
    let high = spaceship(vm, &receiver, &args.get(1))?;
    Ok(Value::bool(low >= 0 && high <= 0))
}

fn receiver_class(vm: &Vm, receiver: &Value) -> Result<Rc<RClass>, Unwind> {
    match receiver {
        Value::Class(c) => Ok(c.clone()),
        other => Err(vm.type_error(format!("{} is not a class/module", other.inspect()))),
    }
}

pub fn module_name(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    match class.is_named() {
        true => vm.new_string(class.name()),
        false => Ok(Value::Nil),
    }
}

pub fn module_to_s(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    vm.new_string(class.name())
}

pub fn module_case_eq(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    Ok(Value::bool(vm.system.is_a(&args.get(0), &class)))
}

pub fn module_include(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    for arg in &args.values {
        match arg {
            Value::Class(m) if m.is_module() => class.include(m),
            other => {
                return Err(vm.type_error(format!(
                    "wrong argument type {} (expected Module)",
                    type_name(vm, other)
                )));
            }
        }
    }
    Ok(receiver)
}

pub fn module_includes(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    let module = class_arg(vm, args)?;
    Ok(Value::bool(
        module.is_module() && !Rc::ptr_eq(&class, &module) && class.inherits(&module),
    ))
}

fn define_attrs(vm: &Vm, receiver: &Value, args: &Args, reader: bool, writer: bool) -> Result<Value, Unwind> {
    let class = receiver_class(vm, receiver)?;
    let mut defined = Vec::new();
    for arg in &args.values {
        let name = name_arg(vm, arg)?;
        let ivar = Symbol::intern(&format!("@{name}"));
        if reader {
            class.define_method(name, Method::Reader(ivar));
            defined.push(Value::Symbol(name));
        }
        if writer {
            let setter = Symbol::intern(&format!("{name}="));
            class.define_method(setter, Method::Writer(ivar));
            defined.push(Value::Symbol(setter));
        }
    }
    vm.new_array(defined)
}

pub fn module_attr_reader(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    define_attrs(vm, &receiver, args, true, false)
}

pub fn module_attr_writer(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    define_attrs(vm, &receiver, args, false, true)
}

pub fn module_attr_accessor(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    define_attrs(vm, &receiver, args, true, true)
}

pub fn module_alias_method(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 2)?;
    let class = receiver_class(vm, &receiver)?;
    let new = name_arg(vm, &args.get(0))?;
    let old = name_arg(vm, &args.get(1))?;
    vm.alias_method(&class, new, old)?;
    Ok(Value::Symbol(new))
}

pub fn module_const_get(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let class = receiver_class(vm, &receiver)?;
    let name = name_arg(vm, &args.get(0))?;
    class
        .ancestors()
        .iter()
        .find_map(|c| c.const_get(name))
        .or_else(|| vm.system.builtins.object.const_get(name))
        .ok_or_else(|| vm.name_error(format!("uninitialized constant {name}")))
}

pub fn module_const_set(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 2)?;
    let class = receiver_class(vm, &receiver)?;
    let name = name_arg(vm, &args.get(0))?;
    let value = args.get(1);
    class.const_set(name, value.clone());
    Ok(value)
}

pub fn module_const_defined(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let class = receiver_class(vm, &receiver)?;
    let name = name_arg(vm, &args.get(0))?;
    Ok(Value::bool(class.ancestors().iter().any(|c| c.const_get(name).is_some())))
}

pub fn module_instance_methods(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let class = receiver_class(vm, &receiver)?;
    let inherited = args.is_empty() || args.get(0).is_truthy();
    let mut names: Vec<Symbol> = Vec::new();
    let scope = if inherited { class.ancestors() } else { vec![class] };
    for c in scope {
        for name in c.method_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    vm.new_array(names.into_iter().map(Value::Symbol).collect())
}

pub fn module_method_defined(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let class = receiver_class(vm, &receiver)?;
    let name = name_arg(vm, &args.get(0))?;
    Ok(Value::bool(class.find_method(name).is_some()))
}

pub fn module_ancestors(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    vm.new_array(class.ancestors().into_iter().map(Value::Class).collect())
}

/// Visibility is not tracked; every method is public.
pub fn module_visibility(_vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    Ok(args.get(0))
}

pub fn class_superclass(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    Ok(class.superclass().cloned().map_or(Value::Nil, Value::Class))
}

pub fn class_allocate(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let class = receiver_class(vm, &receiver)?;
    vm.new_instance(class)
}

/// Run `block` with `self` and the definition target set to `class`.
fn class_exec(vm: &mut Vm, class: &Rc<RClass>, block: &Value) -> Result<(), Unwind> {
    let Value::Proc(p) = block else {
        return Ok(());
    };
    let mut parts = p.parts();
    parts.self_value = Value::Class(class.clone());
    parts.target_class = class.clone();
    let body = Value::Proc(vm.new_proc(parts)?);
    vm.yield_block(&body, &[Value::Class(class.clone())])?;
    Ok(())
}

/// `Class.new(superclass = Object) { body }`: an anonymous class.
pub fn class_new(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let superclass = match args.get(0) {
        Value::Nil => vm.system.builtins.object.clone(),
        Value::Class(c) if !c.is_module() => c,
        other => {
            return Err(vm.type_error(format!(
                "superclass must be a Class ({} given)",
                type_name(vm, &other)
            )));
        }
    };
    let class = RClass::subclass(None, &superclass);
    class_exec(vm, &class, &args.block)?;
    Ok(Value::Class(class))
}

pub fn module_new(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let module = RClass::module(None);
    class_exec(vm, &module, &args.block)?;
    Ok(Value::Class(module))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;

    #[test]
    fn attr_accessor_defines_both_halves() {
        let mut vm = Vm::open(VmConfig::default());
        let point = vm.system.define_class("AttrPoint", &vm.system.builtins.object.clone());
        let args = Args::new(vec![Value::Symbol(Symbol::intern("x"))]);
        let defined = module_attr_accessor(&mut vm, Value::Class(point.clone()), &args).expect("attrs");
        assert_eq!(defined.inspect(), "[:x, :x=]");
        assert!(matches!(point.own_method(Symbol::intern("x")), Some(Method::Reader(_))));
        assert!(matches!(point.own_method(Symbol::intern("x=")), Some(Method::Writer(_))));
    }

    #[test]
    fn raise_builds_exceptions() {
        let mut vm = Vm::open(VmConfig::default());
        let msg = vm.new_string("boom").expect("alloc");
        let err = kernel_raise(&mut vm, Value::Nil, &Args::new(vec![msg])).expect_err("raises");
        let e = err.exception().expect("exception");
        assert_eq!((e.class.name(), e.message()), ("RuntimeError".into(), "boom".into()));

        let class = Value::Class(vm.system.builtins.argument_error.clone());
        let msg = vm.new_string("bad").expect("alloc");
        let err = kernel_raise(&mut vm, Value::Nil, &Args::new(vec![class, msg])).expect_err("raises");
        assert_eq!(err.exception().map(|e| e.class.name()), Some("ArgumentError".into()));
    }

    #[test]
    fn identity_and_class_queries() {
        let mut vm = Vm::open(VmConfig::default());
        let one = Args::new(vec![Value::Integer(1)]);
        assert_eq!(object_eq(&mut vm, Value::Integer(1), &one).ok(), Some(Value::True));
        let numeric = Args::new(vec![Value::Class(vm.system.builtins.numeric.clone())]);
        assert_eq!(object_is_a(&mut vm, Value::Integer(1), &numeric).ok(), Some(Value::True));
        assert_eq!(object_instance_of(&mut vm, Value::Integer(1), &numeric).ok(), Some(Value::False));
        let main = vm.system.main();
        assert_eq!(object_to_s(&mut vm, main, &Args::default()).map(|v| v.to_s()).ok(), Some("main".into()));
    }

    #[test]
    fn anonymous_classes_take_their_constant_name() {
        let mut vm = Vm::open(VmConfig::default());
        let class = class_new(&mut vm, Value::Nil, &Args::default()).expect("class");
        let Value::Class(c) = &class else { panic!("not a class") };
        assert!(!c.is_named());
        assert_eq!(module_name(&mut vm, class.clone(), &Args::default()).ok(), Some(Value::Nil));
    }
}
