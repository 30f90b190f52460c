use std::rc::Rc;

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::{NativeDesc, arity, type_name};
use crate::value::{RException, Value};
use crate::{Vm, sym};

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::singleton("Exception", "exception", exception_exception),
        NativeDesc::new("Exception", "initialize", exception_initialize),
        NativeDesc::new("Exception", "message", exception_message),
        NativeDesc::new("Exception", "to_s", exception_to_s),
        NativeDesc::new("Exception", "inspect", exception_inspect),
        NativeDesc::new("Exception", "full_message", exception_full_message),
        NativeDesc::new("Exception", "backtrace", exception_backtrace),
        NativeDesc::new("Exception", "==", exception_eq),
    ]
}

fn this(vm: &Vm, receiver: &Value) -> Result<Rc<RException>, Unwind> {
    match receiver {
        Value::Exception(e) => Ok(e.clone()),
        other => Err(vm.type_error(format!("{} is not an exception", type_name(vm, other)))),
    }
}

/// `Exception.exception(*args)` is `new`.
pub fn exception_exception(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    vm.funcall(receiver, sym::NEW, &args.values, Value::Nil)
}

pub fn exception_initialize(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let exc = this(vm, &receiver)?;
    let message = match args.get(0) {
        Value::Nil => None,
        v => Some(vm.to_s_value(&v)?),
    };
    exc.set_message(message);
    Ok(receiver)
}

/// `message` goes through `to_s`, so subclasses overriding `to_s`
/// change it too.
pub fn exception_message(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let text = vm.to_s_value(&receiver)?;
    vm.new_string(text)
}

pub fn exception_to_s(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let text = this(vm, &receiver)?.message();
    vm.new_string(text)
}

pub fn exception_inspect(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let exc = this(vm, &receiver)?;
    let class = exc.class.name();
    let message = vm.to_s_value(&receiver)?;
    let text = match message.is_empty() || message == class {
        true => class,
        false => format!("#<{class}: {message}>"),
    };
    vm.new_string(text)
}

pub fn exception_full_message(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let exc = this(vm, &receiver)?;
    let message = vm.to_s_value(&receiver)?;
    vm.new_string(format!("{message} ({})", exc.class.name()))
}

pub fn exception_backtrace(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    this(vm, &receiver)?;
    Ok(Value::Nil)
}

pub fn exception_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let (Value::Exception(a), Value::Exception(b)) = (&receiver, &args.get(0)) else {
        return Ok(Value::False);
    };
    if Rc::ptr_eq(a, b) {
        return Ok(Value::True);
    }
    Ok(Value::bool(Rc::ptr_eq(&a.class, &b.class) && a.message() == b.message()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;

    #[test]
    fn message_defaults_to_class_name() {
        let mut vm = Vm::open(VmConfig::default());
        let class = vm.system.builtins.argument_error.clone();
        let exc = Value::Exception(RException::new(class, None));
        let msg = exception_message(&mut vm, exc.clone(), &Args::default()).expect("message");
        assert_eq!(msg.to_s(), "ArgumentError");
        let shown = exception_inspect(&mut vm, exc.clone(), &Args::default()).expect("inspect");
        assert_eq!(shown.to_s(), "ArgumentError");

        let text = vm.new_string("bad").expect("alloc");
        exception_initialize(&mut vm, exc.clone(), &Args::new(vec![text])).expect("initialize");
        let shown = exception_inspect(&mut vm, exc.clone(), &Args::default()).expect("inspect");
        assert_eq!(shown.to_s(), "#<ArgumentError: bad>");
        let full = exception_full_message(&mut vm, exc, &Args::default()).expect("full");
        assert_eq!(full.to_s(), "bad (ArgumentError)");
    }
}
