use std::rc::Rc;

use bytecode::{Op, decode_at};

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::{NativeDesc, type_name};
use crate::send::Aspec;
use crate::value::{RProc, Value};
use crate::Vm;

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::singleton("Proc", "new", proc_new),
        NativeDesc::new("Proc", "arity", proc_arity),
        NativeDesc::new("Proc", "lambda?", proc_lambda),
        NativeDesc::new("Proc", "to_proc", proc_to_proc),
    ]
}

fn this(vm: &Vm, receiver: &Value) -> Result<Rc<RProc>, Unwind> {
    match receiver {
        Value::Proc(p) => Ok(p.clone()),
        other => Err(vm.type_error(format!("{} is not a Proc", type_name(vm, other)))),
    }
}

/// `Proc.new { }` hands back the block itself.
pub fn proc_new(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    match &args.block {
        Value::Proc(_) => Ok(args.block.clone()),
        _ => Err(vm.argument_error("tried to create Proc object without a block")),
    }
}

/// Required count, or `-(required + 1)` when more may be passed. Optional
/// parameters only make the arity negative for lambdas, since a plain
/// block ignores extra arguments anyway.
pub(crate) fn arity_of(p: &RProc) -> i64 {
    let Ok((insn, _)) = decode_at(p.irep.code(), 0) else {
        return 0;
    };
    if insn.op != Op::Enter {
        return 0;
    }
    let spec = Aspec::decode(insn.a);
    let required = (spec.required + spec.post) as i64;
    if spec.rest || (p.lambda && spec.optional > 0) {
        -(required + 1)
    } else {
        required
    }
}

pub fn proc_arity(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let p = this(vm, &receiver)?;
    Ok(Value::Integer(arity_of(&p)))
}

pub fn proc_lambda(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(this(vm, &receiver)?.lambda))
}

pub fn proc_to_proc(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    this(vm, &receiver)?;
    Ok(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ProcParts;
    use crate::VmConfig;
    use bytecode::{BytecodeBuilder, ImageWriter, IrepDesc};

    fn block(vm: &Vm, lambda: bool, build: impl FnOnce(&mut BytecodeBuilder)) -> Value {
        let mut b = BytecodeBuilder::new();
        build(&mut b);
        b.ret(1);
        let desc = IrepDesc::new(4, 5, b.into_bytes());
        let irep = crate::load(ImageWriter::new().write(&desc)).expect("load");
        let p = vm
            .new_proc(ProcParts {
                irep,
                self_value: Value::Nil,
                env: None,
                outer: None,
                home: 0,
                target_class: vm.system.builtins.object.clone(),
                method: None,
                lambda,
            })
            .expect("alloc");
        Value::Proc(p)
    }

    fn arity(vm: &mut Vm, p: Value) -> Value {
        proc_arity(vm, p, &Args::default()).expect("arity")
    }

    #[test]
    fn arity_counts_required_parameters() {
        let mut vm = Vm::open(VmConfig::default());
        let two = block(&vm, false, |b| b.enter(2, 0, false));
        assert_eq!(arity(&mut vm, two), Value::Integer(2));

        let rest = block(&vm, false, |b| b.enter(1, 0, true));
        assert_eq!(arity(&mut vm, rest), Value::Integer(-2));

        let bare = block(&vm, false, |_| {});
        assert_eq!(arity(&mut vm, bare), Value::Integer(0));
    }

    #[test]
    fn optional_parameters_only_matter_for_lambdas() {
        let optional = |b: &mut BytecodeBuilder| {
            b.enter(2, 1, false);
            b.op_a(Op::Jmp, 0);
            b.op_a(Op::Jmp, 0);
        };
        let mut vm = Vm::open(VmConfig::default());
        let plain = block(&vm, false, optional);
        assert_eq!(arity(&mut vm, plain), Value::Integer(2));
        let lambda = block(&vm, true, optional);
        assert_eq!(arity(&mut vm, lambda.clone()), Value::Integer(-3));
        assert_eq!(proc_lambda(&mut vm, lambda, &Args::default()).expect("lambda?"), Value::True);
    }

    #[test]
    fn arity_of_a_non_proc_is_a_type_error() {
        let mut vm = Vm::open(VmConfig::default());
        let result = proc_arity(&mut vm, Value::Integer(1), &Args::default());
        assert!(matches!(result, Err(Unwind::Raise(e)) if e.class.name() == "TypeError"));
    }

    #[test]
    fn new_requires_a_block() {
        let mut vm = Vm::open(VmConfig::default());
        let result = proc_new(&mut vm, Value::Nil, &Args::default());
        assert!(matches!(result, Err(Unwind::Raise(e)) if e.class.name() == "ArgumentError"));
    }
}
