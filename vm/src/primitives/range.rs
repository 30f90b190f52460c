use std::{cmp::Ordering, rc::Rc};

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::numeric;
use crate::primitives::{NativeDesc, arity, type_name};
use crate::value::{RRange, Value};
use crate::{Vm, sym};

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::singleton("Range", "new", range_new),
        NativeDesc::new("Range", "first", range_first),
        NativeDesc::new("Range", "begin", range_first),
        NativeDesc::new("Range", "last", range_last),
        NativeDesc::new("Range", "end", range_last),
        NativeDesc::new("Range", "exclude_end?", range_exclude_end),
        NativeDesc::new("Range", "each", range_each),
        NativeDesc::new("Range", "to_a", range_to_a),
        NativeDesc::new("Range", "include?", range_include),
        NativeDesc::new("Range", "member?", range_include),
        NativeDesc::new("Range", "cover?", range_include),
        NativeDesc::new("Range", "===", range_include),
        NativeDesc::new("Range", "size", range_size),
        NativeDesc::new("Range", "count", range_size),
        NativeDesc::new("Range", "inspect", range_inspect),
        NativeDesc::new("Range", "to_s", range_to_s),
        NativeDesc::new("Range", "==", range_eq),
    ]
}

fn this(vm: &Vm, receiver: &Value) -> Result<Rc<RRange>, Unwind> {
    match receiver {
        Value::Range(r) => Ok(r.clone()),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into Range",
            type_name(vm, other)
        ))),
    }
}

/// Integer bounds of `range`, or a `TypeError` naming the start.
fn int_bounds(vm: &Vm, range: &RRange) -> Result<(i64, i64), Unwind> {
    range.int_bounds().ok_or_else(|| {
        vm.type_error(format!("can't iterate from {}", type_name(vm, &range.first)))
    })
}

/// `Range.new(first, last, exclusive = false)`.
pub fn range_new(vm: &mut Vm, _receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 3)?;
    let (first, last) = (args.get(0), args.get(1));
    let comparable = matches!(
        (&first, &last),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Nil, _)
            | (_, Value::Nil)
    );
    if !comparable {
        return Err(vm.argument_error("bad value for range"));
    }
    vm.new_range(first, last, args.get(2).is_truthy())
}

pub fn range_first(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(this(vm, &receiver)?.first.clone())
}

pub fn range_last(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(this(vm, &receiver)?.last.clone())
}

pub fn range_exclude_end(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(this(vm, &receiver)?.exclusive))
}

pub fn range_each(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let range = this(vm, &receiver)?;
    let (first, end) = int_bounds(vm, &range)?;
    for i in first..end {
        vm.yield_block(&args.block, &[Value::Integer(i)])?;
    }
    Ok(receiver)
}

pub fn range_to_a(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let range = this(vm, &receiver)?;
    let (first, end) = int_bounds(vm, &range)?;
    vm.new_array((first..end).map(Value::Integer).collect())
}

fn order(vm: &mut Vm, a: &Value, b: &Value) -> Result<Option<Ordering>, Unwind> {
    if let Some(ord) = numeric::compare(a, b) {
        return Ok(Some(ord));
    }
    if a.is_numeric() || b.is_numeric() {
        return Ok(None);
    }
    Ok(match vm.funcall(a.clone(), sym::CMP, &[b.clone()], Value::Nil)? {
        Value::Integer(i) => Some(i.cmp(&0)),
        _ => None,
    })
}

/// Membership by comparison with the bounds; a nil bound is open.
pub fn range_include(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let range = this(vm, &receiver)?;
    let v = args.get(0);
    if !range.first.is_nil() {
        match order(vm, &range.first, &v)? {
            Some(Ordering::Less | Ordering::Equal) => {}
            _ => return Ok(Value::False),
        }
    }
    if !range.last.is_nil() {
        let upper = match order(vm, &v, &range.last)? {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => !range.exclusive,
            _ => false,
        };
        if !upper {
            return Ok(Value::False);
        }
    }
    Ok(Value::True)
}

pub fn range_size(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let range = this(vm, &receiver)?;
    Ok(match range.int_bounds() {
        Some((first, end)) => Value::Integer((end - first).max(0)),
        None => Value::Nil,
    })
}

fn render(vm: &mut Vm, receiver: &Value, inspect: bool) -> Result<Value, Unwind> {
    let range = this(vm, receiver)?;
    let mut text = |v: &Value| match inspect {
        true => vm.inspect_value(v),
        false => vm.to_s_value(v),
    };
    let first = text(&range.first)?;
    let last = text(&range.last)?;
    let dots = if range.exclusive { "..." } else { ".." };
    vm.new_string(format!("{first}{dots}{last}"))
}

pub fn range_inspect(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    render(vm, &receiver, true)
}

pub fn range_to_s(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    render(vm, &receiver, false)
}

pub fn range_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let (Value::Range(a), Value::Range(b)) = (&receiver, &args.get(0)) else {
        return Ok(Value::False);
    };
    Ok(Value::bool(
        a.exclusive == b.exclusive && a.first.eql(&b.first) && a.last.eql(&b.last),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;

    fn range(vm: &Vm, first: Value, last: Value, exclusive: bool) -> Value {
        vm.new_range(first, last, exclusive).expect("alloc")
    }

    #[test]
    fn bounds_and_membership() {
        let mut vm = Vm::open(VmConfig::default());
        let r = range(&vm, Value::Integer(1), Value::Integer(5), true);
        let probe = |vm: &mut Vm, v: Value| range_include(vm, r.clone(), &Args::new(vec![v])).ok();
        assert_eq!(probe(&mut vm, Value::Integer(1)), Some(Value::True));
        assert_eq!(probe(&mut vm, Value::Float(4.5)), Some(Value::True));
        assert_eq!(probe(&mut vm, Value::Integer(5)), Some(Value::False));
        assert_eq!(range_size(&mut vm, r.clone(), &Args::default()).ok(), Some(Value::Integer(4)));
        let arr = range_to_a(&mut vm, r, &Args::default()).expect("to_a");
        assert_eq!(arr.inspect(), "[1, 2, 3, 4]");
    }

    #[test]
    fn endless_range_is_open_above() {
        let mut vm = Vm::open(VmConfig::default());
        let r = range(&vm, Value::Integer(3), Value::Nil, false);
        let hit = range_include(&mut vm, r.clone(), &Args::new(vec![Value::Integer(1000)]));
        assert_eq!(hit.ok(), Some(Value::True));
        let miss = range_include(&mut vm, r.clone(), &Args::new(vec![Value::Integer(2)]));
        assert_eq!(miss.ok(), Some(Value::False));
        let err = range_to_a(&mut vm, r, &Args::default()).err();
        assert!(err.and_then(|u| u.exception().cloned()).is_some_and(|e| e.class.name() == "TypeError"));
    }

    #[test]
    fn new_rejects_mixed_bounds() {
        let mut vm = Vm::open(VmConfig::default());
        let s = vm.new_string("a").expect("alloc");
        let err = range_new(&mut vm, Value::Nil, &Args::new(vec![Value::Integer(1), s]));
        assert!(err.is_err());
        let ok = range_new(&mut vm, Value::Nil, &Args::new(vec![Value::Integer(1), Value::Integer(2), Value::True]));
        let text = ok.and_then(|r| range_inspect(&mut vm, r, &Args::default()));
        assert_eq!(text.ok().map(|v| v.to_s()), Some("1...2".to_string()));
    }
}
