use std::{cmp::Ordering, rc::Rc};

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::numeric::{self, ArithOp};
use crate::primitives::{NativeDesc, arity, expect_array, expect_int, type_name};
use crate::value::{RArray, Value};
use crate::{Vm, sym};

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::new("Array", "initialize", array_initialize),
        NativeDesc::new("Array", "[]", array_aref),
        NativeDesc::new("Array", "[]=", array_aset),
        NativeDesc::new("Array", "push", array_push),
        NativeDesc::new("Array", "append", array_push),
        NativeDesc::new("Array", "<<", array_push),
        NativeDesc::new("Array", "pop", array_pop),
        NativeDesc::new("Array", "shift", array_shift),
        NativeDesc::new("Array", "unshift", array_unshift),
        NativeDesc::new("Array", "prepend", array_unshift),
        NativeDesc::new("Array", "length", array_length),
        NativeDesc::new("Array", "size", array_length),
        NativeDesc::new("Array", "empty?", array_empty),
        NativeDesc::new("Array", "first", array_first),
        NativeDesc::new("Array", "last", array_last),
        NativeDesc::new("Array", "each", array_each),
        NativeDesc::new("Array", "each_with_index", array_each_with_index),
        NativeDesc::new("Array", "map", array_map),
        NativeDesc::new("Array", "collect", array_map),
        NativeDesc::new("Array", "select", array_select),
        NativeDesc::new("Array", "filter", array_select),
        NativeDesc::new("Array", "reject", array_reject),
        NativeDesc::new("Array", "reduce", array_reduce),
        NativeDesc::new("Array", "inject", array_reduce),
        NativeDesc::new("Array", "include?", array_include),
        NativeDesc::new("Array", "index", array_index),
        NativeDesc::new("Array", "join", array_join),
        NativeDesc::new("Array", "inspect", array_inspect),
        NativeDesc::new("Array", "to_s", array_inspect),
        NativeDesc::new("Array", "to_a", array_to_a),
        NativeDesc::new("Array", "==", array_eq),
        NativeDesc::new("Array", "+", array_plus),
        NativeDesc::new("Array", "-", array_minus),
        NativeDesc::new("Array", "concat", array_concat),
        NativeDesc::new("Array", "reverse", array_reverse),
        NativeDesc::new("Array", "sort", array_sort),
        NativeDesc::new("Array", "min", array_min),
        NativeDesc::new("Array", "max", array_max),
        NativeDesc::new("Array", "sum", array_sum),
        NativeDesc::new("Array", "uniq", array_uniq),
        NativeDesc::new("Array", "compact", array_compact),
        NativeDesc::new("Array", "delete_at", array_delete_at),
        NativeDesc::new("Array", "clear", array_clear),
        NativeDesc::new("Array", "count", array_count),
    ]
}

fn this(vm: &Vm, receiver: &Value) -> Result<Rc<RArray>, Unwind> {
    expect_array(vm, receiver)
}

/// `Array.new(size = 0, default = nil)`, or with a block, the block's
/// value for each index.
pub fn array_initialize(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 2)?;
    let arr = this(vm, &receiver)?;
    let size = match args.get(0) {
        Value::Nil => 0,
        v => expect_int(vm, &v)?,
    };
    if size < 0 {
        return Err(vm.argument_error("negative array size"));
    }
    for i in 0..size {
        let item = match args.block {
            Value::Proc(_) => vm.yield_block(&args.block, &[Value::Integer(i)])?,
            _ => args.get(1),
        };
        arr.push(item);
    }
    Ok(receiver)
}

pub fn array_aref(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 2)?;
    let arr = this(vm, &receiver)?;
    let len = arr.len() as i64;
    let (start, count) = match (args.get(0), args.len()) {
        (Value::Integer(i), 1) => return Ok(arr.get(i)),
        (Value::Integer(start), _) => (start, expect_int(vm, &args.get(1))?),
        (Value::Range(r), _) => {
            let Some((first, end)) = r.int_bounds() else {
                return Err(vm.type_error("no implicit conversion of Range into Integer"));
            };
            let first = if first < 0 { first + len } else { first };
            let end = if r.last.as_int().is_some_and(|l| l < 0) { end + len } else { end };
            (first, (end - first).max(0))
        }
        (other, _) => {
            return Err(vm.type_error(format!(
                "no implicit conversion of {} into Integer",
                type_name(vm, &other)
            )));
        }
    };
    let start = if start < 0 { start + len } else { start };
    if start < 0 || start > len || count < 0 {
        return Ok(Value::Nil);
    }
    let end = (start + count).min(len);
    let items = arr.items()[start as usize..end as usize].to_vec();
    vm.new_array(items)
}

pub fn array_aset(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 2)?;
    let arr = this(vm, &receiver)?;
    let idx = expect_int(vm, &args.get(0))?;
    let value = args.get(1);
    if !arr.set(idx, value.clone()) {
        return Err(vm.index_error(format!(
            "index {idx} too small for array; minimum: -{}",
            arr.len()
        )));
    }
    Ok(value)
}

pub fn array_push(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    for v in &args.values {
        arr.push(v.clone());
    }
    Ok(receiver)
}

pub fn array_pop(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    Ok(arr.with_items(|items| items.pop()).unwrap_or_default())
}

pub fn array_shift(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    Ok(arr.with_items(|items| (!items.is_empty()).then(|| items.remove(0))).unwrap_or_default())
}

pub fn array_unshift(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    arr.with_items(|items| {
        items.splice(0..0, args.values.iter().cloned());
    });
    Ok(receiver)
}

pub fn array_length(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::Integer(this(vm, &receiver)?.len() as i64))
}

pub fn array_empty(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(this(vm, &receiver)?.is_empty()))
}

fn take(vm: &mut Vm, receiver: &Value, args: &Args, from_end: bool) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let arr = this(vm, receiver)?;
    if args.is_empty() {
        return Ok(arr.get(if from_end { -1 } else { 0 }));
    }
    let n = expect_int(vm, &args.get(0))?;
    if n < 0 {
        return Err(vm.argument_error("negative array size"));
    }
    let items = arr.items();
    let n = (n as usize).min(items.len());
    let picked = match from_end {
        true => items[items.len() - n..].to_vec(),
        false => items[..n].to_vec(),
    };
    drop(items);
    vm.new_array(picked)
}

pub fn array_first(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    take(vm, &receiver, args, false)
}

pub fn array_last(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    take(vm, &receiver, args, true)
}

/// Visit elements by index so the block may change the array.
fn for_each(
    vm: &mut Vm,
    arr: &Rc<RArray>,
    mut f: impl FnMut(&mut Vm, usize, Value) -> Result<(), Unwind>,
) -> Result<(), Unwind> {
    let mut i = 0;
    while i < arr.len() {
        let item = arr.get(i as i64);
        f(vm, i, item)?;
        i += 1;
    }
    Ok(())
}

pub fn array_each(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    for_each(vm, &arr, |vm, _, item| vm.yield_block(&args.block, &[item]).map(drop))?;
    Ok(receiver)
}

pub fn array_each_with_index(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    for_each(vm, &arr, |vm, i, item| {
        vm.yield_block(&args.block, &[item, Value::Integer(i as i64)]).map(drop)
    })?;
    Ok(receiver)
}

pub fn array_map(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    let mut out = Vec::with_capacity(arr.len());
    for_each(vm, &arr, |vm, _, item| {
        out.push(vm.yield_block(&args.block, &[item])?);
        Ok(())
    })?;
    vm.new_array(out)
}

fn filter(vm: &mut Vm, receiver: &Value, args: &Args, keep: bool) -> Result<Value, Unwind> {
    let arr = this(vm, receiver)?;
    let mut out = Vec::new();
    for_each(vm, &arr, |vm, _, item| {
        if vm.yield_block(&args.block, &[item.clone()])?.is_truthy() == keep {
            out.push(item);
        }
        Ok(())
    })?;
    vm.new_array(out)
}

pub fn array_select(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    filter(vm, &receiver, args, true)
}

pub fn array_reject(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    filter(vm, &receiver, args, false)
}

/// `reduce(init) { |acc, x| }`, or `reduce(:sym)`.
pub fn array_reduce(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 2)?;
    let arr = this(vm, &receiver)?;
    let mut items = arr.items().clone().into_iter();
    let (init, op) = match (args.len(), args.get(0), args.get(1)) {
        (1, Value::Symbol(op), _) if args.block.is_nil() => (None, Some(op)),
        (2, init, Value::Symbol(op)) => (Some(init), Some(op)),
        (0, ..) => (None, None),
        (_, init, _) => (Some(init), None),
    };
    let Some(mut acc) = init.or_else(|| items.next()) else {
        return Ok(Value::Nil);
    };
    for item in items {
        acc = match op {
            Some(op) => vm.funcall(acc, op, &[item], Value::Nil)?,
            None => vm.yield_block(&args.block, &[acc, item])?,
        };
    }
    Ok(acc)
}

pub fn array_include(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let arr = this(vm, &receiver)?;
    let needle = args.get(0);
    Ok(Value::bool(arr.items().iter().any(|v| *v == needle)))
}

pub fn array_index(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let arr = this(vm, &receiver)?;
    if args.is_empty() {
        let mut found = Value::Nil;
        let mut i = 0;
        while i < arr.len() {
            let item = arr.get(i as i64);
            if vm.yield_block(&args.block, &[item])?.is_truthy() {
                found = Value::Integer(i as i64);
                break;
            }
            i += 1;
        }
        return Ok(found);
    }
    let needle = args.get(0);
    let pos = arr.items().iter().position(|v| *v == needle);
    Ok(pos.map_or(Value::Nil, |i| Value::Integer(i as i64)))
}

fn join_into(vm: &mut Vm, arr: &Rc<RArray>, sep: &str, out: &mut String, depth: usize) -> Result<(), Unwind> {
    if depth > 16 {
        return Err(vm.argument_error("recursive array join"));
    }
    let items = arr.items().clone();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        match item {
            Value::Array(inner) => join_into(vm, inner, sep, out, depth + 1)?,
            other => out.push_str(&vm.to_s_value(other)?),
        }
    }
    Ok(())
}

pub fn array_join(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let arr = this(vm, &receiver)?;
    let sep = match args.get(0) {
        Value::Nil => String::new(),
        v => crate::primitives::expect_string(vm, &v)?.to_string_lossy(),
    };
    let mut out = String::new();
    join_into(vm, &arr, &sep, &mut out, 0)?;
    vm.new_string(out)
}

pub fn array_inspect(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    let items = arr.items().clone();
    let mut parts = Vec::with_capacity(items.len());
    for item in &items {
        parts.push(match item {
            Value::Array(inner) if Rc::ptr_eq(inner, &arr) => "[...]".to_string(),
            other => vm.inspect_value(other)?,
        });
    }
    vm.new_string(format!("[{}]", parts.join(", ")))
}

pub fn array_to_a(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver)
}

pub fn array_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let other = args.get(0);
    Ok(Value::bool(matches!(other, Value::Array(_)) && receiver == other))
}

pub fn array_plus(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let lhs = this(vm, &receiver)?;
    let rhs = expect_array(vm, &args.get(0))?;
    let mut items = lhs.items().clone();
    items.extend(rhs.items().iter().cloned());
    vm.new_array(items)
}

pub fn array_minus(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let lhs = this(vm, &receiver)?;
    let rhs = expect_array(vm, &args.get(0))?;
    let removed = rhs.items().clone();
    let items = lhs
        .items()
        .iter()
        .filter(|v| !removed.iter().any(|r| r.eql(v)))
        .cloned()
        .collect();
    vm.new_array(items)
}

pub fn array_concat(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    for v in &args.values {
        let other = expect_array(vm, v)?;
        let more = other.items().clone();
        arr.with_items(|items| items.extend(more));
    }
    Ok(receiver)
}

pub fn array_reverse(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    let items = arr.items().iter().rev().cloned().collect();
    vm.new_array(items)
}

/// Order two elements: numbers and strings directly, anything else by
/// `<=>` (or the block, when one is given).
fn order(vm: &mut Vm, block: &Value, a: &Value, b: &Value) -> Result<Ordering, Unwind> {
    let cmp = match block {
        Value::Proc(_) => vm.yield_block(block, &[a.clone(), b.clone()])?,
        _ => {
            if let Some(ord) = numeric::compare(a, b) {
                return Ok(ord);
            }
            if let (Value::String(x), Value::String(y)) = (a, b) {
                return Ok(x.bytes().as_slice().cmp(y.bytes().as_slice()));
            }
            vm.funcall(a.clone(), sym::CMP, &[b.clone()], Value::Nil)?
        }
    };
    match cmp {
        Value::Integer(i) => Ok(i.cmp(&0)),
        _ => Err(vm.argument_error(format!(
            "comparison of {} with {} failed",
            type_name(vm, a),
            type_name(vm, b)
        ))),
    }
}

/// Stable insertion sort; comparisons may call back into the VM.
fn sorted(vm: &mut Vm, items: Vec<Value>, block: &Value) -> Result<Vec<Value>, Unwind> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        let mut at = out.len();
        while at > 0 && order(vm, block, &out[at - 1], &item)? == Ordering::Greater {
            at -= 1;
        }
        out.insert(at, item);
    }
    Ok(out)
}

pub fn array_sort(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    let items = arr.items().clone();
    let items = sorted(vm, items, &args.block)?;
    vm.new_array(items)
}

fn extreme(vm: &mut Vm, receiver: &Value, block: &Value, want: Ordering) -> Result<Value, Unwind> {
    let arr = this(vm, receiver)?;
    let items = arr.items().clone();
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            Some(b) if order(vm, block, &item, &b)? != want => b,
            _ => item,
        });
    }
    Ok(best.unwrap_or_default())
}

pub fn array_min(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    extreme(vm, &receiver, &args.block, Ordering::Less)
}

pub fn array_max(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    extreme(vm, &receiver, &args.block, Ordering::Greater)
}

pub fn array_sum(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let arr = this(vm, &receiver)?;
    let mut acc = match args.get(0) {
        Value::Nil => Value::Integer(0),
        init => init,
    };
    let items = arr.items().clone();
    for item in items {
        acc = match numeric::arith(vm, ArithOp::Add, &acc, &item) {
            Some(result) => result?,
            None => vm.funcall(acc, sym::PLUS, &[item], Value::Nil)?,
        };
    }
    Ok(acc)
}

pub fn array_uniq(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    let mut out: Vec<Value> = Vec::new();
    for item in arr.items().iter() {
        if !out.iter().any(|v| v.eql(item)) {
            out.push(item.clone());
        }
    }
    vm.new_array(out)
}

pub fn array_compact(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let arr = this(vm, &receiver)?;
    let items = arr.items().iter().filter(|v| !v.is_nil()).cloned().collect();
    vm.new_array(items)
}

pub fn array_delete_at(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let arr = this(vm, &receiver)?;
    let idx = expect_int(vm, &args.get(0))?;
    let len = arr.len() as i64;
    let idx = if idx < 0 { idx + len } else { idx };
    if idx < 0 || idx >= len {
        return Ok(Value::Nil);
    }
    Ok(arr.with_items(|items| items.remove(idx as usize)))
}

pub fn array_clear(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    this(vm, &receiver)?.with_items(Vec::clear);
    Ok(receiver)
}

pub fn array_count(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let arr = this(vm, &receiver)?;
    if !args.is_empty() {
        let needle = args.get(0);
        return Ok(Value::Integer(arr.items().iter().filter(|v| **v == needle).count() as i64));
    }
    if args.block.is_nil() {
        return Ok(Value::Integer(arr.len() as i64));
    }
    let mut n = 0;
    for_each(vm, &arr, |vm, _, item| {
        if vm.yield_block(&args.block, &[item])?.is_truthy() {
            n += 1;
        }
        Ok(())
    })?;
    Ok(Value::Integer(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;

    fn ints(vm: &Vm, items: &[i64]) -> Value {
        vm.new_array(items.iter().map(|i| Value::Integer(*i)).collect()).expect("alloc")
    }

    #[test]
    fn slicing() {
        let mut vm = Vm::open(VmConfig::default());
        let arr = ints(&vm, &[1, 2, 3, 4]);
        let slice = array_aref(&mut vm, arr.clone(), &Args::new(vec![Value::Integer(1), Value::Integer(2)]));
        assert_eq!(slice.map(|v| v.inspect()).ok(), Some("[2, 3]".to_string()));
        let last = array_aref(&mut vm, arr.clone(), &Args::new(vec![Value::Integer(-1)]));
        assert_eq!(last.ok(), Some(Value::Integer(4)));
        let past = array_aref(&mut vm, arr, &Args::new(vec![Value::Integer(5), Value::Integer(1)]));
        assert_eq!(past.ok(), Some(Value::Nil));
    }

    #[test]
    fn sort_min_max_sum_without_blocks() {
        let mut vm = Vm::open(VmConfig::default());
        let arr = ints(&vm, &[3, 1, 2]);
        let none = Args::default();
        assert_eq!(array_sort(&mut vm, arr.clone(), &none).map(|v| v.inspect()).ok(), Some("[1, 2, 3]".to_string()));
        assert_eq!(array_min(&mut vm, arr.clone(), &none).ok(), Some(Value::Integer(1)));
        assert_eq!(array_max(&mut vm, arr.clone(), &none).ok(), Some(Value::Integer(3)));
        assert_eq!(array_sum(&mut vm, arr, &none).ok(), Some(Value::Integer(6)));
    }

    #[test]
    fn mutation() {
        let mut vm = Vm::open(VmConfig::default());
        let arr = ints(&vm, &[1]);
        array_push(&mut vm, arr.clone(), &Args::new(vec![Value::Integer(2)])).expect("push");
        array_unshift(&mut vm, arr.clone(), &Args::new(vec![Value::Integer(0)])).expect("unshift");
        assert_eq!(arr.inspect(), "[0, 1, 2]");
        assert_eq!(array_pop(&mut vm, arr.clone(), &Args::default()).ok(), Some(Value::Integer(2)));
        assert_eq!(array_shift(&mut vm, arr.clone(), &Args::default()).ok(), Some(Value::Integer(0)));
        let set = Args::new(vec![Value::Integer(3), Value::True]);
        array_aset(&mut vm, arr.clone(), &set).expect("aset");
        assert_eq!(arr.inspect(), "[1, nil, nil, true]");
    }

    #[test]
    fn join_nested() {
        let mut vm = Vm::open(VmConfig::default());
        let inner = ints(&vm, &[2, 3]);
        let outer = vm.new_array(vec![Value::Integer(1), inner, Value::Nil]).expect("alloc");
        let sep = vm.new_string("-").expect("alloc");
        let joined = array_join(&mut vm, outer, &Args::new(vec![sep])).expect("join");
        assert_eq!(joined.to_s(), "1-2-3-");
    }
}
