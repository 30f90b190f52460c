use std::rc::Rc;

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::{NativeDesc, arity, type_name};
use crate::value::{RHash, Value};
use crate::Vm;

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::new("Hash", "[]", hash_aref),
        NativeDesc::new("Hash", "[]=", hash_aset),
        NativeDesc::new("Hash", "store", hash_aset),
        NativeDesc::new("Hash", "fetch", hash_fetch),
        NativeDesc::new("Hash", "key?", hash_has_key),
        NativeDesc::new("Hash", "has_key?", hash_has_key),
        NativeDesc::new("Hash", "include?", hash_has_key),
        NativeDesc::new("Hash", "member?", hash_has_key),
        NativeDesc::new("Hash", "keys", hash_keys),
        NativeDesc::new("Hash", "values", hash_values),
        NativeDesc::new("Hash", "each", hash_each),
        NativeDesc::new("Hash", "each_pair", hash_each),
        NativeDesc::new("Hash", "length", hash_length),
        NativeDesc::new("Hash", "size", hash_length),
        NativeDesc::new("Hash", "empty?", hash_empty),
        NativeDesc::new("Hash", "delete", hash_delete),
        NativeDesc::new("Hash", "to_a", hash_to_a),
        NativeDesc::new("Hash", "to_h", hash_to_h),
        NativeDesc::new("Hash", "merge", hash_merge),
        NativeDesc::new("Hash", "inspect", hash_inspect),
        NativeDesc::new("Hash", "to_s", hash_inspect),
        NativeDesc::new("Hash", "==", hash_eq),
    ]
}

fn this(vm: &Vm, receiver: &Value) -> Result<Rc<RHash>, Unwind> {
    match receiver {
        Value::Hash(h) => Ok(h.clone()),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into Hash",
            type_name(vm, other)
        ))),
    }
}

pub fn hash_aref(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    Ok(this(vm, &receiver)?.get(&args.get(0)).unwrap_or_default())
}

pub fn hash_aset(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 2, 2)?;
    let value = args.get(1);
    this(vm, &receiver)?.insert(args.get(0), value.clone());
    Ok(value)
}

/// `fetch(key)`, `fetch(key, default)` or `fetch(key) { |key| }`.
pub fn hash_fetch(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 2)?;
    let key = args.get(0);
    if let Some(v) = this(vm, &receiver)?.get(&key) {
        return Ok(v);
    }
    if !args.block.is_nil() {
        return vm.yield_block(&args.block, &[key]);
    }
    if args.len() == 2 {
        return Ok(args.get(1));
    }
    let shown = vm.inspect_value(&key)?;
    Err(vm.key_error(format!("key not found: {shown}")))
}

pub fn hash_has_key(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    Ok(Value::bool(this(vm, &receiver)?.get(&args.get(0)).is_some()))
}

pub fn hash_keys(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let keys = this(vm, &receiver)?.entries().iter().map(|(k, _)| k.clone()).collect();
    vm.new_array(keys)
}

pub fn hash_values(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let values = this(vm, &receiver)?.entries().iter().map(|(_, v)| v.clone()).collect();
    vm.new_array(values)
}

/// Yields `[key, value]` pairs; a block taking two parameters receives
/// them splatted.
pub fn hash_each(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let hash = this(vm, &receiver)?;
    let mut i = 0;
    loop {
        let entry = hash.entries().get(i).cloned();
        let Some((k, v)) = entry else { break };
        let pair = vm.new_array(vec![k, v])?;
        vm.yield_block(&args.block, &[pair])?;
        i += 1;
    }
    Ok(receiver)
}

pub fn hash_length(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::Integer(this(vm, &receiver)?.len() as i64))
}

pub fn hash_empty(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(this(vm, &receiver)?.is_empty()))
}

pub fn hash_delete(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    Ok(this(vm, &receiver)?.remove(&args.get(0)).unwrap_or_default())
}

pub fn hash_to_a(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let entries = this(vm, &receiver)?.entries().clone();
    let mut pairs = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        pairs.push(vm.new_array(vec![k, v])?);
    }
    vm.new_array(pairs)
}

pub fn hash_to_h(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver)
}

pub fn hash_merge(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let mut entries = this(vm, &receiver)?.entries().clone();
    for other in &args.values {
        entries.extend(this(vm, other)?.entries().iter().cloned());
    }
    // RHash::new keeps the last value for a repeated key.
    vm.new_hash(entries)
}

pub fn hash_inspect(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let hash = this(vm, &receiver)?;
    let entries = hash.entries().clone();
    let mut parts = Vec::with_capacity(entries.len());
    for (k, v) in &entries {
        let value = match v {
            Value::Hash(inner) if Rc::ptr_eq(inner, &hash) => "{...}".to_string(),
            other => vm.inspect_value(other)?,
        };
        parts.push(format!("{}=>{}", vm.inspect_value(k)?, value));
    }
    vm.new_string(format!("{{{}}}", parts.join(", ")))
}

pub fn hash_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let other = args.get(0);
    Ok(Value::bool(matches!(other, Value::Hash(_)) && receiver == other))
}
