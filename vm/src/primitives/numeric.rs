use std::cmp::Ordering;

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::{NativeDesc, arity, expect_int};
use crate::value::{Value, format_float};
use crate::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// `lhs op rhs` for two numbers; `None` when either side is not one.
/// Integer results that overflow become floats.
pub fn arith(vm: &Vm, op: ArithOp, lhs: &Value, rhs: &Value) -> Option<Result<Value, Unwind>> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(int_arith(vm, op, *a, *b)),
        _ => {
            let (a, b) = (lhs.as_float()?, rhs.as_float()?);
            Some(Ok(Value::Float(float_arith(op, a, b))))
        }
    }
}

fn int_arith(vm: &Vm, op: ArithOp, a: i64, b: i64) -> Result<Value, Unwind> {
    let exact = match op {
        ArithOp::Add => a.checked_add(b),
        ArithOp::Sub => a.checked_sub(b),
        ArithOp::Mul => a.checked_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(vm.zero_division_error("divided by 0"));
            }
            a.checked_div(b).map(|q| if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q })
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(vm.zero_division_error("divided by 0"));
            }
            let r = a.checked_rem(b).unwrap_or(0);
            Some(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
        }
        ArithOp::Pow if b >= 0 => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
        ArithOp::Pow => None,
    };
    Ok(match exact {
        Some(v) => Value::Integer(v),
        None => Value::Float(float_arith(op, a as f64, b as f64)),
    })
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => {
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
        }
        ArithOp::Pow => a.powf(b),
    }
}

/// Order of two numbers; `None` if either is not a number or is NaN.
pub fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        _ => lhs.as_float()?.partial_cmp(&rhs.as_float()?),
    }
}

/// A `BIGINT` pool literal. Values past the integer range load as floats.
pub fn parse_big(negative: bool, base: u8, digits: &[u8]) -> Value {
    let radix = u32::from(base.clamp(2, 36));
    let mut exact: Option<i128> = Some(0);
    let mut approx = 0f64;
    for &d in digits {
        let Some(digit) = (d as char).to_digit(radix) else {
            continue;
        };
        exact = exact
            .and_then(|v| v.checked_mul(radix as i128))
            .and_then(|v| v.checked_add(digit as i128));
        approx = approx * radix as f64 + digit as f64;
    }
    let signed = exact.map(|v| if negative { -v } else { v });
    match signed.and_then(|v| i64::try_from(v).ok()) {
        Some(i) => Value::Integer(i),
        None => Value::Float(if negative { -approx } else { approx }),
    }
}

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::new("Numeric", "+", num_add),
        NativeDesc::new("Numeric", "-", num_sub),
        NativeDesc::new("Numeric", "*", num_mul),
        NativeDesc::new("Numeric", "/", num_div),
        NativeDesc::new("Numeric", "%", num_mod),
        NativeDesc::new("Numeric", "modulo", num_mod),
        NativeDesc::new("Numeric", "**", num_pow),
        NativeDesc::new("Numeric", "-@", num_neg),
        NativeDesc::new("Numeric", "+@", num_pos),
        NativeDesc::new("Numeric", "==", num_eq),
        NativeDesc::new("Numeric", "<=>", num_cmp),
        NativeDesc::new("Numeric", "<", num_lt),
        NativeDesc::new("Numeric", "<=", num_le),
        NativeDesc::new("Numeric", ">", num_gt),
        NativeDesc::new("Numeric", ">=", num_ge),
        NativeDesc::new("Numeric", "abs", num_abs),
        NativeDesc::new("Numeric", "zero?", num_zero),
        NativeDesc::new("Numeric", "positive?", num_positive),
        NativeDesc::new("Numeric", "negative?", num_negative),
        NativeDesc::new("Numeric", "to_i", num_to_i),
        NativeDesc::new("Numeric", "to_int", num_to_i),
        NativeDesc::new("Numeric", "to_f", num_to_f),
        NativeDesc::new("Integer", "to_s", int_to_s),
        NativeDesc::new("Integer", "inspect", int_to_s),
        NativeDesc::new("Integer", "times", int_times),
        NativeDesc::new("Integer", "upto", int_upto),
        NativeDesc::new("Integer", "downto", int_downto),
        NativeDesc::new("Integer", "even?", int_even),
        NativeDesc::new("Integer", "odd?", int_odd),
        NativeDesc::new("Integer", "succ", int_succ),
        NativeDesc::new("Integer", "next", int_succ),
        NativeDesc::new("Integer", "pred", int_pred),
        NativeDesc::new("Integer", "chr", int_chr),
        NativeDesc::new("Integer", "&", int_and),
        NativeDesc::new("Integer", "|", int_or),
        NativeDesc::new("Integer", "^", int_xor),
        NativeDesc::new("Integer", "<<", int_shl),
        NativeDesc::new("Integer", ">>", int_shr),
        NativeDesc::new("Float", "to_s", float_to_s),
        NativeDesc::new("Float", "inspect", float_to_s),
        NativeDesc::new("Float", "floor", float_floor),
        NativeDesc::new("Float", "ceil", float_ceil),
        NativeDesc::new("Float", "round", float_round),
        NativeDesc::new("Float", "nan?", float_nan),
        NativeDesc::new("Float", "infinite?", float_infinite),
        NativeDesc::new("Float", "finite?", float_finite),
    ]
}

fn binary(vm: &mut Vm, receiver: Value, args: &Args, op: ArithOp) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let rhs = args.get(0);
    match arith(vm, op, &receiver, &rhs) {
        Some(result) => result,
        None => Err(vm.type_error(format!(
            "{} can't be coerced into {}",
            super::type_name(vm, &rhs),
            super::type_name(vm, &receiver)
        ))),
    }
}

pub fn num_add(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    binary(vm, receiver, args, ArithOp::Add)
}

pub fn num_sub(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    binary(vm, receiver, args, ArithOp::Sub)
}

pub fn num_mul(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    binary(vm, receiver, args, ArithOp::Mul)
}

pub fn num_div(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    binary(vm, receiver, args, ArithOp::Div)
}

pub fn num_mod(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    binary(vm, receiver, args, ArithOp::Mod)
}

pub fn num_pow(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    binary(vm, receiver, args, ArithOp::Pow)
}

pub fn num_neg(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(match receiver {
        Value::Integer(i) => i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Integer),
        Value::Float(f) => Value::Float(-f),
        other => other,
    })
}

pub fn num_pos(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver)
}

pub fn num_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let rhs = args.get(0);
    Ok(Value::bool(rhs.is_numeric() && receiver == rhs))
}

pub fn num_cmp(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    Ok(match compare(&receiver, &args.get(0)) {
        Some(ord) => Value::Integer(ord as i64),
        None => Value::Nil,
    })
}

fn ordered(vm: &Vm, receiver: &Value, args: &Args, test: fn(Ordering) -> bool) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let rhs = args.get(0);
    if !rhs.is_numeric() {
        return Err(vm.comparison_failed(receiver, &rhs));
    }
    Ok(Value::bool(compare(receiver, &rhs).is_some_and(test)))
}

pub fn num_lt(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    ordered(vm, &receiver, args, Ordering::is_lt)
}

pub fn num_le(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    ordered(vm, &receiver, args, Ordering::is_le)
}

pub fn num_gt(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    ordered(vm, &receiver, args, Ordering::is_gt)
}

pub fn num_ge(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    ordered(vm, &receiver, args, Ordering::is_ge)
}

pub fn num_abs(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(match receiver {
        Value::Integer(i) => i.checked_abs().map_or(Value::Float((i as f64).abs()), Value::Integer),
        Value::Float(f) => Value::Float(f.abs()),
        other => other,
    })
}

pub fn num_zero(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(receiver.as_float() == Some(0.0)))
}

pub fn num_positive(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(receiver.as_float().is_some_and(|f| f > 0.0)))
}

pub fn num_negative(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(receiver.as_float().is_some_and(|f| f < 0.0)))
}

pub fn num_to_i(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    match receiver {
        Value::Float(f) if !f.is_finite() => Err(vm.range_error(format_float(f))),
        Value::Float(f) => Ok(Value::Integer(f.trunc() as i64)),
        other => Ok(other),
    }
}

pub fn num_to_f(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver.as_float().map_or(receiver, Value::Float))
}

pub fn int_to_s(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let n = expect_int(vm, &receiver)?;
    let radix = if args.is_empty() { 10 } else { expect_int(vm, &args.get(0))? };
    if !(2..=36).contains(&radix) {
        return Err(vm.argument_error(format!("invalid radix {radix}")));
    }
    vm.new_string(to_radix(n, radix as u32))
}

fn to_radix(n: i64, radix: u32) -> String {
    if radix == 10 {
        return n.to_string();
    }
    let mut digits = Vec::new();
    let mut rest = n.unsigned_abs();
    loop {
        let d = (rest % radix as u64) as u32;
        digits.push(char::from_digit(d, radix).unwrap_or('?'));
        rest /= radix as u64;
        if rest == 0 {
            break;
        }
    }
    if n < 0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

pub fn int_times(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let n = expect_int(vm, &receiver)?;
    for i in 0..n {
        vm.yield_block(&args.block, &[Value::Integer(i)])?;
    }
    Ok(receiver)
}

pub fn int_upto(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let from = expect_int(vm, &receiver)?;
    let to = expect_int(vm, &args.get(0))?;
    for i in from..=to {
        vm.yield_block(&args.block, &[Value::Integer(i)])?;
    }
    Ok(receiver)
}

pub fn int_downto(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let from = expect_int(vm, &receiver)?;
    let to = expect_int(vm, &args.get(0))?;
    for i in (to..=from).rev() {
        vm.yield_block(&args.block, &[Value::Integer(i)])?;
    }
    Ok(receiver)
}

pub fn int_even(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(expect_int(vm, &receiver)? % 2 == 0))
}

pub fn int_odd(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(expect_int(vm, &receiver)? % 2 != 0))
}

pub fn int_succ(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let n = expect_int(vm, &receiver)?;
    int_arith(vm, ArithOp::Add, n, 1)
}

pub fn int_pred(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let n = expect_int(vm, &receiver)?;
    int_arith(vm, ArithOp::Sub, n, 1)
}

pub fn int_chr(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let n = expect_int(vm, &receiver)?;
    match u8::try_from(n) {
        Ok(byte) => vm.new_string(vec![byte]),
        Err(_) => Err(vm.range_error(format!("{n} out of char range"))),
    }
}

fn bitwise(vm: &Vm, receiver: &Value, args: &Args, f: fn(i64, i64) -> i64) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let a = expect_int(vm, receiver)?;
    let b = expect_int(vm, &args.get(0))?;
    Ok(Value::Integer(f(a, b)))
}

pub fn int_and(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    bitwise(vm, &receiver, args, |a, b| a & b)
}

pub fn int_or(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    bitwise(vm, &receiver, args, |a, b| a | b)
}

pub fn int_xor(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    bitwise(vm, &receiver, args, |a, b| a ^ b)
}

fn shift(a: i64, by: i64) -> i64 {
    match by {
        0.. if by >= 64 => 0,
        0.. => a.wrapping_shl(by as u32),
        _ if by <= -64 => if a < 0 { -1 } else { 0 },
        _ => a >> (-by) as u32,
    }
}

pub fn int_shl(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    bitwise(vm, &receiver, args, shift)
}

pub fn int_shr(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    bitwise(vm, &receiver, args, |a, b| shift(a, b.saturating_neg()))
}

fn expect_float(vm: &Vm, v: &Value) -> Result<f64, Unwind> {
    v.as_float()
        .ok_or_else(|| vm.type_error(format!("{} is not a number", v.inspect())))
}

pub fn float_to_s(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let f = expect_float(vm, &receiver)?;
    vm.new_string(format_float(f))
}

fn float_to_int(vm: &Vm, f: f64) -> Result<Value, Unwind> {
    if !f.is_finite() {
        return Err(vm.range_error(format_float(f)));
    }
    Ok(Value::Integer(f as i64))
}

pub fn float_floor(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let f = expect_float(vm, &receiver)?;
    float_to_int(vm, f.floor())
}

pub fn float_ceil(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let f = expect_float(vm, &receiver)?;
    float_to_int(vm, f.ceil())
}

pub fn float_round(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let f = expect_float(vm, &receiver)?;
    if args.is_empty() {
        return float_to_int(vm, f.round());
    }
    let digits = expect_int(vm, &args.get(0))?.clamp(-308, 308) as i32;
    let scale = 10f64.powi(digits);
    Ok(Value::Float((f * scale).round() / scale))
}

pub fn float_nan(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(expect_float(vm, &receiver)?.is_nan()))
}

pub fn float_infinite(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let f = expect_float(vm, &receiver)?;
    Ok(match f.is_infinite() {
        true => Value::Integer(if f > 0.0 { 1 } else { -1 }),
        false => Value::Nil,
    })
}

pub fn float_finite(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(expect_float(vm, &receiver)?.is_finite()))
}
