use std::cmp::Ordering;

use crate::class::Args;
use crate::exception::Unwind;
use crate::primitives::{NativeDesc, arity, expect_int, expect_string, type_name};
use crate::value::{RString, Value};
use crate::{Symbol, Vm};

pub fn natives() -> Vec<NativeDesc> {
    vec![
        NativeDesc::new("String", "initialize", string_initialize),
        NativeDesc::new("String", "+", string_add),
        NativeDesc::new("String", "*", string_mul),
        NativeDesc::new("String", "==", string_eq),
        NativeDesc::new("String", "eql?", string_eq),
        NativeDesc::new("String", "<=>", string_cmp),
        NativeDesc::new("String", "<<", string_append),
        NativeDesc::new("String", "concat", string_append),
        NativeDesc::new("String", "length", string_length),
        NativeDesc::new("String", "size", string_length),
        NativeDesc::new("String", "bytesize", string_bytesize),
        NativeDesc::new("String", "empty?", string_empty),
        NativeDesc::new("String", "to_s", string_to_s),
        NativeDesc::new("String", "to_str", string_to_s),
        NativeDesc::new("String", "inspect", string_inspect),
        NativeDesc::new("String", "to_sym", string_to_sym),
        NativeDesc::new("String", "intern", string_to_sym),
        NativeDesc::new("String", "to_i", string_to_i),
        NativeDesc::new("String", "to_f", string_to_f),
        NativeDesc::new("String", "upcase", string_upcase),
        NativeDesc::new("String", "downcase", string_downcase),
        NativeDesc::new("String", "capitalize", string_capitalize),
        NativeDesc::new("String", "reverse", string_reverse),
        NativeDesc::new("String", "strip", string_strip),
        NativeDesc::new("String", "[]", string_aref),
        NativeDesc::new("String", "include?", string_include),
        NativeDesc::new("String", "start_with?", string_start_with),
        NativeDesc::new("String", "end_with?", string_end_with),
        NativeDesc::new("String", "split", string_split),
        NativeDesc::new("String", "chars", string_chars),
        NativeDesc::new("String", "each_char", string_each_char),
        NativeDesc::new("Symbol", "to_s", symbol_to_s),
        NativeDesc::new("Symbol", "id2name", symbol_to_s),
        NativeDesc::new("Symbol", "name", symbol_to_s),
        NativeDesc::new("Symbol", "to_sym", symbol_to_sym),
        NativeDesc::new("Symbol", "<=>", symbol_cmp),
        NativeDesc::new("Symbol", "length", symbol_length),
        NativeDesc::new("Symbol", "size", symbol_length),
    ]
}

fn this(vm: &Vm, receiver: &Value) -> Result<std::rc::Rc<RString>, Unwind> {
    expect_string(vm, receiver)
}

fn text(vm: &Vm, receiver: &Value) -> Result<String, Unwind> {
    Ok(this(vm, receiver)?.to_string_lossy())
}

/// `String.new(str = "")`.
pub fn string_initialize(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let s = this(vm, &receiver)?;
    if !args.is_empty() {
        let init = expect_string(vm, &args.get(0))?;
        let bytes = init.bytes().clone();
        s.push_bytes(&bytes);
    }
    Ok(receiver)
}

pub fn string_add(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let lhs = this(vm, &receiver)?;
    let rhs = expect_string(vm, &args.get(0))?;
    let mut bytes = lhs.bytes().clone();
    bytes.extend_from_slice(&rhs.bytes());
    vm.new_string(bytes)
}

pub fn string_mul(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let s = this(vm, &receiver)?;
    let times = expect_int(vm, &args.get(0))?;
    if times < 0 {
        return Err(vm.argument_error("negative argument"));
    }
    let bytes = s.bytes().repeat(times as usize);
    vm.new_string(bytes)
}

pub fn string_eq(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let eq = match (&receiver, &args.get(0)) {
        (Value::String(a), Value::String(b)) => *a.bytes() == *b.bytes(),
        _ => false,
    };
    Ok(Value::bool(eq))
}

pub fn string_cmp(_vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    Ok(match (&receiver, &args.get(0)) {
        (Value::String(a), Value::String(b)) => {
            Value::Integer(a.bytes().as_slice().cmp(b.bytes().as_slice()) as i64)
        }
        _ => Value::Nil,
    })
}

pub fn string_append(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let s = this(vm, &receiver)?;
    match args.get(0) {
        Value::String(other) => {
            let bytes = other.bytes().clone();
            s.push_bytes(&bytes);
        }
        Value::Integer(code) => match u8::try_from(code) {
            Ok(byte) => s.push_bytes(&[byte]),
            Err(_) => return Err(vm.range_error(format!("{code} out of char range"))),
        },
        other => {
            return Err(vm.type_error(format!(
                "no implicit conversion of {} into String",
                type_name(vm, &other)
            )));
        }
    }
    Ok(receiver)
}

pub fn string_length(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::Integer(text(vm, &receiver)?.chars().count() as i64))
}

pub fn string_bytesize(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::Integer(this(vm, &receiver)?.len() as i64))
}

pub fn string_empty(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::bool(this(vm, &receiver)?.is_empty()))
}

pub fn string_to_s(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver)
}

pub fn string_inspect(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    vm.new_string(receiver.inspect())
}

pub fn string_to_sym(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(Value::Symbol(Symbol::intern(&text(vm, &receiver)?)))
}

/// Leading integer in `radix`, ignoring what follows; 0 when there is none.
fn leading_int(s: &str, radix: u32) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut n: i64 = 0;
    for ch in digits.chars().filter(|c| *c != '_') {
        let Some(d) = ch.to_digit(radix) else { break };
        n = n.saturating_mul(radix as i64).saturating_add(d as i64);
    }
    if negative { -n } else { n }
}

pub fn string_to_i(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let radix = if args.is_empty() { 10 } else { expect_int(vm, &args.get(0))? };
    if !(2..=36).contains(&radix) {
        return Err(vm.argument_error(format!("invalid radix {radix}")));
    }
    Ok(Value::Integer(leading_int(&text(vm, &receiver)?, radix as u32)))
}

pub fn string_to_f(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let s = text(vm, &receiver)?;
    let s = s.trim();
    let end = s
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || *c == 'e' || *c == 'E' || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    let mut prefix = &s[..end];
    // Trim back to the longest prefix that parses.
    while !prefix.is_empty() && prefix.parse::<f64>().is_err() {
        prefix = &prefix[..prefix.len() - 1];
    }
    Ok(Value::Float(prefix.parse().unwrap_or(0.0)))
}

fn mapped(vm: &mut Vm, receiver: &Value, f: impl FnOnce(&str) -> String) -> Result<Value, Unwind> {
    let s = text(vm, receiver)?;
    vm.new_string(f(&s))
}

pub fn string_upcase(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    mapped(vm, &receiver, str::to_uppercase)
}

pub fn string_downcase(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    mapped(vm, &receiver, str::to_lowercase)
}

pub fn string_capitalize(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    mapped(vm, &receiver, |s| {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
            None => String::new(),
        }
    })
}

pub fn string_reverse(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    mapped(vm, &receiver, |s| s.chars().rev().collect())
}

pub fn string_strip(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    mapped(vm, &receiver, |s| s.trim().to_string())
}

/// Resolve `start` (negative from the end) and `len` against `size`.
fn span(size: usize, start: i64, len: i64) -> Option<(usize, usize)> {
    let start = if start < 0 { start + size as i64 } else { start };
    if start < 0 || start as usize > size || len < 0 {
        return None;
    }
    let start = start as usize;
    Some((start, (len as usize).min(size - start)))
}

/// `str[index]`, `str[start, len]`, `str[range]` and `str[substring]`.
pub fn string_aref(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 1, 2)?;
    let chars: Vec<char> = text(vm, &receiver)?.chars().collect();
    let picked = match (args.get(0), args.len()) {
        (Value::Integer(i), 1) => {
            let idx = if i < 0 { i + chars.len() as i64 } else { i };
            if idx < 0 || idx as usize >= chars.len() {
                return Ok(Value::Nil);
            }
            Some((idx as usize, 1))
        }
        (Value::Integer(start), _) => span(chars.len(), start, expect_int(vm, &args.get(1))?),
        (Value::Range(r), _) => match r.int_bounds() {
            Some((first, end)) => {
                let size = chars.len() as i64;
                let first_abs = if first < 0 { first + size } else { first };
                let end_abs = if r.last.as_int().is_some_and(|l| l < 0) { end + size } else { end };
                span(chars.len(), first_abs, (end_abs - first_abs).max(0))
            }
            None => return Err(vm.type_error("no implicit conversion of Range into Integer")),
        },
        (Value::String(needle), _) => {
            let hay: String = chars.iter().collect();
            let needle = needle.to_string_lossy();
            return match hay.contains(&needle) {
                true => vm.new_string(needle),
                false => Ok(Value::Nil),
            };
        }
        (other, _) => {
            return Err(vm.type_error(format!(
                "no implicit conversion of {} into Integer",
                type_name(vm, &other)
            )));
        }
    };
    match picked {
        Some((start, len)) => vm.new_string(chars[start..start + len].iter().collect::<String>()),
        None => Ok(Value::Nil),
    }
}

fn with_needle(vm: &Vm, receiver: &Value, args: &Args, test: fn(&str, &str) -> bool) -> Result<Value, Unwind> {
    arity(vm, args, 1, 1)?;
    let hay = text(vm, receiver)?;
    let needle = expect_string(vm, &args.get(0))?.to_string_lossy();
    Ok(Value::bool(test(&hay, &needle)))
}

pub fn string_include(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    with_needle(vm, &receiver, args, |h, n| h.contains(n))
}

pub fn string_start_with(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    with_needle(vm, &receiver, args, |h, n| h.starts_with(n))
}

pub fn string_end_with(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    with_needle(vm, &receiver, args, |h, n| h.ends_with(n))
}

/// `split(sep = " ")`; a single space splits on runs of whitespace.
pub fn string_split(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    arity(vm, args, 0, 1)?;
    let s = text(vm, &receiver)?;
    let sep = match args.get(0) {
        Value::Nil => " ".to_string(),
        other => expect_string(vm, &other)?.to_string_lossy(),
    };
    let mut parts: Vec<String> = match sep.as_str() {
        " " => s.split_whitespace().map(str::to_string).collect(),
        "" => s.chars().map(String::from).collect(),
        sep => s.split(sep).map(str::to_string).collect(),
    };
    while parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    let mut items = Vec::with_capacity(parts.len());
    for part in parts {
        items.push(vm.new_string(part)?);
    }
    vm.new_array(items)
}

pub fn string_chars(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let s = text(vm, &receiver)?;
    let mut items = Vec::new();
    for ch in s.chars() {
        items.push(vm.new_string(ch.to_string())?);
    }
    vm.new_array(items)
}

pub fn string_each_char(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let s = text(vm, &receiver)?;
    for ch in s.chars() {
        let c = vm.new_string(ch.to_string())?;
        vm.yield_block(&args.block, &[c])?;
    }
    Ok(receiver)
}

fn symbol(vm: &Vm, receiver: &Value) -> Result<Symbol, Unwind> {
    match receiver {
        Value::Symbol(s) => Ok(*s),
        other => Err(vm.type_error(format!("{} is not a symbol", other.inspect()))),
    }
}

pub fn symbol_to_s(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let name = symbol(vm, &receiver)?;
    vm.new_string(name.name().as_bytes())
}

pub fn symbol_to_sym(_vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    Ok(receiver)
}

pub fn symbol_cmp(vm: &mut Vm, receiver: Value, args: &Args) -> Result<Value, Unwind> {
    let lhs = symbol(vm, &receiver)?;
    Ok(match args.get(0) {
        Value::Symbol(rhs) => {
            let ord: Ordering = lhs.name().cmp(&rhs.name());
            Value::Integer(ord as i64)
        }
        _ => Value::Nil,
    })
}

pub fn symbol_length(vm: &mut Vm, receiver: Value, _args: &Args) -> Result<Value, Unwind> {
    let name = symbol(vm, &receiver)?;
    Ok(Value::Integer(name.name().chars().count() as i64))
}
