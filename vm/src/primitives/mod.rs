use std::rc::Rc;

use crate::class::{Args, NativeFn};
use crate::exception::Unwind;
use crate::value::{RArray, RString, Value};
use crate::Vm;

pub mod array;
pub mod exception;
pub mod hash;
pub mod numeric;
pub mod object;
pub mod proc;
pub mod range;
pub mod string;

/// A native method to install at bootstrap.
#[derive(Clone, Copy)]
pub struct NativeDesc {
    /// Top-level constant naming the class or module.
    pub class: &'static str,
    pub name: &'static str,
    pub func: NativeFn,
    /// Install on the metaclass (a class method).
    pub singleton: bool,
}

impl NativeDesc {
    pub const fn new(class: &'static str, name: &'static str, func: NativeFn) -> Self {
        Self {
            class,
            name,
            func,
            singleton: false,
        }
    }

    pub const fn singleton(class: &'static str, name: &'static str, func: NativeFn) -> Self {
        Self {
            class,
            name,
            func,
            singleton: true,
        }
    }
}

pub fn default_natives() -> Vec<NativeDesc> {
    let mut natives = Vec::new();
    natives.extend(object::natives());
    natives.extend(numeric::natives());
    natives.extend(string::natives());
    natives.extend(array::natives());
    natives.extend(hash::natives());
    natives.extend(range::natives());
    natives.extend(proc::natives());
    natives.extend(exception::natives());
    natives
}

pub(crate) fn arity(vm: &Vm, args: &Args, min: usize, max: usize) -> Result<(), Unwind> {
    let given = args.len();
    if given < min || given > max {
        let expected = match (min, max) {
            (m, n) if m == n => m.to_string(),
            (m, usize::MAX) => format!("{m}+"),
            (m, n) => format!("{m}..{n}"),
        };
        return Err(vm.argument_error(format!(
            "wrong number of arguments (given {given}, expected {expected})"
        )));
    }
    Ok(())
}

pub(crate) fn expect_int(vm: &Vm, v: &Value) -> Result<i64, Unwind> {
    match v {
        Value::Integer(i) => Ok(*i),
        Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into Integer",
            type_name(vm, other)
        ))),
    }
}

pub(crate) fn expect_string(vm: &Vm, v: &Value) -> Result<Rc<RString>, Unwind> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into String",
            type_name(vm, other)
        ))),
    }
}

pub(crate) fn expect_array(vm: &Vm, v: &Value) -> Result<Rc<RArray>, Unwind> {
    match v {
        Value::Array(a) => Ok(a.clone()),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into Array",
            type_name(vm, other)
        ))),
    }
}

/// How error messages name the class of `v`.
pub(crate) fn type_name(vm: &Vm, v: &Value) -> String {
    match v {
        Value::Nil => "nil".into(),
        Value::True => "true".into(),
        Value::False => "false".into(),
        other => vm.system.real_class_of(other).name(),
    }
}
