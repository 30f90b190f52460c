//! Non-local exits and the catch machinery.
//!
//! Every way of leaving code other than falling through or a plain
//! `RETURN` is an [`Unwind`]. The instruction that causes one hands it to
//! [`Vm::handle_unwind`], which probes the catch table of the running IREP
//! and then of each caller in turn. Rescue clauses claim exceptions only;
//! ensure clauses claim every kind and park it until their body has run.

use std::{fmt, rc::Rc};

use bytecode::CatchKind;

use crate::class::RClass;
use crate::irep::CatchFilter;
use crate::value::{RException, Value};
use crate::{Symbol, Vm};

#[derive(Clone)]
pub enum Unwind {
    /// A raised exception.
    Raise(Rc<RException>),
    /// `return` leaving the frame with serial `home`.
    Return { value: Value, home: u64 },
    /// `break` out of the call made by the frame with serial `creator`.
    Break { value: Value, creator: u64 },
    /// `JMPUW` leaving ensure-protected code within one IREP.
    Jump { target: usize },
}

impl Unwind {
    pub fn exception(&self) -> Option<&Rc<RException>> {
        match self {
            Unwind::Raise(e) => Some(e),
            _ => None,
        }
    }

    fn filter(&self) -> CatchFilter {
        match self {
            Unwind::Raise(_) => CatchFilter::Any,
            _ => CatchFilter::Ensure,
        }
    }
}

impl fmt::Debug for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unwind::Raise(e) => write!(f, "Raise({}: {})", e.class.name(), e.message()),
            Unwind::Return { value, home } => write!(f, "Return({value:?} to #{home})"),
            Unwind::Break { value, creator } => write!(f, "Break({value:?} to #{creator})"),
            Unwind::Jump { target } => write!(f, "Jump({target})"),
        }
    }
}

macro_rules! error_constructors {
    ($($fn:ident => $class:ident,)*) => {
        impl Vm {
            $(
                #[doc = concat!("A `", stringify!($class), "` exception ready to raise.")]
                pub fn $fn(&self, message: impl Into<String>) -> Unwind {
                    let class = self.system.builtins.$class.clone();
                    self.exception_of(class, message)
                }
            )*
        }
    };
}

error_constructors! {
    runtime_error => runtime_error,
    argument_error => argument_error,
    type_error => type_error,
    name_error => name_error,
    no_method_error => no_method_error,
    zero_division_error => zero_division_error,
    index_error => index_error,
    key_error => key_error,
    range_error => range_error,
    local_jump_error => local_jump_error,
    not_implemented_error => not_implemented_error,
    stop_iteration => stop_iteration,
    stack_error => system_stack_error,
    no_memory_error => no_memory_error,
}

impl Vm {
    pub fn exception_of(&self, class: Rc<RClass>, message: impl Into<String>) -> Unwind {
        Unwind::Raise(RException::new(class, Some(message.into())))
    }

    /// The `NoMethodError` for sending `name` to `recv`.
    pub(crate) fn undefined_method(&self, name: Symbol, recv: &Value) -> Unwind {
        let target = match recv {
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Class(c) if c.is_module() => format!("module {}", c.name()),
            Value::Class(c) => format!("class {}", c.name()),
            other => format!("an instance of {}", self.system.real_class_of(other).name()),
        };
        self.no_method_error(format!("undefined method '{name}' for {target}"))
    }

    /// Turn the operand of `raise` into an exception: an exception object
    /// as is, a class instantiated with `message`, or a string as the
    /// message of a `RuntimeError`.
    pub(crate) fn make_exception(&self, value: Value, message: Option<String>) -> Unwind {
        match value {
            Value::Exception(e) => {
                if message.is_some() {
                    e.set_message(message);
                }
                Unwind::Raise(e)
            }
            Value::Class(c) if c.inherits(&self.system.builtins.exception) => {
                Unwind::Raise(RException::new(c, message))
            }
            Value::String(s) => self.runtime_error(s.to_string_lossy()),
            Value::Nil => self.runtime_error("unhandled exception"),
            _ => self.type_error("exception class/object expected"),
        }
    }

    /// Route `unwind`, caused by the instruction at `fault_pc`, to the
    /// handler that claims it.
    ///
    /// Returns `Ok` with `pc` (and possibly the frame) changed to resume at
    /// the landing pad, or `Err` when the unwind must leave this dispatch
    /// loop: the chain ran out, or it reached the landing pad at depth
    /// `pad` pushed by a host re-entry.
    pub(crate) fn handle_unwind(
        &mut self,
        unwind: Unwind,
        mut fault_pc: usize,
        pad: Option<usize>,
    ) -> Result<(), Unwind> {
        if let Unwind::Jump { target } = unwind {
            let handler = self
                .irep
                .catch_handlers()
                .iter()
                .find(|h| {
                    h.kind == CatchKind::Ensure
                        && h.covers(fault_pc as u32)
                        && !h.covers(target as u32)
                })
                .map(|h| h.target as usize);
            match handler {
                Some(landing) => {
                    self.pc = landing;
                    self.pending = Some(unwind);
                }
                None => self.pc = target,
            }
            return Ok(());
        }

        let floor = pad.unwrap_or(0);
        loop {
            if let Some(handler) = self.irep.find_handler(fault_pc, unwind.filter()) {
                log::trace!("unwind {unwind:?} caught at {fault_pc}, landing at {}", handler.target);
                self.pc = handler.target as usize;
                self.pending = Some(unwind);
                return Ok(());
            }
            if self.frames.len() <= floor {
                return Err(unwind);
            }

            let Some(popped) = self.pop_frame() else {
                return Err(unwind);
            };
            if let Unwind::Return { value, home } = &unwind {
                if popped.serial == *home {
                    if !popped.is_constructor() {
                        self.regs[self.base + popped.window_offset] = value.clone();
                    }
                    return Ok(());
                }
            }
            if pad.is_some() && self.frames.len() <= floor {
                return Err(unwind);
            }
            if let Unwind::Break { value, creator } = &unwind {
                if self.serial() == *creator {
                    self.regs[self.base + popped.window_offset] = value.clone();
                    return Ok(());
                }
            }
            // The caller is still inside its send.
            fault_pc = self.pc.saturating_sub(1);
        }
    }

    /// Whether the frame with `serial` is still on the call chain.
    pub(crate) fn is_live(&self, serial: u64) -> bool {
        serial == 0 || self.frames.iter().any(|f| f.serial == serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;

    #[test]
    fn raise_operands() {
        let vm = Vm::open(VmConfig::default());
        let u = vm.make_exception(Value::Class(vm.system.builtins.argument_error.clone()), Some("bad".into()));
        let e = u.exception().expect("exception");
        assert_eq!(e.class.name(), "ArgumentError");
        assert_eq!(e.message(), "bad");

        let u = vm.make_exception(Value::Class(vm.system.builtins.type_error.clone()), None);
        assert_eq!(u.exception().map(|e| e.message()), Some("TypeError".into()));

        let u = vm.make_exception(Value::Integer(3), None);
        assert_eq!(u.exception().map(|e| e.class.name()), Some("TypeError".into()));
    }

    #[test]
    fn no_method_messages_name_the_receiver() {
        let vm = Vm::open(VmConfig::default());
        let u = vm.undefined_method(Symbol::intern("frob"), &Value::Integer(1));
        assert_eq!(
            u.exception().map(|e| e.message()),
            Some("undefined method 'frob' for an instance of Integer".into())
        );
        let u = vm.undefined_method(Symbol::intern("frob"), &Value::Nil);
        assert_eq!(
            u.exception().map(|e| e.message()),
            Some("undefined method 'frob' for nil".into())
        );
    }
}
