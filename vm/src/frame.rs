use std::{mem, rc::Rc};

use crate::class::RClass;
use crate::exception::Unwind;
use crate::value::{RProc, Value};
use crate::{Irep, Symbol, Vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Method,
    Block,
    /// `initialize` run by `new`; its return keeps the new instance in R0.
    Constructor,
    /// A class or module body.
    Exec,
}

/// One activation on the call-info chain.
///
/// The caller's state is snapshotted here when the frame is pushed and
/// restored when it is popped; the remaining fields describe the callee.
pub struct CallInfo {
    pub caller_irep: Rc<Irep>,
    pub return_pc: usize,
    pub caller_base: usize,
    pub caller_target_class: Rc<RClass>,
    pub caller_proc: Option<Rc<RProc>>,

    pub method_id: Option<Symbol>,
    /// Class the running method was found in, for `super`.
    pub own_class: Option<Rc<RClass>>,
    /// Callee window start, relative to the caller's window.
    pub window_offset: usize,
    pub argc: usize,
    /// The block passed with the call, or nil.
    pub block: Value,
    pub kind: FrameKind,
    /// Unique per push; blocks name their home and creator frames by it.
    pub serial: u64,
}

impl CallInfo {
    pub fn is_constructor(&self) -> bool {
        self.kind == FrameKind::Constructor
    }
}

impl std::fmt::Debug for CallInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInfo")
            .field("method_id", &self.method_id)
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("window_offset", &self.window_offset)
            .field("argc", &self.argc)
            .field("return_pc", &self.return_pc)
            .finish()
    }
}

/// What a new frame runs and where its window starts.
pub(crate) struct FramePush {
    pub irep: Rc<Irep>,
    /// Window start relative to the current window.
    pub a: usize,
    pub argc: usize,
    pub method_id: Option<Symbol>,
    pub own_class: Option<Rc<RClass>>,
    pub target_class: Rc<RClass>,
    pub proc_: Option<Rc<RProc>>,
    pub kind: FrameKind,
}

/// What [`Vm::pop_frame`] reports about the frame it removed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Popped {
    pub serial: u64,
    pub window_offset: usize,
    pub kind: FrameKind,
}

impl Popped {
    pub fn is_constructor(&self) -> bool {
        self.kind == FrameKind::Constructor
    }
}

impl Vm {
    /// Push a frame and slide the window forward by `push.a`.
    pub(crate) fn push_frame(&mut self, push: FramePush) -> Result<(), Unwind> {
        if self.frames.len() >= self.config.max_callinfo_depth {
            return Err(self.stack_error("stack level too deep"));
        }
        let base = self.base + push.a;
        let window = push.irep.nregs().max(push.argc + 2);
        if base + window > self.regs.len() {
            return Err(self.stack_error("stack level too deep (register file exhausted)"));
        }
        let block = self.regs[base + push.argc + 1].clone();
        self.next_serial += 1;
        let ci = CallInfo {
            caller_irep: mem::replace(&mut self.irep, push.irep),
            return_pc: self.pc,
            caller_base: self.base,
            caller_target_class: mem::replace(&mut self.target_class, push.target_class),
            caller_proc: mem::replace(&mut self.current_proc, push.proc_),
            method_id: push.method_id,
            own_class: push.own_class,
            window_offset: push.a,
            argc: push.argc,
            block,
            kind: push.kind,
            serial: self.next_serial,
        };
        self.frames.push(ci);
        self.base = base;
        self.pc = 0;
        Ok(())
    }

    /// Pop the head frame, clearing its window except R0, and resume the
    /// caller.
    pub(crate) fn pop_frame(&mut self) -> Option<Popped> {
        let ci = self.frames.pop()?;
        let window = self.irep.nregs().max(ci.argc + 2);
        let end = (self.base + window).min(self.regs.len());
        for slot in &mut self.regs[self.base + 1..end] {
            *slot = Value::Nil;
        }
        self.irep = ci.caller_irep;
        self.pc = ci.return_pc;
        self.base = ci.caller_base;
        self.target_class = ci.caller_target_class;
        self.current_proc = ci.caller_proc;
        Some(Popped {
            serial: ci.serial,
            window_offset: ci.window_offset,
            kind: ci.kind,
        })
    }

    /// Serial of the running frame; the top level is 0.
    pub(crate) fn serial(&self) -> u64 {
        self.frames.last().map_or(0, |f| f.serial)
    }
}
