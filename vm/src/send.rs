//! Method dispatch, argument binding and host re-entry.

use std::{mem, rc::Rc};

use crate::class::{Builtin, InstanceKind, Method, NativeFn, RClass};
use crate::exception::Unwind;
use crate::frame::{FrameKind, FramePush};
use crate::interpreter::{Exit, splat};
use crate::value::{RException, RProc, Value};
use crate::{Args, Symbol, Vm, sym};

/// Positional count meaning "arguments packed into one array".
const PACKED: u32 = 15;

/// Argument shape of `ENTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Aspec {
    pub required: usize,
    pub optional: usize,
    pub rest: bool,
    pub post: usize,
    pub keywords: usize,
    pub kdict: bool,
    pub block: bool,
}

impl Aspec {
    pub fn decode(bits: u32) -> Self {
        Self {
            required: (bits >> 18 & 0x1f) as usize,
            optional: (bits >> 13 & 0x1f) as usize,
            rest: bits >> 12 & 1 != 0,
            post: (bits >> 7 & 0x1f) as usize,
            keywords: (bits >> 2 & 0x1f) as usize,
            kdict: bits >> 1 & 1 != 0,
            block: bits & 1 != 0,
        }
    }

    /// Registers from R1 up to and including the block slot.
    fn len(&self) -> usize {
        self.required + self.optional + self.rest as usize + self.post + self.kdict as usize
    }

    fn expected(&self) -> String {
        let least = self.required + self.post;
        match (self.rest, self.optional) {
            (true, _) => format!("{least}+"),
            (false, 0) => least.to_string(),
            (false, o) => format!("{least}..{}", least + o),
        }
    }
}

/// The `b` operand of `BLKPUSH` and `ARGARY`.
#[derive(Debug, Clone, Copy)]
struct ArgLayout {
    /// Leading parameters, optionals included.
    pre: usize,
    rest: bool,
    post: usize,
    kdict: bool,
    /// Enclosing block levels out; 0 is the running frame.
    level: usize,
}

impl ArgLayout {
    fn decode(bits: u32) -> Self {
        Self {
            pre: (bits >> 11 & 0x3f) as usize,
            rest: bits >> 10 & 1 != 0,
            post: (bits >> 5 & 0x1f) as usize,
            kdict: bits >> 4 & 1 != 0,
            level: (bits & 0xf) as usize,
        }
    }

    fn block_slot(&self) -> usize {
        self.pre + self.rest as usize + self.post + self.kdict as usize + 1
    }
}

impl Vm {
    /// `SEND`: call `name` on R(a) with arguments from R(a+1). With
    /// `has_block` the block is in the register after the arguments.
    pub(crate) fn send(
        &mut self,
        a: usize,
        name: Symbol,
        argc: u32,
        has_block: bool,
    ) -> Result<(), Unwind> {
        let argc = self.unpack_args(a, argc, has_block)?;
        let recv = self.r(a).clone();
        self.dispatch(a, recv, name, argc)
    }

    /// Normalize the argument registers at R(a+1) to `n` plain values
    /// followed by the block slot, and return `n`.
    fn unpack_args(&mut self, a: usize, argc: u32, has_block: bool) -> Result<usize, Unwind> {
        if argc >> 4 & 0xf != 0 {
            return Err(self.argument_error("keyword arguments are not supported"));
        }
        let positional = argc & 0xf;
        let n = if positional == PACKED {
            let items = splat(self.r(a + 1));
            let block = if has_block { self.r(a + 2).clone() } else { Value::Nil };
            if self.base + a + items.len() + 2 > self.regs.len() {
                return Err(self.stack_error("stack level too deep (too many arguments)"));
            }
            let n = items.len();
            for (i, item) in items.into_iter().enumerate() {
                self.set(a + 1 + i, item);
            }
            self.set(a + n + 1, block);
            n
        } else {
            let n = positional as usize;
            if self.base + a + n + 2 > self.regs.len() {
                return Err(self.stack_error("stack level too deep (too many arguments)"));
            }
            if !has_block {
                self.set(a + n + 1, Value::Nil);
            }
            n
        };
        Ok(n)
    }

    pub(crate) fn dispatch(
        &mut self,
        a: usize,
        recv: Value,
        name: Symbol,
        argc: usize,
    ) -> Result<(), Unwind> {
        let class = self.system.class_of(&recv);
        match class.find_method(name) {
            Some((method, owner)) => self.invoke(a, recv, name, argc, method, owner),
            None => self.method_missing(a, recv, name, argc),
        }
    }

    fn invoke(
        &mut self,
        a: usize,
        recv: Value,
        name: Symbol,
        argc: usize,
        method: Method,
        owner: Rc<RClass>,
    ) -> Result<(), Unwind> {
        match method {
            Method::Native(func) => self.call_native(a, recv, argc, func),
            Method::Irep(irep) => self.push_frame(FramePush {
                irep,
                a,
                argc,
                method_id: Some(name),
                own_class: Some(owner.clone()),
                target_class: owner,
                proc_: None,
                kind: FrameKind::Method,
            }),
            Method::Reader(ivar) => {
                self.check_arity(argc, 0)?;
                let v = self.ivar_get(&recv, ivar);
                self.finish_inline(a, argc, v);
                Ok(())
            }
            Method::Writer(ivar) => {
                self.check_arity(argc, 1)?;
                let v = self.r(a + 1).clone();
                self.ivar_set(&recv, ivar, v.clone())?;
                self.finish_inline(a, argc, v);
                Ok(())
            }
            Method::Builtin(Builtin::CallBlock) => match recv {
                Value::Proc(p) => self.call_block(a, p, argc),
                other => Err(self.undefined_method(name, &other)),
            },
            Method::Builtin(Builtin::New) => self.construct(a, recv, argc),
            Method::Builtin(Builtin::Send) => self.send_dynamic(a, recv, argc),
            Method::Undefined => self.method_missing(a, recv, name, argc),
        }
    }

    fn check_arity(&self, given: usize, expected: usize) -> Result<(), Unwind> {
        if given != expected {
            return Err(self.argument_error(format!(
                "wrong number of arguments (given {given}, expected {expected})"
            )));
        }
        Ok(())
    }

    /// Write a result computed without a frame and release the arguments.
    fn finish_inline(&mut self, a: usize, argc: usize, value: Value) {
        self.set(a, value);
        for n in a + 1..=a + argc + 1 {
            self.set(n, Value::Nil);
        }
    }

    fn call_native(
        &mut self,
        a: usize,
        recv: Value,
        argc: usize,
        func: NativeFn,
    ) -> Result<(), Unwind> {
        let start = self.base + a;
        let args = Args {
            values: self.regs[start + 1..start + 1 + argc].to_vec(),
            block: self.regs[start + argc + 1].clone(),
        };
        let saved_top = self.native_top;
        self.native_top = self.native_top.max(start + argc + 2);
        let serial = self.serial();
        let result = match func(self, recv, &args) {
            // `break` out of a block this frame passed to the native.
            Err(Unwind::Break { value, creator }) if creator == serial => Ok(value),
            other => other,
        };
        self.native_top = saved_top;
        for slot in &mut self.regs[start + 1..start + argc + 2] {
            *slot = Value::Nil;
        }
        self.regs[start] = result?;
        Ok(())
    }

    /// Enter `block` in the dispatch loop with its arguments at R(a+1).
    pub(crate) fn call_block(&mut self, a: usize, block: Rc<RProc>, argc: usize) -> Result<(), Unwind> {
        let (method_id, own_class) = match &block.method {
            Some((name, owner)) => (Some(*name), Some(owner.clone())),
            None => (None, None),
        };
        let self_value = block.self_value.clone();
        self.push_frame(FramePush {
            irep: block.irep.clone(),
            a,
            argc,
            method_id,
            own_class,
            target_class: block.target_class.clone(),
            proc_: Some(block),
            kind: FrameKind::Block,
        })?;
        self.set(0, self_value);
        Ok(())
    }

    /// `Class#new`: allocate an instance of R(a) and run `initialize`.
    fn construct(&mut self, a: usize, recv: Value, argc: usize) -> Result<(), Unwind> {
        let Value::Class(class) = &recv else {
            return Err(self.undefined_method(sym::NEW, &recv));
        };
        let instance = match class.instance_kind {
            InstanceKind::Object => self.new_instance(class.clone())?,
            InstanceKind::Exception => Value::Exception(RException::new(class.clone(), None)),
            InstanceKind::String => self.new_string(Vec::new())?,
            InstanceKind::Array => self.new_array(Vec::new())?,
            InstanceKind::Hash => self.new_hash(Vec::new())?,
            InstanceKind::None => return Err(self.undefined_method(sym::NEW, &recv)),
        };
        self.set(a, instance.clone());

        let lookup = self.system.class_of(&instance);
        match lookup.find_method(sym::INITIALIZE) {
            Some((Method::Irep(irep), owner)) => self.push_frame(FramePush {
                irep,
                a,
                argc,
                method_id: Some(sym::INITIALIZE),
                own_class: Some(owner.clone()),
                target_class: owner,
                proc_: None,
                kind: FrameKind::Constructor,
            }),
            Some((Method::Native(func), _)) => {
                self.call_native(a, instance.clone(), argc, func)?;
                self.set(a, instance);
                Ok(())
            }
            _ => {
                if argc > 0 && class.instance_kind == InstanceKind::Object {
                    return Err(self.argument_error(format!(
                        "wrong number of arguments (given {argc}, expected 0)"
                    )));
                }
                self.finish_inline(a, argc, instance);
                Ok(())
            }
        }
    }

    /// `send(name, *args)`: dispatch on the first argument.
    fn send_dynamic(&mut self, a: usize, recv: Value, argc: usize) -> Result<(), Unwind> {
        if argc == 0 {
            return Err(self.argument_error("no method name given"));
        }
        let name = match self.r(a + 1) {
            Value::Symbol(s) => *s,
            Value::String(s) => Symbol::intern(&s.to_string_lossy()),
            other => {
                return Err(self.type_error(format!("{} is not a symbol nor a string", other.inspect())));
            }
        };
        for n in a + 1..=a + argc {
            let v = self.r(n + 1).clone();
            self.set(n, v);
        }
        self.set(a + argc + 1, Value::Nil);
        self.dispatch(a, recv, name, argc - 1)
    }

    /// Retry a failed lookup as `method_missing(name, *args)`.
    fn method_missing(&mut self, a: usize, recv: Value, name: Symbol, argc: usize) -> Result<(), Unwind> {
        let class = self.system.class_of(&recv);
        let Some((method, owner)) = class.find_method(sym::METHOD_MISSING) else {
            return Err(self.undefined_method(name, &recv));
        };
        if self.base + a + argc + 3 > self.regs.len() {
            return Err(self.stack_error("stack level too deep (too many arguments)"));
        }
        for n in (a + 1..=a + argc + 1).rev() {
            let v = self.r(n).clone();
            self.set(n + 1, v);
        }
        self.set(a + 1, Value::Symbol(name));
        self.invoke(a, recv, sym::METHOD_MISSING, argc + 1, method, owner)
    }

    /// `SUPER`: call the next definition of the running method past the
    /// class it was found in.
    pub(crate) fn super_send(&mut self, a: usize, argc: u32) -> Result<(), Unwind> {
        let in_block = self.frames.last().is_some_and(|f| f.kind == FrameKind::Block);
        let context = match &self.current_proc {
            Some(p) if in_block => p.method.clone(),
            _ => self
                .frames
                .last()
                .and_then(|f| Some((f.method_id?, f.own_class.clone()?))),
        };
        let Some((name, owner)) = context else {
            return Err(self.runtime_error("super called outside of method"));
        };
        let recv = self.r(0).clone();
        self.set(a, recv.clone());
        let argc = self.unpack_args(a, argc, true)?;
        let class = self.system.class_of(&recv);
        match class.find_super_method(&owner, name) {
            Some((method, found)) => self.invoke(a, recv, name, argc, method, found),
            None => Err(self.no_method_error(format!("super: no superclass method '{name}'"))),
        }
    }

    /// `ENTER`: check the arguments against `aspec` and lay them out as
    /// the method expects.
    pub(crate) fn enter(&mut self, bits: u32) -> Result<(), Unwind> {
        let spec = Aspec::decode(bits);
        if spec.keywords > 0 {
            return Err(self.argument_error("keyword arguments are not supported"));
        }
        let Some(frame) = self.frames.last() else {
            return Ok(());
        };
        let argc = frame.argc;
        let strict = frame.kind != FrameKind::Block
            || self.current_proc.as_ref().is_some_and(|p| p.lambda);

        let block = self.r(argc + 1).clone();
        let mut args = self.regs[self.base + 1..self.base + 1 + argc].to_vec();
        let wants_many = spec.required + spec.optional + spec.post + spec.rest as usize > 1;
        if !strict && args.len() == 1 && wants_many {
            if let Value::Array(arr) = &args[0] {
                let items = arr.items().clone();
                args = items;
            }
        }

        let required = spec.required + spec.post;
        let given = args.len();
        if strict && (given < required || (!spec.rest && given > required + spec.optional)) {
            return Err(self.argument_error(format!(
                "wrong number of arguments (given {given}, expected {})",
                spec.expected()
            )));
        }
        if !spec.rest {
            args.truncate(required + spec.optional);
        }
        let given = args.len();

        let opt_given = given.saturating_sub(required).min(spec.optional);
        let post_given = if given >= required {
            spec.post
        } else {
            given.saturating_sub(spec.required)
        };
        let post_start = given - post_given;

        let mut layout = vec![Value::Nil; spec.len()];
        let pre_given = given.min(spec.required);
        layout[..pre_given].clone_from_slice(&args[..pre_given]);
        let opt_from = spec.required;
        layout[opt_from..opt_from + opt_given].clone_from_slice(&args[opt_from..opt_from + opt_given]);
        let mut at = spec.required + spec.optional;
        if spec.rest {
            let from = (spec.required + opt_given).min(post_start);
            let rest = args[from..post_start].to_vec();
            layout[at] = self.new_array(rest)?;
            at += 1;
        }
        layout[at..at + post_given].clone_from_slice(&args[post_start..]);

        let block_slot = spec.len() + 1;
        if self.base + block_slot >= self.regs.len() {
            return Err(self.stack_error("stack level too deep (register file exhausted)"));
        }
        for (i, v) in layout.into_iter().enumerate() {
            self.set(1 + i, v);
        }
        self.set(block_slot, block);
        for n in block_slot + 1..=argc + 1 {
            self.set(n, Value::Nil);
        }

        if spec.optional > 0 {
            self.pc += opt_given * 3;
        }
        Ok(())
    }

    /// Start of the window a `BLKPUSH`/`ARGARY` operand refers to.
    fn layout_base(&self, layout: &ArgLayout) -> Result<usize, Unwind> {
        if layout.level == 0 {
            return Ok(self.base);
        }
        self.upvar_slot(layout.level - 1, 0)
            .ok_or_else(|| self.local_jump_error("the enclosing method has returned"))
    }

    /// `ARGARY`: R(a) = the method's arguments as one array, R(a+1) = its
    /// block.
    pub(crate) fn arg_ary(&mut self, a: usize, bits: u32) -> Result<(), Unwind> {
        let layout = ArgLayout::decode(bits);
        let base = self.layout_base(&layout)?;
        let mut items = self.regs[base + 1..base + 1 + layout.pre].to_vec();
        let mut at = base + 1 + layout.pre;
        if layout.rest {
            items.extend(splat(&self.regs[at]));
            at += 1;
        }
        items.extend_from_slice(&self.regs[at..at + layout.post]);
        let block = self.regs[base + layout.block_slot()].clone();
        let v = self.new_array(items)?;
        self.set(a, v);
        self.set(a + 1, block);
        Ok(())
    }

    /// `BLKPUSH`: R(a) = the block passed to the method.
    pub(crate) fn blk_push(&mut self, a: usize, bits: u32) -> Result<(), Unwind> {
        let layout = ArgLayout::decode(bits);
        let base = self.layout_base(&layout)?;
        let block = self.regs[base + layout.block_slot()].clone();
        if block.is_nil() {
            return Err(self.local_jump_error("no block given (yield)"));
        }
        self.set(a, block);
        Ok(())
    }

    /// Call `name` on `recv` from native code and return its value.
    pub fn funcall(
        &mut self,
        recv: Value,
        name: Symbol,
        args: &[Value],
        block: Value,
    ) -> Result<Value, Unwind> {
        let argc = args.len();
        self.reenter(recv.clone(), args, block, move |vm, a| vm.dispatch(a, recv, name, argc))
    }

    /// Call `block` with `args` from native code and return its value.
    pub fn yield_block(&mut self, block: &Value, args: &[Value]) -> Result<Value, Unwind> {
        let Value::Proc(p) = block else {
            return Err(self.local_jump_error("no block given (yield)"));
        };
        let p = p.clone();
        let argc = args.len();
        self.reenter(p.self_value.clone(), args, Value::Nil, move |vm, a| {
            vm.call_block(a, p, argc)
        })
    }

    /// Lay out a call window above everything live, make the call, and run
    /// a nested dispatch loop until the frame it pushed returns.
    fn reenter(
        &mut self,
        recv: Value,
        args: &[Value],
        block: Value,
        call: impl FnOnce(&mut Vm, usize) -> Result<(), Unwind>,
    ) -> Result<Value, Unwind> {
        if self.catch_stack.len() >= self.config.catch_stack_size {
            return Err(self.stack_error("stack level too deep (nested native calls)"));
        }
        let start = self.native_top.max(self.base + self.irep.nregs());
        let argc = args.len();
        if start + argc + 2 > self.regs.len() {
            return Err(self.stack_error("stack level too deep (register file exhausted)"));
        }
        self.regs[start] = recv;
        self.regs[start + 1..start + 1 + argc].clone_from_slice(args);
        self.regs[start + argc + 1] = block;

        let depth = self.frames.len();
        let a = start - self.base;
        let result = match call(self, a) {
            Ok(()) => self.run_nested(depth),
            Err(u) => Err(u),
        };
        let value = mem::take(&mut self.regs[start]);
        for slot in &mut self.regs[start + 1..start + argc + 2] {
            *slot = Value::Nil;
        }
        result.map(|()| value)
    }

    fn run_nested(&mut self, depth: usize) -> Result<(), Unwind> {
        if self.frames.len() <= depth {
            return Ok(());
        }
        self.catch_stack.push(depth);
        let outcome = self.execute(Some(depth));
        self.catch_stack.pop();
        let result = match outcome {
            Ok(Exit::Returned) => return Ok(()),
            // `STOP` ends the whole program.
            Ok(Exit::Halted) => Err(Unwind::Return {
                value: Value::Nil,
                home: 0,
            }),
            Ok(Exit::Invalid { pc }) => Err(self.runtime_error(format!("invalid instruction at {pc}"))),
            Ok(Exit::Preempted) => Err(self.runtime_error("preempted inside a native call")),
            Err(u) => Err(u),
        };
        while self.frames.len() > depth {
            self.pop_frame();
        }
        result
    }

    pub(crate) fn ivar_get(&self, recv: &Value, name: Symbol) -> Value {
        match recv {
            Value::Object(o) => o.ivars.get(name),
            Value::Class(c) => c.ivars.get(name),
            Value::Exception(e) => e.ivars.get(name),
            _ => Value::Nil,
        }
    }

    pub(crate) fn ivar_set(&self, recv: &Value, name: Symbol, value: Value) -> Result<(), Unwind> {
        match recv {
            Value::Object(o) => o.ivars.set(name, value),
            Value::Class(c) => c.ivars.set(name, value),
            Value::Exception(e) => e.ivars.set(name, value),
            other => {
                return Err(self.runtime_error(format!(
                    "can't modify instance variable of {}",
                    other.inspect()
                )));
            }
        }
        Ok(())
    }

    /// Whether `recv` has a method `name` defined in bytecode, which takes
    /// precedence over the built-in conversion.
    fn user_defined(&self, recv: &Value, name: Symbol) -> bool {
        matches!(recv, Value::Object(_) | Value::Exception(_) | Value::Class(_))
            && matches!(
                self.system.class_of(recv).find_method(name),
                Some((Method::Irep(_), _))
            )
    }

    /// `recv.to_s` as text.
    pub fn to_s_value(&mut self, recv: &Value) -> Result<String, Unwind> {
        if self.user_defined(recv, sym::TO_S) {
            let v = self.funcall(recv.clone(), sym::TO_S, &[], Value::Nil)?;
            return Ok(v.to_s());
        }
        Ok(match recv {
            Value::Object(o) if Rc::ptr_eq(o, &self.system.builtins.main) => "main".into(),
            other => other.to_s(),
        })
    }

    /// `recv.inspect` as text.
    pub fn inspect_value(&mut self, recv: &Value) -> Result<String, Unwind> {
        if self.user_defined(recv, sym::INSPECT) {
            let v = self.funcall(recv.clone(), sym::INSPECT, &[], Value::Nil)?;
            return Ok(v.to_s());
        }
        if self.user_defined(recv, sym::TO_S) && matches!(recv, Value::Object(_)) {
            return self.to_s_value(recv);
        }
        Ok(match recv {
            Value::Object(o) if Rc::ptr_eq(o, &self.system.builtins.main) => "main".into(),
            other => other.inspect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspec_fields() {
        // def m(a, b = 1, *r, c, &blk)
        let bits = 1 << 18 | 1 << 13 | 1 << 12 | 1 << 7 | 1;
        let spec = Aspec::decode(bits);
        assert_eq!(
            spec,
            Aspec {
                required: 1,
                optional: 1,
                rest: true,
                post: 1,
                keywords: 0,
                kdict: false,
                block: true,
            }
        );
        assert_eq!(spec.len(), 4);
        assert_eq!(spec.expected(), "2+");
        assert_eq!(Aspec::decode(2 << 18 | 2 << 13).expected(), "2..4");
        assert_eq!(Aspec::decode(3 << 18).expected(), "3");
    }

    #[test]
    fn arg_layout_block_slot() {
        // two leading, a rest, one post
        let layout = ArgLayout::decode(2 << 11 | 1 << 10 | 1 << 5 | 1);
        assert_eq!((layout.pre, layout.rest, layout.post, layout.level), (2, true, 1, 1));
        assert_eq!(layout.block_slot(), 5);
    }
}
