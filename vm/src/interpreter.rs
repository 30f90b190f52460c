use std::{rc::Rc, sync::atomic::Ordering};

use bytecode::{Instruction, Op, decode_at};

use crate::class::{ClassKind, Method, RClass};
use crate::exception::Unwind;
use crate::frame::{FrameKind, FramePush};
use crate::irep::{CatchFilter, PoolEntry};
use crate::primitives::numeric::{self, ArithOp};
use crate::value::{Env, ProcParts, Value};
use crate::{Symbol, Vm, sym};

/// Why [`Vm::execute`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Halted,
    Preempted,
    /// The frame pushed by a host re-entry has returned.
    Returned,
    Invalid { pc: usize },
}

type Step = Result<Option<Exit>, Unwind>;

impl Vm {
    /// The dispatch loop.
    ///
    /// `pad` is the call depth of the host re-entry this loop serves; the
    /// loop returns once the frame above it is popped, and unwinds never
    /// pop below it.
    pub(crate) fn execute(&mut self, pad: Option<usize>) -> Result<Exit, Unwind> {
        loop {
            if let Some(depth) = pad {
                if self.frames.len() <= depth {
                    return Ok(Exit::Returned);
                }
            }
            let pc = self.pc;
            if pc >= self.irep.ilen() {
                if self.frames.is_empty() {
                    return Ok(Exit::Halted);
                }
                self.return_value(Value::Nil);
                continue;
            }
            let (insn, next) = match decode_at(self.irep.code(), pc) {
                Ok(decoded) => decoded,
                Err(_) => return Ok(Exit::Invalid { pc }),
            };
            self.pc = next;
            if self.config.debug {
                log::trace!("vm {} [{}] {pc:04} {insn}", self.id, self.frames.len());
            }
            match self.step(insn, pc) {
                Ok(None) => {}
                Ok(Some(exit)) => return Ok(exit),
                Err(unwind) => self.handle_unwind(unwind, pc, pad)?,
            }
        }
    }

    #[inline(always)]
    pub(crate) fn r(&self, n: usize) -> &Value {
        &self.regs[self.base + n]
    }

    #[inline(always)]
    pub(crate) fn set(&mut self, n: usize, value: Value) {
        self.regs[self.base + n] = value;
    }

    /// Leave the head frame with `value`.
    fn return_value(&mut self, value: Value) {
        let constructor = self.frames.last().is_some_and(|f| f.is_constructor());
        if !constructor {
            self.regs[self.base] = value;
        }
        self.pop_frame();
    }

    fn check_preempt(&self) -> Option<Exit> {
        if self.catch_stack.is_empty()
            && self.preempt.load(Ordering::Relaxed)
            && self.preempt.swap(false, Ordering::AcqRel)
        {
            log::debug!("vm {}: preempted at {}", self.id, self.pc);
            return Some(Exit::Preempted);
        }
        None
    }

    fn jump(&mut self, raw: u32) -> Option<Exit> {
        let offset = raw as u16 as i16;
        self.pc = (self.pc as isize + offset as isize) as usize;
        if offset < 0 { self.check_preempt() } else { None }
    }

    fn step(&mut self, insn: Instruction, pc: usize) -> Step {
        let (a, b, c) = (insn.a as usize, insn.b as usize, insn.c as usize);
        match insn.op {
            Op::Nop | Op::KeyEnd | Op::Ext1 | Op::Ext2 | Op::Ext3 => {}

            // Register moves.
            Op::Move => {
                let v = self.r(b).clone();
                self.set(a, v);
            }
            Op::LoadL | Op::LoadL16 => {
                let v = self.pool_value(b)?;
                self.set(a, v);
            }
            Op::LoadI => self.set(a, Value::Integer(b as i64)),
            Op::LoadINeg => self.set(a, Value::Integer(-(b as i64))),
            Op::LoadIM1
            | Op::LoadI0
            | Op::LoadI1
            | Op::LoadI2
            | Op::LoadI3
            | Op::LoadI4
            | Op::LoadI5
            | Op::LoadI6
            | Op::LoadI7 => {
                let n = insn.op as i64 - Op::LoadI0 as i64;
                self.set(a, Value::Integer(n));
            }
            Op::LoadI16 => self.set(a, Value::Integer(insn.signed_b() as i64)),
            Op::LoadI32 => self.set(a, Value::Integer(insn.wide_immediate() as i64)),
            Op::LoadSym | Op::LoadSym16 => {
                let name = self.irep.symbol(b);
                self.set(a, Value::Symbol(name));
            }
            Op::LoadNil => self.set(a, Value::Nil),
            Op::LoadSelf => {
                let v = self.r(0).clone();
                self.set(a, v);
            }
            Op::LoadT => self.set(a, Value::True),
            Op::LoadF => self.set(a, Value::False),

            // Variables.
            Op::GetGv | Op::GetSv => {
                let v = self.system.global_get(self.irep.symbol(b));
                self.set(a, v);
            }
            Op::SetGv | Op::SetSv => {
                self.system.global_set(self.irep.symbol(b), self.r(a).clone());
            }
            Op::GetIv => {
                let v = self.ivar_get(self.r(0), self.irep.symbol(b));
                self.set(a, v);
            }
            Op::SetIv => {
                let recv = self.r(0).clone();
                self.ivar_set(&recv, self.irep.symbol(b), self.r(a).clone())?;
            }
            Op::GetCv => {
                let v = self.class_var_get(self.irep.symbol(b))?;
                self.set(a, v);
            }
            Op::SetCv => self.class_var_set(self.irep.symbol(b), self.r(a).clone()),
            Op::GetConst => {
                let name = self.irep.symbol(b);
                let v = self
                    .const_lookup(name)
                    .ok_or_else(|| self.name_error(format!("uninitialized constant {name}")))?;
                self.set(a, v);
            }
            Op::SetConst => {
                let v = self.r(a).clone();
                let name = self.irep.symbol(b);
                name_class(&v, &self.target_class, name);
                self.target_class.const_set(name, v);
            }
            Op::GetMConst => {
                let name = self.irep.symbol(b);
                let scope = self.class_operand(a)?;
                let v = scope
                    .ancestors()
                    .iter()
                    .find_map(|c| c.const_get(name))
                    .ok_or_else(|| {
                        self.name_error(format!("uninitialized constant {}::{name}", scope.name()))
                    })?;
                self.set(a, v);
            }
            Op::SetMConst => {
                let name = self.irep.symbol(b);
                let scope = self.class_operand(a + 1)?;
                let v = self.r(a).clone();
                name_class(&v, &scope, name);
                scope.const_set(name, v);
            }
            Op::GetUpvar => {
                let v = self
                    .upvar_slot(c, b)
                    .map(|slot| self.regs[slot].clone())
                    .unwrap_or_default();
                self.set(a, v);
            }
            Op::SetUpvar => {
                if let Some(slot) = self.upvar_slot(c, b) {
                    self.regs[slot] = self.r(a).clone();
                }
            }

            // Control flow.
            Op::Jmp => return Ok(self.jump(insn.a)),
            Op::JmpIf => {
                if self.r(a).is_truthy() {
                    return Ok(self.jump(insn.b));
                }
            }
            Op::JmpNot => {
                if !self.r(a).is_truthy() {
                    return Ok(self.jump(insn.b));
                }
            }
            Op::JmpNil => {
                if self.r(a).is_nil() {
                    return Ok(self.jump(insn.b));
                }
            }
            Op::JmpUw => {
                let offset = insn.a as u16 as i16;
                let target = (self.pc as isize + offset as isize) as usize;
                return Err(Unwind::Jump { target });
            }

            // Exceptions.
            Op::Except => {
                let v = match self.pending.take() {
                    Some(Unwind::Raise(e)) => Value::Exception(e),
                    Some(other) => Value::Unwind(Rc::new(other)),
                    None => Value::Nil,
                };
                self.set(a, v);
            }
            Op::Rescue => {
                let Value::Class(class) = self.r(b).clone() else {
                    return Err(self.type_error("class or module required for rescue clause"));
                };
                let matched = self.system.is_a(self.r(a), &class);
                self.set(b, Value::bool(matched));
            }
            Op::RaiseIf => match self.r(a).clone() {
                Value::Nil | Value::False => {}
                Value::Exception(e) => return Err(Unwind::Raise(e)),
                Value::Unwind(u) => return Err((*u).clone()),
                other => return Err(self.make_exception(other, None)),
            },

            // Sends.
            Op::SendV => return self.send_step(a, self.irep.symbol(b), 15, false),
            Op::SendVB => return self.send_step(a, self.irep.symbol(b), 15, true),
            Op::Send => return self.send_step(a, self.irep.symbol(b), insn.c, false),
            Op::SendB => return self.send_step(a, self.irep.symbol(b), insn.c, true),
            Op::SendVK => return Err(self.argument_error("keyword arguments are not supported")),
            Op::Call => self.call_in_place()?,
            Op::Super => {
                self.super_send(a, insn.b)?;
                return Ok(self.check_preempt());
            }
            Op::ArgAry => self.arg_ary(a, insn.b)?,
            Op::Enter => self.enter(insn.a)?,
            Op::KeyP => self.set(a, Value::False),
            Op::KArg => {
                let name = self.irep.symbol(b);
                return Err(self.argument_error(format!("missing keyword: :{name}")));
            }
            Op::Return => return self.op_return(a, pc),
            Op::ReturnBlk => return self.op_return_blk(a, pc),
            Op::Break => return self.op_break(a, pc),
            Op::BlkPush => self.blk_push(a, insn.b)?,

            // Arithmetic and comparison.
            Op::Add => return self.arith(a, ArithOp::Add, None, sym::PLUS),
            Op::AddI => return self.arith(a, ArithOp::Add, Some(b as i64), sym::PLUS),
            Op::Sub => return self.arith(a, ArithOp::Sub, None, sym::MINUS),
            Op::SubI => return self.arith(a, ArithOp::Sub, Some(b as i64), sym::MINUS),
            Op::Mul => return self.arith(a, ArithOp::Mul, None, sym::MUL),
            Op::Div => return self.arith(a, ArithOp::Div, None, sym::DIV),
            Op::Eq => return self.op_eq(a),
            Op::Lt => return self.compare(a, sym::LT, |o| o.is_lt()),
            Op::Le => return self.compare(a, sym::LE, |o| o.is_le()),
            Op::Gt => return self.compare(a, sym::GT, |o| o.is_gt()),
            Op::Ge => return self.compare(a, sym::GE, |o| o.is_ge()),

            // Arrays, strings and hashes.
            Op::Array => {
                let items = self.regs[self.base + a..self.base + a + b].to_vec();
                let v = self.new_array(items)?;
                self.set(a, v);
            }
            Op::Array2 => {
                let items = self.regs[self.base + b..self.base + b + c].to_vec();
                let v = self.new_array(items)?;
                self.set(a, v);
            }
            Op::AryCat => {
                let tail = splat(self.r(a + 1));
                match self.r(a).clone() {
                    Value::Array(arr) => arr.with_items(|items| items.extend(tail)),
                    Value::Nil => {
                        let v = self.new_array(tail)?;
                        self.set(a, v);
                    }
                    other => {
                        let mut items = vec![other];
                        items.extend(tail);
                        let v = self.new_array(items)?;
                        self.set(a, v);
                    }
                }
            }
            Op::AryPush => {
                let item = self.r(a + 1).clone();
                match self.r(a) {
                    Value::Array(arr) => arr.push(item),
                    _ => return Err(self.type_error("ARYPUSH on a non-array")),
                }
            }
            Op::AryDup => {
                let items = splat(self.r(a));
                let v = self.new_array(items)?;
                self.set(a, v);
            }
            Op::ARef => {
                let v = match self.r(b) {
                    Value::Array(arr) => arr.get(c as i64),
                    other if c == 0 => other.clone(),
                    _ => Value::Nil,
                };
                self.set(a, v);
            }
            Op::ASet => {
                let v = self.r(a).clone();
                match self.r(b) {
                    Value::Array(arr) => {
                        arr.set(c as i64, v);
                    }
                    _ => return Err(self.type_error("ASET on a non-array")),
                }
            }
            Op::APost => self.apost(a, b, c)?,
            Op::Intern => {
                let name = match self.r(a) {
                    Value::String(s) => Symbol::intern(&s.to_string_lossy()),
                    Value::Symbol(s) => *s,
                    _ => return Err(self.type_error("INTERN on a non-string")),
                };
                self.set(a, Value::Symbol(name));
            }
            Op::String | Op::String16 => {
                let bytes = match self.irep.pool_entry(b) {
                    PoolEntry::Str(bytes) => bytes.to_vec(),
                    _ => return Err(self.type_error("pool entry is not a string")),
                };
                let v = self.new_string(bytes)?;
                self.set(a, v);
            }
            Op::StrCat => {
                let rhs = self.r(a + 1).clone();
                let text = self.to_s_value(&rhs)?;
                match self.r(a) {
                    Value::String(s) => s.push_bytes(text.as_bytes()),
                    _ => return Err(self.type_error("STRCAT on a non-string")),
                }
            }
            Op::Hash => {
                let entries = self.regs[self.base + a..self.base + a + 2 * b]
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                let v = self.new_hash(entries)?;
                self.set(a, v);
            }
            Op::HashAdd => {
                let Value::Hash(hash) = self.r(a).clone() else {
                    return Err(self.type_error("HASHADD on a non-hash"));
                };
                for pair in self.regs[self.base + a + 1..self.base + a + 1 + 2 * b].chunks(2) {
                    hash.insert(pair[0].clone(), pair[1].clone());
                }
            }
            Op::HashCat => {
                let (Value::Hash(into), Value::Hash(from)) = (self.r(a).clone(), self.r(a + 1).clone())
                else {
                    return Err(self.type_error("HASHCAT on a non-hash"));
                };
                let entries = from.entries().clone();
                for (k, v) in entries {
                    into.insert(k, v);
                }
            }

            // Procs and ranges.
            Op::Lambda | Op::Lambda16 => {
                let p = self.make_proc(b, ProcFlavor::Lambda)?;
                self.set(a, Value::Proc(p));
            }
            Op::Block | Op::Block16 => {
                let p = self.make_proc(b, ProcFlavor::Block)?;
                self.set(a, Value::Proc(p));
            }
            Op::Method | Op::Method16 => {
                let p = self.make_proc(b, ProcFlavor::Method)?;
                self.set(a, Value::Proc(p));
            }
            Op::RangeInc | Op::RangeExc => {
                let (first, last) = (self.r(a).clone(), self.r(a + 1).clone());
                let v = self.new_range(first, last, insn.op == Op::RangeExc)?;
                self.set(a, v);
            }

            // Classes and methods.
            Op::OClass => {
                let object = self.system.builtins.object.clone();
                self.set(a, Value::Class(object));
            }
            Op::Class => self.define_class(a, self.irep.symbol(b), false)?,
            Op::Module => self.define_class(a, self.irep.symbol(b), true)?,
            Op::Exec | Op::Exec16 => {
                let class = self.class_operand(a)?;
                let irep = self.irep.child(b).clone();
                self.set(a + 1, Value::Nil);
                self.push_frame(FramePush {
                    irep,
                    a,
                    argc: 0,
                    method_id: None,
                    own_class: None,
                    target_class: class,
                    proc_: None,
                    kind: FrameKind::Exec,
                })?;
            }
            Op::Def => {
                let name = self.irep.symbol(b);
                let class = self.class_operand(a)?;
                let Value::Proc(body) = self.r(a + 1).clone() else {
                    return Err(self.type_error("DEF without a method body"));
                };
                log::debug!("define {}#{name}", class.name());
                class.define_method(name, Method::Irep(body.irep.clone()));
                self.set(a, Value::Symbol(name));
            }
            Op::Alias => {
                let (new, old) = (self.irep.symbol(a), self.irep.symbol(b));
                self.alias_method(&self.target_class.clone(), new, old)?;
            }
            Op::Undef => {
                let name = self.irep.symbol(a);
                self.target_class.define_method(name, Method::Undefined);
            }
            Op::SClass => {
                let target = self.r(a).clone();
                let singleton = self
                    .system
                    .singleton_of(&target)
                    .ok_or_else(|| self.type_error("can't define singleton"))?;
                self.set(a, Value::Class(singleton));
            }
            Op::TClass => {
                let class = self.target_class.clone();
                self.set(a, Value::Class(class));
            }

            Op::Debug => log::debug!("vm {}: DEBUG {a} {b} {c} at {pc}", self.id),
            Op::Err => {
                let message = match self.irep.pool_entry(a) {
                    PoolEntry::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    _ => "unexpected jump".into(),
                };
                return Err(self.local_jump_error(message));
            }
            Op::Stop => return Ok(Some(Exit::Halted)),
        }
        Ok(None)
    }

    fn send_step(&mut self, a: usize, name: Symbol, argc: u32, has_block: bool) -> Step {
        self.send(a, name, argc, has_block)?;
        Ok(self.check_preempt())
    }

    fn pool_value(&self, n: usize) -> Result<Value, Unwind> {
        match self.irep.pool_entry(n) {
            PoolEntry::Str(bytes) => self.new_string(bytes.to_vec()),
            PoolEntry::Int(i) => Ok(Value::Integer(i)),
            PoolEntry::Float(f) => Ok(Value::Float(f)),
            PoolEntry::BigInt { negative, base, digits } => {
                Ok(numeric::parse_big(negative, base, digits))
            }
        }
    }

    fn op_return(&mut self, a: usize, pc: usize) -> Step {
        let value = self.r(a).clone();
        if self.irep.find_handler(pc, CatchFilter::Ensure).is_some() {
            return Err(Unwind::Return { value, home: self.serial() });
        }
        if self.frames.is_empty() {
            self.regs[self.base] = value;
            return Ok(Some(Exit::Halted));
        }
        self.return_value(value);
        Ok(self.check_preempt())
    }

    /// `return` written inside a block leaves the method the block was
    /// written in.
    fn op_return_blk(&mut self, a: usize, pc: usize) -> Step {
        let in_block = self.frames.last().is_some_and(|f| f.kind == FrameKind::Block);
        let home = match &self.current_proc {
            Some(p) if in_block && !p.lambda => p.home,
            _ => return self.op_return(a, pc),
        };
        if !self.is_live(home) {
            return Err(self.local_jump_error("unexpected return"));
        }
        Err(Unwind::Return { value: self.r(a).clone(), home })
    }

    fn op_break(&mut self, a: usize, pc: usize) -> Step {
        let (creator, lambda) = match &self.current_proc {
            Some(p) => (p.env.map(|env| env.serial), p.lambda),
            None => (None, false),
        };
        if lambda {
            return self.op_return(a, pc);
        }
        match creator {
            Some(creator) if self.is_live(creator) => Err(Unwind::Break {
                value: self.r(a).clone(),
                creator,
            }),
            _ => Err(self.local_jump_error("break from proc-closure")),
        }
    }

    fn arith(&mut self, a: usize, op: ArithOp, immediate: Option<i64>, name: Symbol) -> Step {
        let rhs = match immediate {
            Some(i) => Value::Integer(i),
            None => self.r(a + 1).clone(),
        };
        if let Some(result) = numeric::arith(self, op, self.r(a), &rhs) {
            let v = result?;
            self.set(a, v);
            return Ok(None);
        }
        if immediate.is_some() {
            self.set(a + 1, rhs);
        }
        self.send_step(a, name, 1, false)
    }

    fn op_eq(&mut self, a: usize) -> Step {
        let (lhs, rhs) = (self.r(a), self.r(a + 1));
        let fast = match (lhs, rhs) {
            _ if lhs.is_numeric() && rhs.is_numeric() => Some(lhs == rhs),
            (Value::Nil | Value::True | Value::False | Value::Symbol(_), _) => {
                Some(lhs.same_object(rhs))
            }
            (Value::String(x), Value::String(y)) => Some(*x.bytes() == *y.bytes()),
            _ => None,
        };
        match fast {
            Some(eq) => {
                self.set(a, Value::bool(eq));
                Ok(None)
            }
            None => self.send_step(a, sym::EQ, 1, false),
        }
    }

    fn compare(&mut self, a: usize, name: Symbol, test: fn(std::cmp::Ordering) -> bool) -> Step {
        let (lhs, rhs) = (self.r(a), self.r(a + 1));
        if !lhs.is_numeric() {
            return self.send_step(a, name, 1, false);
        }
        if !rhs.is_numeric() {
            return Err(self.comparison_failed(lhs, rhs));
        }
        let result = numeric::compare(lhs, rhs).is_some_and(test);
        self.set(a, Value::bool(result));
        Ok(None)
    }

    pub(crate) fn comparison_failed(&self, lhs: &Value, rhs: &Value) -> Unwind {
        let describe = |v: &Value| match v {
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            other => self.system.real_class_of(other).name(),
        };
        self.type_error(format!("comparison of {} with {} failed", describe(lhs), describe(rhs)))
    }

    /// `*R(a), R(a+1)..=R(a+post) = R(a)` with `pre` leading elements
    /// skipped.
    fn apost(&mut self, a: usize, pre: usize, post: usize) -> Result<(), Unwind> {
        let items = splat(self.r(a));
        let len = items.len();
        if len > pre + post {
            let rest = items[pre..len - post].to_vec();
            let v = self.new_array(rest)?;
            self.set(a, v);
            for (i, item) in items[len - post..].iter().enumerate() {
                self.set(a + 1 + i, item.clone());
            }
        } else {
            let v = self.new_array(Vec::new())?;
            self.set(a, v);
            for i in 0..post {
                let item = items.get(pre + i).cloned().unwrap_or_default();
                self.set(a + 1 + i, item);
            }
        }
        Ok(())
    }

    /// Replace the running code with the proc in R0, keeping the frame.
    fn call_in_place(&mut self) -> Result<(), Unwind> {
        let Value::Proc(p) = self.r(0).clone() else {
            return Err(self.type_error("CALL without a proc in R0"));
        };
        if self.base + p.irep.nregs() > self.regs.len() {
            return Err(self.stack_error("stack level too deep (register file exhausted)"));
        }
        self.irep = p.irep.clone();
        self.pc = 0;
        self.target_class = p.target_class.clone();
        self.set(0, p.self_value.clone());
        self.current_proc = Some(p);
        Ok(())
    }

    fn make_proc(&self, child: usize, flavor: ProcFlavor) -> Result<Rc<crate::RProc>, Unwind> {
        let irep = self.irep.child(child).clone();
        let parts = match flavor {
            ProcFlavor::Method => ProcParts {
                irep,
                self_value: Value::Nil,
                env: None,
                outer: None,
                home: 0,
                target_class: self.target_class.clone(),
                method: None,
                lambda: true,
            },
            ProcFlavor::Block | ProcFlavor::Lambda => {
                let home = match &self.current_proc {
                    Some(p) if !p.lambda => p.home,
                    _ => self.serial(),
                };
                let method = match &self.current_proc {
                    Some(p) => p.method.clone(),
                    None => self
                        .frames
                        .last()
                        .and_then(|f| Some((f.method_id?, f.own_class.clone()?))),
                };
                ProcParts {
                    irep,
                    self_value: self.r(0).clone(),
                    env: Some(Env {
                        base: self.base,
                        serial: self.serial(),
                    }),
                    outer: self.current_proc.clone(),
                    home,
                    target_class: self.target_class.clone(),
                    method,
                    lambda: flavor == ProcFlavor::Lambda,
                }
            }
        };
        self.new_proc(parts)
    }

    /// Register index of upvar `reg` at `level` enclosing blocks out, when
    /// the frame that owns it is still live.
    pub(crate) fn upvar_slot(&self, level: usize, reg: usize) -> Option<usize> {
        let mut p = self.current_proc.as_ref()?;
        for _ in 0..level {
            p = p.outer.as_ref()?;
        }
        let env = p.env?;
        if !self.is_live(env.serial) {
            return None;
        }
        let slot = env.base + reg;
        (slot < self.regs.len()).then_some(slot)
    }

    pub(crate) fn class_operand(&self, n: usize) -> Result<Rc<RClass>, Unwind> {
        match self.r(n) {
            Value::Class(c) => Ok(c.clone()),
            other => Err(self.type_error(format!("{} is not a class/module", other.inspect()))),
        }
    }

    fn const_lookup(&self, name: Symbol) -> Option<Value> {
        let mut scope = Some(self.target_class.clone());
        while let Some(class) = scope {
            if let Some(v) = class.const_get(name) {
                return Some(v);
            }
            scope = class.outer();
        }
        self.target_class
            .ancestors()
            .iter()
            .find_map(|c| c.const_get(name))
            .or_else(|| self.system.builtins.object.const_get(name))
    }

    /// The class whose class variables the running code sees.
    fn class_var_scope(&self) -> Rc<RClass> {
        let target = &self.target_class;
        if target.kind == ClassKind::Singleton {
            if let Some(attached) = target.outer() {
                return attached;
            }
        }
        target.clone()
    }

    fn class_var_get(&self, name: Symbol) -> Result<Value, Unwind> {
        let scope = self.class_var_scope();
        let mut cur = Some(scope.clone());
        while let Some(class) = cur {
            if let Some(v) = class.class_var_get(name) {
                return Ok(v);
            }
            cur = class.superclass().cloned();
        }
        Err(self.name_error(format!(
            "uninitialized class variable {name} in {}",
            scope.name()
        )))
    }

    fn class_var_set(&self, name: Symbol, value: Value) {
        let scope = self.class_var_scope();
        let mut cur = Some(scope.clone());
        while let Some(class) = cur {
            if class.class_var_set(name, value.clone()) {
                return;
            }
            cur = class.superclass().cloned();
        }
        scope.class_var_define(name, value);
    }

    /// `CLASS` / `MODULE`: open `name` under R(a) (nil for the current
    /// class), creating it when missing.
    fn define_class(&mut self, a: usize, name: Symbol, module: bool) -> Result<(), Unwind> {
        let outer = match self.r(a) {
            Value::Nil => self.target_class.clone(),
            _ => self.class_operand(a)?,
        };
        let superclass = if module {
            None
        } else {
            match self.r(a + 1) {
                Value::Nil => None,
                Value::Class(c) if !c.is_module() => Some(c.clone()),
                _ => return Err(self.type_error("superclass must be a Class")),
            }
        };

        if let Some(existing) = outer.const_get(name) {
            let Value::Class(class) = existing else {
                return Err(self.type_error(format!("{name} is not a class")));
            };
            if class.is_module() != module {
                let kind = if module { "module" } else { "class" };
                return Err(self.type_error(format!("{name} is not a {kind}")));
            }
            if let Some(sup) = &superclass {
                if !class.superclass().is_some_and(|s| Rc::ptr_eq(s, sup)) {
                    return Err(self.type_error(format!("superclass mismatch for class {name}")));
                }
            }
            self.set(a, Value::Class(class));
            return Ok(());
        }

        let full_name = if Rc::ptr_eq(&outer, &self.system.builtins.object) {
            name.to_string()
        } else {
            format!("{}::{name}", outer.name())
        };
        let class = if module {
            RClass::module(Some(full_name))
        } else {
            let sup = superclass.unwrap_or_else(|| self.system.builtins.object.clone());
            RClass::subclass(Some(full_name), &sup)
        };
        if !Rc::ptr_eq(&outer, &self.system.builtins.object) {
            class.set_outer(&outer);
        }
        log::debug!(
            "vm {}: define {} {}",
            self.id,
            if module { "module" } else { "class" },
            class.name()
        );
        outer.const_set(name, Value::Class(class.clone()));
        self.set(a, Value::Class(class));
        Ok(())
    }

    pub(crate) fn alias_method(
        &self,
        class: &Rc<RClass>,
        new: Symbol,
        old: Symbol,
    ) -> Result<(), Unwind> {
        let (method, _) = class.find_method(old).ok_or_else(|| {
            self.name_error(format!("undefined method '{old}' for class '{}'", class.name()))
        })?;
        class.define_method(new, method);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcFlavor {
    Block,
    Lambda,
    Method,
}

/// The elements of an array, or the value itself as one element.
pub(crate) fn splat(v: &Value) -> Vec<Value> {
    match v {
        Value::Array(arr) => arr.items().clone(),
        Value::Nil => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Assigning an anonymous class to a constant names it.
fn name_class(value: &Value, scope: &Rc<RClass>, name: Symbol) {
    if let Value::Class(class) = value {
        if !class.is_named() {
            match scope.is_named() && scope.name() != "Object" {
                true => class.set_name(format!("{}::{name}", scope.name())),
                false => class.set_name(name.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{self, Write},
    };

    use bytecode::{BytecodeBuilder, CatchHandler, CatchKind, ImageWriter, IrepDesc, PoolLiteral};

    use super::*;
    use crate::alloc::{Allocator, BudgetAllocator, SystemAllocator};
    use crate::{FORMAT_INVALID, ObjectSystem, Status, VmConfig, VmError};

    /// Output sink the test keeps a handle to.
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn irep(nregs: u16, build: impl FnOnce(&mut BytecodeBuilder, &mut IrepDesc)) -> IrepDesc {
        let mut desc = IrepDesc::new(1, nregs, Vec::new());
        let mut b = BytecodeBuilder::new();
        build(&mut b, &mut desc);
        desc.code = b.into_bytes();
        desc
    }

    fn start(desc: &IrepDesc, config: VmConfig) -> (Vm, Capture) {
        let out = Capture::default();
        let system = ObjectSystem::with(Rc::new(SystemAllocator::new()), Box::new(out.clone()));
        let mut vm = Vm::open_with(system, config);
        vm.load(ImageWriter::new().write(desc)).expect("load");
        (vm, out)
    }

    fn run(desc: &IrepDesc) -> (Vm, Result<Status, VmError>, Capture) {
        let (mut vm, out) = start(desc, VmConfig::default());
        let status = vm.run();
        (vm, status, out)
    }

    fn uncaught(status: Result<Status, VmError>) -> (String, String) {
        match status {
            Err(VmError::UncaughtException { class, message }) => (class, message),
            other => panic!("expected an uncaught exception, got {other:?}"),
        }
    }

    /// `def name; <body>; end` at the top level.
    fn define_toplevel(b: &mut BytecodeBuilder, d: &mut IrepDesc, name: &str, body: IrepDesc) -> u32 {
        let idx = d.add_child(body);
        let sym = d.sym(name);
        b.op_a(Op::TClass, 1);
        b.op_ab(Op::Method, 2, idx);
        b.op_ab(Op::Def, 1, sym);
        sym
    }

    #[test]
    fn puts_writes_to_the_output_sink() {
        let desc = irep(4, |b, d| {
            let hello = d.add_pool(PoolLiteral::str("hello"));
            let puts = d.sym("puts");
            b.load_self(1);
            b.string(2, hello);
            b.send(1, puts, 1);
            b.ret(1);
        });
        let (vm, status, out) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(out.text(), "hello\n");
        assert_eq!(vm.result(), Value::Nil);
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn integer_add() {
        let desc = irep(4, |b, _| {
            b.load_int(1, 40);
            b.load_int(2, 2);
            b.op_a(Op::Add, 1);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(42));
    }

    #[test]
    fn division_by_zero_without_a_handler_ends_the_run() {
        let desc = irep(4, |b, _| {
            b.load_int(1, 1);
            b.load_int(2, 0);
            b.op_a(Op::Div, 1);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(
            uncaught(status),
            ("ZeroDivisionError".to_string(), "divided by 0".to_string())
        );
        assert_eq!(vm.error_code(), 1);
        assert_eq!(
            vm.exception().map(|e| e.class.name()),
            Some("ZeroDivisionError".to_string())
        );
    }

    #[test]
    fn rescue_clause_catches_division_by_zero() {
        let desc = irep(6, |b, d| {
            let zde = d.sym("ZeroDivisionError");
            let message = d.sym("message");
            b.load_int(1, 1);
            b.load_int(2, 0);
            b.op_a(Op::Div, 1);
            let end = b.current_offset();
            let done = b.jump();
            let landing = b.current_offset();
            b.op_a(Op::Except, 3);
            b.op_ab(Op::GetConst, 4, zde);
            b.op_ab(Op::Rescue, 3, 4);
            let reraise = b.jump_not(4);
            b.send(3, message, 0);
            b.ret(3);
            b.bind(reraise);
            b.op_a(Op::RaiseIf, 3);
            b.bind(done);
            b.ret(1);
            d.catch_handlers.push(CatchHandler {
                kind: CatchKind::Rescue,
                begin: 0,
                end: end as u32,
                target: landing as u32,
            });
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result().to_s(), "divided by 0");
        assert_eq!(vm.error_code(), 0);
    }

    #[test]
    fn class_definition_and_method_send() {
        let desc = irep(4, |b, d| {
            let body = irep(3, |b, d| {
                let m = irep(3, |b, _| {
                    b.enter(0, 0, false);
                    b.load_int(1, 42);
                    b.ret(1);
                });
                let m_idx = d.add_child(m);
                let m_sym = d.sym("m");
                b.op_a(Op::TClass, 1);
                b.op_ab(Op::Method, 2, m_idx);
                b.op_ab(Op::Def, 1, m_sym);
                b.ret(1);
            });
            let body_idx = d.add_child(body);
            let class = d.sym("C");
            let new = d.sym("new");
            let m = d.sym("m");
            b.load_nil(1);
            b.load_nil(2);
            b.op_ab(Op::Class, 1, class);
            b.op_ab(Op::Exec, 1, body_idx);
            b.op_ab(Op::GetConst, 1, class);
            b.send(1, new, 0);
            b.send(1, m, 0);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(42));
        assert_eq!(vm.call_depth(), 0);
        let class = vm.system().class("C").expect("C defined");
        assert!(class.own_method(Symbol::intern("m")).is_some());
    }

    #[test]
    fn preempted_run_resumes_where_it_stopped() {
        let desc = irep(5, |b, _| {
            b.load_int(1, 0);
            let top = b.current_offset();
            b.op_ab(Op::AddI, 1, 1);
            b.mov(2, 1);
            b.load_int(3, 50);
            b.op_a(Op::Lt, 2);
            b.jump_back_if(2, top);
            b.ret(1);
        });
        let (mut vm, _) = start(&desc, VmConfig::default());
        let handle = vm.preempt_handle();
        std::thread::spawn(move || handle.preempt()).join().expect("thread");

        assert_eq!(vm.run(), Ok(Status::Preempted));
        assert_eq!(vm.register(1), Value::Integer(1));
        assert_eq!(vm.run(), Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(50));
        assert_eq!(vm.run(), Ok(Status::Halted));
    }

    #[test]
    fn ensure_runs_on_the_way_out() {
        let desc = irep(6, |b, d| {
            let msg = d.add_pool(PoolLiteral::str("x"));
            let raise = d.sym("raise");
            let g = d.sym("$g");
            b.load_self(1);
            b.string(2, msg);
            b.send(1, raise, 1);
            let end = b.current_offset();
            b.op_a(Op::Except, 3);
            b.load_int(4, 1);
            b.op_ab(Op::SetGv, 4, g);
            b.op_a(Op::RaiseIf, 3);
            b.ret(1);
            d.catch_handlers.push(CatchHandler {
                kind: CatchKind::Ensure,
                begin: 0,
                end: end as u32,
                target: end as u32,
            });
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(uncaught(status), ("RuntimeError".to_string(), "x".to_string()));
        assert_eq!(vm.system().global_get(Symbol::intern("$g")), Value::Integer(1));
    }

    #[test]
    fn break_leaves_the_native_iterator() {
        let desc = irep(5, |b, d| {
            let blk = irep(5, |b, _| {
                b.enter(1, 0, false);
                b.mov(3, 1);
                b.load_int(4, 2);
                b.op_a(Op::Eq, 3);
                let skip = b.jump_not(3);
                b.mov(3, 1);
                b.load_int(4, 10);
                b.op_a(Op::Mul, 3);
                b.op_a(Op::Break, 3);
                b.bind(skip);
                b.ret(1);
            });
            let blk = d.add_child(blk);
            let each = d.sym("each");
            b.load_int(1, 1);
            b.load_int(2, 2);
            b.load_int(3, 3);
            b.op_ab(Op::Array, 1, 3);
            b.op_ab(Op::Block, 2, blk);
            b.send_block(1, each, 0);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(20));
        assert_eq!(vm.call_depth(), 0);
        assert!(vm.catch_stack.is_empty());
    }

    #[test]
    fn yielded_block_updates_captured_local() {
        let desc = irep(5, |b, d| {
            d.nlocals = 2;
            let twice = irep(4, |b, d| {
                let call = d.sym("call");
                b.op_a(Op::Enter, 1);
                b.op_ab(Op::BlkPush, 2, 0);
                b.send(2, call, 0);
                b.op_ab(Op::BlkPush, 2, 0);
                b.send(2, call, 0);
                b.ret(2);
            });
            let bump = irep(3, |b, _| {
                b.op_abc(Op::GetUpvar, 1, 1, 0);
                b.op_ab(Op::AddI, 1, 1);
                b.op_abc(Op::SetUpvar, 1, 1, 0);
                b.ret(1);
            });
            let bump = d.add_child(bump);
            b.load_int(1, 0);
            let name = {
                let idx = d.add_child(twice);
                let sym = d.sym("twice");
                b.op_a(Op::TClass, 2);
                b.op_ab(Op::Method, 3, idx);
                b.op_ab(Op::Def, 2, sym);
                sym
            };
            b.load_self(2);
            b.op_ab(Op::Block, 3, bump);
            b.send_block(2, name, 0);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(2));
    }

    #[test]
    fn missing_method_reaches_method_missing() {
        let desc = irep(4, |b, d| {
            let mm = irep(4, |b, _| {
                b.enter(1, 0, true);
                b.ret(1);
            });
            define_toplevel(b, d, "method_missing", mm);
            let frob = d.sym("frob");
            b.load_self(1);
            b.send(1, frob, 0);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Symbol(Symbol::intern("frob")));
    }

    #[test]
    fn undefined_method_raises_no_method_error() {
        let desc = irep(3, |b, d| {
            let frob = d.sym("frob");
            b.load_int(1, 5);
            b.send(1, frob, 0);
            b.ret(1);
        });
        let (_, status, _) = run(&desc);
        assert_eq!(
            uncaught(status),
            (
                "NoMethodError".to_string(),
                "undefined method 'frob' for an instance of Integer".to_string()
            )
        );
    }

    #[test]
    fn unbounded_recursion_raises_system_stack_error() {
        let desc = irep(4, |b, d| {
            let f = irep(3, |b, d| {
                let f = d.sym("f");
                b.load_self(1);
                b.send(1, f, 0);
                b.ret(1);
            });
            let name = define_toplevel(b, d, "f", f);
            b.load_self(1);
            b.send(1, name, 0);
            b.ret(1);
        });
        let (mut vm, _) = start(&desc, VmConfig::default().with_max_depth(8));
        let (class, message) = uncaught(vm.run());
        assert_eq!(class, "SystemStackError");
        assert_eq!(message, "stack level too deep");
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn exhausted_budget_raises_no_memory_error() {
        let desc = irep(5, |b, d| {
            let s = d.add_pool(PoolLiteral::str("abcdefgh"));
            b.string(1, s);
            let top = b.current_offset();
            b.mov(2, 1);
            b.mov(3, 1);
            b.op_a(Op::Add, 2);
            b.mov(1, 2);
            b.jump_back(top);
        });
        let alloc: Rc<dyn Allocator> = Rc::new(BudgetAllocator::new(4096));
        let system = ObjectSystem::with(alloc.clone(), Box::new(io::sink()));
        let mut vm = Vm::open_with(system, VmConfig::default());
        vm.load(ImageWriter::new().write(&desc)).expect("load");
        let (class, _) = uncaught(vm.run());
        assert_eq!(class, "NoMemoryError");
        vm.end();
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn exception_raised_in_a_block_reaches_the_caller_rescue() {
        let desc = irep(5, |b, d| {
            let blk = irep(4, |b, d| {
                let boom = d.add_pool(PoolLiteral::str("boom"));
                let raise = d.sym("raise");
                b.load_self(1);
                b.string(2, boom);
                b.send(1, raise, 1);
                b.ret(1);
            });
            let blk = d.add_child(blk);
            let each = d.sym("each");
            let message = d.sym("message");
            b.load_int(1, 1);
            b.op_ab(Op::Array, 1, 1);
            b.op_ab(Op::Block, 2, blk);
            b.send_block(1, each, 0);
            let end = b.current_offset();
            b.ret(1);
            let landing = b.current_offset();
            b.op_a(Op::Except, 3);
            b.send(3, message, 0);
            b.ret(3);
            d.catch_handlers.push(CatchHandler {
                kind: CatchKind::Rescue,
                begin: 0,
                end: end as u32,
                target: landing as u32,
            });
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result().to_s(), "boom");
        assert_eq!(vm.call_depth(), 0);
        assert!(vm.catch_stack.is_empty());
    }

    #[test]
    fn unwinding_jump_runs_the_ensure_body() {
        let desc = irep(6, |b, d| {
            let g = d.sym("$g");
            b.load_int(1, 1);
            let begin = b.current_offset();
            let leave = b.jump_unwind();
            b.load_int(1, 99);
            let end = b.current_offset();
            b.op_a(Op::Except, 3);
            b.load_int(4, 7);
            b.op_ab(Op::SetGv, 4, g);
            b.op_a(Op::RaiseIf, 3);
            b.bind(leave);
            b.ret(1);
            d.catch_handlers.push(CatchHandler {
                kind: CatchKind::Ensure,
                begin: begin as u32,
                end: end as u32,
                target: end as u32,
            });
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(1));
        assert_eq!(vm.system().global_get(Symbol::intern("$g")), Value::Integer(7));
    }

    #[test]
    fn return_in_a_block_leaves_the_method_through_the_native() {
        let desc = irep(4, |b, d| {
            let m = irep(5, |b, d| {
                let blk = irep(4, |b, _| {
                    b.enter(1, 0, false);
                    b.load_int(2, 5);
                    b.op_a(Op::ReturnBlk, 2);
                });
                let blk = d.add_child(blk);
                let each = d.sym("each");
                b.enter(0, 0, false);
                b.load_int(1, 1);
                b.load_int(2, 2);
                b.load_int(3, 3);
                b.op_ab(Op::Array, 1, 3);
                b.op_ab(Op::Block, 2, blk);
                b.send_block(1, each, 0);
                b.load_int(1, 0);
                b.ret(1);
            });
            let name = define_toplevel(b, d, "m", m);
            b.load_self(1);
            b.send(1, name, 0);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        assert_eq!(status, Ok(Status::Halted));
        assert_eq!(vm.result(), Value::Integer(5));
        assert_eq!(vm.call_depth(), 0);
        assert!(vm.catch_stack.is_empty());
    }

    /// `def mk; proc { <leave> 5 }; end; mk.call`
    fn escaped_block(leave: Op) -> IrepDesc {
        irep(4, |b, d| {
            let mk = irep(3, |b, d| {
                let blk = irep(3, |b, _| {
                    b.load_int(1, 5);
                    b.op_a(leave, 1);
                });
                let blk = d.add_child(blk);
                b.op_ab(Op::Block, 1, blk);
                b.ret(1);
            });
            let name = define_toplevel(b, d, "mk", mk);
            let call = d.sym("call");
            b.load_self(1);
            b.send(1, name, 0);
            b.send(1, call, 0);
            b.ret(1);
        })
    }

    #[test]
    fn return_from_a_block_whose_method_has_returned() {
        let (vm, status, _) = run(&escaped_block(Op::ReturnBlk));
        assert_eq!(
            uncaught(status),
            ("LocalJumpError".to_string(), "unexpected return".to_string())
        );
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn break_from_a_block_whose_method_has_returned() {
        let (vm, status, _) = run(&escaped_block(Op::Break));
        assert_eq!(
            uncaught(status),
            ("LocalJumpError".to_string(), "break from proc-closure".to_string())
        );
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn nested_native_iteration_is_bounded() {
        // def f; [1].each { f }; end; f
        let desc = irep(4, |b, d| {
            let f = irep(4, |b, d| {
                let blk = irep(4, |b, d| {
                    let f = d.sym("f");
                    b.load_self(2);
                    b.send(2, f, 0);
                    b.ret(2);
                });
                let blk = d.add_child(blk);
                let each = d.sym("each");
                b.load_int(1, 1);
                b.op_ab(Op::Array, 1, 1);
                b.op_ab(Op::Block, 2, blk);
                b.send_block(1, each, 0);
                b.ret(1);
            });
            let name = define_toplevel(b, d, "f", f);
            b.load_self(1);
            b.send(1, name, 0);
            b.ret(1);
        });
        let (vm, status, _) = run(&desc);
        let (class, message) = uncaught(status);
        assert_eq!(class, "SystemStackError");
        assert_eq!(message, "stack level too deep (nested native calls)");
        assert_eq!(vm.call_depth(), 0);
        assert!(vm.catch_stack.is_empty());
    }

    fn record_before(vm: &mut Vm, _receiver: Value, _args: &crate::Args) -> Result<Value, Unwind> {
        let seen = vm.exception().map(Value::Exception).unwrap_or_default();
        vm.system().global_set(Symbol::intern("$before"), seen);
        Ok(Value::Nil)
    }

    fn record_after(vm: &mut Vm, _receiver: Value, _args: &crate::Args) -> Result<Value, Unwind> {
        let seen = vm.exception().map(Value::Exception).unwrap_or_default();
        vm.system().global_set(Symbol::intern("$after"), seen);
        Ok(Value::Nil)
    }

    #[test]
    fn exception_stays_visible_until_the_landing_pad_takes_it() {
        let desc = irep(6, |b, d| {
            let before = d.sym("record_before");
            let after = d.sym("record_after");
            b.load_int(1, 1);
            b.load_int(2, 0);
            b.op_a(Op::Div, 1);
            let end = b.current_offset();
            let done = b.jump();
            let landing = b.current_offset();
            b.load_self(4);
            b.send(4, before, 0);
            b.op_a(Op::Except, 3);
            b.load_self(4);
            b.send(4, after, 0);
            b.ret(3);
            b.bind(done);
            b.ret(1);
            d.catch_handlers.push(CatchHandler {
                kind: CatchKind::Rescue,
                begin: 0,
                end: end as u32,
                target: landing as u32,
            });
        });
        let (mut vm, _) = start(&desc, VmConfig::default());
        let object = vm.system().builtins.object.clone();
        vm.system().define_native(&object, "record_before", record_before);
        vm.system().define_native(&object, "record_after", record_after);

        assert_eq!(vm.run(), Ok(Status::Halted));
        let before = vm.system().global_get(Symbol::intern("$before"));
        match &before {
            Value::Exception(e) => assert_eq!(e.class.name(), "ZeroDivisionError"),
            other => panic!("expected the pending exception, got {other:?}"),
        }
        assert_eq!(vm.system().global_get(Symbol::intern("$after")), Value::Nil);
        assert!(vm.result().same_object(&before));
        assert!(vm.exception().is_none());
    }

    #[test]
    fn vms_on_one_object_system_share_globals() {
        let writer = irep(3, |b, d| {
            let g = d.sym("$shared");
            b.load_int(1, 7);
            b.op_ab(Op::SetGv, 1, g);
            b.ret(1);
        });
        let reader = irep(3, |b, d| {
            let g = d.sym("$shared");
            b.op_ab(Op::GetGv, 1, g);
            b.ret(1);
        });
        let system = ObjectSystem::with(Rc::new(SystemAllocator::new()), Box::new(io::sink()));
        let mut first = Vm::open_with(system.clone(), VmConfig::default());
        let mut second = Vm::open_with(system, VmConfig::default());
        assert_ne!(first.vm_id(), second.vm_id());

        first.load(ImageWriter::new().write(&writer)).expect("load");
        assert_eq!(first.run(), Ok(Status::Halted));
        second.load(ImageWriter::new().write(&reader)).expect("load");
        assert_eq!(second.run(), Ok(Status::Halted));
        assert_eq!(second.result(), Value::Integer(7));
    }

    #[test]
    fn malformed_images_are_refused() {
        let mut vm = Vm::open(VmConfig::default());
        let err = vm.load(b"RITE0300".to_vec()).expect_err("short image");
        assert_eq!(err.code(), FORMAT_INVALID);
        assert_eq!(vm.run(), Err(VmError::NotBegun));

        let mut bytes = ImageWriter::new().write(&irep(2, |b, _| b.ret(0)));
        bytes.truncate(bytes.len() - 3);
        assert!(crate::load(bytes).is_err());
    }
}
