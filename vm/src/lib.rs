//! Executor for RITE 03 bytecode images.
//!
//! A [`Vm`] runs one program: [`load`] (or [`Vm::load`]) turns an image into
//! an [`Irep`] tree, [`Vm::begin`] binds it, [`Vm::run`] drives the dispatch
//! loop until the program halts, raises past the top level, or is
//! preempted, and [`Vm::end`] releases what the run left behind.

pub mod alloc;
pub mod class;
pub mod config;
pub mod disasm;
pub mod error;
pub mod exception;
pub mod frame;
pub mod irep;
pub mod load;
pub mod primitives;
pub mod special;
pub mod symbol;
pub mod system;
pub mod value;

mod interpreter;
mod send;

use std::{
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

pub use alloc::{AllocError, Allocator, BudgetAllocator, SystemAllocator};
pub use class::{Args, Builtin, ClassKind, InstanceKind, Method, NativeFn, RClass};
pub use config::{CATCH_STACK_SIZE, MAX_CALLINFO_DEPTH, MAX_REGS_SIZE, VmConfig};
pub use error::{FORMAT_INVALID, LoadError, VmError};
pub use exception::Unwind;
pub use frame::{CallInfo, FrameKind};
pub use irep::{CatchFilter, Irep, PoolEntry};
pub use load::load;
pub use symbol::{Symbol, sym};
pub use system::ObjectSystem;
pub use value::{RArray, RException, RHash, RInstance, RProc, RRange, RString, Value};

use interpreter::Exit;

static NEXT_VM_ID: AtomicU32 = AtomicU32::new(1);

/// How a call to [`Vm::run`] ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The program finished; [`Vm::result`] holds its value.
    Halted,
    /// The preemption flag was seen; calling `run` again resumes.
    Preempted,
}

/// Sets the preemption flag of one VM from any thread.
#[derive(Debug, Clone)]
pub struct PreemptHandle(Arc<AtomicBool>);

impl PreemptHandle {
    pub fn preempt(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct Vm {
    pub(crate) id: u32,
    pub(crate) config: VmConfig,
    pub(crate) system: Rc<ObjectSystem>,
    pub(crate) regs: Vec<Value>,
    pub(crate) irep: Rc<Irep>,
    pub(crate) pc: usize,
    /// Start of the current window in `regs`.
    pub(crate) base: usize,
    pub(crate) target_class: Rc<RClass>,
    /// The block being run, for upvar access.
    pub(crate) current_proc: Option<Rc<RProc>>,
    pub(crate) frames: Vec<CallInfo>,
    /// Call depth at each active host re-entry.
    pub(crate) catch_stack: Vec<usize>,
    /// The unwind an ensure or rescue landing pad is handling.
    pub(crate) pending: Option<Unwind>,
    /// The exception that ended the last run.
    pub(crate) exception: Option<Rc<RException>>,
    pub(crate) error_code: i32,
    pub(crate) preempt: Arc<AtomicBool>,
    pub(crate) program: Option<Rc<Irep>>,
    /// The program came from [`Vm::load`] and is dropped with the VM.
    pub(crate) owns_program: bool,
    pub(crate) halted: bool,
    /// First register free for windows pushed by a native.
    pub(crate) native_top: usize,
    pub(crate) next_serial: u64,
}

impl Vm {
    /// Open a VM with its own object system writing to stdout.
    pub fn open(config: VmConfig) -> Vm {
        Self::open_with(ObjectSystem::new(), config)
    }

    /// Open a VM on an existing object system. VMs sharing one see the same
    /// classes, constants and globals. The register file always has at
    /// least register 0.
    pub fn open_with(system: Rc<ObjectSystem>, mut config: VmConfig) -> Vm {
        config.max_regs = config.max_regs.max(1);
        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "vm {id}: open ({} registers, depth {})",
            config.max_regs,
            config.max_callinfo_depth
        );
        let target_class = system.builtins.object.clone();
        Vm {
            id,
            config,
            system,
            regs: vec![Value::Nil; config.max_regs],
            irep: Rc::new(Irep::empty()),
            pc: 0,
            base: 0,
            target_class,
            current_proc: None,
            frames: Vec::new(),
            catch_stack: Vec::with_capacity(config.catch_stack_size),
            pending: None,
            exception: None,
            error_code: 0,
            preempt: Arc::new(AtomicBool::new(false)),
            program: None,
            owns_program: false,
            halted: false,
            native_top: 0,
            next_serial: 0,
        }
    }

    /// Load `image` and begin it. The VM keeps the program until `close`.
    pub fn load(&mut self, image: impl Into<Rc<[u8]>>) -> Result<(), LoadError> {
        let irep = load::load(image)?;
        self.begin(irep).map_err(|e| LoadError::at(0, e.to_string()))?;
        self.owns_program = true;
        Ok(())
    }

    /// Bind `irep` as the program: clear the registers, the call chain, the
    /// exception and the error code, and point the PC at its first
    /// instruction.
    pub fn begin(&mut self, irep: Rc<Irep>) -> Result<(), VmError> {
        if irep.nregs() > self.regs.len() {
            return Err(VmError::RegisterOverflow {
                needed: irep.nregs(),
                capacity: self.regs.len(),
            });
        }
        self.reset();
        self.regs[0] = self.system.main();
        self.irep = irep.clone();
        self.program = Some(irep);
        self.owns_program = false;
        self.halted = false;
        Ok(())
    }

    /// Run until the program halts, raises past the top level, or the
    /// preemption flag is seen.
    pub fn run(&mut self) -> Result<Status, VmError> {
        if self.program.is_none() {
            return Err(VmError::NotBegun);
        }
        if self.halted {
            return Ok(Status::Halted);
        }
        match self.execute(None) {
            Ok(Exit::Preempted) => Ok(Status::Preempted),
            Ok(Exit::Halted) | Ok(Exit::Returned) => {
                self.halted = true;
                Ok(Status::Halted)
            }
            Ok(Exit::Invalid { pc }) => {
                self.halted = true;
                self.error_code = 1;
                Err(VmError::InvalidInstruction { pc })
            }
            Err(Unwind::Return { value, .. }) => {
                self.regs[0] = value;
                self.halted = true;
                Ok(Status::Halted)
            }
            Err(Unwind::Raise(e)) => Err(self.uncaught(e)),
            Err(Unwind::Break { .. }) | Err(Unwind::Jump { .. }) => {
                let class = self.system.builtins.local_jump_error.clone();
                let e = RException::new(class, Some("break from proc-closure".into()));
                Err(self.uncaught(e))
            }
        }
    }

    fn uncaught(&mut self, e: Rc<RException>) -> VmError {
        let class = e.class.name();
        let message = e.message();
        log::warn!("vm {}: uncaught {class}: {message}", self.id);
        self.exception = Some(e);
        self.error_code = 1;
        self.halted = true;
        VmError::UncaughtException { class, message }
    }

    /// Release every register value and call-info frame.
    pub fn end(&mut self) {
        self.reset();
        self.halted = true;
    }

    fn reset(&mut self) {
        self.regs.fill(Value::Nil);
        self.frames.clear();
        self.catch_stack.clear();
        self.pending = None;
        self.exception = None;
        self.error_code = 0;
        self.pc = 0;
        self.base = 0;
        self.native_top = 0;
        self.current_proc = None;
        self.target_class = self.system.builtins.object.clone();
        self.preempt.store(false, Ordering::Release);
    }

    pub fn close(mut self) {
        self.end();
        if self.owns_program {
            self.program = None;
        }
        log::info!("vm {}: close", self.id);
    }

    pub fn preempt_handle(&self) -> PreemptHandle {
        PreemptHandle(self.preempt.clone())
    }

    /// Ask the dispatch loop to return at its next suspension point.
    pub fn request_preemption(&self) {
        self.preempt.store(true, Ordering::Release);
    }

    /// Register `n` of the current window.
    pub fn register(&self, n: usize) -> Value {
        self.regs.get(self.base + n).cloned().unwrap_or_default()
    }

    /// Register 0 of the root window: the program's value once halted.
    pub fn result(&self) -> Value {
        self.regs[0].clone()
    }

    /// The exception being rescued, or the one that ended the run.
    pub fn exception(&self) -> Option<Rc<RException>> {
        match &self.pending {
            Some(Unwind::Raise(e)) => Some(e.clone()),
            _ => self.exception.clone(),
        }
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// The method running in the head frame, or `(toplevel)`.
    pub fn callee_name(&self) -> String {
        match self.frames.last() {
            None => "(toplevel)".into(),
            Some(ci) => match (ci.kind, ci.method_id) {
                (FrameKind::Block, _) => "(block)".into(),
                (_, Some(name)) => name.to_string(),
                (_, None) => "(exec)".into(),
            },
        }
    }

    /// Registers holding a value other than nil.
    pub fn live_registers(&self) -> usize {
        self.regs.iter().filter(|v| !v.is_nil()).count()
    }

    pub fn vm_id(&self) -> u32 {
        self.id
    }

    pub fn owns_program(&self) -> bool {
        self.owns_program
    }

    pub fn program(&self) -> Option<&Rc<Irep>> {
        self.program.as_ref()
    }

    pub fn system(&self) -> &Rc<ObjectSystem> {
        &self.system
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn pc(&self) -> usize {
        self.pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{BytecodeBuilder, ImageWriter, IrepDesc, PoolLiteral};

    fn image(build: impl FnOnce(&mut BytecodeBuilder, &mut IrepDesc)) -> Vec<u8> {
        let mut desc = IrepDesc::new(1, 4, Vec::new());
        let mut b = BytecodeBuilder::new();
        build(&mut b, &mut desc);
        desc.code = b.into_bytes();
        ImageWriter::new().write(&desc)
    }

    #[test]
    fn ids_are_distinct_and_start_at_one() {
        let a = Vm::open(VmConfig::default());
        let b = Vm::open(VmConfig::default());
        assert!(a.vm_id() >= 1);
        assert_ne!(a.vm_id(), b.vm_id());
    }

    #[test]
    fn run_before_begin_fails() {
        let mut vm = Vm::open(VmConfig::default());
        assert_eq!(vm.run(), Err(VmError::NotBegun));
        assert_eq!(vm.callee_name(), "(toplevel)");
    }

    #[test]
    fn lifecycle_releases_registers() {
        let bytes = image(|b, d| {
            let s = d.add_pool(PoolLiteral::str("hello"));
            b.string(1, s);
            b.load_int(2, 9);
            b.ret(1);
        });
        let mut vm = Vm::open(VmConfig::default());
        vm.load(bytes).expect("load");
        assert!(vm.owns_program());
        assert_eq!(vm.run(), Ok(Status::Halted));
        assert_eq!(vm.result().to_s(), "hello");
        assert!(vm.live_registers() > 0);
        assert_eq!(vm.run(), Ok(Status::Halted));

        vm.end();
        assert_eq!(vm.live_registers(), 0);
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.system().allocator().in_use(), 0);
        vm.close();
    }

    #[test]
    fn empty_register_file_keeps_register_zero() {
        let mut vm = Vm::open(VmConfig::default().with_max_regs(0));
        assert_eq!(vm.config().max_regs, 1);
        assert_eq!(vm.result(), Value::Nil);

        let desc = IrepDesc::new(1, 2, vec![bytecode::Op::Stop as u8]);
        let irep = load(ImageWriter::new().write(&desc)).expect("load");
        assert_eq!(
            vm.begin(irep),
            Err(VmError::RegisterOverflow { needed: 2, capacity: 1 })
        );

        let desc = IrepDesc::new(1, 1, vec![bytecode::Op::Stop as u8]);
        vm.load(ImageWriter::new().write(&desc)).expect("load");
        assert_eq!(vm.run(), Ok(Status::Halted));
        vm.close();
    }

    #[test]
    fn program_larger_than_register_file_is_refused() {
        let desc = IrepDesc::new(1, 50, vec![bytecode::Op::Stop as u8]);
        let irep = load(ImageWriter::new().write(&desc)).expect("load");
        let mut vm = Vm::open(VmConfig::default().with_max_regs(16));
        assert_eq!(
            vm.begin(irep),
            Err(VmError::RegisterOverflow { needed: 50, capacity: 16 })
        );
    }
}
