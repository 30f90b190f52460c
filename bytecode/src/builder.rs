use crate::endian::write_u16;
use crate::op::{Encoding, Op};

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`] and its conditional siblings.
/// Resolve it with [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "a label must be bound"]
pub struct Label {
    /// Position of the 16-bit offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction (base for relative offset).
    base: usize,
}

/// Builds a RITE code stream.
///
/// The builder emits an `EXT1`/`EXT2`/`EXT3` prefix when a one-byte operand
/// does not fit in eight bits.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the code stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_operand(&mut self, v: u32, wide: bool) {
        if wide {
            self.emit_u16(v as u16);
        } else {
            self.emit_u8(v as u8);
        }
    }

    /// Emit `op` with operands laid out per its [`Encoding`]. Unused operands
    /// are ignored.
    pub fn emit(&mut self, op: Op, a: u32, b: u32, c: u32) {
        let enc = op.encoding();
        let wide_a = a > u8::MAX as u32
            && matches!(enc, Encoding::B | Encoding::BB | Encoding::BBB | Encoding::BS | Encoding::BSS);
        let wide_b = b > u8::MAX as u32 && matches!(enc, Encoding::BB | Encoding::BBB);
        match (wide_a, wide_b) {
            (true, true) => self.emit_u8(Op::Ext3 as u8),
            (true, false) => self.emit_u8(Op::Ext1 as u8),
            (false, true) => self.emit_u8(Op::Ext2 as u8),
            (false, false) => {}
        }
        self.emit_u8(op as u8);
        match enc {
            Encoding::Z => {}
            Encoding::B => self.emit_operand(a, wide_a),
            Encoding::BB => {
                self.emit_operand(a, wide_a);
                self.emit_operand(b, wide_b);
            }
            Encoding::BBB => {
                self.emit_operand(a, wide_a);
                self.emit_operand(b, wide_b);
                self.emit_u8(c as u8);
            }
            Encoding::BS => {
                self.emit_operand(a, wide_a);
                self.emit_u16(b as u16);
            }
            Encoding::BSS => {
                self.emit_operand(a, wide_a);
                self.emit_u16(b as u16);
                self.emit_u16(c as u16);
            }
            Encoding::S => self.emit_u16(a as u16),
            Encoding::W => {
                self.emit_u8((a >> 16) as u8);
                self.emit_u16(a as u16);
            }
        }
    }

    pub fn op(&mut self, op: Op) {
        self.emit(op, 0, 0, 0);
    }

    pub fn op_a(&mut self, op: Op, a: u32) {
        self.emit(op, a, 0, 0);
    }

    pub fn op_ab(&mut self, op: Op, a: u32, b: u32) {
        self.emit(op, a, b, 0);
    }

    pub fn op_abc(&mut self, op: Op, a: u32, b: u32, c: u32) {
        self.emit(op, a, b, c);
    }

    // ── common instructions ────────────────────────────────────────

    /// `MOVE dst, src`.
    pub fn mov(&mut self, dst: u32, src: u32) {
        self.op_ab(Op::Move, dst, src);
    }

    /// Load an integer literal, choosing the shortest encoding.
    pub fn load_int(&mut self, reg: u32, value: i32) {
        match value {
            -1 => self.op_a(Op::LoadIM1, reg),
            0..=7 => {
                // SAFETY: LOADI_0..LOADI_7 are contiguous.
                let op = unsafe { Op::from_u8_unchecked(Op::LoadI0 as u8 + value as u8) };
                self.op_a(op, reg);
            }
            8..=255 => self.op_ab(Op::LoadI, reg, value as u32),
            -255..=-2 => self.op_ab(Op::LoadINeg, reg, (-value) as u32),
            v if i16::try_from(v).is_ok() => self.op_ab(Op::LoadI16, reg, v as i16 as u16 as u32),
            v => {
                let raw = v as u32;
                self.op_abc(Op::LoadI32, reg, raw >> 16, raw & 0xFFFF);
            }
        }
    }

    /// Load pool entry `idx` (`LOADL`, or `LOADL16` past 255).
    pub fn load_pool(&mut self, reg: u32, idx: u32) {
        if idx > u8::MAX as u32 {
            self.op_ab(Op::LoadL16, reg, idx);
        } else {
            self.op_ab(Op::LoadL, reg, idx);
        }
    }

    /// Duplicate pool string `idx` into `reg`.
    pub fn string(&mut self, reg: u32, idx: u32) {
        if idx > u8::MAX as u32 {
            self.op_ab(Op::String16, reg, idx);
        } else {
            self.op_ab(Op::String, reg, idx);
        }
    }

    pub fn load_sym(&mut self, reg: u32, sym: u32) {
        if sym > u8::MAX as u32 {
            self.op_ab(Op::LoadSym16, reg, sym);
        } else {
            self.op_ab(Op::LoadSym, reg, sym);
        }
    }

    pub fn load_nil(&mut self, reg: u32) {
        self.op_a(Op::LoadNil, reg);
    }

    pub fn load_self(&mut self, reg: u32) {
        self.op_a(Op::LoadSelf, reg);
    }

    pub fn load_bool(&mut self, reg: u32, value: bool) {
        self.op_a(if value { Op::LoadT } else { Op::LoadF }, reg);
    }

    /// `SEND a, sym, argc`: receiver in `a`, arguments in `a+1..=a+argc`.
    pub fn send(&mut self, a: u32, sym: u32, argc: u32) {
        self.op_abc(Op::Send, a, sym, argc);
    }

    /// `SENDB a, sym, argc`: like [`send`](Self::send) with the block in
    /// `a+argc+1`.
    pub fn send_block(&mut self, a: u32, sym: u32, argc: u32) {
        self.op_abc(Op::SendB, a, sym, argc);
    }

    /// `ENTER` for `required` mandatory and `optional` optional parameters.
    pub fn enter(&mut self, required: u32, optional: u32, rest: bool) {
        let aspec = (required & 0x1F) << 18 | (optional & 0x1F) << 13 | (rest as u32) << 12;
        self.op_a(Op::Enter, aspec);
    }

    pub fn ret(&mut self, reg: u32) {
        self.op_a(Op::Return, reg);
    }

    pub fn stop(&mut self) {
        self.op(Op::Stop);
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Emit an unconditional forward jump.
    pub fn jump(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jmp, None)
    }

    /// Emit a forward jump that runs the ensure clauses it leaves.
    pub fn jump_unwind(&mut self) -> Label {
        self.emit_jump_placeholder(Op::JmpUw, None)
    }

    /// Jump forward if `reg` is truthy.
    pub fn jump_if(&mut self, reg: u32) -> Label {
        self.emit_jump_placeholder(Op::JmpIf, Some(reg))
    }

    /// Jump forward if `reg` is falsy.
    pub fn jump_not(&mut self, reg: u32) -> Label {
        self.emit_jump_placeholder(Op::JmpNot, Some(reg))
    }

    /// Jump forward if `reg` is nil.
    pub fn jump_nil(&mut self, reg: u32) -> Label {
        self.emit_jump_placeholder(Op::JmpNil, Some(reg))
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i16;
        write_u16(offset as u16, &mut self.buf[label.offset_pos..]);
    }

    /// Emit an unconditional backward jump to `target` (a byte offset
    /// obtained from [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, target: usize) {
        self.emit_jump_to(Op::Jmp, None, target);
    }

    /// Jump back to `target` while `reg` is truthy.
    pub fn jump_back_if(&mut self, reg: u32, target: usize) {
        self.emit_jump_to(Op::JmpIf, Some(reg), target);
    }

    /// Jump back to `target` while `reg` is falsy.
    pub fn jump_back_not(&mut self, reg: u32, target: usize) {
        self.emit_jump_to(Op::JmpNot, Some(reg), target);
    }

    fn emit_jump_to(&mut self, op: Op, reg: Option<u32>, target: usize) {
        let label = self.emit_jump_placeholder(op, reg);
        let offset = (target as isize - label.base as isize) as i16;
        write_u16(offset as u16, &mut self.buf[label.offset_pos..]);
    }

    fn emit_jump_placeholder(&mut self, op: Op, reg: Option<u32>) -> Label {
        match reg {
            Some(reg) => self.emit(op, reg, 0, 0),
            None => self.emit(op, 0, 0, 0),
        }
        let base = self.buf.len();
        Label {
            offset_pos: base - 2,
            base,
        }
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
