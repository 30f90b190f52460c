use crate::endian::{read_u16, read_u24};
use crate::instruction::Instruction;
use crate::op::{Encoding, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02x} at {pc}")]
    UnknownOpcode { pc: usize, byte: u8 },
    #[error("instruction at {pc} runs past the end of the code")]
    Truncated { pc: usize },
    #[error("{prefix} at {pc} is not followed by an opcode it can widen")]
    BadPrefix { pc: usize, prefix: Op },
}

/// Operand width selected by an optional `EXTn` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Normal,
    WideA,
    WideB,
    WideAB,
}

impl Width {
    fn wide_a(self) -> bool {
        matches!(self, Width::WideA | Width::WideAB)
    }

    fn wide_b(self) -> bool {
        matches!(self, Width::WideB | Width::WideAB)
    }
}

/// Decode the instruction starting at `pc`.
///
/// Returns the instruction and the offset of the one after it. Every read is
/// bounds-checked; the loader runs this over each IREP once so the
/// interpreter can rely on the result.
#[inline]
pub fn decode_at(code: &[u8], pc: usize) -> Result<(Instruction, usize), DecodeError> {
    let byte = *code.get(pc).ok_or(DecodeError::Truncated { pc })?;
    let op = Op::try_from(byte).map_err(|byte| DecodeError::UnknownOpcode { pc, byte })?;

    let (op, width, operands_at) = match op {
        Op::Ext1 | Op::Ext2 | Op::Ext3 => {
            let next = *code.get(pc + 1).ok_or(DecodeError::Truncated { pc })?;
            let next = Op::try_from(next).map_err(|byte| DecodeError::UnknownOpcode {
                pc: pc + 1,
                byte,
            })?;
            if next.is_prefix() || next.encoding() == Encoding::Z {
                return Err(DecodeError::BadPrefix { pc, prefix: op });
            }
            let width = match op {
                Op::Ext1 => Width::WideA,
                Op::Ext2 => Width::WideB,
                _ => Width::WideAB,
            };
            (next, width, pc + 2)
        }
        _ => (op, Width::Normal, pc + 1),
    };

    let mut cursor = Cursor { code, pos: operands_at, start: pc };
    let insn = match op.encoding() {
        Encoding::Z => Instruction::new(op, 0, 0, 0),
        Encoding::B => {
            let a = cursor.operand(width.wide_a())?;
            Instruction::new(op, a, 0, 0)
        }
        Encoding::BB => {
            let a = cursor.operand(width.wide_a())?;
            let b = cursor.operand(width.wide_b())?;
            Instruction::new(op, a, b, 0)
        }
        Encoding::BBB => {
            let a = cursor.operand(width.wide_a())?;
            let b = cursor.operand(width.wide_b())?;
            let c = cursor.operand(false)?;
            Instruction::new(op, a, b, c)
        }
        Encoding::BS => {
            let a = cursor.operand(width.wide_a())?;
            let b = cursor.s()?;
            Instruction::new(op, a, b, 0)
        }
        Encoding::BSS => {
            let a = cursor.operand(width.wide_a())?;
            let b = cursor.s()?;
            let c = cursor.s()?;
            Instruction::new(op, a, b, c)
        }
        Encoding::S => {
            let a = cursor.s()?;
            Instruction::new(op, a, 0, 0)
        }
        Encoding::W => {
            let a = cursor.w()?;
            Instruction::new(op, a, 0, 0)
        }
    };
    Ok((insn, cursor.pos))
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + n)
            .ok_or(DecodeError::Truncated { pc: self.start })?;
        self.pos += n;
        Ok(bytes)
    }

    fn operand(&mut self, wide: bool) -> Result<u32, DecodeError> {
        if wide { self.s() } else { Ok(self.take(1)?[0] as u32) }
    }

    fn s(&mut self) -> Result<u32, DecodeError> {
        Ok(read_u16(self.take(2)?) as u32)
    }

    fn w(&mut self) -> Result<u32, DecodeError> {
        Ok(read_u24(self.take(3)?))
    }
}

/// Walks a code stream instruction by instruction, yielding each
/// instruction with its offset. Stops after the first error.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0, failed: false }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<(usize, Instruction), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.is_at_end() {
            return None;
        }
        let at = self.pos;
        match decode_at(self.bytes, at) {
            Ok((insn, next)) => {
                self.pos = next;
                Some(Ok((at, insn)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
