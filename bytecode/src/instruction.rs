use core::fmt;

use crate::op::{Op, Role};

/// A decoded instruction with its operands widened to `u32`.
///
/// Operand meaning depends on [`Op::roles`]. Jump offsets and the `LOADI16`
/// immediate are stored as their raw 16-bit pattern; use
/// [`jump_offset`](Instruction::jump_offset) and
/// [`signed_b`](Instruction::signed_b) to read them signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

impl Instruction {
    pub const fn new(op: Op, a: u32, b: u32, c: u32) -> Self {
        Self { op, a, b, c }
    }

    /// The operand at position `n` (0 = a, 1 = b, 2 = c).
    pub fn operand(&self, n: usize) -> u32 {
        match n {
            0 => self.a,
            1 => self.b,
            _ => self.c,
        }
    }

    /// The relative jump carried by a jump instruction, if any.
    pub fn jump_offset(&self) -> Option<i16> {
        let roles = self.op.roles();
        roles
            .iter()
            .position(|r| *r == Role::Jump)
            .map(|n| self.operand(n) as u16 as i16)
    }

    pub fn signed_b(&self) -> i16 {
        self.b as u16 as i16
    }

    /// The 32-bit immediate of `LOADI32`.
    pub fn wide_immediate(&self) -> i32 {
        ((self.b << 16) | (self.c & 0xFFFF)) as i32
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.mnemonic())?;
        let mut first = true;
        for (n, role) in self.op.roles().iter().enumerate() {
            let v = self.operand(n);
            let sep = if first { " " } else { ", " };
            match role {
                Role::None => continue,
                Role::Reg => write!(f, "{sep}r{v}")?,
                Role::Pool => write!(f, "{sep}L{v}")?,
                Role::Sym => write!(f, "{sep}:{v}")?,
                Role::Irep => write!(f, "{sep}I{v}")?,
                Role::Jump => write!(f, "{sep}{:+}", v as u16 as i16)?,
                Role::Imm if self.op == Op::LoadI16 => {
                    write!(f, "{sep}{}", self.signed_b())?
                }
                Role::Imm => write!(f, "{sep}{v}")?,
            }
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_by_role() {
        assert_eq!(Instruction::new(Op::Move, 1, 2, 0).to_string(), "MOVE r1, r2");
        assert_eq!(
            Instruction::new(Op::Send, 3, 5, 2).to_string(),
            "SEND r3, :5, 2"
        );
        assert_eq!(
            Instruction::new(Op::JmpNot, 1, 0xFFF9, 0).to_string(),
            "JMPNOT r1, -7"
        );
        assert_eq!(Instruction::new(Op::Jmp, 4, 0, 0).to_string(), "JMP +4");
        assert_eq!(Instruction::new(Op::Stop, 0, 0, 0).to_string(), "STOP");
        assert_eq!(
            Instruction::new(Op::LoadI16, 1, (-300i16) as u16 as u32, 0).to_string(),
            "LOADI16 r1, -300"
        );
    }

    #[test]
    fn signed_views() {
        let jmp = Instruction::new(Op::JmpIf, 0, 0xFFFE, 0);
        assert_eq!(jmp.jump_offset(), Some(-2));
        assert_eq!(Instruction::new(Op::Add, 1, 0, 0).jump_offset(), None);
        let wide = Instruction::new(Op::LoadI32, 0, 0xFFFF, 0xFFFF);
        assert_eq!(wide.wide_immediate(), -1);
        let wide = Instruction::new(Op::LoadI32, 0, 0x0001, 0x0000);
        assert_eq!(wide.wide_immediate(), 65536);
    }
}
