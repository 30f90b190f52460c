//! Wire format of RITE 03 bytecode: opcodes, instruction decoding, a code
//! builder and an image writer.

pub mod endian;
pub mod image;
mod op;
mod instruction;
mod builder;
mod decoder;

pub use op::{Encoding, Op, Role};
pub use instruction::Instruction;
pub use builder::{BytecodeBuilder, Label};
pub use decoder::{decode_at, BytecodeDecoder, DecodeError};
pub use image::{CatchHandler, CatchKind, ImageWriter, IrepDesc, PoolLiteral};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes)
            .map(|r| r.expect("decode").1)
            .collect()
    }

    #[test]
    fn builder_output_decodes() {
        // a = 1; while a < 10; a += 2; end; a
        let mut b = BytecodeBuilder::new();
        b.load_int(1, 1);
        let top = b.current_offset();
        b.mov(2, 1);
        b.load_int(3, 10);
        b.op_a(Op::Lt, 2);
        let exit = b.jump_not(2);
        b.op_ab(Op::AddI, 1, 2);
        b.jump_back(top);
        b.bind(exit);
        b.ret(1);

        let insns = decode_all(b.as_bytes());
        assert_eq!(insns.iter().map(|i| i.op).collect::<Vec<_>>(), vec![
            Op::LoadI1,
            Op::Move,
            Op::LoadI,
            Op::Lt,
            Op::JmpNot,
            Op::AddI,
            Op::Jmp,
            Op::Return,
        ]);
        assert_eq!(insns[4].jump_offset(), Some(6));
        assert_eq!(insns[6].jump_offset(), Some(-18));
    }

    #[test]
    fn wide_operands_survive_decoding() {
        let mut b = BytecodeBuilder::new();
        b.send(260, 300, 1);
        b.load_sym(2, 1000);
        b.string(400, 3);

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::new(Op::Send, 260, 300, 1),
            Instruction::new(Op::LoadSym16, 2, 1000, 0),
            Instruction::new(Op::String, 400, 3, 0),
        ]);
    }
}
