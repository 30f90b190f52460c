/// Operand layout of an instruction, fixed by its opcode.
///
/// `B` is one byte, `S` a big-endian 16-bit word and `W` a big-endian 24-bit
/// word. An [`Ext1`](Op::Ext1)/[`Ext2`](Op::Ext2)/[`Ext3`](Op::Ext3) prefix
/// widens the first, the second, or both `B` operands to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Z,
    B,
    BB,
    BBB,
    BS,
    BSS,
    S,
    W,
}

impl Encoding {
    /// Operand bytes following the opcode byte, without any prefix.
    pub const fn operand_len(self) -> usize {
        match self {
            Encoding::Z => 0,
            Encoding::B => 1,
            Encoding::BB => 2,
            Encoding::BBB => 3,
            Encoding::BS => 3,
            Encoding::BSS => 5,
            Encoding::S => 2,
            Encoding::W => 3,
        }
    }
}

/// What an operand refers to. Drives load-time validation and disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Unused operand slot.
    None,
    /// Register in the current window.
    Reg,
    /// Plain immediate.
    Imm,
    /// Index into the IREP's constant pool.
    Pool,
    /// Index into the IREP's symbol table.
    Sym,
    /// Index into the IREP's children.
    Irep,
    /// Signed 16-bit offset relative to the next instruction.
    Jump,
}

macro_rules! ops {
    ($($variant:ident = $name:literal, $enc:ident, ($a:ident, $b:ident, $c:ident);)*) => {
        /// RITE 03 opcodes, in wire order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($variant,)*
        }

        const TABLE: &[(&str, Encoding, [Role; 3])] = &[
            $(($name, Encoding::$enc, [Role::$a, Role::$b, Role::$c]),)*
        ];
    };
}

ops! {
    Nop = "NOP", Z, (None, None, None);
    Move = "MOVE", BB, (Reg, Reg, None);
    LoadL = "LOADL", BB, (Reg, Pool, None);
    LoadL16 = "LOADL16", BS, (Reg, Pool, None);
    LoadI = "LOADI", BB, (Reg, Imm, None);
    LoadINeg = "LOADINEG", BB, (Reg, Imm, None);
    LoadIM1 = "LOADI__1", B, (Reg, None, None);
    LoadI0 = "LOADI_0", B, (Reg, None, None);
    LoadI1 = "LOADI_1", B, (Reg, None, None);
    LoadI2 = "LOADI_2", B, (Reg, None, None);
    LoadI3 = "LOADI_3", B, (Reg, None, None);
    LoadI4 = "LOADI_4", B, (Reg, None, None);
    LoadI5 = "LOADI_5", B, (Reg, None, None);
    LoadI6 = "LOADI_6", B, (Reg, None, None);
    LoadI7 = "LOADI_7", B, (Reg, None, None);
    LoadI16 = "LOADI16", BS, (Reg, Imm, None);
    LoadI32 = "LOADI32", BSS, (Reg, Imm, Imm);
    LoadSym = "LOADSYM", BB, (Reg, Sym, None);
    LoadSym16 = "LOADSYM16", BS, (Reg, Sym, None);
    LoadNil = "LOADNIL", B, (Reg, None, None);
    LoadSelf = "LOADSELF", B, (Reg, None, None);
    LoadT = "LOADT", B, (Reg, None, None);
    LoadF = "LOADF", B, (Reg, None, None);
    GetGv = "GETGV", BB, (Reg, Sym, None);
    SetGv = "SETGV", BB, (Reg, Sym, None);
    GetSv = "GETSV", BB, (Reg, Sym, None);
    SetSv = "SETSV", BB, (Reg, Sym, None);
    GetIv = "GETIV", BB, (Reg, Sym, None);
    SetIv = "SETIV", BB, (Reg, Sym, None);
    GetCv = "GETCV", BB, (Reg, Sym, None);
    SetCv = "SETCV", BB, (Reg, Sym, None);
    GetConst = "GETCONST", BB, (Reg, Sym, None);
    SetConst = "SETCONST", BB, (Reg, Sym, None);
    GetMConst = "GETMCNST", BB, (Reg, Sym, None);
    SetMConst = "SETMCNST", BB, (Reg, Sym, None);
    GetUpvar = "GETUPVAR", BBB, (Reg, Imm, Imm);
    SetUpvar = "SETUPVAR", BBB, (Reg, Imm, Imm);
    Jmp = "JMP", S, (Jump, None, None);
    JmpIf = "JMPIF", BS, (Reg, Jump, None);
    JmpNot = "JMPNOT", BS, (Reg, Jump, None);
    JmpNil = "JMPNIL", BS, (Reg, Jump, None);
    JmpUw = "JMPUW", S, (Jump, None, None);
    Except = "EXCEPT", B, (Reg, None, None);
    Rescue = "RESCUE", BB, (Reg, Reg, None);
    RaiseIf = "RAISEIF", B, (Reg, None, None);
    SendV = "SENDV", BB, (Reg, Sym, None);
    SendVB = "SENDVB", BB, (Reg, Sym, None);
    Send = "SEND", BBB, (Reg, Sym, Imm);
    SendB = "SENDB", BBB, (Reg, Sym, Imm);
    SendVK = "SENDVK", BB, (Reg, Sym, None);
    Call = "CALL", Z, (None, None, None);
    Super = "SUPER", BB, (Reg, Imm, None);
    ArgAry = "ARGARY", BS, (Reg, Imm, None);
    Enter = "ENTER", W, (Imm, None, None);
    KeyP = "KEY_P", BB, (Reg, Sym, None);
    KeyEnd = "KEYEND", Z, (None, None, None);
    KArg = "KARG", BB, (Reg, Sym, None);
    Return = "RETURN", B, (Reg, None, None);
    ReturnBlk = "RETURN_BLK", B, (Reg, None, None);
    Break = "BREAK", B, (Reg, None, None);
    BlkPush = "BLKPUSH", BS, (Reg, Imm, None);
    Add = "ADD", B, (Reg, None, None);
    AddI = "ADDI", BB, (Reg, Imm, None);
    Sub = "SUB", B, (Reg, None, None);
    SubI = "SUBI", BB, (Reg, Imm, None);
    Mul = "MUL", B, (Reg, None, None);
    Div = "DIV", B, (Reg, None, None);
    Eq = "EQ", B, (Reg, None, None);
    Lt = "LT", B, (Reg, None, None);
    Le = "LE", B, (Reg, None, None);
    Gt = "GT", B, (Reg, None, None);
    Ge = "GE", B, (Reg, None, None);
    Array = "ARRAY", BB, (Reg, Imm, None);
    Array2 = "ARRAY2", BBB, (Reg, Reg, Imm);
    AryCat = "ARYCAT", B, (Reg, None, None);
    AryPush = "ARYPUSH", B, (Reg, None, None);
    AryDup = "ARYDUP", B, (Reg, None, None);
    ARef = "AREF", BBB, (Reg, Reg, Imm);
    ASet = "ASET", BBB, (Reg, Reg, Imm);
    APost = "APOST", BBB, (Reg, Imm, Imm);
    Intern = "INTERN", B, (Reg, None, None);
    String = "STRING", BB, (Reg, Pool, None);
    String16 = "STRING16", BS, (Reg, Pool, None);
    StrCat = "STRCAT", B, (Reg, None, None);
    Hash = "HASH", BB, (Reg, Imm, None);
    HashAdd = "HASHADD", BB, (Reg, Imm, None);
    HashCat = "HASHCAT", B, (Reg, None, None);
    Lambda = "LAMBDA", BB, (Reg, Irep, None);
    Lambda16 = "LAMBDA16", BS, (Reg, Irep, None);
    Block = "BLOCK", BB, (Reg, Irep, None);
    Block16 = "BLOCK16", BS, (Reg, Irep, None);
    Method = "METHOD", BB, (Reg, Irep, None);
    Method16 = "METHOD16", BS, (Reg, Irep, None);
    RangeInc = "RANGE_INC", B, (Reg, None, None);
    RangeExc = "RANGE_EXC", B, (Reg, None, None);
    OClass = "OCLASS", B, (Reg, None, None);
    Class = "CLASS", BB, (Reg, Sym, None);
    Module = "MODULE", BB, (Reg, Sym, None);
    Exec = "EXEC", BB, (Reg, Irep, None);
    Exec16 = "EXEC16", BS, (Reg, Irep, None);
    Def = "DEF", BB, (Reg, Sym, None);
    Alias = "ALIAS", BB, (Sym, Sym, None);
    Undef = "UNDEF", B, (Sym, None, None);
    SClass = "SCLASS", B, (Reg, None, None);
    TClass = "TCLASS", B, (Reg, None, None);
    Debug = "DEBUG", BBB, (Imm, Imm, Imm);
    Err = "ERR", B, (Pool, None, None);
    Ext1 = "EXT1", Z, (None, None, None);
    Ext2 = "EXT2", Z, (None, None, None);
    Ext3 = "EXT3", Z, (None, None, None);
    Stop = "STOP", Z, (None, None, None);
}

impl Op {
    pub const COUNT: usize = Op::Stop as usize + 1;

    /// Convert a raw byte to an opcode without a range check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        unsafe { core::mem::transmute::<u8, Op>(byte) }
    }

    /// The upstream mnemonic, e.g. `"LOADI_3"`.
    pub fn mnemonic(self) -> &'static str {
        TABLE[self as usize].0
    }

    pub fn encoding(self) -> Encoding {
        TABLE[self as usize].1
    }

    /// Roles of operands `a`, `b` and `c`.
    pub fn roles(self) -> [Role; 3] {
        TABLE[self as usize].2
    }

    pub const fn is_prefix(self) -> bool {
        matches!(self, Op::Ext1 | Op::Ext2 | Op::Ext3)
    }

    /// Whether the instruction transfers control relative to itself.
    pub fn is_jump(self) -> bool {
        self.roles().contains(&Role::Jump)
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

impl core::fmt::Display for Op {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_enum() {
        assert_eq!(TABLE.len(), Op::COUNT);
        assert_eq!(Op::Nop as u8, 0);
        assert_eq!(Op::LoadI0 as u8, 7);
        assert_eq!(Op::Jmp as u8, 0x25);
        assert_eq!(Op::Send as u8, 0x2F);
        assert_eq!(Op::Return as u8, 0x39);
        assert_eq!(Op::Add as u8, 0x3D);
        assert_eq!(Op::Stop.mnemonic(), "STOP");
    }

    #[test]
    fn try_from_rejects_out_of_range() {
        assert_eq!(Op::try_from(0x01), Ok(Op::Move));
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
        assert_eq!(Op::try_from(0xFF), Err(0xFF));
    }

    #[test]
    fn roles_and_encodings() {
        assert_eq!(Op::JmpIf.encoding(), Encoding::BS);
        assert_eq!(Op::JmpIf.roles(), [Role::Reg, Role::Jump, Role::None]);
        assert!(Op::JmpUw.is_jump());
        assert!(!Op::Send.is_jump());
        assert_eq!(Op::Enter.encoding().operand_len(), 3);
        assert_eq!(Op::LoadI32.encoding().operand_len(), 5);
        assert!(Op::Ext2.is_prefix());
    }
}
