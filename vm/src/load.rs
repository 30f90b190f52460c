//! Image loader: validates a RITE 03 image and builds the IREP tree.
//!
//! The loader is the only place that trusts nothing. Everything it accepts
//! is checked once here (section bounds, record sizes, pool tags, every
//! instruction and its operand indices) so the interpreter can index the
//! tree without further checks.

use std::rc::Rc;

use bytecode::endian::{read_u16, read_u32};
use bytecode::image::{
    CatchHandler, CatchKind, HEADER_SIZE, IREP_VERSION, NO_SYMBOL, POOL_BIGINT, POOL_FLOAT,
    POOL_INT32, POOL_INT64, POOL_SSTR, POOL_STR, RITE_MAGIC, RITE_MAJOR, SECTION_DEBUG,
    SECTION_END, SECTION_HEADER_SIZE, SECTION_IREP, SECTION_LVAR,
};
use bytecode::{decode_at, Instruction, Op, Role};

use crate::{Irep, LoadError, Symbol};

/// Deepest IREP nesting accepted.
const MAX_IREP_DEPTH: usize = 255;

/// Load an image, returning the root IREP.
pub fn load(bytes: impl Into<Rc<[u8]>>) -> Result<Rc<Irep>, LoadError> {
    let image: Rc<[u8]> = bytes.into();
    let total = check_header(&image)?;

    let mut irep_section = None;
    let mut lvar_section = None;
    let mut pos = HEADER_SIZE;
    loop {
        if pos + SECTION_HEADER_SIZE > total {
            return Err(LoadError::at(pos, "missing END section"));
        }
        let tag = &image[pos..pos + 4];
        let size = read_u32(&image[pos + 4..]) as usize;
        if size < SECTION_HEADER_SIZE || size > total - pos {
            return Err(LoadError::at(pos + 4, format!("section size {size} out of range")));
        }
        log::debug!("section {:?} at {pos}, {size} bytes", String::from_utf8_lossy(tag));

        match tag {
            t if t == SECTION_IREP => {
                if irep_section.is_some() {
                    return Err(LoadError::at(pos, "duplicate IREP section"));
                }
                if pos != HEADER_SIZE {
                    return Err(LoadError::at(pos, "IREP section must follow the header"));
                }
                if size < SECTION_HEADER_SIZE + 4
                    || &image[pos + 8..pos + 12] != IREP_VERSION
                {
                    return Err(LoadError::at(pos + 8, "unsupported IREP version"));
                }
                irep_section = Some((pos + 12, pos + size));
            }
            t if t == SECTION_LVAR => lvar_section = Some((pos + 8, pos + size)),
            t if t == SECTION_DEBUG => {}
            t if t == SECTION_END => {
                if size != SECTION_HEADER_SIZE {
                    return Err(LoadError::at(pos + 4, "END section must be 8 bytes"));
                }
                break;
            }
            _ => return Err(LoadError::at(pos, "unknown section tag")),
        }
        pos += size;
    }

    let (start, end) = irep_section.ok_or_else(|| LoadError::at(HEADER_SIZE, "missing IREP section"))?;
    let mut lvar = match lvar_section {
        Some((at, end)) => Some(LocalNames::read(&image, at, end)?),
        None => None,
    };
    let mut reader = Reader {
        image: &image,
        pos: start,
        end,
    };
    let root = reader.irep(&image, lvar.as_mut(), 0)?;
    Ok(Rc::new(root))
}

fn check_header(image: &[u8]) -> Result<usize, LoadError> {
    if image.len() < HEADER_SIZE {
        return Err(LoadError::at(0, "image shorter than its header"));
    }
    if &image[0..4] != RITE_MAGIC {
        return Err(LoadError::at(0, "bad magic"));
    }
    if &image[4..6] != RITE_MAJOR {
        return Err(LoadError::at(4, "unsupported major version"));
    }
    if !matches!(&image[6..8], b"00" | b"01" | b"02") {
        return Err(LoadError::at(6, "unsupported minor version"));
    }
    let total = read_u32(&image[8..]) as usize;
    if total < HEADER_SIZE + SECTION_HEADER_SIZE || total > image.len() {
        return Err(LoadError::at(8, format!("image size {total} out of range")));
    }
    Ok(total)
}

struct Reader<'a> {
    image: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if n > self.end - self.pos {
            return Err(LoadError::at(self.pos, "truncated IREP record"));
        }
        let bytes = &self.image[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        Ok(read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        Ok(read_u32(self.take(4)?))
    }

    fn irep(
        &mut self,
        shared: &Rc<[u8]>,
        mut lvar: Option<&mut LocalNames>,
        depth: usize,
    ) -> Result<Irep, LoadError> {
        if depth > MAX_IREP_DEPTH {
            return Err(LoadError::at(self.pos, "IREP nesting too deep"));
        }
        let start = self.pos;
        let record_size = self.u32()? as usize;
        let nlocals = self.u16()?;
        let nregs = self.u16()?;
        let rlen = self.u16()?;
        let clen = self.u16()?;
        let ilen = self.u32()? as usize;

        let code_start = self.pos;
        self.take(ilen)?;

        let mut catch_handlers = Vec::with_capacity(clen as usize);
        for _ in 0..clen {
            let at = self.pos;
            let kind = CatchKind::try_from(self.u8()?)
                .map_err(|k| LoadError::at(at, format!("unknown catch handler kind {k}")))?;
            catch_handlers.push(CatchHandler {
                kind,
                begin: self.u32()?,
                end: self.u32()?,
                target: self.u32()?,
            });
        }

        let plen = self.u16()?;
        let pool_base = self.pos;
        let mut pool_offsets = Vec::with_capacity(plen as usize);
        for _ in 0..plen {
            let offset = u16::try_from(self.pos - pool_base)
                .map_err(|_| LoadError::at(self.pos, "constant pool larger than 64 KiB"))?;
            pool_offsets.push(offset);
            self.pool_entry()?;
        }

        let slen = self.u16()?;
        let mut symbols = Vec::with_capacity(slen as usize);
        for _ in 0..slen {
            let len = self.u16()?;
            if len == NO_SYMBOL {
                symbols.push(Symbol::intern(""));
                continue;
            }
            let name = self.take(len as usize)?;
            if self.u8()? != 0 {
                return Err(LoadError::at(self.pos - 1, "symbol is not NUL terminated"));
            }
            symbols.push(Symbol::intern(&String::from_utf8_lossy(name)));
        }

        if self.pos - start != record_size {
            return Err(LoadError::at(
                start,
                format!("record size {record_size} does not match its contents ({})", self.pos - start),
            ));
        }

        let local_names = match lvar.as_deref_mut() {
            Some(names) => names.record(nlocals)?,
            None => Vec::new(),
        };

        let mut children = Vec::with_capacity(rlen as usize);
        for _ in 0..rlen {
            let child = self.irep(shared, lvar.as_deref_mut(), depth + 1)?;
            children.push(Rc::new(child));
        }

        let irep = Irep {
            #[cfg(feature = "debug")]
            tag: *b"IR",
            nlocals,
            nregs,
            image: shared.clone(),
            code: code_start..code_start + ilen,
            pool_base,
            pool_offsets,
            symbols,
            catch_handlers,
            children,
            local_names,
        };
        validate(&irep, code_start)?;
        Ok(irep)
    }

    fn pool_entry(&mut self) -> Result<(), LoadError> {
        let at = self.pos;
        match self.u8()? {
            POOL_STR | POOL_SSTR => {
                let len = self.u16()? as usize;
                self.take(len)?;
                if self.u8()? != 0 {
                    return Err(LoadError::at(self.pos - 1, "string literal is not NUL terminated"));
                }
            }
            POOL_INT32 => {
                self.take(4)?;
            }
            POOL_INT64 | POOL_FLOAT => {
                self.take(8)?;
            }
            POOL_BIGINT => {
                let len = self.u8()? as usize;
                let base = self.u8()? & 0x7F;
                let digits = self.take(len)?;
                if !(2..=36).contains(&base)
                    || !digits.iter().all(|&d| (d as char).is_digit(base as u32))
                {
                    return Err(LoadError::at(at, "malformed big integer literal"));
                }
            }
            tag => return Err(LoadError::at(at, format!("unknown pool tag {tag}"))),
        }
        Ok(())
    }
}

/// The `LVAR` section: a name table followed by one index record per IREP,
/// in the same depth-first order as the `IREP` section.
struct LocalNames {
    names: Vec<Symbol>,
    image: Rc<[u8]>,
    pos: usize,
    end: usize,
}

impl LocalNames {
    fn read(image: &Rc<[u8]>, start: usize, end: usize) -> Result<Self, LoadError> {
        let mut reader = Reader { image, pos: start, end };
        let count = reader.u32()? as usize;
        let mut names = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = reader.u16()? as usize;
            let name = reader.take(len)?;
            names.push(Symbol::intern(&String::from_utf8_lossy(name)));
        }
        Ok(Self {
            names,
            image: image.clone(),
            pos: reader.pos,
            end,
        })
    }

    fn record(&mut self, nlocals: u16) -> Result<Vec<Option<Symbol>>, LoadError> {
        let mut reader = Reader {
            image: &self.image,
            pos: self.pos,
            end: self.end,
        };
        let mut locals = Vec::with_capacity(nlocals as usize);
        for _ in 1..nlocals {
            let at = reader.pos;
            let idx = reader.u16()?;
            if idx == NO_SYMBOL {
                locals.push(None);
                continue;
            }
            let name = self
                .names
                .get(idx as usize)
                .copied()
                .ok_or_else(|| LoadError::at(at, format!("local name index {idx} out of range")))?;
            locals.push(Some(name));
        }
        self.pos = reader.pos;
        Ok(locals)
    }
}

/// Check every instruction of `irep` against its tables. `base` is the
/// image offset of the code, used for error positions.
///
/// Jump targets, ENTER jump-table entries and catch handler offsets must
/// all land on the first byte of an instruction.
fn validate(irep: &Irep, base: usize) -> Result<(), LoadError> {
    let code = irep.code();
    let ilen = code.len();
    if ilen > 0 && irep.nregs == 0 {
        return Err(LoadError::at(base, "IREP with code must reserve register 0"));
    }

    // `starts[ilen]` stands for the end of the code.
    let mut starts = vec![false; ilen + 1];
    starts[ilen] = true;
    let mut targets = Vec::new();
    let mut pc = 0;
    while pc < ilen {
        starts[pc] = true;
        let (insn, next) =
            decode_at(code, pc).map_err(|err| LoadError::at(base + pc, err.to_string()))?;
        check_operands(irep, &insn, pc, next, &mut targets)
            .map_err(|reason| LoadError::at(base + pc, reason))?;
        pc = next;
    }

    for (pc, target) in targets {
        if !starts[target] {
            return Err(LoadError::at(
                base + pc,
                format!("jump at {pc} lands inside an instruction at {target}"),
            ));
        }
    }

    for h in irep.catch_handlers() {
        let (begin, end, target) = (h.begin as usize, h.end as usize, h.target as usize);
        if begin > end || end > ilen || target >= ilen {
            return Err(LoadError::at(base, format!("catch handler {h:?} outside the code")));
        }
        if !starts[begin] || !starts[end] || !starts[target] {
            return Err(LoadError::at(
                base,
                format!("catch handler {h:?} splits an instruction"),
            ));
        }
    }
    Ok(())
}

/// Check the table indices and register span of one instruction. Jump
/// targets are range checked here and pushed to `targets` as
/// `(pc, target)` for the boundary check once the whole code is decoded.
fn check_operands(
    irep: &Irep,
    insn: &Instruction,
    pc: usize,
    next: usize,
    targets: &mut Vec<(usize, usize)>,
) -> Result<(), String> {
    for (n, role) in insn.op.roles().into_iter().enumerate() {
        let v = insn.operand(n) as usize;
        match role {
            Role::Pool if v >= irep.plen() => {
                return Err(format!("{}: pool index {v} >= {}", insn.op, irep.plen()));
            }
            Role::Sym if v >= irep.slen() => {
                return Err(format!("{}: symbol index {v} >= {}", insn.op, irep.slen()));
            }
            Role::Irep if v >= irep.rlen() => {
                return Err(format!("{}: child index {v} >= {}", insn.op, irep.rlen()));
            }
            Role::Jump => {
                let target = next as isize + v as u16 as i16 as isize;
                if target < 0 || target as usize >= irep.ilen() {
                    return Err(format!("{} at {pc} jumps outside the code", insn.op));
                }
                targets.push((pc, target as usize));
            }
            _ => {}
        }
    }

    if let Some(span) = register_span(insn) {
        if span >= irep.nregs() {
            return Err(format!("{} touches r{span}, IREP has {} registers", insn.op, irep.nregs));
        }
    }

    if insn.op == Op::Enter {
        let optional = (insn.a >> 13 & 0x1F) as usize;
        if optional > 0 {
            if next + (optional + 1) * 3 > irep.ilen() {
                return Err("ENTER jump table runs past the code".into());
            }
            targets.extend((0..=optional).map(|k| (pc, next + k * 3)));
        }
    }
    Ok(())
}

/// The highest register an instruction reads or writes in its own window.
/// Sends write into the callee window, which is checked against the
/// register file when the call happens.
fn register_span(insn: &Instruction) -> Option<usize> {
    let (a, b, c) = (insn.a as usize, insn.b as usize, insn.c as usize);
    let span = match insn.op {
        Op::Send | Op::SendB | Op::SendV | Op::SendVB | Op::SendVK | Op::Super => return None,
        Op::Move | Op::Rescue => a.max(b),
        Op::Add | Op::AddI | Op::Sub | Op::SubI | Op::Mul | Op::Div | Op::Eq | Op::Lt
        | Op::Le | Op::Gt | Op::Ge | Op::StrCat | Op::AryCat | Op::AryPush | Op::HashCat
        | Op::RangeInc | Op::RangeExc | Op::Class | Op::Def | Op::SetMConst
        | Op::ArgAry => a + 1,
        Op::Array => a + b.saturating_sub(1),
        Op::Array2 => a.max((b + c).saturating_sub(1)),
        Op::Hash => a + (2 * b).saturating_sub(1),
        Op::HashAdd => a + 2 * b,
        Op::APost => a + c,
        Op::Enter => {
            let spec = insn.a;
            let params = (spec >> 18 & 0x1F) + (spec >> 13 & 0x1F) + (spec >> 12 & 1)
                + (spec >> 7 & 0x1F) + (spec >> 1 & 1);
            params as usize + 1
        }
        op => {
            let roles = op.roles();
            let mut span = None;
            for (n, role) in roles.into_iter().enumerate() {
                if role == Role::Reg {
                    span = span.max(Some(insn.operand(n) as usize));
                }
            }
            return span;
        }
    };
    Some(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FORMAT_INVALID;
    use bytecode::{BytecodeBuilder, ImageWriter, IrepDesc, PoolLiteral};

    fn hello() -> IrepDesc {
        let mut b = BytecodeBuilder::new();
        b.string(1, 0);
        b.ret(1);
        let mut desc = IrepDesc::new(1, 2, b.into_bytes());
        desc.add_pool(PoolLiteral::str("hello"));
        desc
    }

    fn reason(result: Result<Rc<Irep>, LoadError>) -> String {
        match result {
            Err(LoadError::FormatInvalid { reason, .. }) => reason,
            Ok(_) => panic!("image was accepted"),
        }
    }

    #[test]
    fn loads_a_minimal_image() {
        let irep = load(ImageWriter::new().write(&hello())).expect("load");
        assert_eq!(irep.nregs(), 2);
        assert_eq!(irep.ilen(), 5);
        assert_eq!(irep.plen(), 1);
        assert_eq!(irep.slen(), 0);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut image = ImageWriter::new().write(&hello());
        image[..4].copy_from_slice(b"XXXX");
        let err = load(image).map(|_| ()).unwrap_err();
        assert_eq!(err.code(), FORMAT_INVALID);
        assert!(err.to_string().contains("bad magic"));

        let mut image = ImageWriter::new().write(&hello());
        image[4..6].copy_from_slice(b"02");
        assert_eq!(reason(load(image)), "unsupported major version");

        let mut image = ImageWriter::new().write(&hello());
        image[6..8].copy_from_slice(b"09");
        assert_eq!(reason(load(image)), "unsupported minor version");
    }

    #[test]
    fn rejects_truncation_anywhere() {
        let image = ImageWriter::new().write(&hello());
        for len in 0..image.len() {
            let mut cut = image[..len].to_vec();
            // Keep the declared size consistent so the cut reaches the records.
            if len >= 12 {
                cut[8..12].copy_from_slice(&(len as u32).to_be_bytes());
            }
            assert!(load(cut).is_err(), "accepted image cut at {len}");
        }
    }

    #[test]
    fn ignores_bytes_past_declared_size() {
        let mut image = ImageWriter::new().write(&hello());
        image.extend_from_slice(b"trailing garbage");
        assert!(load(image).is_ok());
    }

    #[test]
    fn rejects_unknown_section() {
        let mut image = ImageWriter::new().write(&hello());
        let end = image.len() - 8;
        image[end..end + 4].copy_from_slice(b"ZZZZ");
        assert_eq!(reason(load(image)), "unknown section tag");
    }

    #[test]
    fn skips_debug_section() {
        let image = ImageWriter::new().write(&hello());
        let end = image.len() - 8;
        let mut patched = image[..end].to_vec();
        patched.extend_from_slice(b"DBG\0");
        patched.extend_from_slice(&12u32.to_be_bytes());
        patched.extend_from_slice(&[1, 2, 3, 4]);
        patched.extend_from_slice(&image[end..]);
        let total = patched.len() as u32;
        patched[8..12].copy_from_slice(&total.to_be_bytes());
        assert!(load(patched).is_ok());
    }

    #[test]
    fn rejects_record_size_mismatch() {
        let mut image = ImageWriter::new().write(&hello());
        let record = HEADER_SIZE + 12;
        let size = read_u32(&image[record..]) + 1;
        image[record..record + 4].copy_from_slice(&size.to_be_bytes());
        assert!(reason(load(image)).starts_with("record size"));
    }

    #[test]
    fn rejects_jump_out_of_code() {
        let mut b = BytecodeBuilder::new();
        b.op_a(Op::Jmp, 0x10);
        b.op(Op::Stop);
        let desc = IrepDesc::new(1, 1, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("jumps outside"));
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let mut b = BytecodeBuilder::new();
        b.load_pool(1, 3);
        b.ret(1);
        let desc = IrepDesc::new(1, 2, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("pool index"));

        let mut b = BytecodeBuilder::new();
        b.load_sym(1, 0);
        b.ret(1);
        let desc = IrepDesc::new(1, 2, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("symbol index"));

        let mut b = BytecodeBuilder::new();
        b.op_ab(Op::Block, 1, 0);
        b.ret(1);
        let desc = IrepDesc::new(1, 2, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("child index"));
    }

    #[test]
    fn rejects_registers_beyond_nregs() {
        let mut b = BytecodeBuilder::new();
        b.load_int(1, 1);
        b.op_a(Op::Add, 1);
        b.ret(1);
        let desc = IrepDesc::new(1, 2, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("touches r2"));
    }

    #[test]
    fn rejects_bad_catch_handler() {
        let mut desc = hello();
        desc.catch_handlers.push(CatchHandler {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 3,
            target: 99,
        });
        assert!(reason(load(ImageWriter::new().write(&desc))).starts_with("catch handler"));
    }

    #[test]
    fn rejects_jump_into_operand_bytes() {
        // The target is the register byte of LOADI, which reads as a LOADL
        // with a pool index the IREP does not have.
        let mut b = BytecodeBuilder::new();
        b.op_a(Op::Jmp, 1);
        b.op_ab(Op::LoadI, Op::LoadL as u32, 1);
        b.ret(1);
        let desc = IrepDesc::new(1, Op::LoadL as u16 + 2, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("lands inside an instruction"));
    }

    #[test]
    fn rejects_catch_handler_inside_an_instruction() {
        let mut desc = hello();
        desc.catch_handlers.push(CatchHandler {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 3,
            target: 1,
        });
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("splits an instruction"));

        let mut desc = hello();
        desc.catch_handlers.push(CatchHandler {
            kind: CatchKind::Ensure,
            begin: 1,
            end: 5,
            target: 3,
        });
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("splits an instruction"));

        let mut desc = hello();
        desc.catch_handlers.push(CatchHandler {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 5,
            target: 3,
        });
        assert!(load(ImageWriter::new().write(&desc)).is_ok());
    }

    #[test]
    fn rejects_enter_table_entry_inside_an_instruction() {
        // ENTER with one optional argument expects two 3-byte JMPs after it.
        let mut b = BytecodeBuilder::new();
        b.enter(0, 1, false);
        b.load_int(1, 300);
        b.op_a(Op::Jmp, 0);
        b.ret(1);
        let desc = IrepDesc::new(2, 3, b.into_bytes());
        assert!(reason(load(ImageWriter::new().write(&desc))).contains("lands inside an instruction"));
    }

    #[test]
    fn empty_irep_and_empty_pool_are_legal() {
        let desc = IrepDesc::new(0, 0, Vec::new());
        let irep = load(ImageWriter::new().write(&desc)).expect("load");
        assert_eq!(irep.ilen(), 0);
        assert_eq!(irep.plen(), 0);
    }

    #[test]
    fn local_names_follow_depth_first_order() {
        let mut inner = IrepDesc::new(2, 3, vec![Op::Stop as u8]);
        inner.local_names = vec![Some("b".into())];
        let mut root = IrepDesc::new(3, 4, vec![Op::Stop as u8]);
        root.local_names = vec![Some("a".into()), None];
        root.add_child(inner);

        let irep = load(ImageWriter::new().write(&root)).expect("load");
        assert_eq!(irep.local_name(1), Some(Symbol::intern("a")));
        assert_eq!(irep.local_name(2), None);
        assert_eq!(irep.child(0).local_name(1), Some(Symbol::intern("b")));
    }
}
