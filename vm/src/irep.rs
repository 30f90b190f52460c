use std::{ops::Range, rc::Rc};

use bytecode::endian::{read_f64_le, read_u16, read_u32, read_u64};
use bytecode::image::{
    CatchHandler, CatchKind, POOL_BIGINT, POOL_FLOAT, POOL_INT32, POOL_INT64, POOL_SSTR, POOL_STR,
};

use crate::Symbol;

/// A constant-pool literal, borrowed from the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolEntry<'a> {
    Str(&'a [u8]),
    Int(i64),
    Float(f64),
    BigInt {
        negative: bool,
        base: u8,
        digits: &'a [u8],
    },
}

/// Which catch handlers an unwind may land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchFilter {
    /// Exceptions stop at rescue and ensure clauses.
    Any,
    /// Returns, breaks and unwinding jumps only run ensure clauses.
    Ensure,
}

impl CatchFilter {
    fn accepts(self, kind: CatchKind) -> bool {
        match self {
            CatchFilter::Any => true,
            CatchFilter::Ensure => kind == CatchKind::Ensure,
        }
    }
}

/// The loaded form of one compiled method, block or class body.
///
/// Code bytes and pool literals stay in the image; the IREP records where
/// they are. Symbols are interned at load time. Nothing here changes after
/// the loader returns.
pub struct Irep {
    #[cfg(feature = "debug")]
    pub(crate) tag: [u8; 2],
    pub(crate) nlocals: u16,
    pub(crate) nregs: u16,
    pub(crate) image: Rc<[u8]>,
    pub(crate) code: Range<usize>,
    pub(crate) pool_base: usize,
    pub(crate) pool_offsets: Vec<u16>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) catch_handlers: Vec<CatchHandler>,
    pub(crate) children: Vec<Rc<Irep>>,
    pub(crate) local_names: Vec<Option<Symbol>>,
}

impl Irep {
    /// An IREP with no code; running it halts at once.
    pub fn empty() -> Self {
        Self {
            #[cfg(feature = "debug")]
            tag: *b"IR",
            nlocals: 0,
            nregs: 1,
            image: Rc::from(&[][..]),
            code: 0..0,
            pool_base: 0,
            pool_offsets: Vec::new(),
            symbols: Vec::new(),
            catch_handlers: Vec::new(),
            children: Vec::new(),
            local_names: Vec::new(),
        }
    }

    #[inline(always)]
    fn check_tag(&self) {
        #[cfg(feature = "debug")]
        assert_eq!(&self.tag, b"IR", "IREP tag corrupted");
    }

    pub fn nlocals(&self) -> usize {
        self.nlocals as usize
    }

    pub fn nregs(&self) -> usize {
        self.nregs as usize
    }

    pub fn ilen(&self) -> usize {
        self.code.len()
    }

    pub fn rlen(&self) -> usize {
        self.children.len()
    }

    pub fn clen(&self) -> usize {
        self.catch_handlers.len()
    }

    pub fn plen(&self) -> usize {
        self.pool_offsets.len()
    }

    pub fn slen(&self) -> usize {
        self.symbols.len()
    }

    #[inline(always)]
    pub fn code(&self) -> &[u8] {
        self.check_tag();
        &self.image[self.code.clone()]
    }

    /// Pool literal `n`.
    pub fn pool_entry(&self, n: usize) -> PoolEntry<'_> {
        self.check_tag();
        #[cfg(feature = "debug")]
        assert!(n < self.plen(), "pool index {n} out of range");
        let at = self.pool_base + self.pool_offsets[n] as usize;
        let bytes = &self.image[at..];
        match bytes[0] {
            POOL_STR | POOL_SSTR => {
                let len = read_u16(&bytes[1..]) as usize;
                PoolEntry::Str(&bytes[3..3 + len])
            }
            POOL_INT32 => PoolEntry::Int(read_u32(&bytes[1..]) as i32 as i64),
            POOL_INT64 => PoolEntry::Int(read_u64(&bytes[1..]) as i64),
            POOL_FLOAT => PoolEntry::Float(read_f64_le(&bytes[1..])),
            POOL_BIGINT => {
                let len = bytes[1] as usize;
                PoolEntry::BigInt {
                    negative: bytes[2] & 0x80 != 0,
                    base: bytes[2] & 0x7F,
                    digits: &bytes[3..3 + len],
                }
            }
            tag => unreachable!("pool tag {tag} passed validation"),
        }
    }

    #[inline]
    pub fn symbol(&self, n: usize) -> Symbol {
        #[cfg(feature = "debug")]
        assert!(n < self.slen(), "symbol index {n} out of range");
        self.symbols[n]
    }

    #[inline]
    pub fn child(&self, n: usize) -> &Rc<Irep> {
        #[cfg(feature = "debug")]
        assert!(n < self.rlen(), "child index {n} out of range");
        &self.children[n]
    }

    pub fn children(&self) -> &[Rc<Irep>] {
        &self.children
    }

    pub fn catch_handler(&self, k: usize) -> &CatchHandler {
        &self.catch_handlers[k]
    }

    pub fn catch_handlers(&self) -> &[CatchHandler] {
        &self.catch_handlers
    }

    /// The first handler, in table order, whose range covers `pc`.
    pub fn find_handler(&self, pc: usize, filter: CatchFilter) -> Option<&CatchHandler> {
        self.catch_handlers
            .iter()
            .find(|h| filter.accepts(h.kind) && h.covers(pc as u32))
    }

    /// The source name of local register `reg`, when the image carried an
    /// `LVAR` section.
    pub fn local_name(&self, reg: usize) -> Option<Symbol> {
        reg.checked_sub(1)
            .and_then(|i| self.local_names.get(i))
            .copied()
            .flatten()
    }
}

impl std::fmt::Debug for Irep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Irep")
            .field("nlocals", &self.nlocals)
            .field("nregs", &self.nregs)
            .field("ilen", &self.ilen())
            .field("plen", &self.plen())
            .field("slen", &self.slen())
            .field("clen", &self.clen())
            .field("rlen", &self.rlen())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::load;
    use bytecode::{BytecodeBuilder, CatchHandler, ImageWriter, IrepDesc, PoolLiteral};

    fn loaded(desc: &IrepDesc) -> Rc<Irep> {
        load(ImageWriter::new().write(desc)).expect("load")
    }

    #[test]
    fn pool_entries_are_decoded_in_place() {
        let mut b = BytecodeBuilder::new();
        b.op_a(bytecode::Op::LoadNil, 1);
        b.ret(1);
        let mut desc = IrepDesc::new(1, 2, b.into_bytes());
        desc.add_pool(PoolLiteral::str("hello"));
        desc.add_pool(PoolLiteral::Int32(-7));
        desc.add_pool(PoolLiteral::Int64(1 << 40));
        desc.add_pool(PoolLiteral::Float(2.5));
        desc.add_pool(PoolLiteral::BigInt("-123456789012345678901".into()));

        let irep = loaded(&desc);
        assert_eq!(irep.plen(), 5);
        assert_eq!(irep.pool_entry(0), PoolEntry::Str(b"hello"));
        assert_eq!(irep.pool_entry(1), PoolEntry::Int(-7));
        assert_eq!(irep.pool_entry(2), PoolEntry::Int(1 << 40));
        assert_eq!(irep.pool_entry(3), PoolEntry::Float(2.5));
        assert_eq!(
            irep.pool_entry(4),
            PoolEntry::BigInt {
                negative: true,
                base: 10,
                digits: b"123456789012345678901",
            }
        );
    }

    #[test]
    fn handler_search_is_first_match_in_table_order() {
        let code = vec![bytecode::Op::Nop as u8; 8];
        let mut desc = IrepDesc::new(1, 1, code);
        desc.catch_handlers = vec![
            CatchHandler { kind: CatchKind::Ensure, begin: 2, end: 4, target: 6 },
            CatchHandler { kind: CatchKind::Rescue, begin: 0, end: 6, target: 7 },
        ];
        let irep = loaded(&desc);

        let first = irep.find_handler(3, CatchFilter::Any).expect("handler");
        assert_eq!(first.target, 6);
        let again = irep.find_handler(3, CatchFilter::Any).expect("handler");
        assert!(std::ptr::eq(first, again));

        assert_eq!(irep.find_handler(1, CatchFilter::Any).map(|h| h.target), Some(7));
        assert_eq!(irep.find_handler(1, CatchFilter::Ensure), None);
        assert_eq!(irep.find_handler(6, CatchFilter::Any), None);
    }

    #[test]
    fn children_and_symbols() {
        let mut child = IrepDesc::new(1, 1, vec![bytecode::Op::Stop as u8]);
        child.sym("inner");
        let mut root = IrepDesc::new(2, 3, vec![bytecode::Op::Stop as u8]);
        root.sym("outer");
        root.local_names = vec![Some("x".into())];
        root.add_child(child);

        let irep = loaded(&root);
        assert_eq!(irep.rlen(), 1);
        assert_eq!(irep.symbol(0), Symbol::intern("outer"));
        assert_eq!(irep.child(0).symbol(0), Symbol::intern("inner"));
        assert_eq!(irep.local_name(1), Some(Symbol::intern("x")));
        assert_eq!(irep.local_name(0), None);
        assert_eq!(irep.local_name(2), None);
    }
}
