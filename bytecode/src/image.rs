//! RITE 03 image layout: constants shared with the loader, and a writer
//! that serialises an [`IrepDesc`] tree.

use crate::endian::{write_u16, write_u32};

pub const RITE_MAGIC: &[u8; 4] = b"RITE";
pub const RITE_MAJOR: &[u8; 2] = b"03";
pub const RITE_MINOR: &[u8; 2] = b"00";
pub const COMPILER_NAME: &[u8; 4] = b"MATZ";
pub const COMPILER_VERSION: &[u8; 4] = b"0000";
/// Bytes in the image header.
pub const HEADER_SIZE: usize = 20;
/// Bytes in a section header (tag + size).
pub const SECTION_HEADER_SIZE: usize = 8;

pub const SECTION_IREP: &[u8; 4] = b"IREP";
pub const SECTION_LVAR: &[u8; 4] = b"LVAR";
pub const SECTION_DEBUG: &[u8; 4] = b"DBG\0";
pub const SECTION_END: &[u8; 4] = b"END\0";
/// RITE version stamp that follows the `IREP` section header.
pub const IREP_VERSION: &[u8; 4] = b"0300";

/// `record_size, nlocals, nregs, rlen, clen, ilen`.
pub const IREP_HEADER_SIZE: usize = 16;
/// `kind u8, begin u32, end u32, target u32`.
pub const CATCH_HANDLER_SIZE: usize = 13;

pub const POOL_STR: u8 = 0;
pub const POOL_INT32: u8 = 1;
pub const POOL_SSTR: u8 = 2;
pub const POOL_INT64: u8 = 3;
pub const POOL_FLOAT: u8 = 5;
pub const POOL_BIGINT: u8 = 7;

/// Symbol length marking an anonymous slot.
pub const NO_SYMBOL: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CatchKind {
    Rescue = 0,
    Ensure = 1,
}

impl TryFrom<u8> for CatchKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(CatchKind::Rescue),
            1 => Ok(CatchKind::Ensure),
            other => Err(other),
        }
    }
}

/// One catch-table row. `begin..end` is the protected range of code
/// offsets; `target` is the landing pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    pub kind: CatchKind,
    pub begin: u32,
    pub end: u32,
    pub target: u32,
}

impl CatchHandler {
    #[inline]
    pub fn covers(&self, pc: u32) -> bool {
        self.begin <= pc && pc < self.end
    }
}

/// A literal in an IREP constant pool, as written to the image.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolLiteral {
    Str(Vec<u8>),
    Int32(i32),
    Int64(i64),
    Float(f64),
    /// Decimal digits, optionally signed.
    BigInt(String),
}

impl PoolLiteral {
    pub fn str(s: &str) -> Self {
        PoolLiteral::Str(s.as_bytes().to_vec())
    }

    fn encoded_len(&self) -> usize {
        match self {
            PoolLiteral::Str(bytes) => 1 + 2 + bytes.len() + 1,
            PoolLiteral::Int32(_) => 1 + 4,
            PoolLiteral::Int64(_) | PoolLiteral::Float(_) => 1 + 8,
            PoolLiteral::BigInt(digits) => 1 + 2 + digits.trim_start_matches('-').len(),
        }
    }
}

/// Description of one IREP to be written into an image.
#[derive(Debug, Clone, Default)]
pub struct IrepDesc {
    pub nlocals: u16,
    pub nregs: u16,
    pub code: Vec<u8>,
    pub catch_handlers: Vec<CatchHandler>,
    pub pool: Vec<PoolLiteral>,
    /// `None` writes an anonymous symbol slot.
    pub symbols: Vec<Option<String>>,
    pub children: Vec<IrepDesc>,
    /// Names of locals `r1..nlocals`; emitted into the `LVAR` section when
    /// any IREP in the tree has them.
    pub local_names: Vec<Option<String>>,
}

impl IrepDesc {
    pub fn new(nlocals: u16, nregs: u16, code: Vec<u8>) -> Self {
        Self {
            nlocals,
            nregs,
            code,
            ..Default::default()
        }
    }

    /// Append a pool literal and return its index.
    pub fn add_pool(&mut self, literal: PoolLiteral) -> u32 {
        self.pool.push(literal);
        (self.pool.len() - 1) as u32
    }

    /// Return the index of `name` in the symbol table, adding it if needed.
    pub fn sym(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.symbols.iter().position(|s| s.as_deref() == Some(name)) {
            return idx as u32;
        }
        self.symbols.push(Some(name.to_owned()));
        (self.symbols.len() - 1) as u32
    }

    /// Append a child IREP and return its index.
    pub fn add_child(&mut self, child: IrepDesc) -> u32 {
        self.children.push(child);
        (self.children.len() - 1) as u32
    }

    fn record_size(&self) -> usize {
        let pool: usize = self.pool.iter().map(PoolLiteral::encoded_len).sum();
        let syms: usize = self
            .symbols
            .iter()
            .map(|s| match s {
                Some(name) => 2 + name.len() + 1,
                None => 2,
            })
            .sum();
        IREP_HEADER_SIZE
            + self.code.len()
            + self.catch_handlers.len() * CATCH_HANDLER_SIZE
            + 2
            + pool
            + 2
            + syms
    }

    fn has_local_names(&self) -> bool {
        !self.local_names.is_empty() || self.children.iter().any(IrepDesc::has_local_names)
    }
}

/// Serialises an IREP tree into a RITE image.
pub struct ImageWriter {
    buf: Vec<u8>,
}

impl ImageWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Build a complete image: header, `IREP`, optional `LVAR`, `END`.
    pub fn write(mut self, root: &IrepDesc) -> Vec<u8> {
        self.buf.extend_from_slice(RITE_MAGIC);
        self.buf.extend_from_slice(RITE_MAJOR);
        self.buf.extend_from_slice(RITE_MINOR);
        let size_at = self.reserve_u32();
        self.buf.extend_from_slice(COMPILER_NAME);
        self.buf.extend_from_slice(COMPILER_VERSION);

        let section_start = self.buf.len();
        self.buf.extend_from_slice(SECTION_IREP);
        let section_size_at = self.reserve_u32();
        self.buf.extend_from_slice(IREP_VERSION);
        self.write_irep(root);
        self.patch_u32(section_size_at, (self.buf.len() - section_start) as u32);

        if root.has_local_names() {
            self.write_lvar(root);
        }

        self.buf.extend_from_slice(SECTION_END);
        self.push_u32(SECTION_HEADER_SIZE as u32);

        let total = self.buf.len() as u32;
        self.patch_u32(size_at, total);
        self.buf
    }

    fn write_irep(&mut self, irep: &IrepDesc) {
        self.push_u32(irep.record_size() as u32);
        self.push_u16(irep.nlocals);
        self.push_u16(irep.nregs);
        self.push_u16(irep.children.len() as u16);
        self.push_u16(irep.catch_handlers.len() as u16);
        self.push_u32(irep.code.len() as u32);
        self.buf.extend_from_slice(&irep.code);

        for handler in &irep.catch_handlers {
            self.buf.push(handler.kind as u8);
            self.push_u32(handler.begin);
            self.push_u32(handler.end);
            self.push_u32(handler.target);
        }

        self.push_u16(irep.pool.len() as u16);
        for literal in &irep.pool {
            self.write_pool_literal(literal);
        }

        self.push_u16(irep.symbols.len() as u16);
        for sym in &irep.symbols {
            match sym {
                Some(name) => {
                    self.push_u16(name.len() as u16);
                    self.buf.extend_from_slice(name.as_bytes());
                    self.buf.push(0);
                }
                None => self.push_u16(NO_SYMBOL),
            }
        }

        for child in &irep.children {
            self.write_irep(child);
        }
    }

    fn write_pool_literal(&mut self, literal: &PoolLiteral) {
        match literal {
            PoolLiteral::Str(bytes) => {
                self.buf.push(POOL_STR);
                self.push_u16(bytes.len() as u16);
                self.buf.extend_from_slice(bytes);
                self.buf.push(0);
            }
            PoolLiteral::Int32(v) => {
                self.buf.push(POOL_INT32);
                self.push_u32(*v as u32);
            }
            PoolLiteral::Int64(v) => {
                self.buf.push(POOL_INT64);
                self.push_u32((*v as u64 >> 32) as u32);
                self.push_u32(*v as u32);
            }
            PoolLiteral::Float(v) => {
                self.buf.push(POOL_FLOAT);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            PoolLiteral::BigInt(digits) => {
                let negative = digits.starts_with('-');
                let body = digits.trim_start_matches('-');
                self.buf.push(POOL_BIGINT);
                self.buf.push(body.len() as u8);
                // Base 10; the high bit carries the sign.
                self.buf.push(10 | if negative { 0x80 } else { 0 });
                self.buf.extend_from_slice(body.as_bytes());
            }
        }
    }

    fn write_lvar(&mut self, root: &IrepDesc) {
        let mut names: Vec<&str> = Vec::new();
        collect_local_names(root, &mut names);

        let section_start = self.buf.len();
        self.buf.extend_from_slice(SECTION_LVAR);
        let size_at = self.reserve_u32();
        self.push_u32(names.len() as u32);
        for name in &names {
            self.push_u16(name.len() as u16);
            self.buf.extend_from_slice(name.as_bytes());
        }
        self.write_lvar_record(root, &names);
        self.patch_u32(size_at, (self.buf.len() - section_start) as u32);
    }

    fn write_lvar_record(&mut self, irep: &IrepDesc, names: &[&str]) {
        for i in 0..irep.nlocals.saturating_sub(1) as usize {
            let idx = irep
                .local_names
                .get(i)
                .and_then(|n| n.as_deref())
                .and_then(|n| names.iter().position(|m| *m == n));
            self.push_u16(idx.map_or(NO_SYMBOL, |i| i as u16));
        }
        for child in &irep.children {
            self.write_lvar_record(child, names);
        }
    }

    fn push_u16(&mut self, v: u16) {
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0; 2]);
        write_u16(v, &mut self.buf[at..]);
    }

    fn push_u32(&mut self, v: u32) {
        let at = self.reserve_u32();
        self.patch_u32(at, v);
    }

    fn reserve_u32(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        at
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        write_u32(v, &mut self.buf[at..]);
    }
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_local_names<'a>(irep: &'a IrepDesc, names: &mut Vec<&'a str>) {
    for name in irep.local_names.iter().flatten() {
        if !names.contains(&name.as_str()) {
            names.push(name);
        }
    }
    for child in &irep.children {
        collect_local_names(child, names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::{read_u16, read_u32};

    #[test]
    fn header_and_sections() {
        let desc = IrepDesc::new(1, 2, vec![crate::Op::Stop as u8]);
        let image = ImageWriter::new().write(&desc);

        assert_eq!(&image[..4], RITE_MAGIC);
        assert_eq!(&image[4..8], b"0300");
        assert_eq!(read_u32(&image[8..]) as usize, image.len());
        assert_eq!(&image[HEADER_SIZE..HEADER_SIZE + 4], SECTION_IREP);
        assert_eq!(&image[image.len() - 8..image.len() - 4], SECTION_END);

        let record = HEADER_SIZE + 12;
        assert_eq!(read_u32(&image[record..]), (IREP_HEADER_SIZE + 1 + 2 + 2) as u32);
        assert_eq!(read_u16(&image[record + 6..]), 2);
    }

    #[test]
    fn record_size_counts_pool_and_symbols() {
        let mut desc = IrepDesc::new(1, 3, vec![0; 4]);
        desc.add_pool(PoolLiteral::str("hi"));
        desc.add_pool(PoolLiteral::Int64(-5));
        desc.add_pool(PoolLiteral::BigInt("-123".into()));
        assert_eq!(desc.sym("puts"), 0);
        assert_eq!(desc.sym("puts"), 0);
        desc.symbols.push(None);
        desc.catch_handlers.push(CatchHandler {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 2,
            target: 3,
        });
        let expected = IREP_HEADER_SIZE + 4 + 13 + 2 + (1 + 2 + 2 + 1) + 9 + (1 + 2 + 3) + 2 + (2 + 4 + 1) + 2;
        assert_eq!(desc.record_size(), expected);

        let image = ImageWriter::new().write(&desc);
        let record = HEADER_SIZE + 12;
        assert_eq!(read_u32(&image[record..]) as usize, expected);
    }

    #[test]
    fn lvar_section_only_when_named() {
        let mut desc = IrepDesc::new(3, 4, vec![crate::Op::Stop as u8]);
        let plain = ImageWriter::new().write(&desc);
        assert!(!plain.windows(4).any(|w| w == SECTION_LVAR));

        desc.local_names = vec![Some("x".into()), Some("y".into())];
        let named = ImageWriter::new().write(&desc);
        assert!(named.windows(4).any(|w| w == SECTION_LVAR));
    }

    #[test]
    fn catch_handler_range_is_half_open() {
        let h = CatchHandler { kind: CatchKind::Ensure, begin: 2, end: 5, target: 9 };
        assert!(!h.covers(1));
        assert!(h.covers(2));
        assert!(h.covers(4));
        assert!(!h.covers(5));
    }
}
