//! Fixed-width integer access for the big-endian RITE wire format.
//!
//! On hosts that tolerate misaligned loads the readers perform one unaligned
//! load followed by [`u32::from_be`], which is a byte swap on little-endian
//! targets and the identity on big-endian ones. With the `require-alignment`
//! feature the readers assemble the value one byte at a time instead.
//!
//! All readers index the slice, so a short slice panics rather than reading
//! out of bounds. The loader checks lengths before calling them.

/// Read a big-endian `u16` from the first two bytes of `bytes`.
#[cfg(not(feature = "require-alignment"))]
#[inline(always)]
pub fn read_u16(bytes: &[u8]) -> u16 {
    let head = &bytes[..2];
    // SAFETY: `head` is exactly two readable bytes and `read_unaligned` has
    // no alignment requirement.
    let raw = unsafe { head.as_ptr().cast::<u16>().read_unaligned() };
    u16::from_be(raw)
}

/// Read a big-endian `u32` from the first four bytes of `bytes`.
#[cfg(not(feature = "require-alignment"))]
#[inline(always)]
pub fn read_u32(bytes: &[u8]) -> u32 {
    let head = &bytes[..4];
    // SAFETY: `head` is exactly four readable bytes.
    let raw = unsafe { head.as_ptr().cast::<u32>().read_unaligned() };
    u32::from_be(raw)
}

#[cfg(feature = "require-alignment")]
#[inline(always)]
pub fn read_u16(bytes: &[u8]) -> u16 {
    let p = &bytes[..2];
    (p[0] as u16) << 8 | p[1] as u16
}

#[cfg(feature = "require-alignment")]
#[inline(always)]
pub fn read_u32(bytes: &[u8]) -> u32 {
    let p = &bytes[..4];
    let mut x = p[0] as u32;
    x = x << 8 | p[1] as u32;
    x = x << 8 | p[2] as u32;
    x << 8 | p[3] as u32
}

/// Read a big-endian 24-bit value (the `W` operand encoding).
#[inline(always)]
pub fn read_u24(bytes: &[u8]) -> u32 {
    let p = &bytes[..3];
    (p[0] as u32) << 16 | (p[1] as u32) << 8 | p[2] as u32
}

#[inline(always)]
pub fn read_i16(bytes: &[u8]) -> i16 {
    read_u16(bytes) as i16
}

/// Read a big-endian `u64` stored as two consecutive `u32` words.
#[inline(always)]
pub fn read_u64(bytes: &[u8]) -> u64 {
    (read_u32(bytes) as u64) << 32 | read_u32(&bytes[4..]) as u64
}

/// Read an IEEE-754 double. Float pool entries are the one field of the
/// image that is stored little-endian.
#[inline(always)]
pub fn read_f64_le(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(raw)
}

/// Write `v` big-endian into the first two bytes of `bytes`.
#[inline(always)]
pub fn write_u16(v: u16, bytes: &mut [u8]) {
    let p = &mut bytes[..2];
    p[0] = (v >> 8) as u8;
    p[1] = v as u8;
}

/// Write `v` big-endian into the first four bytes of `bytes`.
#[inline(always)]
pub fn write_u32(v: u32, bytes: &mut [u8]) {
    let p = &mut bytes[..4];
    p[0] = (v >> 24) as u8;
    p[1] = (v >> 16) as u8;
    p[2] = (v >> 8) as u8;
    p[3] = v as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        assert_eq!(read_u16(&[0x12, 0x34]), 0x1234);
        assert_eq!(read_u32(&[0xDE, 0xAD, 0xBE, 0xEF]), 0xDEAD_BEEF);
        assert_eq!(read_u24(&[0x01, 0x02, 0x03]), 0x010203);
        assert_eq!(read_i16(&[0xFF, 0xFE]), -2);
    }

    #[test]
    fn reads_misaligned_slices() {
        let buf = [0u8, 0x00, 0x00, 0x01, 0x00, 0x7F];
        assert_eq!(read_u32(&buf[1..]), 0x0000_0100);
        assert_eq!(read_u16(&buf[3..]), 0x0100);
        assert_eq!(read_u16(&buf[4..]), 0x007F);
    }

    #[test]
    fn u32_round_trip() {
        let mut buf = [0u8; 4];
        for x in [0u32, 1, 0x80, 0xFFFF_FFFF, 0x0102_0304, 0xDEAD_BEEF] {
            write_u32(x, &mut buf);
            assert_eq!(read_u32(&buf), x);
        }
        write_u32(0x0102_0304, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn u16_round_trip() {
        let mut buf = [0u8; 2];
        for x in [0u16, 1, 0xFF, 0x100, 0xFFFF, 0xBEEF] {
            write_u16(x, &mut buf);
            assert_eq!(read_u16(&buf), x);
        }
        write_u16(0xABCD, &mut buf);
        assert_eq!(buf, [0xAB, 0xCD]);
    }

    #[test]
    fn u64_and_float() {
        let bytes = [0, 0, 0, 1, 0, 0, 0, 2];
        assert_eq!(read_u64(&bytes), (1u64 << 32) | 2);
        assert_eq!(read_f64_le(&1.5f64.to_le_bytes()), 1.5);
    }

    #[test]
    #[should_panic]
    fn short_slice_panics() {
        read_u32(&[1, 2, 3]);
    }
}
