//! Bitfield helpers for CSR fields, TLB entries and instruction words.

/// Mask with `len` low bits set. `len` may be 64.
#[inline]
pub const fn mask64(len: u32) -> u64 {
    if len >= 64 { u64::MAX } else { (1u64 << len) - 1 }
}

/// Extract `len` bits starting at `shift`.
#[inline]
pub const fn extract64(value: u64, shift: u32, len: u32) -> u64 {
    (value >> shift) & mask64(len)
}

/// Extract `len` bits starting at `shift` and sign-extend the result.
#[inline]
pub const fn sextract64(value: u64, shift: u32, len: u32) -> i64 {
    ((value << (64 - shift - len)) as i64) >> (64 - len)
}

/// Replace `len` bits starting at `shift` with the low bits of `field`.
#[inline]
pub const fn deposit64(value: u64, shift: u32, len: u32, field: u64) -> u64 {
    let mask = mask64(len) << shift;
    (value & !mask) | ((field << shift) & mask)
}

#[inline]
pub const fn extract32(value: u32, shift: u32, len: u32) -> u32 {
    extract64(value as u64, shift, len) as u32
}

/// Sign-extend the low `bits` bits of `value`.
#[inline]
pub const fn sext(value: u64, bits: u32) -> i64 {
    sextract64(value, 0, bits)
}
