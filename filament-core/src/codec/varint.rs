//! Base-128 varints.
//!
//! Seven value bits per byte, least significant group first; the high bit of
//! each byte is set when another byte follows. A `u64` takes at most ten
//! bytes, and the tenth may only carry the single remaining bit.

use super::error::DecodeError;

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of `value` to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes [`encode_varint`] writes for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode one varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed. Never reads past
/// `data`, and rejects encodings longer than ten bytes or wider than 64
/// bits.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(DecodeError::VarintOverflow { offset: 0 });
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(DecodeError::UnexpectedEof {
        offset: data.len(),
        needed: 1,
    })
}

// ---- Tests ----
