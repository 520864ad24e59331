//! QUIC variable-length integers (RFC 9000 Section 16).
//!
//! The two most significant bits of the first byte encode the length:
//!
//! ```text
//! 00 -> 1 byte,  6-bit value
//! 01 -> 2 bytes, 14-bit value
//! 10 -> 4 bytes, 30-bit value
//! 11 -> 8 bytes, 62-bit value
//! ```

use bytes::BufMut;

/// Largest value representable as a varint.
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Decode a variable-length integer.
///
/// Returns `(value, bytes_consumed)`, or `None` if `data` is truncated.
#[must_use]
pub fn decode(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return None;
    }

    let mut value = u64::from(first & 0x3f);
    for &byte in &data[1..len] {
        value = (value << 8) | u64::from(byte);
    }
    Some((value, len))
}

/// Number of bytes needed to encode `value`.
///
/// # Panics
///
/// Panics if `value` exceeds [`MAX_VARINT`].
#[must_use]
pub const fn encoded_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else if value <= MAX_VARINT {
        8
    } else {
        panic!("varint out of range")
    }
}

/// Append `value` in its shortest encoding.
pub fn encode<B: BufMut>(value: u64, buf: &mut B) {
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        #[allow(clippy::cast_possible_truncation)]
        2 => buf.put_u16(0x4000 | value as u16),
        #[allow(clippy::cast_possible_truncation)]
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

/// Append `value` using exactly two bytes.
///
/// Used for the Length field of long-header packets, which is written
/// before the final payload size is known.
///
/// # Panics
///
/// Panics if `value` does not fit in 14 bits.
pub fn encode_u14<B: BufMut>(value: usize, buf: &mut B) {
    assert!(value < (1 << 14), "length {value} does not fit a 2-byte varint");
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(0x4000 | value as u16);
}
