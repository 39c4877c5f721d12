//! Continuation-coded length integers
//!
//! Every byte but the last has bit 7 set. The groups are not byte aligned:
//!
//! ```text
//! group 0: bits 0..7  at shift 0   (written with only 6 bits, bit 6 clear)
//! group 1: bits 0..7  at shift 6
//! group k: bits 0..7  at shift 6 + 7 * (k - 1)
//! ```
//!
//! Decoding ORs the first group's 7 bits in at shift 0 while the encoder only
//! ever fills 6 of them. Both halves are kept exactly as the on-flash format
//! defines them.

use crate::error::{FlashError, Result};

const CONTINUATION: u8 = 0x80;
const GROUP_MASK: u8 = 0x7F;
const FIRST_GROUP_BITS: u32 = 6;
const GROUP_BITS: u32 = 7;

/// Longest encoding of a 32-bit length (6 + 4 * 7 >= 32)
pub const MAX_ENCODED_LEN: usize = 5;

fn shift_of(group: usize) -> u32 {
    match group {
        0 => 0,
        k => FIRST_GROUP_BITS + GROUP_BITS * (k as u32 - 1),
    }
}

/// Decode a length, pulling bytes from `next_byte` until one lacks the continuation bit
pub fn decode_with<F>(mut next_byte: F) -> Result<u32>
where
    F: FnMut() -> Result<u8>,
{
    let mut value: u64 = 0;

    for group in 0..MAX_ENCODED_LEN {
        let byte = next_byte()?;
        value |= u64::from(byte & GROUP_MASK) << shift_of(group);

        if byte & CONTINUATION == 0 {
            return u32::try_from(value).map_err(|_| FlashError::VarLenOverflow);
        }
    }

    Err(FlashError::VarLenOverflow)
}

/// Decode a length from the front of `bytes`
///
/// Returns the value and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut consumed = 0;
    let value = decode_with(|| {
        let byte = bytes.get(consumed).copied().ok_or_else(|| {
            FlashError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "length field ends early",
            ))
        })?;
        consumed += 1;
        Ok(byte)
    })?;
    Ok((value, consumed))
}

/// Append the minimal encoding of `len` to `out`
pub fn encode_into(len: u32, out: &mut Vec<u8>) {
    let mut rest = len >> FIRST_GROUP_BITS;
    let mut byte = (len & 0x3F) as u8;

    while rest != 0 {
        out.push(byte | CONTINUATION);
        byte = (rest & u32::from(GROUP_MASK)) as u8;
        rest >>= GROUP_BITS;
    }
    out.push(byte);
}

pub fn encode(len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ENCODED_LEN);
    encode_into(len, &mut out);
    out
}
