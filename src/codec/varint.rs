//! VarInt encoding (LEB128) for lengths, counts and integers.
//!
//! Variable-length encoding where small values use fewer bytes:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - etc.
//!
//! Signed integers are zig-zag mapped first so that small negative
//! numbers stay short.

#![allow(missing_docs)]

use bytes::BufMut;

use crate::error::{Result, RpcError};

/// Write a variable-length integer
pub fn write_varint<B: BufMut>(buf: &mut B, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80; // continuation
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Write a signed integer as a zig-zag varint
pub fn write_signed<B: BufMut>(buf: &mut B, value: i64) {
    write_varint(buf, zigzag_encode(value));
}

/// Read a variable-length integer from a byte slice, returning (value, bytes_consumed)
pub fn read_varint_slice(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut pos = 0;

    loop {
        let Some(&byte) = data.get(pos) else {
            return Err(RpcError::Marshalling(
                "VarInt: unexpected end of data".to_string(),
            ));
        };
        pos += 1;

        result |= u64::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(RpcError::Marshalling("VarInt overflow".to_string()));
        }
    }

    Ok((result, pos))
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Calculate the number of bytes needed to encode a value as VarInt
pub fn varint_size(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros() as usize;
    (bits + 6) / 7
}
