//! Order-preserving key encoding.
//!
//! Each key is prefixed with a type tag, so keys of different types have a
//! stable cross-type order. Within a type, the encoding is chosen so that
//! lexicographic comparison of the encoded bytes matches the logical order
//! of the values.

use crate::encoding::Key;
use crate::error::{Error, Result};

// Type prefixes. Order matters: these determine cross-type ordering.
const TYPE_BOOLEAN: u8 = 0x01;
const TYPE_INTEGER: u8 = 0x02;
const TYPE_FLOAT: u8 = 0x03;
const TYPE_STRING: u8 = 0x04;
const TYPE_BYTES: u8 = 0x05;

fn check_prefix(bytes: &[u8], expected: u8, kind: &str) -> Result<()> {
    match bytes.first() {
        Some(&tag) if tag == expected => Ok(()),
        Some(&tag) => Err(Error::Corrupted(format!(
            "expected {kind} key prefix, got tag {tag:#04x}"
        ))),
        None => Err(Error::Corrupted(format!("truncated {kind} key"))),
    }
}

/// Encode a boolean: false sorts before true.
pub fn encode_boolean(b: bool) -> Vec<u8> {
    vec![TYPE_BOOLEAN, b as u8]
}

pub fn decode_boolean(bytes: &[u8]) -> Result<bool> {
    check_prefix(bytes, TYPE_BOOLEAN, "boolean")?;
    match bytes.get(1) {
        Some(0x00) if bytes.len() == 2 => Ok(false),
        Some(0x01) if bytes.len() == 2 => Ok(true),
        _ => Err(Error::Corrupted("invalid boolean key".to_string())),
    }
}

/// Encode an integer, flipping the sign bit so negatives sort first.
pub fn encode_integer(i: i64) -> Vec<u8> {
    let unsigned = (i as u64) ^ (1u64 << 63);
    let mut result = vec![TYPE_INTEGER];
    result.extend_from_slice(&unsigned.to_be_bytes());
    result
}

pub fn decode_integer(bytes: &[u8]) -> Result<i64> {
    check_prefix(bytes, TYPE_INTEGER, "integer")?;
    if bytes.len() != 9 {
        return Err(Error::Corrupted("integer key must be 9 bytes".to_string()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[1..9]);
    Ok((u64::from_be_bytes(buf) ^ (1u64 << 63)) as i64)
}

/// Encode a float per IEEE 754 total order: negatives have all bits flipped,
/// positives only the sign bit.
pub fn encode_float(f: f64) -> Vec<u8> {
    let bits = f.to_bits();
    let ordered_bits = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    let mut result = vec![TYPE_FLOAT];
    result.extend_from_slice(&ordered_bits.to_be_bytes());
    result
}

pub fn decode_float(bytes: &[u8]) -> Result<f64> {
    check_prefix(bytes, TYPE_FLOAT, "float")?;
    if bytes.len() != 9 {
        return Err(Error::Corrupted("float key must be 9 bytes".to_string()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[1..9]);
    let ordered_bits = u64::from_be_bytes(buf);
    let original_bits = if ordered_bits & (1u64 << 63) != 0 {
        ordered_bits & !(1u64 << 63)
    } else {
        !ordered_bits
    };
    Ok(f64::from_bits(original_bits))
}

/// Encode a string. UTF-8 already sorts correctly byte-wise.
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut result = vec![TYPE_STRING];
    result.extend_from_slice(s.as_bytes());
    result
}

pub fn decode_string(bytes: &[u8]) -> Result<String> {
    check_prefix(bytes, TYPE_STRING, "string")?;
    let s = std::str::from_utf8(&bytes[1..])
        .map_err(|_| Error::Corrupted("string key is not valid UTF-8".to_string()))?;
    Ok(s.to_string())
}

/// Encode raw bytes.
pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut result = vec![TYPE_BYTES];
    result.extend_from_slice(bytes);
    result
}

pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    check_prefix(bytes, TYPE_BYTES, "bytes")?;
    Ok(bytes[1..].to_vec())
}

impl Key for bool {
    fn encode(&self) -> Vec<u8> {
        encode_boolean(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_boolean(bytes)
    }
}

impl Key for i64 {
    fn encode(&self) -> Vec<u8> {
        encode_integer(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_integer(bytes)
    }
}

impl Key for u64 {
    fn encode(&self) -> Vec<u8> {
        let mut result = vec![TYPE_INTEGER];
        result.extend_from_slice(&(self ^ (1u64 << 63)).to_be_bytes());
        result
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        check_prefix(bytes, TYPE_INTEGER, "integer")?;
        if bytes.len() != 9 {
            return Err(Error::Corrupted("integer key must be 9 bytes".to_string()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[1..9]);
        Ok(u64::from_be_bytes(buf) ^ (1u64 << 63))
    }
}

impl Key for f64 {
    fn encode(&self) -> Vec<u8> {
        encode_float(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_float(bytes)
    }
}

impl Key for String {
    fn encode(&self) -> Vec<u8> {
        encode_string(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_string(bytes)
    }
}

impl Key for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        encode_bytes(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_bytes(bytes)
    }
}
