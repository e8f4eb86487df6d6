//! Entity-id parsing and the id → sharding-key mapping.
//!
//! Entity ids are signed 64-bit integers. On the wire (URL segments,
//! environment variables, config values) they appear either as decimal with
//! an optional sign, or as `0x`-prefixed unsigned hexadecimal; unsigned
//! values above `i64::MAX` are reinterpreted as negatives via two's
//! complement. The sharding key of one or two ids is the first 32 bits of
//! the MD5 digest of their big-endian serialization.

use md5::{Digest, Md5};

/// Parses an entity id from its textual form.
///
/// Accepts decimal (optionally signed) and `0x`-prefixed unsigned hex.
/// Unsigned values in `(i64::MAX, u64::MAX]` map to negatives via two's
/// complement; anything that overflows `u64` is rejected.
pub fn parse_i64(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|u| u as i64);
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    s.parse::<u64>().ok().map(|u| u as i64)
}

/// Two's-complement reinterpretation of an id as unsigned.
///
/// URL id segments always carry this form, so they are non-negative decimal
/// strings even for negative ids.
pub fn to_unsigned(id: i64) -> u64 {
    id as u64
}

/// Inverse of [`to_unsigned`].
pub fn from_unsigned(u: u64) -> i64 {
    u as i64
}

/// Computes the 32-bit sharding key of one or two entity ids.
///
/// The ids are serialized as 8 bytes each, big-endian two's complement, and
/// hashed with MD5; the key is the first 4 digest bytes read big-endian.
pub fn shard_key(first: i64, second: Option<i64>) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(first.to_be_bytes());
    if let Some(second) = second {
        hasher.update(second.to_be_bytes());
    }
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Lowercase hex MD5 digest, used as the opaque config version token.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
