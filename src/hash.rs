//! Key hashing primitives.
//!
//! Keys can be hashed with MD5 (default), FNV1-32, FNV1a-32, or CRC-32.
//! The ketama continuum always uses MD5 regardless of the key hash, matching
//! libmemcached's `KETAMA_HASH` behavior.

use md5::{Digest, Md5};
use serde::Deserialize;

const FNV_32_INIT: u32 = 2_166_136_261;
const FNV_32_PRIME: u32 = 16_777_619;

/// Hash function used to place keys on the continuum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    #[default]
    Md5,
    #[serde(rename = "fnv1_32")]
    Fnv1,
    #[serde(rename = "fnv1a_32")]
    Fnv1a,
    #[serde(rename = "crc_32")]
    Crc32,
}

impl HashFunction {
    /// Hash `key` to a 32-bit continuum position.
    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            HashFunction::Md5 => hash_md5(key),
            HashFunction::Fnv1 => hash_fnv1_32(key),
            HashFunction::Fnv1a => hash_fnv1a_32(key),
            HashFunction::Crc32 => hash_crc_32(key),
        }
    }
}

/// First four bytes of the MD5 digest, little-endian.
pub fn hash_md5(key: &[u8]) -> u32 {
    let digest = Md5::digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub fn hash_fnv1_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_INIT;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= u32::from(byte);
    }
    hash
}

pub fn hash_fnv1a_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_INIT;
    for &byte in key {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}

pub fn hash_crc_32(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}
