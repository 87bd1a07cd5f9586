//! BLAKE3 hashing of plaintext and shards
//!
//! The plaintext hash is the file's integrity check on recover. Shard hashes
//! let retrieval turn a bit-rotted shard into a missing one before
//! reconstruction.

use rayon::prelude::*;

use tessera_core::{TesseraError, TesseraResult};

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> TesseraResult<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| TesseraError::validation(format!("invalid BLAKE3 hex '{hex}': {e}")))
}

/// Hex hashes of every shard, in shard order. Shards are hashed in parallel.
pub fn hash_shards(shards: &[Vec<u8>]) -> Vec<String> {
    shards
        .par_iter()
        .map(|shard| hash_to_hex(&hash_bytes(shard)))
        .collect()
}

/// True if `data` hashes to `expected_hex`. Malformed hex never matches.
pub fn matches_hex(data: &[u8], expected_hex: &str) -> bool {
    match hash_from_hex(expected_hex) {
        // blake3::Hash equality is constant-time
        Ok(expected) => hash_bytes(data) == expected,
        Err(_) => false,
    }
}
