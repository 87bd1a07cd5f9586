//! tessera-chunks: erasure coding, compression, and hashing
//!
//! # Overview
//! - `erasure`: Reed-Solomon shard sets with an 8-byte size header
//! - `compress`: zstd before encryption
//! - `blake3`: plaintext and per-shard integrity hashes

pub mod blake3;
pub mod compress;
pub mod erasure;

pub use self::blake3::{hash_bytes, hash_from_hex, hash_shards, hash_to_hex, matches_hex, Hash};
pub use compress::{compress, decompress, Compressed};
pub use erasure::{
    reconstruct_file, shard_size_for, split_file, validate_shards, ShardSet, MAX_TOTAL_SHARDS,
    SHARD_ALIGNMENT, SIZE_HEADER_LEN,
};
