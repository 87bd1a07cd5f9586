//! Reed-Solomon erasure coding of ciphertext into equal-length shards
//!
//! Layout of the logical data stream before encoding:
//! ```text
//! [8 bytes: ciphertext length, little-endian][ciphertext][zero padding]
//! ```
//! The stream is cut into `data_shards` pieces of `shard_size` bytes, where
//! `shard_size` is `ceil((8 + len) / data_shards)` rounded up to
//! [`SHARD_ALIGNMENT`]. Systematic RS over GF(2^8) then appends
//! `parity_shards` parity pieces of the same length. Any `data_shards` of the
//! `data_shards + parity_shards` pieces reconstruct the ciphertext.

use reed_solomon_erasure::galois_8::ReedSolomon;

use tessera_core::{TesseraError, TesseraResult};

/// Length of the original-size header at the start of the first data shard
pub const SIZE_HEADER_LEN: usize = 8;

/// Per-shard length granularity in bytes
pub const SHARD_ALIGNMENT: usize = 64;

/// Upper bound on data + parity shards for GF(2^8)
pub const MAX_TOTAL_SHARDS: usize = 256;

/// A complete erasure-coded shard set, indexed by shard number.
///
/// Indices `0..data_shards` are data, the rest parity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    pub shards: Vec<Vec<u8>>,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub shard_size: usize,
}

impl ShardSet {
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Shard slots as `Some`, ready to be knocked out and reconstructed
    pub fn into_slots(self) -> Vec<Option<Vec<u8>>> {
        self.shards.into_iter().map(Some).collect()
    }
}

fn codec(data_shards: usize, parity_shards: usize) -> TesseraResult<ReedSolomon> {
    if data_shards == 0 || parity_shards == 0 {
        return Err(TesseraError::validation(format!(
            "data_shards ({data_shards}) and parity_shards ({parity_shards}) must both be >= 1"
        )));
    }
    if data_shards + parity_shards > MAX_TOTAL_SHARDS {
        return Err(TesseraError::validation(format!(
            "data_shards + parity_shards must be <= {MAX_TOTAL_SHARDS}, got {}",
            data_shards + parity_shards
        )));
    }
    ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| TesseraError::validation(format!("reed-solomon setup failed: {e:?}")))
}

/// Per-shard length for a ciphertext of `ciphertext_len` bytes.
pub fn shard_size_for(ciphertext_len: usize, data_shards: usize) -> usize {
    let total = SIZE_HEADER_LEN + ciphertext_len;
    let per_shard = total.div_ceil(data_shards.max(1));
    per_shard.div_ceil(SHARD_ALIGNMENT).max(1) * SHARD_ALIGNMENT
}

/// Encode `ciphertext` into `data_shards + parity_shards` equal-length shards.
pub fn split_file(
    ciphertext: &[u8],
    data_shards: usize,
    parity_shards: usize,
) -> TesseraResult<ShardSet> {
    let rs = codec(data_shards, parity_shards)?;
    let shard_size = shard_size_for(ciphertext.len(), data_shards);

    let mut stream = Vec::with_capacity(shard_size * data_shards);
    stream.extend_from_slice(&(ciphertext.len() as u64).to_le_bytes());
    stream.extend_from_slice(ciphertext);
    stream.resize(shard_size * data_shards, 0);

    let mut shards: Vec<Vec<u8>> = stream
        .chunks_exact(shard_size)
        .map(<[u8]>::to_vec)
        .collect();
    shards.resize(data_shards + parity_shards, vec![0u8; shard_size]);

    rs.encode(&mut shards)
        .map_err(|e| TesseraError::Other(anyhow::anyhow!("reed-solomon encode failed: {e:?}")))?;

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        data_shards,
        parity_shards,
        shard_size,
        "erasure-coded"
    );

    Ok(ShardSet {
        shards,
        data_shards,
        parity_shards,
        shard_size,
    })
}

/// Common length of the present shards, or `CorruptShard` if they disagree.
fn present_shard_len(shards: &[Option<Vec<u8>>]) -> TesseraResult<Option<usize>> {
    let mut len = None;
    for (index, shard) in shards.iter().enumerate() {
        let Some(shard) = shard else { continue };
        match len {
            None => len = Some(shard.len()),
            Some(expected) if expected != shard.len() => {
                return Err(TesseraError::CorruptShard(format!(
                    "shard {index} is {} bytes, expected {expected}",
                    shard.len()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(len)
}

/// Pre-flight check: at least `data_shards` present shards, all the same
/// non-zero length.
pub fn validate_shards(shards: &[Option<Vec<u8>>], data_shards: usize) -> bool {
    let present = shards.iter().filter(|s| s.is_some()).count();
    if data_shards == 0 || present < data_shards {
        return false;
    }
    matches!(present_shard_len(shards), Ok(Some(len)) if len > 0)
}

/// Rebuild the ciphertext from a shard set with `None` for missing shards.
pub fn reconstruct_file(
    mut shards: Vec<Option<Vec<u8>>>,
    data_shards: usize,
    parity_shards: usize,
) -> TesseraResult<Vec<u8>> {
    let rs = codec(data_shards, parity_shards)?;

    if shards.len() != data_shards + parity_shards {
        return Err(TesseraError::validation(format!(
            "expected {} shard slots, got {}",
            data_shards + parity_shards,
            shards.len()
        )));
    }

    let shard_len = present_shard_len(&shards)?;
    let present = shards.iter().filter(|s| s.is_some()).count();
    if present < data_shards {
        return Err(TesseraError::InsufficientShards {
            have: present,
            need: data_shards,
        });
    }
    let shard_len = shard_len.unwrap_or(0);
    if shard_len == 0 {
        return Err(TesseraError::CorruptShard("shards are empty".into()));
    }
    if shard_len * data_shards < SIZE_HEADER_LEN {
        return Err(TesseraError::CorruptShard(format!(
            "{data_shards} shards of {shard_len} bytes cannot hold the size header"
        )));
    }

    if present < shards.len() {
        rs.reconstruct_data(&mut shards).map_err(|e| {
            TesseraError::CorruptShard(format!("reed-solomon reconstruction failed: {e:?}"))
        })?;
    }

    let mut stream = Vec::with_capacity(shard_len * data_shards);
    for (index, shard) in shards.into_iter().take(data_shards).enumerate() {
        let shard = shard.ok_or_else(|| {
            TesseraError::CorruptShard(format!("data shard {index} missing after reconstruction"))
        })?;
        stream.extend_from_slice(&shard);
    }

    let mut header = [0u8; SIZE_HEADER_LEN];
    header.copy_from_slice(&stream[..SIZE_HEADER_LEN]);
    let declared = u64::from_le_bytes(header);
    let available = (stream.len() - SIZE_HEADER_LEN) as u64;
    if declared > available {
        return Err(TesseraError::ShortData {
            declared,
            available,
        });
    }

    stream.drain(..SIZE_HEADER_LEN);
    stream.truncate(declared as usize);
    Ok(stream)
}
