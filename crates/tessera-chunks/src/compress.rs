//! zstd compression of plaintext before encryption

use tessera_core::{TesseraError, TesseraResult};

/// Default zstd level
pub const DEFAULT_LEVEL: i32 = 3;

/// Result of compressing one file
#[derive(Debug)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub original_size: u64,
}

impl Compressed {
    pub fn compressed_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// compressed / original; 1.0 for empty input
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.bytes.len() as f64 / self.original_size as f64
        }
    }
}

/// Compress `data` as a single zstd frame.
pub fn compress(data: &[u8], level: i32) -> TesseraResult<Compressed> {
    if !zstd::compression_level_range().contains(&level) {
        return Err(TesseraError::validation(format!(
            "zstd level {level} outside {:?}",
            zstd::compression_level_range()
        )));
    }
    let bytes = zstd::encode_all(data, level)?;
    Ok(Compressed {
        bytes,
        original_size: data.len() as u64,
    })
}

/// Decompress a zstd frame produced by [`compress`].
pub fn decompress(data: &[u8]) -> TesseraResult<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| TesseraError::IntegrityMismatch(format!("zstd decompress failed: {e}")))
}
