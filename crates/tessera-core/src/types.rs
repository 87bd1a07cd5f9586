use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TesseraError;

/// Symmetric AEAD suite used for a protected file's ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    /// AES-256-GCM with a 16-byte IV
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// XChaCha20-Poly1305 with a 24-byte nonce
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
    /// Twofish in GCM mode with a 12-byte IV
    #[serde(rename = "twofish-gcm")]
    TwofishGcm,
}

impl CipherSuite {
    pub const ALL: [CipherSuite; 3] = [
        CipherSuite::Aes256Gcm,
        CipherSuite::XChaCha20Poly1305,
        CipherSuite::TwofishGcm,
    ];

    /// Canonical IV/nonce length. Checked before every decryption.
    pub fn iv_len(self) -> usize {
        match self {
            CipherSuite::Aes256Gcm => 16,
            CipherSuite::XChaCha20Poly1305 => 24,
            CipherSuite::TwofishGcm => 12,
        }
    }

    /// Suites that require a premium entitlement at the account layer.
    pub fn is_premium(self) -> bool {
        !matches!(self, CipherSuite::Aes256Gcm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CipherSuite::Aes256Gcm => "aes-256-gcm",
            CipherSuite::XChaCha20Poly1305 => "xchacha20-poly1305",
            CipherSuite::TwofishGcm => "twofish-gcm",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherSuite {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" | "aes" => Ok(CipherSuite::Aes256Gcm),
            "xchacha20-poly1305" | "xchacha20poly1305" | "xchacha" => {
                Ok(CipherSuite::XChaCha20Poly1305)
            }
            "twofish-gcm" | "twofishgcm" | "twofish" => Ok(CipherSuite::TwofishGcm),
            other => Err(TesseraError::UnsupportedCipher(other.to_string())),
        }
    }
}

/// Who custodies a key share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolderType {
    /// Wrapped under the active master key
    Server,
    /// Wrapped under a key only the user can produce
    User,
}

impl fmt::Display for HolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HolderType::Server => f.write_str("server"),
            HolderType::User => f.write_str("user"),
        }
    }
}

/// Caller-supplied account entitlement, checked before premium suites are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entitlement {
    #[default]
    Standard,
    Premium,
}

impl Entitlement {
    pub fn permits(self, suite: CipherSuite) -> bool {
        !suite.is_premium() || self == Entitlement::Premium
    }
}

/// Metadata record for one protected file.
///
/// Written last during protect (it is the commit record) and read first
/// during recover. Binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Record format version
    pub version: u32,
    pub file_id: String,
    /// Original plaintext size in bytes
    pub size: u64,
    /// Size after zstd compression
    pub compressed_size: u64,
    /// compressed_size / size (1.0 for empty input)
    pub compression_ratio: f64,
    pub encryption_type: CipherSuite,
    /// base64 IV; decoded length must equal `encryption_type.iv_len()`
    pub iv: String,
    /// base64 32-byte HKDF salt
    pub salt: String,
    /// BLAKE3 of the original plaintext (hex)
    pub file_hash: String,
    pub share_count: u8,
    pub threshold: u8,
    /// Shares with holder type `user`
    #[serde(default)]
    pub user_held_shares: u8,
    pub data_shard_count: usize,
    pub parity_shard_count: usize,
    /// Length of every shard in the set
    pub shard_size: usize,
    /// BLAKE3 hash (hex) of each shard, by shard index
    #[serde(default)]
    pub shard_hashes: Vec<String>,
    /// Master key that wrapped the server-held shares
    pub server_key_id: String,
    pub master_key_version: u32,
    /// Unix epoch seconds
    pub created_at: u64,
}

impl FileMetadata {
    pub fn total_shards(&self) -> usize {
        self.data_shard_count + self.parity_shard_count
    }
}

/// File ids become object path segments: non-empty, at most 128 chars of
/// `[A-Za-z0-9_-]`.
pub fn check_file_id(file_id: &str) -> Result<(), TesseraError> {
    let valid = !file_id.is_empty()
        && file_id.len() <= 128
        && file_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(TesseraError::validation(format!("invalid file id {file_id:?}")))
    }
}
