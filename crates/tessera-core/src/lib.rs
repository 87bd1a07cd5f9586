pub mod b64;
pub mod config;
pub mod error;
pub mod types;

pub use error::{TesseraError, TesseraResult};
pub use types::{check_file_id, CipherSuite, Entitlement, FileMetadata, HolderType};

/// Size of every symmetric key handled by tessera (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the per-file HKDF salt
pub const SALT_SIZE: usize = 32;
