//! tessera-crypto: per-file encryption and key custody for tessera
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, versioned, sealed at rest by tessera-secrets)
//!   └── wraps server-held KeyShares (AES-256-GCM, 96-bit random nonce)
//! User Key (256-bit, Argon2id from passphrase + user id)
//!   └── wraps user-held KeyShares
//! DataKey (per-file, 256-bit random, never persisted)
//!   ├── split into n KeyShares, any k recombine (GF(256) threshold sharing)
//!   └── HKDF(salt) → AEAD key: AES-256-GCM | XChaCha20-Poly1305 | Twofish-GCM
//! ```

pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod shamir;

pub use cipher::{decrypt, encrypt, validate_params, EncryptedPayload};
pub use kdf::{derive_key, derive_user_key, KdfParams, KDF_SALT_SIZE};
pub use keys::{
    generate_data_key, generate_wrap_nonce, open_secret, seal_secret, unwrap_share, wrap_share,
    DataKey, WrappedShare, WrappingKey,
};
pub use shamir::{recombine, split, KeyShare};

/// Size of a share-wrapping nonce (96-bit)
pub const WRAP_NONCE_SIZE: usize = 12;

/// Size of every AEAD authentication tag used here
pub const TAG_SIZE: usize = 16;
