//! Key derivation: Argon2id passphrase → wrapping key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};

use tessera_core::{TesseraError, TesseraResult, KEY_SIZE};

use crate::keys::WrappingKey;

/// Length of an Argon2id salt
pub const KDF_SALT_SIZE: usize = 16;

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&tessera_core::config::SecretsConfig> for KdfParams {
    fn from(cfg: &tessera_core::config::SecretsConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Derive a 256-bit wrapping key from a passphrase and salt using Argon2id.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8; KDF_SALT_SIZE],
    params: &KdfParams,
) -> TesseraResult<WrappingKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| TesseraError::validation(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| TesseraError::Other(anyhow::anyhow!("Argon2id KDF failed: {e}")))?;

    Ok(WrappingKey::from_bytes(key))
}

/// Derive the key that wraps a user's key shares.
///
/// The salt is fixed per user id (BLAKE3 key derivation under a tessera
/// context string), so the same passphrase always yields the same key for
/// the same user without storing anything.
pub fn derive_user_key(
    passphrase: &SecretString,
    user_id: &str,
    params: &KdfParams,
) -> TesseraResult<WrappingKey> {
    if user_id.is_empty() {
        return Err(TesseraError::validation("user id must not be empty"));
    }
    let material = blake3::derive_key("tessera 2026 user share wrapping salt", user_id.as_bytes());
    let mut salt = [0u8; KDF_SALT_SIZE];
    salt.copy_from_slice(&material[..KDF_SALT_SIZE]);
    derive_key(passphrase, &salt, params)
}
