//! Key types and share wrapping
//!
//! - `DataKey`: per-file random key, only ever held in memory
//! - `WrappingKey`: a master key or a user key, used to wrap key shares
//!
//! Wrapped share format:
//! ```text
//! nonce: 12 random bytes (stored next to the ciphertext)
//! ciphertext: AES-256-GCM(secret) = 32 bytes + 16-byte tag
//! AAD = "tessera-share" || index (1 byte) || holder (1 byte) || context
//! ```
//! The context is the file id, so a wrapped share cannot be replayed
//! under another file or index.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use tessera_core::{HolderType, TesseraError, TesseraResult, KEY_SIZE};

use crate::shamir::KeyShare;
use crate::{TAG_SIZE, WRAP_NONCE_SIZE};

/// A per-file 256-bit data key. Zeroized on drop.
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit data key.
pub fn generate_data_key() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// A 256-bit key that wraps other keys. Zeroized on drop.
#[derive(Clone)]
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Fresh random 96-bit nonce for a wrapping operation.
pub fn generate_wrap_nonce() -> [u8; WRAP_NONCE_SIZE] {
    let mut nonce = [0u8; WRAP_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Seal a 32-byte secret under `key` with AES-256-GCM.
///
/// Returns `ciphertext || tag` (48 bytes).
pub fn seal_secret(
    key: &WrappingKey,
    nonce: &[u8; WRAP_NONCE_SIZE],
    secret: &[u8],
    aad: &[u8],
) -> TesseraResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: secret,
                aad,
            },
        )
        .map_err(|e| TesseraError::Other(anyhow::anyhow!("key sealing failed: {e}")))
}

/// Open a secret sealed by [`seal_secret`]. Fails `AuthenticationFailed`
/// on a wrong key, tampered ciphertext, or mismatched AAD.
pub fn open_secret(
    key: &WrappingKey,
    nonce: &[u8; WRAP_NONCE_SIZE],
    sealed: &[u8],
    aad: &[u8],
) -> TesseraResult<Zeroizing<[u8; KEY_SIZE]>> {
    if sealed.len() != KEY_SIZE + TAG_SIZE {
        return Err(TesseraError::InvalidShare(format!(
            "sealed key is {} bytes (expected {})",
            sealed.len(),
            KEY_SIZE + TAG_SIZE
        )));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| TesseraError::AuthenticationFailed)?;

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    out.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(out)
}

/// A key share's secret encrypted under a master key or a user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedShare {
    pub index: u8,
    pub holder: HolderType,
    pub nonce: [u8; WRAP_NONCE_SIZE],
    /// `ciphertext || tag`
    pub ciphertext: Vec<u8>,
}

fn share_aad(index: u8, holder: HolderType, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(13 + 2 + context.len());
    aad.extend_from_slice(b"tessera-share");
    aad.push(index);
    aad.push(match holder {
        HolderType::Server => 0,
        HolderType::User => 1,
    });
    aad.extend_from_slice(context);
    aad
}

/// Wrap a share under `key` with a fresh nonce. `context` is usually the file id.
pub fn wrap_share(key: &WrappingKey, share: &KeyShare, context: &[u8]) -> TesseraResult<WrappedShare> {
    if share.secret.len() != KEY_SIZE {
        return Err(TesseraError::InvalidShare(format!(
            "share {} has {} secret bytes (expected {KEY_SIZE})",
            share.index,
            share.secret.len()
        )));
    }
    let nonce = generate_wrap_nonce();
    let aad = share_aad(share.index, share.holder, context);
    let ciphertext = seal_secret(key, &nonce, &share.secret, &aad)?;
    Ok(WrappedShare {
        index: share.index,
        holder: share.holder,
        nonce,
        ciphertext,
    })
}

/// Unwrap a share wrapped by [`wrap_share`] with the same `context`.
pub fn unwrap_share(
    key: &WrappingKey,
    wrapped: &WrappedShare,
    context: &[u8],
) -> TesseraResult<KeyShare> {
    let aad = share_aad(wrapped.index, wrapped.holder, context);
    let secret = open_secret(key, &wrapped.nonce, &wrapped.ciphertext, &aad)?;
    Ok(KeyShare::new(wrapped.index, secret.to_vec(), wrapped.holder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shamir::split;

    fn test_share(holder: HolderType) -> KeyShare {
        let mut share = split(&[7u8; KEY_SIZE], 3, 2).unwrap().remove(1);
        share.holder = holder;
        share
    }

    #[test]
    fn test_data_key_generation() {
        let k1 = generate_data_key();
        let k2 = generate_data_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let key = WrappingKey::from_bytes([42u8; KEY_SIZE]);
        let share = test_share(HolderType::Server);

        let wrapped = wrap_share(&key, &share, b"file-1").unwrap();
        assert_eq!(wrapped.nonce.len(), 12);
        assert_eq!(wrapped.ciphertext.len(), KEY_SIZE + TAG_SIZE);

        let back = unwrap_share(&key, &wrapped, b"file-1").unwrap();
        assert_eq!(back.index, share.index);
        assert_eq!(back.secret, share.secret);
        assert_eq!(back.holder, HolderType::Server);
    }

    #[test]
    fn test_unwrap_wrong_key() {
        let share = test_share(HolderType::User);
        let wrapped = wrap_share(&WrappingKey::from_bytes([1u8; KEY_SIZE]), &share, b"f").unwrap();
        let result = unwrap_share(&WrappingKey::from_bytes([2u8; KEY_SIZE]), &wrapped, b"f");
        assert!(matches!(result, Err(TesseraError::AuthenticationFailed)));
    }

    #[test]
    fn test_unwrap_under_other_file_fails() {
        let key = WrappingKey::generate();
        let wrapped = wrap_share(&key, &test_share(HolderType::Server), b"file-a").unwrap();
        assert!(matches!(
            unwrap_share(&key, &wrapped, b"file-b"),
            Err(TesseraError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_relabelled_holder_fails() {
        let key = WrappingKey::generate();
        let mut wrapped = wrap_share(&key, &test_share(HolderType::User), b"f").unwrap();
        wrapped.holder = HolderType::Server;
        assert!(unwrap_share(&key, &wrapped, b"f").is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = WrappingKey::generate();
        let share = test_share(HolderType::Server);
        let a = wrap_share(&key, &share, b"f").unwrap();
        let b = wrap_share(&key, &share, b"f").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_truncated_sealed_key_rejected() {
        let key = WrappingKey::generate();
        let mut wrapped = wrap_share(&key, &test_share(HolderType::Server), b"f").unwrap();
        wrapped.ciphertext.truncate(40);
        assert!(matches!(
            unwrap_share(&key, &wrapped, b"f"),
            Err(TesseraError::InvalidShare(_))
        ));
    }
}
