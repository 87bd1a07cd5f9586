//! Per-file authenticated encryption under a selectable suite
//!
//! ```text
//! DataKey (32 random bytes, split into key shares)
//!   └── HKDF-SHA256(salt, info = "tessera-cipher-key:" || suite) → AEAD key
//!         └── AEAD(iv, plaintext, AAD = suite label) → ciphertext || tag
//! ```
//!
//! | Suite              | IV  | Tag |
//! |--------------------|-----|-----|
//! | AES-256-GCM        | 16  | 16  |
//! | XChaCha20-Poly1305 | 24  | 16  |
//! | Twofish-GCM        | 12  | 16  |

use aes_gcm::{
    aead::{
        consts::{U12, U16},
        Aead, KeyInit, Payload,
    },
    aes::Aes256,
    AesGcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use twofish::Twofish;
use zeroize::Zeroizing;

use tessera_core::{CipherSuite, TesseraError, TesseraResult, KEY_SIZE, SALT_SIZE};

use crate::keys::{generate_data_key, DataKey};
use crate::shamir::{self, KeyShare};

/// AES-256-GCM with the 16-byte IV stored in file metadata
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Twofish block cipher in GCM mode, 96-bit IV
type TwofishGcm = AesGcm<Twofish, U12>;

/// Output of [`encrypt`]: everything needed to store and later decrypt a file.
pub struct EncryptedPayload {
    /// `ciphertext || tag`
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub salt: [u8; SALT_SIZE],
    pub shares: Vec<KeyShare>,
    pub suite: CipherSuite,
}

impl std::fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .field("shares", &self.shares.len())
            .field("suite", &self.suite)
            .finish()
    }
}

/// Check the declared IV and salt against the suite before any decryption.
pub fn validate_params(suite: CipherSuite, iv: &[u8], salt: &[u8]) -> TesseraResult<()> {
    if iv.len() != suite.iv_len() {
        return Err(TesseraError::validation(format!(
            "{suite} requires a {}-byte IV, got {}",
            suite.iv_len(),
            iv.len()
        )));
    }
    if salt.len() != SALT_SIZE {
        return Err(TesseraError::validation(format!(
            "salt must be {SALT_SIZE} bytes, got {}",
            salt.len()
        )));
    }
    Ok(())
}

fn derive_cipher_key(
    data_key: &[u8; KEY_SIZE],
    salt: &[u8],
    suite: CipherSuite,
) -> TesseraResult<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), data_key);
    let mut info = Vec::with_capacity(32);
    info.extend_from_slice(b"tessera-cipher-key:");
    info.extend_from_slice(suite.as_str().as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&info, &mut okm[..])
        .map_err(|e| TesseraError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

fn seal(suite: CipherSuite, key: &[u8; KEY_SIZE], iv: &[u8], plaintext: &[u8]) -> TesseraResult<Vec<u8>> {
    let payload = Payload {
        msg: plaintext,
        aad: suite.as_str().as_bytes(),
    };
    let result = match suite {
        CipherSuite::Aes256Gcm => {
            Aes256Gcm16::new(key.into()).encrypt(Nonce::<U16>::from_slice(iv), payload)
        }
        CipherSuite::XChaCha20Poly1305 => {
            XChaCha20Poly1305::new(key.into()).encrypt(XNonce::from_slice(iv), payload)
        }
        CipherSuite::TwofishGcm => twofish_gcm(key)?.encrypt(Nonce::<U12>::from_slice(iv), payload),
    };
    result.map_err(|e| TesseraError::Other(anyhow::anyhow!("{suite} encryption failed: {e}")))
}

fn open(suite: CipherSuite, key: &[u8; KEY_SIZE], iv: &[u8], ciphertext: &[u8]) -> TesseraResult<Vec<u8>> {
    let payload = Payload {
        msg: ciphertext,
        aad: suite.as_str().as_bytes(),
    };
    let result = match suite {
        CipherSuite::Aes256Gcm => {
            Aes256Gcm16::new(key.into()).decrypt(Nonce::<U16>::from_slice(iv), payload)
        }
        CipherSuite::XChaCha20Poly1305 => {
            XChaCha20Poly1305::new(key.into()).decrypt(XNonce::from_slice(iv), payload)
        }
        CipherSuite::TwofishGcm => twofish_gcm(key)?.decrypt(Nonce::<U12>::from_slice(iv), payload),
    };
    result.map_err(|_| TesseraError::AuthenticationFailed)
}

fn twofish_gcm(key: &[u8; KEY_SIZE]) -> TesseraResult<TwofishGcm> {
    let block = Twofish::new_from_slice(key)
        .map_err(|e| TesseraError::Other(anyhow::anyhow!("twofish key setup failed: {e}")))?;
    Ok(TwofishGcm::from(block))
}

/// Encrypt `plaintext` under a fresh DataKey and split that key into `n`
/// shares, any `k` of which decrypt.
pub fn encrypt(
    plaintext: &[u8],
    n: usize,
    k: usize,
    suite: CipherSuite,
) -> TesseraResult<EncryptedPayload> {
    let data_key: DataKey = generate_data_key();

    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_SIZE];
    rng.fill_bytes(&mut salt);
    let mut iv = vec![0u8; suite.iv_len()];
    rng.fill_bytes(&mut iv);

    // Split first: invalid (n, k) fails before any encryption work.
    let shares = shamir::split(data_key.as_bytes(), n, k)?;

    let cipher_key = derive_cipher_key(data_key.as_bytes(), &salt, suite)?;
    let ciphertext = seal(suite, &cipher_key, &iv, plaintext)?;

    tracing::trace!(
        suite = %suite,
        plaintext_len = plaintext.len(),
        ciphertext_len = ciphertext.len(),
        shares = n,
        threshold = k,
        "encrypted payload"
    );

    Ok(EncryptedPayload {
        ciphertext,
        iv,
        salt,
        shares,
        suite,
    })
}

/// Recombine the DataKey from `shares` and decrypt.
///
/// The IV and salt are validated first. A wrong key or any modified byte of
/// the ciphertext fails `AuthenticationFailed`.
pub fn decrypt(
    ciphertext: &[u8],
    iv: &[u8],
    shares: &[KeyShare],
    k: usize,
    salt: &[u8],
    suite: CipherSuite,
) -> TesseraResult<Vec<u8>> {
    validate_params(suite, iv, salt)?;

    let data_key = shamir::recombine(shares, k)?;
    let cipher_key = derive_cipher_key(&data_key, salt, suite)?;
    open(suite, &cipher_key, iv, ciphertext)
}
