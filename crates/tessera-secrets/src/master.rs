//! Versioned, rotatable master keys
//!
//! Master keys wrap the server-held key shares of every protected file. The
//! key material is sealed at rest (AES-256-GCM) under a store key derived
//! with Argon2id from an operator passphrase:
//!
//! ```text
//! master-keys.json
//!   kdf:   { salt, memCostKib, timeCost, parallelism }
//!   activeKeyId
//!   keys:  [ { keyId, version, nonce, sealedKey, isActive, activatedAt, retiredAt } ]
//! ```
//!
//! Rotation builds the next document in memory (new key active, previous key
//! retired) and replaces the file atomically, so the on-disk store always has
//! exactly one active key. Retired keys are kept forever: wrapped shares name
//! the key they were wrapped under.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use tessera_core::config::SecretsConfig;
use tessera_core::{b64, TesseraError, TesseraResult};
use tessera_crypto::{
    derive_key, generate_wrap_nonce, open_secret, seal_secret, KdfParams, WrappingKey,
    KDF_SALT_SIZE, WRAP_NONCE_SIZE,
};

use crate::rotate::{atomic_replace, now_epoch};

const STORE_FORMAT_VERSION: u32 = 1;

/// Public view of one master key version (no key material).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyInfo {
    pub key_id: String,
    pub version: u32,
    pub is_active: bool,
    pub activated_at: u64,
    pub retired_at: Option<u64>,
}

/// The active key, as handed to a wrapping operation.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub key_id: String,
    pub version: u32,
    pub key: WrappingKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KdfRecord {
    salt: String,
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterKeyRecord {
    key_id: String,
    version: u32,
    /// Sealing nonce (base64, 12 bytes)
    nonce: String,
    /// AES-256-GCM(key material) || tag (base64)
    sealed_key: String,
    is_active: bool,
    activated_at: u64,
    #[serde(default)]
    retired_at: Option<u64>,
}

impl MasterKeyRecord {
    fn info(&self) -> MasterKeyInfo {
        MasterKeyInfo {
            key_id: self.key_id.clone(),
            version: self.version,
            is_active: self.is_active,
            activated_at: self.activated_at,
            retired_at: self.retired_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
    format: u32,
    kdf: KdfRecord,
    #[serde(default)]
    active_key_id: Option<String>,
    #[serde(default)]
    keys: Vec<MasterKeyRecord>,
}

impl StoreDocument {
    /// Exactly one active key, matching `active_key_id`; or no keys at all.
    fn check(&self) -> TesseraResult<()> {
        let active: Vec<&MasterKeyRecord> = self.keys.iter().filter(|k| k.is_active).collect();
        match (&self.active_key_id, active.as_slice()) {
            (None, []) if self.keys.is_empty() => Ok(()),
            (Some(id), [only]) if &only.key_id == id => Ok(()),
            _ => Err(TesseraError::Config(format!(
                "master key store is inconsistent: {} active keys, activeKeyId {:?}",
                active.len(),
                self.active_key_id
            ))),
        }
    }
}

fn seal_aad(key_id: &str) -> Vec<u8> {
    let mut aad = b"tessera-master-key:".to_vec();
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

struct Inner {
    doc: StoreDocument,
    /// Unsealed key material by key id
    keys: HashMap<String, WrappingKey>,
}

/// Versioned master key store. Cheap to share behind an `Arc`.
pub struct MasterKeyManager {
    path: PathBuf,
    store_key: WrappingKey,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for MasterKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MasterKeyManager {
    /// Open (or prepare) the store at `path`.
    ///
    /// An existing store is unsealed with `passphrase`; a wrong passphrase
    /// fails `AuthenticationFailed`. A missing store starts uninitialized and
    /// nothing is written until [`initialize`](Self::initialize).
    pub async fn open(
        path: &Path,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> TesseraResult<Self> {
        let doc = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let doc: StoreDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    TesseraError::Serialization(format!("parsing {}: {e}", path.display()))
                })?;
                if doc.format != STORE_FORMAT_VERSION {
                    return Err(TesseraError::Config(format!(
                        "unsupported master key store format {}",
                        doc.format
                    )));
                }
                doc.check()?;
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut salt = [0u8; KDF_SALT_SIZE];
                rand::thread_rng().fill_bytes(&mut salt);
                StoreDocument {
                    format: STORE_FORMAT_VERSION,
                    kdf: KdfRecord {
                        salt: b64::encode(&salt),
                        mem_cost_kib: params.mem_cost_kib,
                        time_cost: params.time_cost,
                        parallelism: params.parallelism,
                    },
                    active_key_id: None,
                    keys: Vec::new(),
                }
            }
            Err(e) => return Err(e.into()),
        };

        // The store's own parameters win over the configured ones, so a
        // config change never locks out an existing store.
        let salt = b64::decode_array::<KDF_SALT_SIZE>("kdf.salt", &doc.kdf.salt)?;
        let store_params = KdfParams {
            mem_cost_kib: doc.kdf.mem_cost_kib,
            time_cost: doc.kdf.time_cost,
            parallelism: doc.kdf.parallelism,
        };
        let store_key = derive_key(passphrase, &salt, &store_params)?;

        let mut keys = HashMap::with_capacity(doc.keys.len());
        for record in &doc.keys {
            let nonce = b64::decode_array::<WRAP_NONCE_SIZE>("nonce", &record.nonce)?;
            let sealed = b64::decode("sealedKey", &record.sealed_key)?;
            let material = open_secret(&store_key, &nonce, &sealed, &seal_aad(&record.key_id))?;
            keys.insert(record.key_id.clone(), WrappingKey::from_bytes(*material));
        }

        tracing::debug!(
            path = %path.display(),
            versions = doc.keys.len(),
            active = ?doc.active_key_id,
            "master key store opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            store_key,
            inner: RwLock::new(Inner { doc, keys }),
        })
    }

    /// Open using the passphrase held in the configured environment variable.
    pub async fn from_config(cfg: &SecretsConfig) -> TesseraResult<Self> {
        let passphrase = std::env::var(&cfg.passphrase_env).map_err(|_| {
            TesseraError::Config(format!(
                "master key passphrase not set: export {}",
                cfg.passphrase_env
            ))
        })?;
        Self::open(
            &cfg.master_key_store,
            &SecretString::from(passphrase),
            &KdfParams::from(cfg),
        )
        .await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn new_record(&self, version: u32) -> TesseraResult<(MasterKeyRecord, WrappingKey)> {
        let key = WrappingKey::generate();
        let key_id = uuid::Uuid::new_v4().to_string();
        let nonce = generate_wrap_nonce();
        let sealed = seal_secret(&self.store_key, &nonce, key.as_bytes(), &seal_aad(&key_id))?;
        let record = MasterKeyRecord {
            key_id,
            version,
            nonce: b64::encode(&nonce),
            sealed_key: b64::encode(&sealed),
            is_active: true,
            activated_at: now_epoch(),
            retired_at: None,
        };
        Ok((record, key))
    }

    async fn persist(&self, doc: &StoreDocument) -> TesseraResult<()> {
        doc.check()?;
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| TesseraError::Serialization(format!("master key store: {e}")))?;
        atomic_replace(&self.path, &json).await
    }

    /// Create the first master key if none is active. No-op otherwise.
    pub async fn initialize(&self) -> TesseraResult<MasterKeyInfo> {
        let mut inner = self.inner.write().await;
        if let Some(active) = active_record(&inner.doc) {
            return Ok(active.info());
        }

        let (record, key) = self.new_record(1)?;
        let mut next = inner.doc.clone();
        next.active_key_id = Some(record.key_id.clone());
        next.keys.push(record.clone());
        self.persist(&next).await?;

        inner.keys.insert(record.key_id.clone(), key);
        inner.doc = next;

        tracing::info!(key_id = %record.key_id, version = 1, "master key store initialized");
        Ok(record.info())
    }

    /// The current active key. Fails `NoActiveKey` before initialization.
    pub async fn get_active(&self) -> TesseraResult<ActiveKey> {
        let inner = self.inner.read().await;
        let record = active_record(&inner.doc).ok_or(TesseraError::NoActiveKey)?;
        let key = inner
            .keys
            .get(&record.key_id)
            .ok_or_else(|| TesseraError::KeyNotFound(record.key_id.clone()))?;
        Ok(ActiveKey {
            key_id: record.key_id.clone(),
            version: record.version,
            key: key.clone(),
        })
    }

    /// Activate a new key and retire the current one, in one store write.
    ///
    /// Holds the write lock for the whole transaction: concurrent wrappers see
    /// either the old active key or the new one.
    pub async fn rotate(&self) -> TesseraResult<MasterKeyInfo> {
        let mut inner = self.inner.write().await;
        let previous = active_record(&inner.doc)
            .ok_or(TesseraError::NoActiveKey)?
            .clone();

        let next_version = inner.doc.keys.iter().map(|k| k.version).max().unwrap_or(0) + 1;
        let (record, key) = self.new_record(next_version)?;

        let mut next = inner.doc.clone();
        let now = record.activated_at;
        for existing in next.keys.iter_mut().filter(|k| k.is_active) {
            existing.is_active = false;
            existing.retired_at = Some(now);
        }
        next.active_key_id = Some(record.key_id.clone());
        next.keys.push(record.clone());

        // On failure the in-memory state is untouched and the file is either
        // the old document or was never replaced.
        self.persist(&next).await?;

        inner.keys.insert(record.key_id.clone(), key);
        inner.doc = next;

        tracing::info!(
            key_id = %record.key_id,
            version = record.version,
            retired = %previous.key_id,
            "master key rotated"
        );
        Ok(record.info())
    }

    /// Any key version, active or retired.
    pub async fn get_by_id(&self, key_id: &str) -> TesseraResult<WrappingKey> {
        let inner = self.inner.read().await;
        inner
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| TesseraError::KeyNotFound(key_id.to_string()))
    }

    /// Every key version, oldest first.
    pub async fn list(&self) -> Vec<MasterKeyInfo> {
        let inner = self.inner.read().await;
        let mut infos: Vec<MasterKeyInfo> = inner.doc.keys.iter().map(MasterKeyRecord::info).collect();
        infos.sort_by_key(|k| k.version);
        infos
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.doc.active_key_id.is_some()
    }
}

fn active_record(doc: &StoreDocument) -> Option<&MasterKeyRecord> {
    let id = doc.active_key_id.as_ref()?;
    doc.keys.iter().find(|k| &k.key_id == id && k.is_active)
}
