//! Pipeline orchestrator: per-file protect and recover state machines
//!
//! Protect runs `Validating → Compressing → Encrypting → Splitting →
//! ErasureCoding → Placing → Persisted`; recover runs `Retrieving →
//! ErasureDecoding → Recombining → Decrypting → Decompressing → Delivered`.
//! Stages within one file are strictly sequential. Every stage transition is
//! a `debug!` event with a `stage` field.
//!
//! Protect is all-or-nothing: shards and fragments are written before the
//! manifest, and a failure anywhere after placement starts removes whatever
//! landed before the error is returned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opendal::Operator;
use tracing::{debug, info, warn};

use tessera_chunks::MAX_TOTAL_SHARDS;
use tessera_core::config::{PipelineConfig, TesseraConfig};
use tessera_core::{
    b64, check_file_id, CipherSuite, Entitlement, FileMetadata, HolderType, TesseraError,
    TesseraResult,
};
use tessera_crypto::shamir::MIN_THRESHOLD;
use tessera_crypto::WrappingKey;
use tessera_secrets::MasterKeyManager;
use tessera_storage::{
    build_node_operator, build_node_operators, check_all, KeyFragmentStore, NodeHealth,
    ShardStore,
};

use crate::manifest::{ManifestStore, METADATA_VERSION};

/// One state of the protect or recover pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Compressing,
    Encrypting,
    Splitting,
    ErasureCoding,
    Placing,
    Persisted,
    Retrieving,
    ErasureDecoding,
    Recombining,
    Decrypting,
    Decompressing,
    Delivered,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Compressing => "compressing",
            Stage::Encrypting => "encrypting",
            Stage::Splitting => "splitting",
            Stage::ErasureCoding => "erasure-coding",
            Stage::Placing => "placing",
            Stage::Persisted => "persisted",
            Stage::Retrieving => "retrieving",
            Stage::ErasureDecoding => "erasure-decoding",
            Stage::Recombining => "recombining",
            Stage::Decrypting => "decrypting",
            Stage::Decompressing => "decompressing",
            Stage::Delivered => "delivered",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(file_id: &str, stage: Stage) {
    debug!(file_id, stage = %stage, "pipeline stage");
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-call overrides for protect. Unset fields fall back to the vault's
/// `[pipeline]` defaults.
#[derive(Debug, Clone, Default)]
pub struct ProtectOptions {
    /// Generated (UUID v4) when not given
    pub file_id: Option<String>,
    pub cipher: Option<CipherSuite>,
    pub share_count: Option<u8>,
    pub threshold: Option<u8>,
    /// The highest-indexed shares are held by the user
    pub user_held_shares: Option<u8>,
    pub data_shards: Option<usize>,
    pub parity_shards: Option<usize>,
    pub compression_level: Option<i32>,
    pub entitlement: Entitlement,
    /// Wraps the user-held shares; required when any share is user-held
    pub user_key: Option<WrappingKey>,
}

/// Fully resolved and validated protect parameters
struct Plan {
    file_id: String,
    cipher: CipherSuite,
    share_count: u8,
    threshold: u8,
    user_held_shares: u8,
    data_shards: usize,
    parity_shards: usize,
    compression_level: i32,
}

impl ProtectOptions {
    fn resolve(&self, defaults: &PipelineConfig) -> TesseraResult<Plan> {
        let plan = Plan {
            file_id: self
                .file_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            cipher: self.cipher.unwrap_or(defaults.cipher),
            share_count: self.share_count.unwrap_or(defaults.share_count),
            threshold: self.threshold.unwrap_or(defaults.threshold),
            user_held_shares: self.user_held_shares.unwrap_or(defaults.user_held_shares),
            data_shards: self.data_shards.unwrap_or(defaults.data_shards),
            parity_shards: self.parity_shards.unwrap_or(defaults.parity_shards),
            compression_level: self.compression_level.unwrap_or(defaults.compression_level),
        };

        check_file_id(&plan.file_id)?;
        if !self.entitlement.permits(plan.cipher) {
            return Err(TesseraError::validation(format!(
                "cipher {} requires a premium entitlement",
                plan.cipher
            )));
        }
        if (plan.threshold as usize) < MIN_THRESHOLD || plan.threshold > plan.share_count {
            return Err(TesseraError::validation(format!(
                "threshold must satisfy {MIN_THRESHOLD} <= threshold ({}) <= share count ({})",
                plan.threshold, plan.share_count
            )));
        }
        if plan.user_held_shares > plan.share_count {
            return Err(TesseraError::validation(format!(
                "user-held shares ({}) exceed share count ({})",
                plan.user_held_shares, plan.share_count
            )));
        }
        if plan.user_held_shares > 0 && self.user_key.is_none() {
            return Err(TesseraError::validation(
                "user-held shares requested but no user key was supplied",
            ));
        }
        if plan.data_shards == 0 || plan.parity_shards == 0 {
            return Err(TesseraError::validation(format!(
                "data shards ({}) and parity shards ({}) must both be >= 1",
                plan.data_shards, plan.parity_shards
            )));
        }
        if plan.data_shards + plan.parity_shards > MAX_TOTAL_SHARDS {
            return Err(TesseraError::validation(format!(
                "data + parity shards must be <= {MAX_TOTAL_SHARDS}, got {}",
                plan.data_shards + plan.parity_shards
            )));
        }
        Ok(plan)
    }
}

/// What [`Vault::delete`] removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub manifest: bool,
    pub shards: usize,
    pub fragments: usize,
}

/// Decoded IV and salt of a manifest that passed every pre-crypto check.
fn check_metadata(meta: &FileMetadata) -> TesseraResult<(Vec<u8>, Vec<u8>)> {
    if meta.version > METADATA_VERSION {
        return Err(TesseraError::validation(format!(
            "metadata version {} is newer than supported ({METADATA_VERSION})",
            meta.version
        )));
    }
    let iv = b64::decode("iv", &meta.iv)?;
    let salt = b64::decode("salt", &meta.salt)?;
    tessera_crypto::validate_params(meta.encryption_type, &iv, &salt)?;

    if (meta.threshold as usize) < MIN_THRESHOLD || meta.threshold > meta.share_count {
        return Err(TesseraError::validation(format!(
            "recorded threshold {} invalid for share count {}",
            meta.threshold, meta.share_count
        )));
    }
    if meta.data_shard_count == 0 || meta.parity_shard_count == 0 {
        return Err(TesseraError::validation(format!(
            "recorded shard counts must be >= 1 (data {}, parity {})",
            meta.data_shard_count, meta.parity_shard_count
        )));
    }
    if !meta.shard_hashes.is_empty() && meta.shard_hashes.len() != meta.total_shards() {
        return Err(TesseraError::validation(format!(
            "{} shard hashes recorded for {} shards",
            meta.shard_hashes.len(),
            meta.total_shards()
        )));
    }
    Ok((iv, salt))
}

/// File ids with a protect in flight on this vault and its clones.
#[derive(Debug, Clone, Default)]
struct Claims(Arc<Mutex<HashSet<String>>>);

impl Claims {
    /// Reserve `file_id`; `None` if another protect already holds it.
    fn claim(&self, file_id: &str) -> Option<Claim> {
        let mut held = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(file_id.to_string()) {
            return None;
        }
        Some(Claim {
            claims: self.clone(),
            file_id: file_id.to_string(),
        })
    }
}

/// Released on drop, after the protect has committed or rolled back.
struct Claim {
    claims: Claims,
    file_id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut held = self.claims.0.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.file_id);
    }
}

/// Shard nodes, key fragment catalog and master keys for one deployment.
///
/// Cloning is cheap; clones share the same operators and master key manager.
#[derive(Debug, Clone)]
pub struct Vault {
    shards: ShardStore,
    fragments: KeyFragmentStore,
    manifests: ManifestStore,
    catalog: Operator,
    master: Arc<MasterKeyManager>,
    defaults: PipelineConfig,
    claims: Claims,
}

impl Vault {
    pub fn new(
        shards: ShardStore,
        catalog: Operator,
        master: Arc<MasterKeyManager>,
        defaults: PipelineConfig,
    ) -> Self {
        Self {
            shards,
            fragments: KeyFragmentStore::new(catalog.clone()),
            manifests: ManifestStore::new(catalog.clone()),
            catalog,
            master,
            defaults,
            claims: Claims::default(),
        }
    }

    /// Build operators for every configured node and the catalog.
    pub fn from_config(config: &TesseraConfig, master: Arc<MasterKeyManager>) -> TesseraResult<Self> {
        let storage = &config.storage;
        let nodes = build_node_operators(&storage.nodes, storage.enforce_tls)?;
        let catalog = build_node_operator(&storage.catalog, storage.enforce_tls)?;
        let shards = ShardStore::new(nodes, Duration::from_secs(storage.node_timeout_secs))?;
        Ok(Self::new(shards, catalog, master, config.pipeline.clone()))
    }

    pub fn master(&self) -> &Arc<MasterKeyManager> {
        &self.master
    }

    pub fn defaults(&self) -> &PipelineConfig {
        &self.defaults
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Protect `data` and return its committed metadata record.
    pub async fn protect(&self, data: &[u8], opts: &ProtectOptions) -> TesseraResult<FileMetadata> {
        let plan = opts.resolve(&self.defaults)?;
        let file_id = plan.file_id.as_str();

        enter(file_id, Stage::Validating);
        // Held until commit or rollback, so no other protect of this id can
        // write to the same shard and fragment paths meanwhile.
        let _claim = self.claims.claim(file_id).ok_or_else(|| {
            TesseraError::validation(format!("file {file_id} is already being protected"))
        })?;
        if self.manifests.exists(file_id).await? {
            return Err(TesseraError::validation(format!(
                "file {file_id} is already protected"
            )));
        }
        // Fail before any crypto work if there is nothing to wrap under.
        self.master.get_active().await?;

        enter(file_id, Stage::Compressing);
        let compressed = tessera_chunks::compress(data, plan.compression_level)?;
        let file_hash = tessera_chunks::hash_to_hex(&tessera_chunks::hash_bytes(data));

        enter(file_id, Stage::Encrypting);
        let mut payload = tessera_crypto::encrypt(
            &compressed.bytes,
            plan.share_count as usize,
            plan.threshold as usize,
            plan.cipher,
        )?;

        enter(file_id, Stage::Splitting);
        let first_user = (plan.share_count - plan.user_held_shares) as usize;
        for share in payload.shares.iter_mut().skip(first_user) {
            share.holder = HolderType::User;
        }

        enter(file_id, Stage::ErasureCoding);
        let set = tessera_chunks::split_file(&payload.ciphertext, plan.data_shards, plan.parity_shards)?;
        let shard_hashes = tessera_chunks::hash_shards(&set.shards);

        enter(file_id, Stage::Placing);
        let committed = async {
            self.shards.store(file_id, &set.shards).await?;
            let saved = self
                .fragments
                .save(file_id, &payload.shares, &self.master, opts.user_key.as_ref())
                .await?;

            let meta = FileMetadata {
                version: METADATA_VERSION,
                file_id: file_id.to_string(),
                size: compressed.original_size,
                compressed_size: compressed.compressed_size(),
                compression_ratio: compressed.ratio(),
                encryption_type: plan.cipher,
                iv: b64::encode(&payload.iv),
                salt: b64::encode(&payload.salt),
                file_hash,
                share_count: plan.share_count,
                threshold: plan.threshold,
                user_held_shares: plan.user_held_shares,
                data_shard_count: set.data_shards,
                parity_shard_count: set.parity_shards,
                shard_size: set.shard_size,
                shard_hashes,
                server_key_id: saved.server_key_id,
                master_key_version: saved.master_key_version,
                created_at: now_epoch(),
            };
            self.manifests.write(&meta).await?;
            Ok::<_, TesseraError>(meta)
        }
        .await;

        let meta = match committed {
            Ok(meta) => meta,
            Err(e) => {
                warn!(file_id, error = %e, "protect failed during placement, rolling back");
                self.rollback(file_id).await;
                return Err(e);
            }
        };

        enter(file_id, Stage::Persisted);
        info!(
            file_id,
            cipher = %meta.encryption_type,
            size = meta.size,
            compressed = meta.compressed_size,
            shards = meta.total_shards(),
            shares = meta.share_count,
            threshold = meta.threshold,
            key_id = %meta.server_key_id,
            "protected"
        );
        Ok(meta)
    }

    async fn rollback(&self, file_id: &str) {
        if let Err(e) = self.manifests.delete(file_id).await {
            warn!(file_id, error = %e, "rollback: manifest not removed");
        }
        match self.shards.delete(file_id).await {
            Ok(removed) => debug!(file_id, removed, "rollback: shards removed"),
            Err(e) => warn!(file_id, error = %e, "rollback: shards not removed"),
        }
        match self.fragments.delete(file_id).await {
            Ok(removed) => debug!(file_id, removed, "rollback: fragments removed"),
            Err(e) => warn!(file_id, error = %e, "rollback: fragments not removed"),
        }
    }

    /// Recover the plaintext of `file_id`.
    ///
    /// `user_key` unwraps user-held shares; without it only server-held
    /// shares count toward the threshold.
    pub async fn recover(
        &self,
        file_id: &str,
        user_key: Option<&WrappingKey>,
    ) -> TesseraResult<Vec<u8>> {
        enter(file_id, Stage::Retrieving);
        let meta = self.manifests.read(file_id).await?;
        let (iv, salt) = check_metadata(&meta)?;

        let shard_read = async {
            if meta.shard_hashes.is_empty() {
                self.shards.retrieve(file_id, meta.total_shards()).await
            } else {
                self.shards.retrieve_verified(file_id, &meta.shard_hashes).await
            }
        };
        let (slots, fragments) =
            tokio::try_join!(shard_read, self.fragments.load(file_id, &self.master))?;

        enter(file_id, Stage::ErasureDecoding);
        let ciphertext = tessera_chunks::reconstruct_file(
            slots,
            meta.data_shard_count,
            meta.parity_shard_count,
        )?;

        enter(file_id, Stage::Recombining);
        let threshold = meta.threshold as usize;
        let shares = fragments.into_shares(user_key, threshold)?;

        enter(file_id, Stage::Decrypting);
        let compressed = tessera_crypto::decrypt(
            &ciphertext,
            &iv,
            &shares,
            threshold,
            &salt,
            meta.encryption_type,
        )?;

        enter(file_id, Stage::Decompressing);
        let plaintext = tessera_chunks::decompress(&compressed)?;
        if !tessera_chunks::matches_hex(&plaintext, &meta.file_hash) {
            return Err(TesseraError::IntegrityMismatch(format!(
                "plaintext hash of {file_id} does not match its manifest"
            )));
        }

        enter(file_id, Stage::Delivered);
        info!(file_id, size = plaintext.len(), "recovered");
        Ok(plaintext)
    }

    /// Remove the manifest, shards and fragments of `file_id`. Deleting an
    /// unknown or already-deleted file succeeds.
    pub async fn delete(&self, file_id: &str) -> TesseraResult<DeleteReport> {
        check_file_id(file_id)?;
        let manifest = self.manifests.delete(file_id).await?;
        let shards = self.shards.delete(file_id).await?;
        let fragments = self.fragments.delete(file_id).await?;

        let report = DeleteReport {
            manifest,
            shards,
            fragments,
        };
        info!(
            file_id,
            manifest = report.manifest,
            shards = report.shards,
            fragments = report.fragments,
            "deleted"
        );
        Ok(report)
    }

    /// Re-wrap the server-held shares of `file_id` under the active master
    /// key and record it in the manifest.
    pub async fn rewrap(&self, file_id: &str) -> TesseraResult<FileMetadata> {
        let mut meta = self.manifests.read(file_id).await?;
        let saved = self.fragments.rewrap(file_id, &self.master).await?;

        if meta.server_key_id != saved.server_key_id
            || meta.master_key_version != saved.master_key_version
        {
            meta.server_key_id = saved.server_key_id;
            meta.master_key_version = saved.master_key_version;
            self.manifests.write(&meta).await?;
        }
        Ok(meta)
    }

    /// Committed file ids, sorted.
    pub async fn list_files(&self) -> TesseraResult<Vec<String>> {
        self.manifests.list().await
    }

    /// Reachability of every shard node (`node0`, `node1`, ...) and the catalog.
    pub async fn status(&self) -> Vec<NodeHealth> {
        let mut targets: Vec<(String, Operator)> = self
            .shards
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, op)| (format!("node{i}"), op.clone()))
            .collect();
        targets.push(("catalog".to_string(), self.catalog.clone()));
        check_all(&targets).await
    }
}
