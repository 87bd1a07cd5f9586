use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TesseraError, TesseraResult};
use crate::types::CipherSuite;

/// Top-level configuration (loaded from tessera.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub secrets: SecretsConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Per-read timeout; a timed-out shard read counts as a missing shard
    pub node_timeout_secs: u64,
    /// Reject plaintext-HTTP S3 endpoints
    pub enforce_tls: bool,
    /// Shard nodes, in placement order (shard i lives on node i mod len)
    pub nodes: Vec<NodeConfig>,
    /// Backend holding key fragments and metadata manifests
    pub catalog: NodeConfig,
}

/// One storage location. Any OpenDAL-backed service is a valid node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeConfig {
    /// Local directory
    Fs { root: PathBuf },
    /// In-process memory (tests, dry runs)
    Memory,
    /// S3-compatible object store; credentials from AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY
    S3 {
        endpoint: String,
        #[serde(default = "default_region")]
        region: String,
        bucket: String,
        #[serde(default)]
        root: Option<String>,
    },
}

fn default_region() -> String {
    "us-east-1".into()
}

impl NodeConfig {
    /// Short label for logs and health output
    pub fn describe(&self) -> String {
        match self {
            NodeConfig::Fs { root } => format!("fs:{}", root.display()),
            NodeConfig::Memory => "memory".into(),
            NodeConfig::S3 {
                endpoint, bucket, ..
            } => format!("s3:{endpoint}/{bucket}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// JSON record store holding every master key version
    pub master_key_store: PathBuf,
    /// Environment variable holding the store passphrase
    pub passphrase_env: String,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

/// Default protect parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cipher: CipherSuite,
    /// Key shares generated per file (n)
    pub share_count: u8,
    /// Key shares needed to recover (k)
    pub threshold: u8,
    /// How many of the n shares are custodied by the user
    pub user_held_shares: u8,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// zstd level (1-22)
    pub compression_level: i32,
    /// Simultaneous file pipelines during batch operations
    pub batch_concurrency: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: 10,
            enforce_tls: false,
            nodes: (0..3)
                .map(|i| NodeConfig::Fs {
                    root: PathBuf::from(format!("/var/lib/tessera/node{i}")),
                })
                .collect(),
            catalog: NodeConfig::Fs {
                root: PathBuf::from("/var/lib/tessera/catalog"),
            },
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            master_key_store: PathBuf::from("/var/lib/tessera/master-keys.json"),
            passphrase_env: "TESSERA_MASTER_PASSPHRASE".into(),
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cipher: CipherSuite::Aes256Gcm,
            share_count: 5,
            threshold: 3,
            user_held_shares: 0,
            data_shards: 4,
            parity_shards: 2,
            compression_level: 3,
            batch_concurrency: 5,
        }
    }
}

/// Where [`TesseraConfig::load`] got its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file did not exist; built-in defaults were used
    Defaults,
}

impl TesseraConfig {
    /// Load from a TOML file. A missing file yields the defaults, reported
    /// as [`ConfigSource::Defaults`] so the caller can warn once logging is up.
    pub fn load(path: &Path) -> TesseraResult<(Self, ConfigSource)> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok((Self::from_toml(&content)?, ConfigSource::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                Ok((config, ConfigSource::Defaults))
            }
            Err(e) => Err(TesseraError::Config(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }

    /// Parse a TOML document and check cross-field constraints.
    pub fn from_toml(s: &str) -> TesseraResult<Self> {
        let config: TesseraConfig =
            toml::from_str(s).map_err(|e| TesseraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.storage.nodes.is_empty() {
            return Err(TesseraError::Config(
                "storage.nodes must list at least one node".into(),
            ));
        }
        let p = &self.pipeline;
        if p.threshold < 2 || p.threshold > p.share_count {
            return Err(TesseraError::Config(format!(
                "pipeline.threshold must satisfy 2 <= threshold ({}) <= share_count ({})",
                p.threshold, p.share_count
            )));
        }
        if p.user_held_shares > p.share_count {
            return Err(TesseraError::Config(format!(
                "pipeline.user_held_shares ({}) exceeds share_count ({})",
                p.user_held_shares, p.share_count
            )));
        }
        if p.data_shards == 0 || p.parity_shards == 0 {
            return Err(TesseraError::Config(
                "pipeline.data_shards and pipeline.parity_shards must be >= 1".into(),
            ));
        }
        if p.batch_concurrency == 0 {
            return Err(TesseraError::Config(
                "pipeline.batch_concurrency must be >= 1".into(),
            ));
        }
        if self.storage.nodes.len() < p.data_shards + p.parity_shards {
            tracing::warn!(
                nodes = self.storage.nodes.len(),
                shards = p.data_shards + p.parity_shards,
                "fewer nodes than shards: some nodes will hold several shards of one file"
            );
        }
        Ok(())
    }
}
