//! tessera-pipeline: the protect/recover orchestrator
//!
//! A [`Vault`] ties together the shard nodes, the key fragment catalog and
//! the master key manager:
//!
//! ```text
//! protect:  validate → compress → encrypt → split key → erasure-code → place → manifest
//! recover:  manifest → retrieve shards ‖ load fragments → decode → recombine → decrypt → decompress
//! ```
//!
//! The manifest is written last and is the commit record: a file exists only
//! once its manifest does.

pub mod batch;
pub mod engine;
pub mod manifest;

pub use batch::{BatchOutcome, ProtectJob};
pub use engine::{DeleteReport, ProtectOptions, Stage, Vault};
pub use manifest::{manifest_path, ManifestStore, METADATA_VERSION};
