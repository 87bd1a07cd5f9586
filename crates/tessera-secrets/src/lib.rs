//! tessera-secrets: master key custody
//!
//! The master key store is a single JSON document holding every master key
//! version, sealed under an Argon2id-derived store key. Its passphrase comes
//! from the environment (`secrets.passphrase_env`, default
//! `TESSERA_MASTER_PASSPHRASE`) or an interactive prompt in the CLI.

pub mod master;
pub mod rotate;

pub use master::{ActiveKey, MasterKeyInfo, MasterKeyManager};
pub use rotate::atomic_replace;
