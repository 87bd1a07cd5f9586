//! tessera: threshold-protected file storage CLI
//!
//! Commands:
//!   init                         - create the master key store (idempotent)
//!   protect <file>...            - encrypt, split and place files; prints file ids
//!   recover <file-id> <out>      - reassemble and decrypt one file
//!   delete <file-id>             - remove shards, fragments and manifest
//!   rotate                       - activate a new master key version
//!   rewrap <file-id>|--all       - re-wrap server-held shares under the active key
//!   keys                         - list master key versions
//!   status                       - node, catalog and key store health
//!   config show                  - print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tessera_core::config::{ConfigSource, TesseraConfig};
use tessera_core::{CipherSuite, Entitlement};
use tessera_crypto::{derive_user_key, KdfParams, WrappingKey};
use tessera_pipeline::{ProtectJob, ProtectOptions, Vault};
use tessera_secrets::MasterKeyManager;
use tessera_storage::NodeHealth;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Threshold-protected file storage",
    long_about = "tessera: encrypt files, split their keys into threshold shares, \
                  and erasure-code the ciphertext across storage nodes"
)]
struct Cli {
    /// Path to tessera configuration file
    #[arg(
        long,
        short = 'c',
        env = "TESSERA_CONFIG",
        default_value = "/etc/tessera/config.toml"
    )]
    config: PathBuf,

    /// Log filter directive (overrides [logging].level)
    #[arg(long, env = "TESSERA_LOG")]
    log: Option<String>,

    /// Log format (overrides [logging].format)
    #[arg(long, env = "TESSERA_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the master key store and its first key
    Init,

    /// Protect one or more files
    Protect {
        /// Files to protect
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Cipher suite (aes-256-gcm, xchacha20-poly1305, twofish-gcm)
        #[arg(long)]
        cipher: Option<CipherSuite>,
        /// Account holds a premium entitlement
        #[arg(long)]
        premium: bool,
        /// Hold some key shares for this user, wrapped by their passphrase
        #[arg(long)]
        user: Option<String>,
        /// Number of user-held shares (with --user; default from config, at least 1)
        #[arg(long, requires = "user")]
        user_shares: Option<u8>,
        /// Explicit file id (single file only)
        #[arg(long)]
        file_id: Option<String>,
    },

    /// Recover a protected file
    Recover {
        file_id: String,
        /// Output path
        out: PathBuf,
        /// Unwrap user-held shares for this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Delete a protected file (no error if already gone)
    Delete { file_id: String },

    /// Rotate the master key
    Rotate,

    /// Re-wrap server-held shares under the active master key
    Rewrap {
        /// File to re-wrap
        #[arg(required_unless_present = "all")]
        file_id: Option<String>,
        /// Re-wrap every protected file
        #[arg(long, conflicts_with = "file_id")]
        all: bool,
    },

    /// List master key versions
    Keys,

    /// Show node, catalog and key store health
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = TesseraConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(level, &format);
    if source == ConfigSource::Defaults {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Init => cmd_init(&config).await,
        Commands::Protect {
            files,
            cipher,
            premium,
            user,
            user_shares,
            file_id,
        } => {
            cmd_protect(
                &config,
                &files,
                cipher,
                premium,
                user.as_deref(),
                user_shares,
                file_id,
            )
            .await
        }
        Commands::Recover { file_id, out, user } => {
            cmd_recover(&config, &file_id, &out, user.as_deref()).await
        }
        Commands::Delete { file_id } => cmd_delete(&config, &file_id).await,
        Commands::Rotate => cmd_rotate(&config).await,
        Commands::Rewrap { file_id, all } => cmd_rewrap(&config, file_id.as_deref(), all).await,
        Commands::Keys => cmd_keys(&config).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config, source),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Secrets ───────────────────────────────────────────────────────────────────

/// Read a passphrase from `env_var`, falling back to an interactive prompt.
fn passphrase(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt)
        .with_context(|| format!("reading passphrase (or set {env_var})"))?;
    if value.is_empty() {
        anyhow::bail!("empty passphrase");
    }
    Ok(SecretString::from(value))
}

async fn open_master(config: &TesseraConfig) -> Result<Arc<MasterKeyManager>> {
    let secrets = &config.secrets;
    let pass = passphrase(&secrets.passphrase_env, "master key passphrase: ")?;
    let master = MasterKeyManager::open(&secrets.master_key_store, &pass, &KdfParams::from(secrets))
        .await
        .with_context(|| {
            format!(
                "opening master key store: {}",
                secrets.master_key_store.display()
            )
        })?;
    Ok(Arc::new(master))
}

async fn open_vault(config: &TesseraConfig) -> Result<Vault> {
    let master = open_master(config).await?;
    if !master.is_initialized().await {
        anyhow::bail!(
            "master key store {} is not initialized; run `tessera init` first",
            master.path().display()
        );
    }
    Vault::from_config(config, master).context("building storage operators")
}

fn user_key(config: &TesseraConfig, user: &str) -> Result<WrappingKey> {
    let pass = passphrase(
        "TESSERA_USER_PASSPHRASE",
        &format!("passphrase for user {user}: "),
    )?;
    derive_user_key(&pass, user, &KdfParams::from(&config.secrets))
        .with_context(|| format!("deriving key for user {user}"))
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `tessera init` ────────────────────────────────────────────────────────────

async fn cmd_init(config: &TesseraConfig) -> Result<()> {
    let master = open_master(config).await?;
    let already = master.is_initialized().await;
    let active = master.initialize().await.context("initializing master key")?;

    if already {
        println!("Master key store already initialized:");
    } else {
        println!("Master key store created:");
    }
    println!("  path:     {}", master.path().display());
    println!("  key id:   {}", active.key_id);
    println!("  version:  {}", active.version);
    Ok(())
}

// ── `tessera protect` ─────────────────────────────────────────────────────────

async fn cmd_protect(
    config: &TesseraConfig,
    files: &[PathBuf],
    cipher: Option<CipherSuite>,
    premium: bool,
    user: Option<&str>,
    user_shares: Option<u8>,
    file_id: Option<String>,
) -> Result<()> {
    if file_id.is_some() && files.len() > 1 {
        anyhow::bail!("--file-id can only be used with a single file");
    }

    let vault = open_vault(config).await?;
    let user_key = user.map(|u| user_key(config, u)).transpose()?;
    let user_held_shares = match user {
        Some(_) => Some(
            user_shares.unwrap_or(config.pipeline.user_held_shares.max(1)),
        ),
        None => Some(0),
    };

    let options = ProtectOptions {
        file_id,
        cipher,
        user_held_shares,
        entitlement: if premium {
            Entitlement::Premium
        } else {
            Entitlement::Standard
        },
        user_key,
        ..Default::default()
    };

    let mut jobs = Vec::with_capacity(files.len());
    for path in files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        jobs.push(ProtectJob {
            label: path.display().to_string(),
            data,
            options: options.clone(),
        });
    }

    let pb = make_spinner("protect");
    pb.set_message(format!(
        "{} file(s), {} at a time",
        jobs.len(),
        config.pipeline.batch_concurrency
    ));
    let outcomes = vault.protect_batch(jobs).await;
    pb.finish_and_clear();

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(meta) => println!(
                "{}  {}  {} → {} ({}, {}/{} shares, {}+{} shards)",
                meta.file_id,
                outcome.label,
                fmt_bytes(meta.size),
                fmt_bytes(meta.compressed_size),
                meta.encryption_type,
                meta.threshold,
                meta.share_count,
                meta.data_shard_count,
                meta.parity_shard_count,
            ),
            Err(e) => {
                failed += 1;
                eprintln!("FAILED  {}  {e}", outcome.label);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) failed", outcomes.len());
    }
    Ok(())
}

// ── `tessera recover` ─────────────────────────────────────────────────────────

async fn cmd_recover(
    config: &TesseraConfig,
    file_id: &str,
    out: &Path,
    user: Option<&str>,
) -> Result<()> {
    let vault = open_vault(config).await?;
    let user_key = user.map(|u| user_key(config, u)).transpose()?;

    let pb = make_spinner("recover");
    pb.set_message(file_id.to_string());
    let result = vault.recover(file_id, user_key.as_ref()).await;
    pb.finish_and_clear();

    let plaintext = match result {
        Ok(plaintext) => plaintext,
        Err(e) if e.is_quorum() => {
            return Err(e).context("not enough shards or shares are reachable; retry once more nodes are back")
        }
        Err(e) => return Err(e).with_context(|| format!("recovering {file_id}")),
    };

    tokio::fs::write(out, &plaintext)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!("Recovered {file_id} → {} ({})", out.display(), fmt_bytes(plaintext.len() as u64));
    Ok(())
}

// ── `tessera delete` ──────────────────────────────────────────────────────────

async fn cmd_delete(config: &TesseraConfig, file_id: &str) -> Result<()> {
    let vault = open_vault(config).await?;
    let report = vault
        .delete(file_id)
        .await
        .with_context(|| format!("deleting {file_id}"))?;

    if report.manifest || report.shards > 0 || report.fragments > 0 {
        println!(
            "Deleted {file_id}: {} shard(s), {} key fragment(s)",
            report.shards, report.fragments
        );
    } else {
        println!("{file_id}: nothing stored");
    }
    Ok(())
}

// ── `tessera rotate` / `rewrap` / `keys` ──────────────────────────────────────

async fn cmd_rotate(config: &TesseraConfig) -> Result<()> {
    let master = open_master(config).await?;
    let active = master.rotate().await.context("rotating master key")?;
    info!(key_id = %active.key_id, version = active.version, "rotation complete");
    println!("Active master key is now v{} ({})", active.version, active.key_id);
    println!("Existing files keep working; run `tessera rewrap --all` to move them eagerly.");
    Ok(())
}

async fn cmd_rewrap(config: &TesseraConfig, file_id: Option<&str>, all: bool) -> Result<()> {
    let vault = open_vault(config).await?;
    let targets = match file_id {
        Some(id) if !all => vec![id.to_string()],
        _ => vault.list_files().await.context("listing protected files")?,
    };

    for id in &targets {
        let meta = vault
            .rewrap(id)
            .await
            .with_context(|| format!("rewrapping {id}"))?;
        println!("{id}  master key v{} ({})", meta.master_key_version, meta.server_key_id);
    }
    if targets.is_empty() {
        println!("No protected files.");
    }
    Ok(())
}

async fn cmd_keys(config: &TesseraConfig) -> Result<()> {
    let master = open_master(config).await?;
    let keys = master.list().await;
    if keys.is_empty() {
        println!("No master keys (run `tessera init`).");
        return Ok(());
    }

    println!("{:<8} {:<38} {:<8} {:>12} {:>12}", "VERSION", "KEY ID", "STATE", "ACTIVATED", "RETIRED");
    for key in keys {
        println!(
            "{:<8} {:<38} {:<8} {:>12} {:>12}",
            format!("v{}", key.version),
            key.key_id,
            if key.is_active { "active" } else { "retired" },
            key.activated_at,
            key.retired_at.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

// ── `tessera status` ──────────────────────────────────────────────────────────

fn print_health(entry: &NodeHealth, describe: &str) {
    match &entry.error {
        None => println!("  {:<10} ok           {describe}", entry.label),
        Some(e) => println!("  {:<10} UNREACHABLE  {describe}  ({e})", entry.label),
    }
}

async fn cmd_status(config: &TesseraConfig) -> Result<()> {
    let vault = open_vault(config).await?;

    println!("tessera v{}", env!("CARGO_PKG_VERSION"));
    println!("Storage:");
    let report = vault.status().await;
    let describes = config
        .storage
        .nodes
        .iter()
        .chain(std::iter::once(&config.storage.catalog))
        .map(|n| n.describe());
    for (entry, describe) in report.iter().zip(describes) {
        print_health(entry, &describe);
    }

    let keys = vault.master().list().await;
    match keys.iter().find(|k| k.is_active) {
        Some(active) => println!(
            "Master key:  v{} active ({} version(s) total)",
            active.version,
            keys.len()
        ),
        None => println!("Master key:  none active"),
    }

    match vault.list_files().await {
        Ok(files) => println!("Files:       {}", files.len()),
        Err(e) => println!("Files:       unknown ({e})"),
    }

    let unhealthy = report.iter().filter(|n| !n.healthy).count();
    if unhealthy > 0 {
        anyhow::bail!("{unhealthy} storage target(s) unreachable");
    }
    Ok(())
}

// ── `tessera config show` ─────────────────────────────────────────────────────

fn cmd_config_show(
    config: &TesseraConfig,
    config_path: &Path,
    source: ConfigSource,
) -> Result<()> {
    match source {
        ConfigSource::File => println!("# Configuration from: {}", config_path.display()),
        ConfigSource::Defaults => {
            println!("# Configuration: defaults (no file at {})", config_path.display())
        }
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_protect() {
        let cli = Cli::try_parse_from([
            "tessera",
            "protect",
            "a.txt",
            "b.txt",
            "--cipher",
            "xchacha20-poly1305",
            "--premium",
        ])
        .unwrap();
        match cli.command {
            Commands::Protect {
                files,
                cipher,
                premium,
                ..
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(cipher, Some(CipherSuite::XChaCha20Poly1305));
                assert!(premium);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rewrap_needs_target() {
        assert!(Cli::try_parse_from(["tessera", "rewrap"]).is_err());
        assert!(Cli::try_parse_from(["tessera", "rewrap", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["tessera", "rewrap", "abc"]).is_ok());
    }

    #[test]
    fn user_shares_require_user() {
        assert!(Cli::try_parse_from(["tessera", "protect", "f", "--user-shares", "2"]).is_err());
    }

    #[test]
    fn config_show_renders_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TesseraConfig::default();
        let path = dir.path().join("missing.toml");
        cmd_config_show(&config, &path, ConfigSource::Defaults).unwrap();
        assert!(toml::to_string_pretty(&config).unwrap().contains("[pipeline]"));
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(10 * 1024), "10.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024 / 2), "1.5 MB");
    }
}
