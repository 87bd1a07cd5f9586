//! Atomic replacement of the master key store
//!
//! The store is rewritten as a whole on every change: serialize, write a temp
//! file next to the target, then rename over it. A crash leaves either the
//! old document or the new one on disk, never a mix.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use tessera_core::TesseraResult;

/// Atomically replace a file with new content.
///
/// The temp file is flushed to disk before the rename and the parent
/// directory is synced after it, so the rename survives a power loss.
pub async fn atomic_replace(path: &Path, new_content: &[u8]) -> TesseraResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(parent).await?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    if let Err(e) = write_synced(&tmp_path, new_content).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    sync_dir(parent).await?;

    tracing::debug!(path = %path.display(), bytes = new_content.len(), "store replaced");
    Ok(())
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

// Directory handles cannot be synced on this platform.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
