//! Cache directory housekeeping.
//!
//! Jobs clean up after themselves; this sweeps whatever a crash or a kill
//! left behind.

use crate::preferences::PREFERENCES_FILE;
use anyhow::Result;
use bb_gen::{ProbeReport, ProbeStatus};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Removes files under `dir` last modified at least `retention` ago, then
/// any directories left empty. Returns the number of files removed. The
/// preferences file at the top of `dir` is never removed.
pub async fn cleanup_cache(dir: &Path, retention: Duration) -> Result<usize> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0usize;
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(path.clone());
                dirs.push(path);
                continue;
            }
            if current == dir && entry.file_name() == PREFERENCES_FILE {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < retention {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), %e, "failed to remove cached file"),
            }
        }
    }

    // Deepest first so parents see their children gone.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for d in dirs {
        // Fails harmlessly while the directory still has files.
        let _ = tokio::fs::remove_dir(&d).await;
    }

    if removed > 0 {
        tracing::info!(removed, dir = %dir.display(), "cache cleanup removed files");
    }
    Ok(removed)
}

/// Confirms the cache directory exists and accepts writes.
pub async fn check_cache_writable(dir: &Path) -> ProbeReport {
    let marker = dir.join(".health_check");
    let attempt = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&marker, b"ok").await?;
        tokio::fs::remove_file(&marker).await
    };
    match attempt.await {
        Ok(()) => ProbeReport::new(ProbeStatus::Ok, "cache storage writable"),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), %e, "cache storage check failed");
            ProbeReport::new(ProbeStatus::Unhealthy, format!("cache storage: {e}"))
        }
    }
}
