//! Files owned by one in-flight job.
//!
//! Every path handed out here is removed by `release_all`, which also runs on
//! drop. Removal failures are logged and never returned.

use crate::error::Result;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct TempResources {
    dir: PathBuf,
    tracked: Vec<PathBuf>,
}

impl TempResources {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tracked: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves a fresh, tracked path with the given extension. Nothing is
    /// written yet.
    pub fn allocate(&mut self, ext: &str) -> PathBuf {
        let ext = ext.trim_start_matches('.');
        let path = self.dir.join(format!("{}.{ext}", uuid::Uuid::new_v4()));
        self.track(path.clone());
        path
    }

    pub fn track(&mut self, path: PathBuf) {
        if !self.tracked.contains(&path) {
            tracing::debug!(path = %path.display(), "tracking temp file");
            self.tracked.push(path);
        }
    }

    pub async fn write_tracked(&mut self, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.allocate(ext);
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Removes one tracked file early, e.g. a downscale attempt that did not
    /// shrink anything.
    pub fn discard(&mut self, path: &Path) {
        if let Some(idx) = self.tracked.iter().position(|p| p == path) {
            let path = self.tracked.swap_remove(idx);
            remove_logged(&path);
        }
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn release_all(&mut self) {
        if self.tracked.is_empty() {
            return;
        }
        let count = self.tracked.len();
        for path in self.tracked.drain(..) {
            remove_logged(&path);
        }
        tracing::debug!(count, "released temp files");
    }
}

impl Drop for TempResources {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn remove_logged(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove temp file"),
    }
}
