//! Validator sidecar for conditionally fetched cache entries.
//!
//! Each conditional cache entry may carry a `<entry>.meta.json` sibling with
//! the ETag and Last-Modified values of the most recently fetched copy.
//! Reads never fail a request: a missing or malformed sidecar yields empty
//! validators, and the next successful fetch overwrites it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::AppResult;

/// Upstream validators recorded for a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
}

impl CacheMeta {
    pub fn is_empty(&self) -> bool {
        self.etag.is_empty() && self.last_modified.is_empty()
    }

    /// Fold non-empty response validators into the stored pair.
    pub fn merge(&mut self, fresh: &CacheMeta) {
        if !fresh.etag.is_empty() {
            self.etag = fresh.etag.clone();
        }
        if !fresh.last_modified.is_empty() {
            self.last_modified = fresh.last_modified.clone();
        }
    }
}

/// Read the sidecar at `path`. Absent or unreadable sidecars yield empty
/// validators; the entry is then refetched unconditionally.
pub async fn read(path: &Path) -> CacheMeta {
    match tokio::fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "Resetting malformed cache meta");
            CacheMeta::default()
        }),
        Err(_) => CacheMeta::default(),
    }
}

/// Write the sidecar at `path` with mode 0o600, creating parent directories
/// with mode 0o750.
pub async fn write(path: &Path, meta: &CacheMeta) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    let data = serde_json::to_vec(meta)?;
    let mut file = open_private(path).await?;
    file.write_all(&data).await?;
    file.flush().await?;
    Ok(())
}

/// Create `dir` (and parents) with mode 0o750.
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(dir).await
}

/// Open `path` for writing with mode 0o600, truncating any previous content.
pub async fn open_private(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}
