//! Codebase snapshots
//!
//! A snapshot is the list of files every worker must hold, each recorded as
//! (relative path, mode, SHA-256 of the content). Entries are sorted by
//! relative path and the aggregate hash is the SHA-256 over
//!
//! ```text
//! <path>\0<mode, 4 octal digits>\0<hex hash>\n
//! ```
//!
//! for every entry in order. The same tree always produces the same
//! aggregate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use bt_core::config::SnapshotFile;

use super::ReconcileError;

/// Mode of files marked executable
pub const EXECUTABLE_MODE: u32 = 0o755;
/// Mode of every other file
pub const REGULAR_MODE: u32 = 0o644;

/// One file of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Path relative to the worker's remote directory
    pub rel_path: String,
    /// Unix mode applied on the worker
    pub mode: u32,
    /// Hex SHA-256 of `content`
    pub hash: String,
    /// File content as hashed
    pub content: Bytes,
}

impl SnapshotEntry {
    fn manifest_line(&self) -> String {
        format!("{}\0{:04o}\0{}\n", self.rel_path, self.mode, self.hash)
    }
}

/// Files the coordinator expects on every worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodebaseSnapshot {
    entries: Vec<SnapshotEntry>,
    aggregate: String,
}

impl CodebaseSnapshot {
    /// Build a snapshot from in-memory entries
    pub fn from_entries(mut entries: Vec<SnapshotEntry>) -> Self {
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.manifest_line().as_bytes());
        }
        let aggregate = hex::encode(hasher.finalize());
        Self { entries, aggregate }
    }

    /// Read and hash every configured file
    pub async fn build(files: &[SnapshotFile]) -> Result<Self, ReconcileError> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read(&file.local_path)
                .await
                .map_err(|e| ReconcileError::LocalRead {
                    path: file.local_path.clone(),
                    reason: e.to_string(),
                })?;
            entries.push(SnapshotEntry {
                rel_path: file.remote_rel_path.clone(),
                mode: if file.executable {
                    EXECUTABLE_MODE
                } else {
                    REGULAR_MODE
                },
                hash: hex::encode(Sha256::digest(&content)),
                content: Bytes::from(content),
            });
        }
        Ok(Self::from_entries(entries))
    }

    /// Entries sorted by relative path
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Hex SHA-256 over the sorted manifest
    pub fn aggregate(&self) -> &str {
        &self.aggregate
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity of the on-disk files a snapshot was built from
type Signature = Vec<(PathBuf, Option<SystemTime>, u64)>;

/// Rebuilds the snapshot only when the files change on disk
pub struct SnapshotCache {
    files: Vec<SnapshotFile>,
    cached: Mutex<Option<(Signature, Arc<CodebaseSnapshot>)>>,
}

impl SnapshotCache {
    pub fn new(files: Vec<SnapshotFile>) -> Self {
        Self {
            files,
            cached: Mutex::new(None),
        }
    }

    /// Configured files
    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    /// Current snapshot, rebuilt if any file's size or mtime changed
    pub async fn current(&self) -> Result<Arc<CodebaseSnapshot>, ReconcileError> {
        let signature = self.signature().await?;
        let mut cached = self.cached.lock().await;
        if let Some((known, snapshot)) = cached.as_ref() {
            if *known == signature {
                return Ok(Arc::clone(snapshot));
            }
        }

        let snapshot = Arc::new(CodebaseSnapshot::build(&self.files).await?);
        tracing::info!(
            "Built codebase snapshot {} ({} files)",
            &snapshot.aggregate()[..12],
            snapshot.len()
        );
        *cached = Some((signature, Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    async fn signature(&self) -> Result<Signature, ReconcileError> {
        let mut signature = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let metadata = tokio::fs::metadata(&file.local_path)
                .await
                .map_err(|e| ReconcileError::LocalRead {
                    path: file.local_path.clone(),
                    reason: e.to_string(),
                })?;
            signature.push((file.local_path.clone(), metadata.modified().ok(), metadata.len()));
        }
        Ok(signature)
    }
}
