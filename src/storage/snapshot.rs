//! Snapshot persistence for the in-memory store
//!
//! Each project partition is written to its own file as LZ4-compressed JSON.
//! Files are written to a temporary path and renamed into place, so a crash
//! mid-write leaves the previous snapshot intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;

use super::memory::MemoryStore;
use crate::span::Span;

const SCHEMA_VERSION: u32 = 1;
const EXTENSION: &str = "snap";

/// Summary of one snapshot run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub projects: usize,
    pub spans: usize,
    pub size_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProjectSnapshot {
    schema_version: u32,
    project_id: String,
    created_at: DateTime<Utc>,
    spans: Vec<Span>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted snapshot {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },
}

/// Writes and restores store snapshots under one directory
pub struct SnapshotManager {
    data_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, SnapshotError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn path_for(&self, project_id: &str) -> PathBuf {
        // Hex keeps arbitrary project ids filesystem-safe
        let name: String = project_id.bytes().map(|b| format!("{:02x}", b)).collect();
        self.data_dir.join(format!("project-{}.{}", name, EXTENSION))
    }

    /// Write every partition of `store` to disk
    pub fn create_snapshot(&self, store: &MemoryStore) -> Result<SnapshotMetadata, SnapshotError> {
        let created_at = Utc::now();
        let mut metadata = SnapshotMetadata {
            created_at,
            projects: 0,
            spans: 0,
            size_bytes: 0,
        };

        for (project_id, spans) in store.export() {
            let span_count = spans.len();
            let snapshot = ProjectSnapshot {
                schema_version: SCHEMA_VERSION,
                project_id,
                created_at,
                spans,
            };
            let json = serde_json::to_vec(&snapshot)
                .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
            let compressed = lz4_flex::compress_prepend_size(&json);

            let path = self.path_for(&snapshot.project_id);
            write_atomic(&path, &compressed)?;

            metadata.projects += 1;
            metadata.spans += span_count;
            metadata.size_bytes += compressed.len();
        }

        tracing::debug!(
            projects = metadata.projects,
            spans = metadata.spans,
            bytes = metadata.size_bytes,
            "snapshot written"
        );
        Ok(metadata)
    }

    /// Load every snapshot file into `store`. Returns the number of spans
    /// restored; an empty directory restores nothing.
    pub fn restore(&self, store: &MemoryStore) -> Result<usize, SnapshotError> {
        let mut restored = 0;

        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }

            let snapshot = read_snapshot(&path)?;
            let (owned, foreign): (Vec<Span>, Vec<Span>) = snapshot
                .spans
                .into_iter()
                .partition(|s| s.project_id == snapshot.project_id);
            if !foreign.is_empty() {
                tracing::warn!(
                    path = %path.display(),
                    skipped = foreign.len(),
                    "snapshot holds spans of another project"
                );
            }
            restored += store.load(owned);
        }

        Ok(restored)
    }
}

fn read_snapshot(path: &Path) -> Result<ProjectSnapshot, SnapshotError> {
    let corrupted = |reason: String| SnapshotError::Corrupted {
        path: path.to_path_buf(),
        reason,
    };

    let compressed = fs::read(path)?;
    let json = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| corrupted(e.to_string()))?;
    let snapshot: ProjectSnapshot =
        serde_json::from_slice(&json).map_err(|e| corrupted(e.to_string()))?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(corrupted(format!(
            "unsupported schema version {}",
            snapshot.schema_version
        )));
    }
    Ok(snapshot)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), SnapshotError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Background task that snapshots the store on a fixed interval
pub struct SnapshotWorker {
    manager: Arc<SnapshotManager>,
    store: Arc<MemoryStore>,
    interval: Duration,
    running: AtomicBool,
    shutdown: Notify,
}

impl SnapshotWorker {
    pub fn new(manager: Arc<SnapshotManager>, store: Arc<MemoryStore>, interval: Duration) -> Self {
        Self {
            manager,
            store,
            interval,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Snapshot worker started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);
            // The first tick fires immediately; nothing has changed yet
            interval.tick().await;

            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.shutdown.notified() => break,
                }

                if let Err(e) = self.snapshot_now().await {
                    tracing::error!("Periodic snapshot failed: {}", e);
                }
            }

            tracing::info!("Snapshot worker stopped");
        })
    }

    /// Write a snapshot off the async runtime
    pub async fn snapshot_now(&self) -> Result<SnapshotMetadata, SnapshotError> {
        let manager = Arc::clone(&self.manager);
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || manager.create_snapshot(&store))
            .await
            .map_err(|e| SnapshotError::Io(std::io::Error::other(e)))?
    }

    /// Stop the worker
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
