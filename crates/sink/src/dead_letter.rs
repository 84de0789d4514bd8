//! Dead-letter storage for batches that could not be delivered.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use transit_types::{Batch, PartitionOffset, Record};
use uuid::Uuid;

use crate::append::append_synced;

/// File name used inside the dead-letter directory.
pub const DEAD_LETTER_FILE: &str = "dead_letter.jsonl";

/// Why a batch ended up in dead-letter storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Every allowed attempt failed with a retryable error
    RetriesExhausted { last_error: String },
    /// The sink refused the batch permanently
    Fatal(String),
    /// The batch was still queued or in flight when the shutdown grace period ran out
    ShutdownTimeout,
}

impl DeadLetterReason {
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterReason::RetriesExhausted { .. } => "retries_exhausted",
            DeadLetterReason::Fatal(_) => "fatal",
            DeadLetterReason::ShutdownTimeout => "shutdown_timeout",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            DeadLetterReason::RetriesExhausted { last_error } => last_error.clone(),
            DeadLetterReason::Fatal(reason) => reason.clone(),
            DeadLetterReason::ShutdownTimeout => {
                "shutdown grace period elapsed before delivery".to_string()
            }
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.detail())
    }
}

/// One dead-lettered batch, with its full content.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub channel: usize,
    pub batch_id: String,
    pub reason_kind: &'static str,
    pub reason: String,
    /// Sink calls made for this batch before it was given up on
    pub attempts: u32,
    pub record_count: usize,
    pub offsets: Vec<PartitionOffset>,
    pub records: Vec<Record>,
    pub batch_created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(batch: &Batch, reason: &DeadLetterReason, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: batch.channel,
            batch_id: batch.id.to_string(),
            reason_kind: reason.kind(),
            reason: reason.detail(),
            attempts,
            record_count: batch.len(),
            offsets: batch.offsets.clone(),
            records: batch.records.clone(),
            batch_created_at: batch.created_at,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Append-only store for dead-lettered batches.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<()>;
}

/// Filesystem implementation of `DeadLetterStore`.
///
/// Appends one JSON line per entry to `<dir>/dead_letter.jsonl`.
pub struct FilesystemDeadLetterStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FilesystemDeadLetterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(DEAD_LETTER_FILE)
    }
}

#[async_trait]
impl DeadLetterStore for FilesystemDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("Failed to serialize dead-letter entry")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.file_path();
        append_synced(&path, &line)
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;

        tracing::info!(
            batch_id = %entry.batch_id,
            reason = entry.reason_kind,
            records = entry.record_count,
            "Stored dead-letter entry to {}",
            path.display()
        );
        Ok(())
    }
}

/// In-memory `DeadLetterStore`, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: StdMutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
