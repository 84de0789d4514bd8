//! Log of broker messages that never became records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use transit_types::{PayloadError, RawMessage, RecordRejected, SourcePosition};

use crate::append::append_synced;

pub const REJECTED_FILE: &str = "rejected.jsonl";

/// A rejected message or payload.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Element index inside the payload, absent when the whole payload was undecodable
    pub index: Option<u32>,
    pub error: String,
    /// Decoded fields, when decoding got that far
    pub fields: Option<BTreeMap<String, String>>,
    pub rejected_at: DateTime<Utc>,
}

impl RejectedEntry {
    pub fn from_record(raw: &RawMessage, error: &RecordRejected) -> Self {
        Self {
            topic: raw.position.topic.clone(),
            partition: raw.position.partition,
            offset: raw.position.offset,
            index: Some(raw.index),
            error: error.to_string(),
            fields: Some(
                raw.fields()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            rejected_at: Utc::now(),
        }
    }

    pub fn from_payload(position: &SourcePosition, error: &PayloadError) -> Self {
        Self {
            topic: position.topic.clone(),
            partition: position.partition,
            offset: position.offset,
            index: None,
            error: error.to_string(),
            fields: None,
            rejected_at: Utc::now(),
        }
    }
}

/// Appends rejected messages to `<dir>/rejected.jsonl` for later inspection.
pub struct RejectedRecordLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl RejectedRecordLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(REJECTED_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn append(&self, entry: &RejectedEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.file_path();
        append_synced(&path, &line)
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        Ok(())
    }
}
