//! JSON lines file sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use transit_types::Batch;

use crate::append::append_synced;
use crate::traits::{BatchSink, SinkError};

/// Appends every record of a batch as one JSON line to a local file.
///
/// Stands in for the analytical store during development. A batch is written
/// with a single append that is synced to disk before the batch counts as
/// delivered, and IO errors are reported as retryable.
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BatchSink for JsonlFileSink {
    async fn commit(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(batch.len() * 512);
        for record in &batch.records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| SinkError::Fatal(format!("Failed to serialize record: {e}")))?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SinkError::Retryable(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
        }
        append_synced(&self.path, &buf).await.map_err(|e| {
            SinkError::Retryable(format!(
                "Failed to append rows to {}: {e}",
                self.path.display()
            ))
        })?;

        tracing::debug!(
            batch_id = %batch.id,
            rows = batch.len(),
            path = %self.path.display(),
            "Appended batch to JSONL sink"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}
