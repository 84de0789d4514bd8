//! BatchSink trait definition.

use async_trait::async_trait;
use thiserror::Error;
use transit_types::Batch;

/// Why a sink refused a batch.
///
/// The split decides what the retry controller does next: retryable failures
/// are retried with backoff, fatal failures go straight to dead-letter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Transient condition such as a timeout, throttling or an expired token
    #[error("Retryable sink failure: {0}")]
    Retryable(String),

    /// Permanent condition such as a malformed batch or a rejected credential
    #[error("Fatal sink failure: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            SinkError::Retryable(reason) | SinkError::Fatal(reason) => reason,
        }
    }
}

/// Destination for sealed batches.
///
/// Implementations must be safe to call again with the same batch after a
/// retryable failure: every record carries a stable `record_id` the storage
/// side can deduplicate or upsert on.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Append all rows of `batch`. Returns only after the sink has durably
    /// accepted them, or with the reason it did not.
    async fn commit(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}
