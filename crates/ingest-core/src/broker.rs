//! Broker consumer contract.
//!
//! The engine reads from the broker through `BrokerConsumer` only. The Kafka
//! implementation lives in the kafka-source crate; tests use an in-memory one.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use transit_types::{PartitionOffset, PayloadError, RawMessage, SourcePosition};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Failed to create consumer: {0}")]
    Create(String),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Error receiving message: {0}")]
    Poll(String),

    #[error("Failed to commit offsets: {0}")]
    Commit(String),
}

/// One broker message.
///
/// A payload may decode into several raw messages (JSON arrays) or into none
/// at all. Either way the position counts as seen for offset tracking.
#[derive(Debug)]
pub struct Delivery {
    pub position: SourcePosition,
    pub payload: Result<Vec<RawMessage>, PayloadError>,
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Commit consumer offsets.
    ///
    /// Each `offset` is the next offset to consume for its partition, so
    /// committing `N` acknowledges everything below `N`.
    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError>;
}
