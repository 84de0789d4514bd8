//! Channel-parallel ingestion engine.
//!
//! Records polled from a [`BrokerConsumer`] are routed by vehicle id to a
//! fixed set of channels. Each channel batches its records and delivers
//! batches to a [`transit_sink::BatchSink`] through the [`RetryController`].
//! Broker offsets are committed by the [`OffsetCommitter`] only once every
//! record at or below them has been accepted by the sink.

pub mod broker;
mod channel;
pub mod committer;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod ledger;
mod manager;
pub mod metrics;
pub mod retry;

pub use broker::{BrokerConsumer, BrokerError, Delivery};
pub use committer::OffsetCommitter;
pub use config::EngineConfig;
pub use engine::IngestEngine;
pub use error::{EngineError, Result};
pub use health::{
    bind_health, health_router, serve_health, HealthReporter, HealthSnapshot, HealthStatus,
};
pub use ledger::{OffsetLedger, PartitionSnapshot};
pub use manager::channel_for;
pub use metrics::{
    process_memory_mb, ChannelSnapshot, IngestMetrics, MetricsSnapshot, QualitySnapshot, Totals,
};
pub use retry::{Backoff, DeliveryOutcome, RetryController, RetryPolicy};
