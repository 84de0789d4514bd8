//! Kafka source for transit-ingest.
//!
//! Consumes JSON vehicle-position messages and exposes them to the engine as
//! a [`ingest_core::BrokerConsumer`]. Auto commit is disabled; the engine
//! commits offsets explicitly once the sink holds every record below them.

pub mod config;
pub mod consumer;

pub use config::{ConsumerConfig, KafkaOpts};
pub use consumer::KafkaConsumer;
