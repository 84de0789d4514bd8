//! Shared types for transit-ingest.
//!
//! This crate provides:
//! - `RawMessage`: the loosely typed field map decoded from a broker message
//! - `Record`: the normalized, strongly typed vehicle-position event
//! - `Batch`: an immutable group of records sealed by one ingestion channel
//! - Field validators and the `Normalizer` that turns a `RawMessage` into a `Record`
//!
//! # Dependency Direction
//!
//! The sink, kafka-source and ingest-core crates all depend on this crate.
//! It depends on none of them, so payload decoding and normalization can be
//! tested without a broker or a sink.

pub mod batch;
pub mod decode;
pub mod error;
pub mod normalize;
pub mod raw;
pub mod record;
pub mod validate;

pub use batch::{Batch, BatchId, FlushTrigger, PartitionOffset};
pub use decode::decode_json_payload;
pub use error::{PayloadError, RecordRejected};
pub use normalize::{Normalized, Normalizer, NormalizerConfig, QualityReport};
pub use raw::{RawMessage, SourcePosition, TopicPartition};
pub use record::{Direction, ProgressRate, ProgressStatus, Record, RecordSource, StatusValue};
pub use validate::{CoordinateRange, Parsed};
