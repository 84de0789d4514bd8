//! Batch sinks for transit-ingest.
//!
//! This crate defines the `BatchSink` contract the ingestion engine delivers
//! sealed batches to, together with the concrete sinks:
//!
//! - `HttpSink`: POSTs each batch as JSON to an ingestion endpoint
//! - `JsonlFileSink`: appends rows to a local JSON lines file
//!
//! It also provides the dead-letter storage batches are routed to when they
//! cannot be delivered, and the optional rejected-record log.
//!
//! The engine only depends on the traits; which sink is used is decided once
//! by the CLI.

mod append;
mod dead_letter;
mod http;
mod jsonl;
mod rejected;
mod traits;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterReason, DeadLetterStore, FilesystemDeadLetterStore,
    MemoryDeadLetterStore, DEAD_LETTER_FILE,
};
pub use http::{HttpSink, HttpSinkConfig};
pub use jsonl::JsonlFileSink;
pub use rejected::{RejectedEntry, RejectedRecordLog, REJECTED_FILE};
pub use traits::{BatchSink, SinkError};
