//! Error types for transit-types crate.

use thiserror::Error;

use crate::raw::SourcePosition;

/// A broker payload that could not be turned into raw messages at all.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("Message has no payload")]
    Empty,

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Unexpected JSON structure: expected object or array of objects, got {0}")]
    UnexpectedShape(&'static str),
}

/// A raw message that cannot become a `Record`.
///
/// Rejected messages never enter a channel. They are counted and logged by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordRejected {
    #[error("Missing required field '{field}' at {position}")]
    MissingField {
        field: &'static str,
        position: SourcePosition,
    },
}
