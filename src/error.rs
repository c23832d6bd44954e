// Error taxonomy. Decode and validation errors end the request with a 4xx,
// buffer errors with a 503, write errors stay inside the writer.
use std::io;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("no data received")]
    Empty,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("field {field} is too long: {len} chars (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum BufferError {
    #[error("ingestion buffer is full")]
    Full,

    #[error("ingestion buffer is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("transient write failure: {0}")]
    Transient(#[source] io::Error),

    #[error("write failed after {attempts} attempts: {source}")]
    Fatal {
        attempts: usize,
        #[source]
        source: io::Error,
    },
}

/// Failures opening or recovering a durable log file.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path} is not a sensor log (bad header)")]
    NotALog { path: String },

    #[error("unsupported log format version: {0}")]
    UnsupportedVersion(String),

    #[error("corrupt log entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Why a request was not accepted, one variant per pipeline stage.
#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl IngestError {
    /// Label used for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::Decode(DecodeError::Empty) => "empty",
            IngestError::Decode(DecodeError::Malformed(_)) => "malformed",
            IngestError::Validation(ValidationError::MissingField(_)) => "missing_field",
            IngestError::Validation(ValidationError::OutOfRange { .. }) => "out_of_range",
            IngestError::Validation(ValidationError::FieldTooLong { .. }) => "field_too_long",
            IngestError::Buffer(BufferError::Full) => "full",
            IngestError::Buffer(BufferError::Closed) => "closed",
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            IngestError::Decode(_) => "decode",
            IngestError::Validation(_) => "validate",
            IngestError::Buffer(_) => "enqueue",
        }
    }

    pub fn is_backpressure(&self) -> bool {
        matches!(self, IngestError::Buffer(_))
    }
}
