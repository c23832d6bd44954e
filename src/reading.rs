// Data model for a single sensor reading as it moves through the pipeline:
// `RawRequest` (request scope) -> `SensorReading` (decoded) ->
// `CheckedReading` (validated fields) -> `ValidatedReading` (sequenced,
// owned by the buffer until the writer persists it).
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The request as delivered by the HTTP layer. Never outlives the request.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub content_type: Option<String>,
    pub payload: Bytes,
    pub arrived_at: DateTime<Utc>,
}

impl RawRequest {
    pub fn new(content_type: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            payload: payload.into(),
            arrived_at: Utc::now(),
        }
    }
}

/// Decoder output. Every field is optional here; presence and ranges are the
/// validator's business.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub device_id: Option<String>,
    pub metric: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A reading whose fields passed validation but which has not been assigned
/// a sequence number yet.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedReading {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An accepted reading. `seq` is unique and strictly increasing per process
/// lineage (it resumes after the highest persisted value on restart).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedReading {
    pub seq: u64,
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Client timestamp, or the arrival time when the client sent none.
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}
