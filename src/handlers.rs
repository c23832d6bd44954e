// HTTP handlers. The sensor endpoint is a thin adapter: it packages the
// request into a `RawRequest`, hands it to the `IngestPipeline` and maps
// the outcome to a status code.
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, Registry, TextEncoder};

use crate::error::IngestError;
use crate::ingest::IngestPipeline;
use crate::reading::RawRequest;

/// Seconds a client should wait before retrying after a 503.
#[derive(Debug, Clone, Copy)]
pub struct RetryAfter(pub u64);

/// `POST /sensor-data`
///
/// 202 means the reading is buffered and will be written to the durable log
/// shortly; durability is not confirmed synchronously.
pub async fn receive_sensor_data(
    Extension(pipeline): Extension<IngestPipeline>,
    Extension(retry_after): Extension<RetryAfter>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match pipeline.ingest(RawRequest::new(content_type, body)) {
        Ok(_) => (StatusCode::ACCEPTED, "OK").into_response(),
        Err(e) => rejection(&e, retry_after),
    }
}

fn rejection(err: &IngestError, retry_after: RetryAfter) -> Response {
    match err {
        IngestError::Decode(_) | IngestError::Validation(_) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        IngestError::Buffer(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, HeaderValue::from(retry_after.0))],
            format!("{err}; retry later"),
        )
            .into_response(),
    }
}

/// Prometheus text exposition of everything in the registry.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    let content_type = HeaderValue::from_str(encoder.format_type())
        .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
    ([(header::CONTENT_TYPE, content_type)], buffer).into_response()
}

pub async fn health() -> &'static str {
    "ok"
}
