//! Reliable sensor-ingestion endpoint.
//!
//! IoT devices `POST /sensor-data` with a JSON or form-encoded reading. Each
//! request is decoded, validated, stamped with a sequence number and placed
//! in a bounded buffer; a single background writer drains the buffer in
//! batches into an append-only durable log. A full buffer is answered with
//! 503 so devices back off instead of the service running out of memory.
//!
//! ```text
//! request -> decoder -> validator -> buffer -> (writer thread) -> durable log
//!                                                  \-> dead-letter log
//! ```
pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
#[cfg(feature = "duckdb")]
pub mod export;
pub mod handlers;
pub mod ingest;
pub mod log;
pub mod logging;
pub mod metrics;
pub mod reading;
pub mod server;
pub mod validator;
pub mod writer;
