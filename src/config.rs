// Runtime configuration, read once from environment variables. Every
// setting has a default so the service starts with no environment at all;
// a value that is present but malformed stops startup with an error naming
// the variable.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::buffer::DEFAULT_CAPACITY;
use crate::validator::{Limits, DEFAULT_MAX_DEVICE_ID_LEN};
use crate::writer::{RetryPolicy, WriterConfig};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_path: PathBuf,
    pub dead_letter_path: PathBuf,
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub write_retries: usize,
    pub retry_backoff: Duration,
    pub max_device_id_len: usize,
    pub max_body_bytes: usize,
    pub retry_after_secs: u64,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            log_path: PathBuf::from("data/readings.log"),
            dead_letter_path: PathBuf::from("data/dead-letter.log"),
            buffer_capacity: DEFAULT_CAPACITY,
            batch_size: 100,
            flush_interval: Duration::from_millis(200),
            write_retries: 3,
            retry_backoff: Duration::from_millis(50),
            max_device_id_len: DEFAULT_MAX_DEVICE_ID_LEN,
            max_body_bytes: 64 * 1024,
            retry_after_secs: 1,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Config::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let log_json = match get("SENSOR_LOG_FORMAT").as_deref() {
            None | Some("text") => false,
            Some("json") => true,
            Some(other) => {
                bail!("Invalid SENSOR_LOG_FORMAT value, expected text or json, got: {other}")
            }
        };

        let config = Config {
            bind_addr: parse_or(&get, "SENSOR_BIND_ADDR", d.bind_addr)?,
            log_path: get("SENSOR_LOG_PATH").map(PathBuf::from).unwrap_or(d.log_path),
            dead_letter_path: get("SENSOR_DEAD_LETTER_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.dead_letter_path),
            buffer_capacity: parse_or(&get, "SENSOR_BUFFER_CAPACITY", d.buffer_capacity)?,
            batch_size: parse_or(&get, "SENSOR_BATCH_SIZE", d.batch_size)?,
            flush_interval: parse_or(&get, "SENSOR_FLUSH_INTERVAL_MS", 200u64)
                .map(Duration::from_millis)?,
            write_retries: parse_or(&get, "SENSOR_WRITE_RETRIES", d.write_retries)?,
            retry_backoff: parse_or(&get, "SENSOR_RETRY_BACKOFF_MS", 50u64)
                .map(Duration::from_millis)?,
            max_device_id_len: parse_or(&get, "SENSOR_MAX_DEVICE_ID_LEN", d.max_device_id_len)?,
            max_body_bytes: parse_or(&get, "SENSOR_MAX_BODY_BYTES", d.max_body_bytes)?,
            retry_after_secs: parse_or(&get, "SENSOR_RETRY_AFTER_SECS", d.retry_after_secs)?,
            log_level: get("SENSOR_LOG_LEVEL").unwrap_or(d.log_level),
            log_json,
        };

        for (name, value) in [
            ("SENSOR_BUFFER_CAPACITY", config.buffer_capacity),
            ("SENSOR_BATCH_SIZE", config.batch_size),
            ("SENSOR_FLUSH_INTERVAL_MS", config.flush_interval.as_millis() as usize),
            ("SENSOR_MAX_DEVICE_ID_LEN", config.max_device_id_len),
            ("SENSOR_MAX_BODY_BYTES", config.max_body_bytes),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        Ok(config)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_device_id_len: self.max_device_id_len,
            ..Limits::default()
        }
    }

    pub fn writer(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            retry: RetryPolicy {
                max_retries: self.write_retries,
                initial_backoff: self.retry_backoff,
                max_backoff: MAX_RETRY_BACKOFF,
                backoff_multiplier: 2.0,
            },
        }
    }
}

fn parse_or<T>(get: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("Invalid {key} value {v:?}: {e}")),
    }
}
