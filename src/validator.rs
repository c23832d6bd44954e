// Schema checks for decoded readings and sequence stamping.
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::reading::{CheckedReading, SensorReading, ValidatedReading};

pub const DEFAULT_MAX_DEVICE_ID_LEN: usize = 128;
pub const DEFAULT_MAX_METRIC_LEN: usize = 128;
pub const DEFAULT_MAX_UNIT_LEN: usize = 32;

/// Length bounds, counted in chars.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_device_id_len: usize,
    pub max_metric_len: usize,
    pub max_unit_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_device_id_len: DEFAULT_MAX_DEVICE_ID_LEN,
            max_metric_len: DEFAULT_MAX_METRIC_LEN,
            max_unit_len: DEFAULT_MAX_UNIT_LEN,
        }
    }
}

/// Process-wide monotonic sequence source. Owned by the validator and
/// seeded at startup from the highest sequence found in the durable logs.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// The first number handed out will be `last + 1`. `None` when `last`
    /// is already the largest representable sequence number.
    pub fn starting_after(last: u64) -> Option<Self> {
        let next = last.checked_add(1)?;
        Some(Self {
            next: AtomicU64::new(next),
        })
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The number the next call to `next` will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Validator {
    limits: Limits,
    sequence: SequenceCounter,
}

impl Validator {
    pub fn new(limits: Limits, sequence: SequenceCounter) -> Self {
        Self { limits, sequence }
    }

    /// Check a reading and stamp it with the next sequence number.
    pub fn validate(
        &self,
        reading: SensorReading,
        arrived_at: DateTime<Utc>,
    ) -> Result<ValidatedReading, ValidationError> {
        let checked = self.check(reading)?;
        Ok(self.stamp(checked, arrived_at))
    }

    /// Field checks only; consumes no sequence number.
    pub fn check(&self, reading: SensorReading) -> Result<CheckedReading, ValidationError> {
        let device_id =
            non_blank(reading.device_id).ok_or(ValidationError::MissingField("device_id"))?;
        let metric = non_blank(reading.metric).ok_or(ValidationError::MissingField("metric"))?;
        let value = reading.value.ok_or(ValidationError::MissingField("value"))?;

        bounded("device_id", &device_id, self.limits.max_device_id_len)?;
        bounded("metric", &metric, self.limits.max_metric_len)?;
        let unit = non_blank(reading.unit);
        if let Some(unit) = &unit {
            bounded("unit", unit, self.limits.max_unit_len)?;
        }

        if !value.is_finite() {
            return Err(ValidationError::OutOfRange {
                field: "value",
                value,
            });
        }

        Ok(CheckedReading {
            device_id,
            metric,
            value,
            unit,
            timestamp: reading.timestamp,
        })
    }

    /// Assign the next sequence number and the receipt time.
    pub fn stamp(&self, checked: CheckedReading, arrived_at: DateTime<Utc>) -> ValidatedReading {
        ValidatedReading {
            seq: self.sequence.next(),
            device_id: checked.device_id,
            metric: checked.metric,
            value: checked.value,
            unit: checked.unit,
            timestamp: checked.timestamp.unwrap_or(arrived_at),
            received_at: Utc::now(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn next_seq(&self) -> u64 {
        self.sequence.peek()
    }
}

fn non_blank(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.trim().is_empty())
}

fn bounded(field: &'static str, s: &str, max: usize) -> Result<(), ValidationError> {
    let len = s.chars().count();
    if len > max {
        return Err(ValidationError::FieldTooLong { field, len, max });
    }
    Ok(())
}
