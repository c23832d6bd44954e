// Request body decoding. Devices post either JSON or form-encoded fields;
// when they don't say which, JSON is tried first and form encoding second.
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::reading::{RawRequest, SensorReading};

const NAIVE_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    Form,
    Unknown,
}

impl BodyKind {
    fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(ct) = content_type else {
            return BodyKind::Unknown;
        };
        // Drop parameters such as `; charset=utf-8`.
        let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if mime == "application/json" || mime.ends_with("+json") {
            BodyKind::Json
        } else if mime == "application/x-www-form-urlencoded" {
            BodyKind::Form
        } else {
            BodyKind::Unknown
        }
    }
}

/// Turn a raw request body into a `SensorReading`. Pure: no logging, no I/O.
pub fn decode(raw: &RawRequest) -> Result<SensorReading, DecodeError> {
    let payload = raw.payload.as_ref();
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    match BodyKind::from_content_type(raw.content_type.as_deref()) {
        BodyKind::Json => decode_json(payload),
        BodyKind::Form => decode_form(payload),
        BodyKind::Unknown => match decode_json(payload) {
            Err(DecodeError::Malformed(json_err)) => decode_form(payload).map_err(|e| match e {
                DecodeError::Malformed(form_err) => DecodeError::Malformed(format!(
                    "neither JSON ({json_err}) nor form data ({form_err})"
                )),
                other => other,
            }),
            other => other,
        },
    }
}

fn decode_json(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            return decode_json_overflow(payload)
                .ok_or_else(|| DecodeError::Malformed(e.to_string()));
        }
    };

    let obj = match value {
        Value::Object(obj) => obj,
        Value::Null => return Err(DecodeError::Empty),
        other => {
            return Err(DecodeError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )));
        }
    };
    if obj.is_empty() {
        return Err(DecodeError::Empty);
    }
    reading_from_object(&obj)
}

// serde_json refuses numbers outside the f64 range. When that is the only
// problem with the body and the number is `value`, decode it as infinity,
// the same as the form decoder does, so the validator reports it as out of
// range.
fn decode_json_overflow(payload: &[u8]) -> Option<SensorReading> {
    let mut fields: BTreeMap<String, Box<RawValue>> = serde_json::from_slice(payload).ok()?;
    let value = fields
        .remove("value")?
        .get()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_infinite())?;

    let mut obj = Map::new();
    for (key, raw) in fields {
        obj.insert(key, serde_json::from_str(raw.get()).ok()?);
    }
    let reading = reading_from_object(&obj).ok()?;
    Some(SensorReading {
        value: Some(value),
        ..reading
    })
}

fn reading_from_object(obj: &Map<String, Value>) -> Result<SensorReading, DecodeError> {
    Ok(SensorReading {
        device_id: json_device_id(obj)?,
        metric: json_string(obj, "metric")?,
        value: json_value(obj)?,
        unit: json_string(obj, "unit")?,
        timestamp: json_string(obj, "timestamp")?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}

// Device firmware often sends numeric ids; keep their decimal text.
fn json_device_id(obj: &Map<String, Value>) -> Result<Option<String>, DecodeError> {
    match obj.get("device_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(wrong_type("device_id", "a string or number", other)),
    }
}

fn json_string(obj: &Map<String, Value>, field: &str) -> Result<Option<String>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(wrong_type(field, "a string", other)),
    }
}

fn json_value(obj: &Map<String, Value>) -> Result<Option<f64>, DecodeError> {
    match obj.get("value") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| DecodeError::Malformed(format!("value {n} is not representable"))),
        Some(Value::String(s)) => parse_number(s).map(Some),
        Some(other) => Err(wrong_type("value", "a number", other)),
    }
}

fn wrong_type(field: &str, expected: &str, got: &Value) -> DecodeError {
    DecodeError::Malformed(format!(
        "field {field} must be {expected}, got {}",
        json_kind(got)
    ))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn decode_form(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DecodeError::Malformed("form body is not valid UTF-8".to_string()))?;
    // `serde_urlencoded` accepts almost anything; require key=value pairs so
    // arbitrary text is not mistaken for a form with one empty field.
    if let Some(bad) = text
        .trim()
        .split('&')
        .find(|segment| !segment.is_empty() && !segment.contains('='))
    {
        return Err(DecodeError::Malformed(format!(
            "form segment {bad:?} is not a key=value pair"
        )));
    }

    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(text.trim())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if pairs.is_empty() {
        return Err(DecodeError::Empty);
    }

    // First occurrence of a repeated key wins.
    let field = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    Ok(SensorReading {
        device_id: field("device_id"),
        metric: field("metric"),
        value: field("value").map(|v| parse_number(&v)).transpose()?,
        unit: field("unit"),
        timestamp: field("timestamp")
            .map(|t| parse_timestamp(&t))
            .transpose()?,
    })
}

// `f64::from_str` accepts "NaN" and "inf"; those decode fine and are
// rejected later as out of range rather than as malformed.
fn parse_number(s: &str) -> Result<f64, DecodeError> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| DecodeError::Malformed(format!("value {s:?} is not a number")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NAIVE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|ndt| ndt.and_utc())
        .ok_or_else(|| DecodeError::Malformed(format!("timestamp {s:?} is not ISO-8601")))
}
