use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single field value as reported by a device.
///
/// Integers and floats are kept apart so a value written as `-52` never
/// comes back as `-52.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

pub type SampleFields = BTreeMap<String, FieldValue>;

/// One normalized, timestamped, device-attributed telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: SampleFields,
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, FieldValue::Text(_))
    }

    /// Coerce a bare token: integer first, then finite float, else text.
    pub fn coerce(token: &str) -> Self {
        if let Ok(v) = token.parse::<i64>() {
            return FieldValue::Integer(v);
        }
        // Rust also accepts "inf"/"NaN"; those stay text
        if token.bytes().any(|b| b.is_ascii_digit()) {
            if let Ok(v) = token.parse::<f64>() {
                if v.is_finite() {
                    return FieldValue::Float(v);
                }
            }
        }
        FieldValue::Text(token.to_string())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl Sample {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, fields: SampleFields) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn numeric(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(FieldValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Human-readable signal quality for an RSSI reading in dBm.
pub fn signal_quality(rssi: f64) -> &'static str {
    if rssi >= -50.0 {
        "Excellent"
    } else if rssi >= -60.0 {
        "Good"
    } else if rssi >= -70.0 {
        "Fair"
    } else if rssi >= -80.0 {
        "Weak"
    } else {
        "Poor"
    }
}
