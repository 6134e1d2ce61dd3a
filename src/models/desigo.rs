//! Wire models for the measurement source and the cloud ingest endpoint.
//!
//! Notes
//! - A property read returns a JSON array; the first element carries the sample
//!   nested under `Value`.
//! - `Value` and `Quality` arrive as strings on most installations but numbers
//!   have been observed too, so both are accepted and stored as text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl Scalar {
    pub fn into_text(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Number(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyValue {
    pub value: Scalar,
    pub quality: Scalar,
    pub quality_good: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PropertySample {
    #[serde(rename = "Value")]
    pub value: Option<PropertyValue>,
}

/// Validated current value of one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReading {
    pub value: String,
    pub quality: String,
    pub quality_good: bool,
    pub timestamp: DateTime<Utc>,
}

impl SourceReading {
    /// Take the first sample of a property read, if it has the expected shape.
    pub fn from_samples(samples: Vec<PropertySample>) -> Option<Self> {
        let PropertyValue {
            value,
            quality,
            quality_good,
            timestamp,
        } = samples.into_iter().next()?.value?;
        Some(SourceReading {
            value: value.into_text(),
            quality: quality.into_text(),
            quality_good,
            timestamp,
        })
    }
}

/// One buffered row as the ingest endpoint expects it; `sensor_id` is the bank id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestRow {
    pub id: i64,
    pub sensor_id: i64,
    pub value: String,
    pub quality: String,
    pub quality_good: bool,
    pub timestamp: DateTime<Utc>,
    pub sent_to_cloud: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBatch {
    pub company_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsite_id: Option<i64>,
    pub sensor_id: i64,
    /// Stable for a given set of rows so the receiver can drop replays.
    pub batch_id: String,
    pub batch: Vec<IngestRow>,
}
