//! Ingest contract: the raw log record published by the ingestion agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default ship id substituted when a record arrives without one or with a
/// ship unknown to the registry. Never compare an optional ship id directly;
/// substitute first.
pub const UNKNOWN_SHIP: &str = "unknown-ship";

/// Raw log record as received on `logs.anomalous` (read-only contract).
///
/// `tracking_id` and `ship_id` are optional on the wire; the detector
/// validates and substitutes before anything downstream sees the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub tracking_id: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub ship_id: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub severity_hint: Option<String>,
    #[serde(default)]
    pub facility: Option<String>,
    #[serde(default)]
    pub raw_message: String,
    /// Structured fields extracted by the ingestion agent (syslog key-value
    /// pairs, metric samples). Numeric entries feed the statistical detector.
    #[serde(default)]
    pub parsed_fields: BTreeMap<String, Value>,
    /// Unknown top-level fields, preserved and round-tripped.
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, Value>,
}

impl LogRecord {
    /// Numeric parsed fields, in deterministic (sorted) order.
    pub fn numeric_fields(&self) -> impl Iterator<Item = (&str, f64)> {
        self.parsed_fields
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.as_str(), f)))
    }

    /// Optional device identifier, if the ingestion agent extracted one.
    pub fn device_id(&self) -> Option<&str> {
        self.parsed_fields.get("device_id").and_then(Value::as_str)
    }
}
