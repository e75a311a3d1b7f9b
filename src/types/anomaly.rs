//! Anomaly events: detector output and fast-path enrichment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::TrackingId;

/// Coarse category of the signal source.
///
/// Assigned by the detector and never changed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    System,
    Network,
    Comms,
    Application,
    Security,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::System,
        Domain::Network,
        Domain::Comms,
        Domain::Application,
        Domain::Security,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Domain::System => "system",
            Domain::Network => "network",
            Domain::Comms => "comms",
            Domain::Application => "application",
            Domain::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Domain::System),
            "network" => Some(Domain::Network),
            "comms" | "communications" => Some(Domain::Comms),
            "application" => Some(Domain::Application),
            "security" => Some(Domain::Security),
            _ => None,
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident/anomaly severity. Variant order defines the escalation order:
/// `Low < Med < High < Crit` (derive(Ord) relies on declaration order).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Med,
    High,
    Crit,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Med => "med",
            Severity::High => "high",
            Severity::Crit => "crit",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed anomaly emitted by the detector on `anomaly.detected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyDetected {
    pub tracking_id: TrackingId,
    pub ts: DateTime<Utc>,
    pub ship_id: String,
    pub domain: Domain,
    pub anomaly_type: String,
    /// Name of the detector that emitted this anomaly.
    pub detector: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Confidence in [0, 1], monotonic w.r.t. anomaly strength.
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Pointer to the durable log row this anomaly was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    /// True when the tracking id was minted at ingress.
    #[serde(default)]
    pub synthetic: bool,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, Value>,
}

/// Similar-anomaly counters queried by the fast enricher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyContext {
    pub similar_count_1h: u32,
    pub similar_count_24h: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_incident_ts: Option<DateTime<Utc>>,
}

/// Device registry row attached to enriched anomalies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub ship_id: String,
    pub device_id: String,
    pub device_type: String,
    pub vendor: String,
    pub model: String,
    pub criticality: String,
}

/// Aggregated 24h failure statistics for a `(ship_id, domain)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureRates {
    pub count: u64,
    pub count_by_severity: BTreeMap<String, u64>,
    pub avg_score: f64,
}

/// Compact reference to a historical anomaly in the columnar store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarAnomaly {
    pub ts: DateTime<Utc>,
    pub anomaly_type: String,
    pub score: f64,
    pub severity: Severity,
    pub tracking_id: String,
}

/// Compact reference to a recent incident in the columnar store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentIncident {
    pub incident_id: String,
    pub created_at: DateTime<Utc>,
    pub incident_type: String,
    pub severity: Severity,
    pub status: String,
}

/// Historical context attached by the fast enricher. Every member is
/// best-effort: a query that misses its latency budget leaves its slot empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_metadata: Option<DeviceMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_failure_rates: Option<FailureRates>,
    #[serde(default)]
    pub similar_anomalies: Vec<SimilarAnomaly>,
    #[serde(default)]
    pub recent_incidents: Vec<RecentIncident>,
    /// True when the store was unreachable and context is score-only.
    #[serde(default)]
    pub degraded: bool,
}

/// Anomaly decorated with historical context, published on `anomaly.enriched`.
///
/// The embedded [`AnomalyDetected`] is carried verbatim — enrichment never
/// rewrites the detector's fields (in particular it never downgrades `score`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEnriched {
    #[serde(flatten)]
    pub anomaly: AnomalyDetected,
    pub severity: Severity,
    pub context: AnomalyContext,
    pub meta: EnrichmentMeta,
    pub enrichment_latency_ms: u64,
}
