//! Incident events: correlator output and insight-path enrichment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Severity, SuppressKey, TrackingId};

/// Incident lifecycle. Transitions are monotonic:
/// `open → ack → resolved | suppressed`, and `open → resolved | suppressed`
/// directly. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    #[default]
    Open,
    Ack,
    Resolved,
    Suppressed,
}

impl IncidentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Ack => "ack",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IncidentStatus::Open),
            "ack" => Some(IncidentStatus::Ack),
            "resolved" => Some(IncidentStatus::Resolved),
            "suppressed" => Some(IncidentStatus::Suppressed),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Open, Ack) | (Open, Resolved) | (Open, Suppressed) | (Ack, Resolved) | (Ack, Suppressed)
        )
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(device, service)` pair affected by an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub service: String,
}

/// One entry in an incident's event timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub source: String,
    pub description: String,
}

/// Correlated incident published on `incidents.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentCreated {
    pub incident_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub ship_id: String,
    pub incident_type: String,
    pub severity: Severity,
    pub scope: Vec<ScopeEntry>,
    pub correlation_keys: Vec<String>,
    pub suppress_key: SuppressKey,
    /// Tracking ids of the member anomalies. Members are stored as id
    /// references only; resolving them is a store query, never a pointer
    /// graph back into the anomaly objects.
    pub member_anomaly_ids: Vec<TrackingId>,
    pub evidence_refs: Vec<String>,
    pub timeline: Vec<TimelineEntry>,
    pub status: IncidentStatus,
    /// Tracking id of the anomaly whose arrival fired the window.
    pub tracking_id: TrackingId,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, Value>,
}

/// Confidence grade of an AI enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Med,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Confidence::Low => "low",
            Confidence::Med => "med",
            Confidence::High => "high",
        })
    }
}

/// Similar past incident retrieved from the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarIncident {
    pub incident_id: String,
    pub similarity_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// AI-generated payload of an enriched incident.
///
/// On any LLM/vector failure this is populated by the rule-based fallback
/// and the enclosing event carries `confidence = "low"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiInsight {
    pub root_cause: String,
    pub remediation_steps: Vec<String>,
    pub similar_incidents: Vec<SimilarIncident>,
}

/// Incident with AI narrative, published on `incidents.enriched`.
///
/// Publication is idempotent on `(incident_id, enrichment_version)`;
/// downstream consumers must tolerate duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentEnriched {
    #[serde(flatten)]
    pub incident: IncidentCreated,
    pub ai: AiInsight,
    pub cache_hit: bool,
    pub processing_time_ms: u64,
    pub confidence: Confidence,
    pub enrichment_version: u32,
}
