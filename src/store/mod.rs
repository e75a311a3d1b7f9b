//! Columnar store interface.
//!
//! The storage engine itself is an external collaborator; this module owns
//! the typed rows, the query surface the pipeline needs, and two
//! implementations: an HTTP client for a real engine and an in-memory store
//! for tests and single-node operation.
//!
//! All write paths go through typed row structs. All queries are
//! parameterized — the HTTP layer only accepts `'static` SQL templates with
//! bound parameters, so a query assembled by string interpolation has no
//! way in.

mod http;
mod memory;

pub use http::HttpColumnStore;
pub use memory::MemoryColumnStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{
    DeviceMetadata, Domain, FailureRates, RecentIncident, Severity, SimilarAnomaly, Stage,
};

/// Additive schema version stamped on every written row.
pub const ROW_SCHEMA_VERSION: u32 = 1;

pub type SharedStore = Arc<dyn ColumnStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("query timed out")]
    Timeout,
    #[error("query failed: {0}")]
    Query(String),
    #[error("row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("schema mismatch: {0}")]
    Schema(String),
}

// ============================================================================
// Typed rows
// ============================================================================

/// Row in the `anomalies` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub ts: DateTime<Utc>,
    pub ship_id: String,
    pub domain: Domain,
    pub anomaly_type: String,
    pub score: f64,
    pub severity: Option<Severity>,
    pub service: String,
    pub device_id: Option<String>,
    pub metric_name: Option<String>,
    pub metric_value: Option<f64>,
    pub tracking_id: String,
    pub schema_version: u32,
}

/// Row in the append-only `incidents` table. Updates are new rows keyed by
/// `(incident_id, updated_at)`; the current view is the latest row per id.
/// `domain` is an additive column over the minimum schema, needed by the
/// recent-incident context query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRow {
    pub created_at: DateTime<Utc>,
    pub incident_id: String,
    pub ship_id: String,
    pub domain: Domain,
    pub incident_type: String,
    pub severity: Severity,
    pub status: String,
    pub member_anomaly_ids: Vec<String>,
    pub timeline_json: String,
    pub tracking_id: String,
    pub updated_at: DateTime<Utc>,
    /// AI enrichment payload, present on rows written from
    /// `incidents.enriched` (additive column).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_json: Option<String>,
    pub schema_version: u32,
}

/// Row in the `llm_cache` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCacheRow {
    pub cache_key: String,
    pub response_json: String,
    pub created_at: DateTime<Utc>,
    pub ttl_sec: u64,
}

impl LlmCacheRow {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at).num_seconds() < self.ttl_sec as i64
    }
}

/// Per-stage emission record in the `stage_trace` table; the trace endpoint
/// reconstructs end-to-end timing from these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub tracking_id: String,
    pub stage: Stage,
    pub ts: DateTime<Utc>,
    pub latency_ms: u64,
    pub status: String,
}

// ============================================================================
// Query surface
// ============================================================================

/// Everything the pipeline asks of the columnar store. Implementations must
/// answer every method with bound parameters only.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Liveness probe used by the startup dependency check and `/health`.
    async fn ping(&self) -> Result<(), StoreError>;

    // --- anomalies -----------------------------------------------------

    async fn insert_anomaly(&self, row: AnomalyRow) -> Result<(), StoreError>;

    /// One-row device lookup by `(ship_id, device_id)`.
    async fn device_metadata(
        &self,
        ship_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceMetadata>, StoreError>;

    /// Aggregate failure statistics for `(ship_id, domain)` since `since`.
    async fn failure_rates(
        &self,
        ship_id: &str,
        domain: Domain,
        since: DateTime<Utc>,
    ) -> Result<FailureRates, StoreError>;

    /// Most recent anomalies matching `(ship_id, domain, anomaly_type)`.
    async fn similar_anomalies(
        &self,
        ship_id: &str,
        domain: Domain,
        anomaly_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SimilarAnomaly>, StoreError>;

    /// Most recent incidents for `(ship_id, domain)`.
    async fn recent_incidents(
        &self,
        ship_id: &str,
        domain: Domain,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecentIncident>, StoreError>;

    // --- incidents -----------------------------------------------------

    /// Append an incident row. Idempotent on `(incident_id, updated_at)`:
    /// re-inserting the same key is a no-op, not an error.
    async fn insert_incident(&self, row: IncidentRow) -> Result<(), StoreError>;

    /// Latest row for an incident id, or `None`.
    async fn incident_latest(&self, incident_id: &str) -> Result<Option<IncidentRow>, StoreError>;

    /// Latest row per incident id with `created_at >= since`.
    async fn incidents_since(&self, since: DateTime<Utc>) -> Result<Vec<IncidentRow>, StoreError>;

    // --- llm cache -----------------------------------------------------

    /// Fresh cache row for a key, if any. Expired rows are not returned.
    async fn cache_get(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LlmCacheRow>, StoreError>;

    async fn cache_put(&self, row: LlmCacheRow) -> Result<(), StoreError>;

    // --- stage trace ---------------------------------------------------

    async fn record_stage(&self, event: StageEvent) -> Result<(), StoreError>;

    /// All stage records for a tracking id, ordered by timestamp.
    async fn trace(&self, tracking_id: &str) -> Result<Vec<StageEvent>, StoreError>;
}

/// Best-effort stage-trace write: trace loss must never fail a stage.
pub async fn record_stage_best_effort(
    store: &dyn ColumnStore,
    tracking_id: &str,
    stage: Stage,
    ts: DateTime<Utc>,
    latency_ms: u64,
    status: &str,
) {
    let event = StageEvent {
        tracking_id: tracking_id.to_string(),
        stage,
        ts,
        latency_ms,
        status: status.to_string(),
    };
    if let Err(e) = store.record_stage(event).await {
        tracing::debug!(stage = %stage, error = %e, "Stage trace write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_row_freshness() {
        let created: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let row = LlmCacheRow {
            cache_key: "k".to_string(),
            response_json: "{}".to_string(),
            created_at: created,
            ttl_sec: 3600,
        };
        assert!(row.is_fresh(created + chrono::Duration::minutes(59)));
        assert!(!row.is_fresh(created + chrono::Duration::minutes(61)));
    }
}
