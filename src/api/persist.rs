//! Bus-side persistence for the incident API.
//!
//! Subscribes `incidents.created` and `incidents.enriched` and writes
//! append-only rows keyed `(incident_id, updated_at)`. Enriched rows use a
//! deterministic `updated_at` derived from the enrichment version, so a
//! replayed publication maps onto the same row key and persists nothing new.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{subjects, ErrorEnvelope, SharedBus};
use crate::clock::SharedClock;
use crate::metrics;
use crate::store::{
    record_stage_best_effort, ColumnStore, IncidentRow, SharedStore, StoreError,
    ROW_SCHEMA_VERSION,
};
use crate::types::{IncidentCreated, IncidentEnriched, Stage};

/// Storage write retry schedule: 3 attempts, exponential.
const STORE_ATTEMPTS: u32 = 3;
const STORE_BASE_DELAY: Duration = Duration::from_millis(100);

pub struct IncidentPersister {
    bus: SharedBus,
    store: SharedStore,
    clock: SharedClock,
}

impl IncidentPersister {
    pub fn new(bus: SharedBus, store: SharedStore, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self { bus, store, clock })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Incident persister starting");
        let mut created = self.bus.subscribe(subjects::INCIDENTS_CREATED);
        let mut enriched = self.bus.subscribe(subjects::INCIDENTS_ENRICHED);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = created.recv() => match maybe {
                    Some(payload) => self.persist_created(&payload).await,
                    None => break,
                },
                maybe = enriched.recv() => match maybe {
                    Some(payload) => self.persist_enriched(&payload).await,
                    None => break,
                },
            }
        }
        info!("Incident persister stopped");
    }

    async fn persist_created(&self, payload: &[u8]) {
        let started = std::time::Instant::now();
        let incident: IncidentCreated = match serde_json::from_slice(payload) {
            Ok(incident) => incident,
            Err(e) => {
                metrics::inc("incident_api.drops");
                warn!(error = %e, "Malformed incident dropped");
                return;
            }
        };

        let row = row_from_created(&incident);
        match store_with_retry(self.store.as_ref(), row).await {
            Ok(()) => {
                metrics::inc("incident_api.incidents_persisted");
                let latency_ms = started.elapsed().as_millis() as u64;
                record_stage_best_effort(
                    self.store.as_ref(),
                    incident.tracking_id.as_str(),
                    Stage::Persist,
                    self.clock.now(),
                    latency_ms,
                    "ok",
                )
                .await;
            }
            Err(e) => {
                self.dead_letter(subjects::INCIDENTS_CREATED, payload, &e).await;
            }
        }
    }

    async fn persist_enriched(&self, payload: &[u8]) {
        let enriched: IncidentEnriched = match serde_json::from_slice(payload) {
            Ok(enriched) => enriched,
            Err(e) => {
                metrics::inc("incident_api.drops");
                warn!(error = %e, "Malformed enriched incident dropped");
                return;
            }
        };

        let row = row_from_enriched(&enriched);
        if let Err(e) = store_with_retry(self.store.as_ref(), row).await {
            self.dead_letter(subjects::INCIDENTS_ENRICHED, payload, &e).await;
        }
    }

    async fn dead_letter(&self, subject: &str, payload: &[u8], error: &StoreError) {
        metrics::inc("incident_api.dlq_published");
        warn!(subject = subject, error = %error, "Persist failed, dead-lettering");

        let envelope = ErrorEnvelope {
            stage: "incident_api".to_string(),
            subject: subject.to_string(),
            error: error.to_string(),
            ts: self.clock.now(),
            payload: serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null),
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            if let Err(e) = self.bus.publish(&subjects::dlq("incident_api"), bytes).await {
                tracing::error!(error = %e, "Dead-letter publish failed, event lost");
            }
        }
    }
}

/// Build the initial append-only row for a created incident.
pub(crate) fn row_from_created(incident: &IncidentCreated) -> IncidentRow {
    IncidentRow {
        created_at: incident.created_at,
        incident_id: incident.incident_id.to_string(),
        ship_id: incident.ship_id.clone(),
        domain: domain_of(incident),
        incident_type: incident.incident_type.clone(),
        severity: incident.severity,
        status: incident.status.as_str().to_string(),
        member_anomaly_ids: incident
            .member_anomaly_ids
            .iter()
            .map(|id| id.as_str().to_string())
            .collect(),
        timeline_json: serde_json::to_string(&incident.timeline).unwrap_or_else(|_| "[]".to_string()),
        tracking_id: incident.tracking_id.as_str().to_string(),
        updated_at: incident.created_at,
        ai_json: None,
        schema_version: ROW_SCHEMA_VERSION,
    }
}

fn row_from_enriched(enriched: &IncidentEnriched) -> IncidentRow {
    let mut row = row_from_created(&enriched.incident);
    // Deterministic update key: replaying the same (incident, version)
    // publication lands on the same row.
    row.updated_at = enriched.incident.created_at
        + ChronoDuration::milliseconds(i64::from(enriched.enrichment_version));
    row.ai_json = serde_json::to_string(&enriched.ai).ok();
    row
}

/// Domain is recoverable from the correlation keys; `system` is the
/// documented default when absent (backfilled incidents).
fn domain_of(incident: &IncidentCreated) -> crate::types::Domain {
    incident
        .correlation_keys
        .iter()
        .find_map(|key| key.strip_prefix("domain="))
        .and_then(crate::types::Domain::parse)
        .unwrap_or(crate::types::Domain::System)
}

/// Write a row with bounded exponential retry.
pub(crate) async fn store_with_retry(
    store: &dyn ColumnStore,
    row: IncidentRow,
) -> Result<(), StoreError> {
    let mut last_err = None;
    for attempt in 0..STORE_ATTEMPTS {
        match store.insert_incident(row.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "Incident row write failed");
                last_err = Some(e);
                if attempt + 1 < STORE_ATTEMPTS {
                    tokio::time::sleep(STORE_BASE_DELAY * 2u32.saturating_pow(attempt)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(StoreError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use crate::clock::ManualClock;
    use crate::store::MemoryColumnStore;
    use crate::types::{
        AiInsight, Confidence, IncidentStatus, ScopeEntry, Severity, SuppressKey, TrackingId,
    };

    fn incident() -> IncidentCreated {
        IncidentCreated {
            incident_id: uuid::Uuid::new_v4(),
            created_at: "2026-03-01T12:00:00Z".parse().unwrap(),
            ship_id: "mv-aurora".to_string(),
            incident_type: "cpu_pressure".to_string(),
            severity: Severity::High,
            scope: vec![ScopeEntry {
                device_id: None,
                service: "cpu-monitor".to_string(),
            }],
            correlation_keys: vec!["ship_id=mv-aurora".to_string(), "domain=system".to_string()],
            suppress_key: SuppressKey::derive(
                "mv-aurora", "system", "cpu-monitor", "cpu_pressure", None, "high",
            ),
            member_anomaly_ids: vec![TrackingId::from_wire("a-1").unwrap()],
            evidence_refs: Vec::new(),
            timeline: Vec::new(),
            status: IncidentStatus::Open,
            tracking_id: TrackingId::from_wire("a-1").unwrap(),
            extensions: serde_json::Map::new(),
        }
    }

    fn enriched(incident: IncidentCreated) -> IncidentEnriched {
        IncidentEnriched {
            incident,
            ai: AiInsight {
                root_cause: "load".to_string(),
                remediation_steps: vec!["inspect".to_string()],
                similar_incidents: Vec::new(),
            },
            cache_hit: false,
            processing_time_ms: 800,
            confidence: Confidence::Med,
            enrichment_version: 1,
        }
    }

    #[tokio::test]
    async fn test_replay_persists_no_extra_rows() {
        let bus = MemoryBus::new();
        let store = MemoryColumnStore::new();
        let clock = ManualClock::new("2026-03-01T12:00:05Z".parse().unwrap());
        let persister = IncidentPersister::new(bus, Arc::clone(&store) as SharedStore, clock);

        let event = incident();
        let payload = serde_json::to_vec(&event).unwrap();
        persister.persist_created(&payload).await;
        persister.persist_created(&payload).await;
        assert_eq!(store.incident_row_count(), 1);

        let enriched_payload = serde_json::to_vec(&enriched(event)).unwrap();
        persister.persist_enriched(&enriched_payload).await;
        persister.persist_enriched(&enriched_payload).await;
        // One created row plus one enriched row, replays deduplicated by
        // the (incident_id, updated_at) key.
        assert_eq!(store.incident_row_count(), 2);
    }

    #[tokio::test]
    async fn test_persist_failure_dead_letters() {
        let bus = MemoryBus::new();
        let mut dlq = bus.subscribe("dlq.incident_api");
        let store = MemoryColumnStore::new();
        store.set_unreachable(true);
        let clock = ManualClock::new("2026-03-01T12:00:05Z".parse().unwrap());
        let persister = IncidentPersister::new(bus, Arc::clone(&store) as SharedStore, clock);

        let payload = serde_json::to_vec(&incident()).unwrap();
        persister.persist_created(&payload).await;

        let letter = tokio::time::timeout(Duration::from_secs(1), dlq.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: ErrorEnvelope = serde_json::from_slice(&letter).unwrap();
        assert_eq!(envelope.stage, "incident_api");
    }

    #[test]
    fn test_enriched_row_key_is_deterministic() {
        let event = enriched(incident());
        let a = row_from_enriched(&event);
        let b = row_from_enriched(&event);
        assert_eq!(a.updated_at, b.updated_at);
        assert!(a.updated_at > a.created_at);
        assert!(a.ai_json.is_some());
    }
}
