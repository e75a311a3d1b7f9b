//! In-memory columnar store.
//!
//! Backs tests and single-node deployments (`TIDEWATCH_STORE_URL=memory://`).
//! Also carries failure-injection knobs so the enricher's degraded mode and
//! budget handling can be exercised without a network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    AnomalyRow, ColumnStore, IncidentRow, LlmCacheRow, StageEvent, StoreError,
};
use crate::types::{DeviceMetadata, Domain, FailureRates, RecentIncident, SimilarAnomaly};

#[derive(Default)]
struct Tables {
    anomalies: Vec<AnomalyRow>,
    incidents: Vec<IncidentRow>,
    devices: Vec<DeviceMetadata>,
    llm_cache: BTreeMap<String, LlmCacheRow>,
    stage_trace: Vec<StageEvent>,
}

/// Process-local store with the same contract as the HTTP client.
#[derive(Default)]
pub struct MemoryColumnStore {
    tables: Mutex<Tables>,
    /// When set, every query fails as unreachable.
    fail_all: AtomicBool,
    /// When set, every query sleeps this long before answering.
    query_delay: Mutex<Option<Duration>>,
}

impl MemoryColumnStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Preload a device registry row (tests, backfill tooling).
    pub fn seed_device(&self, device: DeviceMetadata) {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .devices
            .push(device);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_all.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn anomaly_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .anomalies
            .len()
    }

    pub fn incident_row_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .incidents
            .len()
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let delay = *self.query_delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.gate().await
    }

    async fn insert_anomaly(&self, row: AnomalyRow) -> Result<(), StoreError> {
        self.gate().await?;
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .anomalies
            .push(row);
        Ok(())
    }

    async fn device_metadata(
        &self,
        ship_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceMetadata>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tables
            .devices
            .iter()
            .find(|d| d.ship_id == ship_id && d.device_id == device_id)
            .cloned())
    }

    async fn failure_rates(
        &self,
        ship_id: &str,
        domain: Domain,
        since: DateTime<Utc>,
    ) -> Result<FailureRates, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let mut rates = FailureRates::default();
        let mut score_sum = 0.0;
        for row in tables
            .anomalies
            .iter()
            .filter(|a| a.ship_id == ship_id && a.domain == domain && a.ts >= since)
        {
            rates.count += 1;
            score_sum += row.score;
            if let Some(sev) = row.severity {
                *rates
                    .count_by_severity
                    .entry(sev.as_str().to_string())
                    .or_default() += 1;
            }
        }
        if rates.count > 0 {
            rates.avg_score = score_sum / rates.count as f64;
        }
        Ok(rates)
    }

    async fn similar_anomalies(
        &self,
        ship_id: &str,
        domain: Domain,
        anomaly_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SimilarAnomaly>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let mut matches: Vec<&AnomalyRow> = tables
            .anomalies
            .iter()
            .filter(|a| {
                a.ship_id == ship_id
                    && a.domain == domain
                    && a.anomaly_type == anomaly_type
                    && a.ts >= since
            })
            .collect();
        matches.sort_by_key(|a| std::cmp::Reverse(a.ts));
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|a| SimilarAnomaly {
                ts: a.ts,
                anomaly_type: a.anomaly_type.clone(),
                score: a.score,
                severity: a.severity.unwrap_or_default(),
                tracking_id: a.tracking_id.clone(),
            })
            .collect())
    }

    async fn recent_incidents(
        &self,
        ship_id: &str,
        domain: Domain,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecentIncident>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let mut latest = latest_per_incident(&tables.incidents);
        latest.retain(|r| r.ship_id == ship_id && r.domain == domain && r.created_at >= since);
        latest.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(latest
            .into_iter()
            .take(limit)
            .map(|r| RecentIncident {
                incident_id: r.incident_id.clone(),
                created_at: r.created_at,
                incident_type: r.incident_type.clone(),
                severity: r.severity,
                status: r.status.clone(),
            })
            .collect())
    }

    async fn insert_incident(&self, row: IncidentRow) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        // Append-only with idempotent key: replaying the same
        // (incident_id, updated_at) is a no-op.
        let duplicate = tables
            .incidents
            .iter()
            .any(|r| r.incident_id == row.incident_id && r.updated_at == row.updated_at);
        if !duplicate {
            tables.incidents.push(row);
        }
        Ok(())
    }

    async fn incident_latest(&self, incident_id: &str) -> Result<Option<IncidentRow>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tables
            .incidents
            .iter()
            .filter(|r| r.incident_id == incident_id)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn incidents_since(&self, since: DateTime<Utc>) -> Result<Vec<IncidentRow>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let mut latest = latest_per_incident(&tables.incidents);
        latest.retain(|r| r.created_at >= since);
        Ok(latest)
    }

    async fn cache_get(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LlmCacheRow>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tables
            .llm_cache
            .get(cache_key)
            .filter(|row| row.is_fresh(now))
            .cloned())
    }

    async fn cache_put(&self, row: LlmCacheRow) -> Result<(), StoreError> {
        self.gate().await?;
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .llm_cache
            .insert(row.cache_key.clone(), row);
        Ok(())
    }

    async fn record_stage(&self, event: StageEvent) -> Result<(), StoreError> {
        self.gate().await?;
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .stage_trace
            .push(event);
        Ok(())
    }

    async fn trace(&self, tracking_id: &str) -> Result<Vec<StageEvent>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let mut events: Vec<StageEvent> = tables
            .stage_trace
            .iter()
            .filter(|e| e.tracking_id == tracking_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.ts);
        Ok(events)
    }
}

fn latest_per_incident(rows: &[IncidentRow]) -> Vec<IncidentRow> {
    let mut latest: BTreeMap<&str, &IncidentRow> = BTreeMap::new();
    for row in rows {
        match latest.get(row.incident_id.as_str()) {
            Some(existing) if existing.updated_at >= row.updated_at => {}
            _ => {
                latest.insert(row.incident_id.as_str(), row);
            }
        }
    }
    latest.into_values().cloned().collect()
}
