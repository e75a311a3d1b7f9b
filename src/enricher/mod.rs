//! Fast-path enricher (stage E1).
//!
//! Consumes `anomaly.detected`, decorates each anomaly with historical
//! context from the columnar store and publishes `anomaly.enriched` under a
//! strict latency budget. Context is strictly best-effort: a query that
//! misses its timeout contributes an empty slot and enrichment continues,
//! trading completeness for the fast-path SLO. When the store is entirely
//! unreachable the event still ships, severity computed from score alone
//! and `meta.degraded` set.

mod severity;

pub use severity::severity_for;

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{publish_with_retry, subjects, RetryPolicy, SharedBus};
use crate::clock::SharedClock;
use crate::metrics;
use crate::policy::SharedPolicy;
use crate::store::{
    record_stage_best_effort, AnomalyRow, SharedStore, StoreError, ROW_SCHEMA_VERSION,
};
use crate::types::{
    AnomalyContext, AnomalyDetected, AnomalyEnriched, EnrichmentMeta, Stage,
};
use crate::workers::{default_pool_size, BoundedQueue, DEFAULT_QUEUE_CAPACITY};

pub struct FastEnricher {
    bus: SharedBus,
    store: SharedStore,
    policy: SharedPolicy,
    clock: SharedClock,
}

impl FastEnricher {
    pub fn new(bus: SharedBus, store: SharedStore, policy: SharedPolicy, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            policy,
            clock,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Fast enricher starting");
        let mut sub = self.bus.subscribe(subjects::ANOMALY_DETECTED);
        let queue: Arc<BoundedQueue<Arc<Vec<u8>>>> =
            BoundedQueue::new("enricher", DEFAULT_QUEUE_CAPACITY);

        let mut workers = Vec::new();
        for _ in 0..default_pool_size() {
            let service = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        payload = queue.pop() => service.handle(&payload).await,
                    }
                }
            }));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = sub.recv() => match maybe {
                    Some(payload) => queue.push(payload),
                    None => break,
                },
            }
        }

        for worker in workers {
            worker.abort();
        }
        info!("Fast enricher stopped");
    }

    async fn handle(&self, payload: &[u8]) {
        let anomaly: AnomalyDetected = match serde_json::from_slice(payload) {
            Ok(anomaly) => anomaly,
            Err(e) => {
                metrics::inc("enricher.drops");
                warn!(error = %e, "Malformed anomaly dropped");
                return;
            }
        };

        // Internal invariant: score must be in [0, 1]. A violation is
        // dropped, logged and counted; it never crashes the stage.
        if !(0.0..=1.0).contains(&anomaly.score) {
            metrics::inc("enricher.invariant_violations");
            tracing::error!(
                tracking_id = %anomaly.tracking_id,
                score = anomaly.score,
                "Anomaly score outside [0, 1], dropped"
            );
            return;
        }

        let enriched = self.enrich(anomaly).await;

        if let Err(e) = publish_with_retry(
            self.bus.as_ref(),
            subjects::ANOMALY_ENRICHED,
            &enriched,
            "enricher",
            RetryPolicy::default(),
            self.clock.now(),
        )
        .await
        {
            warn!(
                tracking_id = %enriched.anomaly.tracking_id,
                error = %e,
                "Enriched anomaly publish dead-lettered"
            );
        }

        record_stage_best_effort(
            self.store.as_ref(),
            enriched.anomaly.tracking_id.as_str(),
            Stage::Enrich,
            self.clock.now(),
            enriched.enrichment_latency_ms,
            if enriched.meta.degraded { "degraded" } else { "ok" },
        )
        .await;
    }

    /// Enrich one anomaly. Public for tests and backfill tooling.
    pub async fn enrich(&self, anomaly: AnomalyDetected) -> AnomalyEnriched {
        let started = std::time::Instant::now();
        let policy = self.policy.load();
        let now = self.clock.now();

        let per_query = Duration::from_millis(
            policy
                .slo
                .enrich_query_timeout_ms
                .min(policy.slo.enrich_total_budget_ms),
        );

        let day_ago = now - ChronoDuration::hours(24);
        let week_ago = now - ChronoDuration::days(7);

        // The four context queries run concurrently, each under the
        // per-query timeout, together well inside the total budget.
        let device_query = async {
            match &anomaly.device_id {
                Some(device_id) => {
                    bounded(per_query, self.store.device_metadata(&anomaly.ship_id, device_id)).await
                }
                // No device to look up: an empty slot, not a failure.
                None => Ok(None),
            }
        };
        let rates_query = bounded(
            per_query,
            self.store.failure_rates(&anomaly.ship_id, anomaly.domain, day_ago),
        );
        let similar_query = bounded(
            per_query,
            self.store.similar_anomalies(
                &anomaly.ship_id,
                anomaly.domain,
                &anomaly.anomaly_type,
                week_ago,
                10,
            ),
        );
        let incidents_query = bounded(
            per_query,
            self.store.recent_incidents(&anomaly.ship_id, anomaly.domain, day_ago, 5),
        );

        let (device, rates, similar, incidents) =
            tokio::join!(device_query, rates_query, similar_query, incidents_query);

        let mut failures = 0;
        let device_metadata = device.unwrap_or_else(|_| {
            failures += 1;
            None
        });
        let historical_failure_rates = match rates {
            Ok(rates) => Some(rates),
            Err(_) => {
                failures += 1;
                None
            }
        };
        let similar_anomalies = similar.unwrap_or_else(|_| {
            failures += 1;
            Vec::new()
        });
        let recent_incidents = incidents.unwrap_or_else(|_| {
            failures += 1;
            Vec::new()
        });

        // All context queries failing reads as "store unreachable".
        let degraded = failures >= 4 || (failures >= 3 && anomaly.device_id.is_none());
        if degraded {
            metrics::inc("enricher.degraded");
            debug!(tracking_id = %anomaly.tracking_id, "Store unreachable, enriching degraded");
        }

        // Counters derive from what the queries returned: the 1h count from
        // the recency-ordered similar list (bounded by its top-10 limit),
        // the 24h count from the domain-level failure aggregate.
        let hour_ago = now - ChronoDuration::hours(1);
        let similar_count_1h = similar_anomalies.iter().filter(|a| a.ts >= hour_ago).count() as u32;
        let similar_count_24h = historical_failure_rates
            .as_ref()
            .map(|r| r.count.min(u32::MAX as u64) as u32)
            .unwrap_or(0);
        let last_incident_ts = recent_incidents.first().map(|i| i.created_at);

        let severity = severity_for(anomaly.score, similar_count_1h, similar_count_24h);

        let enrichment_latency_ms = started.elapsed().as_millis() as u64;
        metrics::observe_ms("enricher.latency_ms", enrichment_latency_ms);

        let enriched = AnomalyEnriched {
            severity,
            context: AnomalyContext {
                similar_count_1h,
                similar_count_24h,
                last_incident_ts,
            },
            meta: EnrichmentMeta {
                device_metadata,
                historical_failure_rates,
                similar_anomalies,
                recent_incidents,
                degraded,
            },
            enrichment_latency_ms,
            anomaly,
        };

        // The anomaly row is persisted here, where severity is known. The
        // write runs detached: a slow store must not spend fast-path
        // budget, and a failure costs history, not the event.
        let store = Arc::clone(&self.store);
        let row = row_for(&enriched);
        tokio::spawn(async move {
            if let Err(e) = store.insert_anomaly(row).await {
                debug!(error = %e, "Anomaly row write failed");
            }
        });

        enriched
    }
}

async fn bounded<T>(
    timeout: Duration,
    query: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, query).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

fn row_for(enriched: &AnomalyEnriched) -> AnomalyRow {
    let anomaly = &enriched.anomaly;
    AnomalyRow {
        ts: anomaly.ts,
        ship_id: anomaly.ship_id.clone(),
        domain: anomaly.domain,
        anomaly_type: anomaly.anomaly_type.clone(),
        score: anomaly.score,
        severity: Some(enriched.severity),
        service: anomaly.service.clone(),
        device_id: anomaly.device_id.clone(),
        metric_name: anomaly.metric_name.clone(),
        metric_value: anomaly.metric_value,
        tracking_id: anomaly.tracking_id.as_str().to_string(),
        schema_version: ROW_SCHEMA_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::clock::ManualClock;
    use crate::policy::Policy;
    use crate::store::{ColumnStore, MemoryColumnStore};
    use crate::types::{Domain, Severity, TrackingId};

    fn anomaly(score: f64) -> AnomalyDetected {
        AnomalyDetected {
            tracking_id: TrackingId::from_wire("t-1").unwrap(),
            ts: "2026-03-01T12:00:00Z".parse().unwrap(),
            ship_id: "mv-aurora".to_string(),
            domain: Domain::System,
            anomaly_type: "cpu_pressure".to_string(),
            detector: "zscore".to_string(),
            service: "cpu-monitor".to_string(),
            device_id: None,
            score,
            metric_name: Some("cpu_load".to_string()),
            metric_value: Some(97.0),
            threshold: Some(3.0),
            evidence_ref: None,
            synthetic: false,
            extensions: serde_json::Map::new(),
        }
    }

    fn enricher(store: Arc<MemoryColumnStore>, clock: crate::clock::SharedClock) -> Arc<FastEnricher> {
        FastEnricher::new(
            MemoryBus::new(),
            store,
            Policy::default().into_shared(),
            clock,
        )
    }

    #[tokio::test]
    async fn test_context_escalates_severity() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let store = MemoryColumnStore::new();

        // Four similar anomalies in the last hour.
        for minutes in [5, 15, 30, 45] {
            store
                .insert_anomaly(AnomalyRow {
                    ts: format!("2026-03-01T11:{minutes:02}:00Z").parse().unwrap(),
                    ship_id: "mv-aurora".to_string(),
                    domain: Domain::System,
                    anomaly_type: "cpu_pressure".to_string(),
                    score: 0.6,
                    severity: Some(Severity::Med),
                    service: "cpu-monitor".to_string(),
                    device_id: None,
                    metric_name: None,
                    metric_value: None,
                    tracking_id: format!("h-{minutes}"),
                    schema_version: ROW_SCHEMA_VERSION,
                })
                .await
                .unwrap();
        }

        let service = enricher(store, clock);
        let enriched = service.enrich(anomaly(0.55)).await;

        assert_eq!(enriched.context.similar_count_1h, 4);
        // 0.55 alone would be med; recurrence escalates to high.
        assert_eq!(enriched.severity, Severity::High);
        assert!(!enriched.meta.degraded);
        // Score carried through untouched.
        assert!((enriched.anomaly.score - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_gracefully() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let store = MemoryColumnStore::new();
        store.set_unreachable(true);

        let service = enricher(store, clock);
        let started = std::time::Instant::now();
        let enriched = service.enrich(anomaly(0.95)).await;

        assert!(started.elapsed() < Duration::from_millis(500), "degraded path must hold the SLO");
        assert_eq!(enriched.severity, Severity::Crit);
        assert!(enriched.meta.degraded);
        assert!(enriched.meta.similar_anomalies.is_empty());
        assert!(enriched.meta.historical_failure_rates.is_none());
    }

    #[tokio::test]
    async fn test_slow_store_is_cut_off_by_query_timeout() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let store = MemoryColumnStore::new();
        store.set_query_delay(Some(Duration::from_secs(5)));

        let service = enricher(store, clock);
        let started = std::time::Instant::now();
        let enriched = service.enrich(anomaly(0.95)).await;

        // Queries run concurrently, so the wall cost is one per-query
        // timeout, not four.
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(enriched.meta.degraded);
        assert_eq!(enriched.severity, Severity::Crit);
        assert!(enriched.enrichment_latency_ms < 500);
    }

    #[tokio::test]
    async fn test_enrichment_persists_anomaly_row() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let store = MemoryColumnStore::new();
        let service = enricher(Arc::clone(&store), clock);

        service.enrich(anomaly(0.8)).await;

        // The row write is detached from the fast path; wait for it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.anomaly_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "anomaly row never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
