//! Correlator (stage C).
//!
//! Consumes `anomaly.enriched`, accumulates per-`(ship_id, domain)` tumbling
//! windows, deduplicates by incident fingerprint and publishes
//! `incidents.created`. Same-key events are serialized through a striped
//! worker pool; across keys there is no ordering guarantee.
//!
//! This stage is a singleton per deployment: window and dedup state are
//! process-local. Scaling out requires partitioning `anomaly.enriched` by
//! `(ship_id, domain)` with exclusive subscriptions.

mod dedup;
mod window;

pub use dedup::{DedupCache, DedupError};
pub use window::{Offer, SweepStats, WindowKey, WindowTable};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{publish_with_retry, subjects, RetryPolicy, SharedBus};
use crate::clock::SharedClock;
use crate::metrics;
use crate::policy::SharedPolicy;
use crate::store::{record_stage_best_effort, SharedStore};
use crate::types::{
    AnomalyEnriched, IncidentCreated, IncidentStatus, ScopeEntry, Severity, Stage, SuppressKey,
    TimelineEntry,
};
use crate::workers::{StripedPool, DEFAULT_QUEUE_CAPACITY};

pub struct Correlator {
    bus: SharedBus,
    store: SharedStore,
    policy: SharedPolicy,
    clock: SharedClock,
    windows: WindowTable,
    dedup: DedupCache,
}

impl Correlator {
    pub fn new(
        bus: SharedBus,
        store: SharedStore,
        policy: SharedPolicy,
        clock: SharedClock,
    ) -> Result<Arc<Self>, DedupError> {
        let snapshot = policy.load_full();
        let dedup = match &snapshot.correlate.dedup_persist_path {
            Some(path) => {
                info!(path = %path, "Dedup cache: persistent (sled)");
                DedupCache::persistent(path, snapshot.correlate.dedup_ttl_sec)?
            }
            None => DedupCache::in_memory(snapshot.correlate.dedup_ttl_sec),
        };
        Ok(Arc::new(Self {
            bus,
            store,
            policy,
            clock,
            windows: WindowTable::new(snapshot.correlate.stripes),
            dedup,
        }))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Correlator starting");
        let mut sub = self.bus.subscribe(subjects::ANOMALY_ENRICHED);

        let stripes = self.policy.load().correlate.stripes;
        let pool: Arc<StripedPool<AnomalyEnriched>> = Arc::new(StripedPool::new(
            "correlator",
            stripes,
            DEFAULT_QUEUE_CAPACITY,
        ));

        let mut workers = Vec::new();
        for stripe in 0..pool.stripes() {
            let service = Arc::clone(&self);
            let queue = pool.queue(stripe);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        anomaly = queue.pop() => service.process(anomaly).await,
                    }
                }
            }));
        }

        let sweeper = tokio::spawn(Arc::clone(&self).run_sweeper(cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = sub.recv() => match maybe {
                    Some(payload) => match serde_json::from_slice::<AnomalyEnriched>(&payload) {
                        Ok(anomaly) => {
                            let key = (
                                anomaly.anomaly.ship_id.clone(),
                                anomaly.anomaly.domain,
                            );
                            pool.dispatch(&key, anomaly);
                        }
                        Err(e) => {
                            metrics::inc("correlator.drops");
                            warn!(error = %e, "Malformed enriched anomaly dropped");
                        }
                    },
                    None => break,
                },
            }
        }

        for worker in workers {
            worker.abort();
        }
        sweeper.abort();
        info!("Correlator stopped");
    }

    /// Offer one anomaly to its window; form an incident when it fires.
    pub async fn process(&self, anomaly: AnomalyEnriched) {
        let started = std::time::Instant::now();
        let policy = self.policy.load();
        let now = self.clock.now();
        let duration = policy.correlate.window_for(anomaly.anomaly.domain);

        match self
            .windows
            .offer(anomaly, duration, policy.correlate.threshold, now)
        {
            Offer::Accumulated { members } => {
                debug!(members = members, threshold = policy.correlate.threshold, "Window accumulating");
            }
            Offer::Fired(members) => {
                self.form_incident(members, now, started).await;
            }
        }
    }

    async fn form_incident(
        &self,
        members: Vec<AnomalyEnriched>,
        now: chrono::DateTime<chrono::Utc>,
        started: std::time::Instant,
    ) {
        // Severity is the max over members; the representative member (the
        // incident's identity for fingerprinting) is the highest-severity
        // member, earliest first on ties.
        let severity = members
            .iter()
            .map(|m| m.severity)
            .max()
            .unwrap_or(Severity::Low);
        let Some(representative) = members
            .iter()
            .max_by(|a, b| {
                a.severity
                    .cmp(&b.severity)
                    .then_with(|| b.anomaly.ts.cmp(&a.anomaly.ts))
            })
        else {
            return;
        };
        let Some(trigger) = members.last() else {
            return;
        };

        let ship_id = representative.anomaly.ship_id.clone();
        let domain = representative.anomaly.domain;
        let suppress_key = SuppressKey::derive(
            &ship_id,
            domain.as_str(),
            &representative.anomaly.service,
            &representative.anomaly.anomaly_type,
            representative.anomaly.device_id.as_deref(),
            severity.as_str(),
        );

        let incident_id = Uuid::new_v4();

        // Dedup is claimed before publish: a failed publish leaves the
        // window fired and the fingerprint taken, so a retry or replay
        // cannot double-emit.
        if let Some(existing) = self
            .dedup
            .check_and_insert(&suppress_key, &incident_id.to_string(), now)
        {
            metrics::inc("correlator.duplicates_suppressed");
            info!(
                suppress_key = %suppress_key,
                suppressed_by = %existing,
                "Duplicate incident suppressed"
            );
            return;
        }

        let mut scope: Vec<ScopeEntry> = Vec::new();
        for member in &members {
            let entry = ScopeEntry {
                device_id: member.anomaly.device_id.clone(),
                service: member.anomaly.service.clone(),
            };
            if !scope.contains(&entry) {
                scope.push(entry);
            }
        }

        let mut timeline: Vec<TimelineEntry> = members
            .iter()
            .map(|m| TimelineEntry {
                ts: m.anomaly.ts,
                event: "anomaly".to_string(),
                source: m.anomaly.detector.clone(),
                description: format!(
                    "{} score {:.2} severity {} ({})",
                    m.anomaly.anomaly_type, m.anomaly.score, m.severity, m.anomaly.tracking_id
                ),
            })
            .collect();
        timeline.push(TimelineEntry {
            ts: now,
            event: "incident_created".to_string(),
            source: "correlator".to_string(),
            description: format!(
                "{} anomalies correlated in a {}s window",
                members.len(),
                self.policy
                    .load()
                    .correlate
                    .window_for(domain)
                    .num_seconds()
            ),
        });

        // The representative's metric rides along in the extensions so the
        // insight cache can key metric-scoped incidents apart.
        let mut extensions = serde_json::Map::new();
        if let Some(metric) = &representative.anomaly.metric_name {
            extensions.insert(
                "metric_name".to_string(),
                serde_json::Value::String(metric.clone()),
            );
        }

        let incident = IncidentCreated {
            incident_id,
            created_at: now,
            ship_id,
            incident_type: representative.anomaly.anomaly_type.clone(),
            severity,
            scope,
            correlation_keys: vec![
                format!("ship_id={}", representative.anomaly.ship_id),
                format!("domain={}", domain),
            ],
            suppress_key,
            member_anomaly_ids: members
                .iter()
                .map(|m| m.anomaly.tracking_id.clone())
                .collect(),
            evidence_refs: members
                .iter()
                .filter_map(|m| m.anomaly.evidence_ref.clone())
                .collect(),
            timeline,
            status: IncidentStatus::Open,
            tracking_id: trigger.anomaly.tracking_id.clone(),
            extensions,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        metrics::observe_ms("correlator.latency_ms", latency_ms);

        match publish_with_retry(
            self.bus.as_ref(),
            subjects::INCIDENTS_CREATED,
            &incident,
            "correlator",
            RetryPolicy::default(),
            now,
        )
        .await
        {
            Ok(()) => {
                metrics::inc("correlator.incidents_created");
                info!(
                    incident_id = %incident.incident_id,
                    ship_id = %incident.ship_id,
                    severity = %incident.severity,
                    members = incident.member_anomaly_ids.len(),
                    "Incident created"
                );
            }
            Err(e) => {
                // Window stays fired and the fingerprint stays claimed.
                warn!(incident_id = %incident.incident_id, error = %e, "Incident publish dead-lettered");
            }
        }

        record_stage_best_effort(
            self.store.as_ref(),
            incident.tracking_id.as_str(),
            Stage::Correlate,
            now,
            latency_ms,
            "ok",
        )
        .await;
    }

    async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut cursor = 0usize;
        loop {
            let interval = self.policy.load().correlate.sweep_interval_sec;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }

            let now = self.clock.now();
            let budget = Duration::from_millis(self.policy.load().correlate.sweep_budget_ms);
            let stats = self.windows.sweep(now, budget, &mut cursor);
            let dedup_removed = self.dedup.sweep(now);

            if stats.expired > 0 || dedup_removed > 0 {
                debug!(
                    expired = stats.expired,
                    cleared = stats.cleared,
                    dedup_removed = dedup_removed,
                    truncated = stats.truncated,
                    "Sweep tick"
                );
            }
        }
    }

    /// Direct window access for integration tests.
    pub fn sweep_now(&self, cursor: &mut usize) -> SweepStats {
        let budget = Duration::from_millis(self.policy.load().correlate.sweep_budget_ms);
        self.windows.sweep(self.clock.now(), budget, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use crate::clock::ManualClock;
    use crate::policy::Policy;
    use crate::store::MemoryColumnStore;
    use crate::types::{AnomalyContext, AnomalyDetected, Domain, EnrichmentMeta, TrackingId};

    fn enriched(id: &str, severity: Severity, ts: &str) -> AnomalyEnriched {
        AnomalyEnriched {
            anomaly: AnomalyDetected {
                tracking_id: TrackingId::from_wire(id).unwrap(),
                ts: ts.parse().unwrap(),
                ship_id: "mv-aurora".to_string(),
                domain: Domain::System,
                anomaly_type: "cpu_pressure".to_string(),
                detector: "zscore".to_string(),
                service: "cpu-monitor".to_string(),
                device_id: None,
                score: 0.8,
                metric_name: None,
                metric_value: None,
                threshold: None,
                evidence_ref: Some(format!("log:mv-aurora:0:{id}")),
                synthetic: false,
                extensions: serde_json::Map::new(),
            },
            severity,
            context: AnomalyContext::default(),
            meta: EnrichmentMeta::default(),
            enrichment_latency_ms: 12,
        }
    }

    fn correlator(bus: crate::bus::SharedBus, clock: crate::clock::SharedClock) -> Arc<Correlator> {
        Correlator::new(
            bus,
            MemoryColumnStore::new(),
            Policy::default().into_shared(),
            clock,
        )
        .unwrap()
    }

    async fn recv_incident(
        sub: &mut crate::bus::Subscription,
    ) -> Option<IncidentCreated> {
        let payload = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .ok()??;
        serde_json::from_slice(&payload).ok()
    }

    #[tokio::test]
    async fn test_threshold_firing_creates_one_incident() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = correlator(bus.clone(), clock.clone());
        let mut sub = bus.subscribe(subjects::INCIDENTS_CREATED);

        service.process(enriched("a-1", Severity::High, "2026-03-01T12:00:00Z")).await;
        clock.advance(chrono::Duration::seconds(30));
        service.process(enriched("a-2", Severity::High, "2026-03-01T12:00:30Z")).await;
        clock.advance(chrono::Duration::seconds(30));
        service.process(enriched("a-3", Severity::High, "2026-03-01T12:01:00Z")).await;

        let incident = recv_incident(&mut sub).await.unwrap();
        assert_eq!(incident.severity, Severity::High);
        assert_eq!(incident.member_anomaly_ids.len(), 3);
        assert_eq!(incident.ship_id, "mv-aurora");
        assert_eq!(incident.incident_type, "cpu_pressure");
        assert_eq!(incident.status, IncidentStatus::Open);
        // Triggering anomaly is the one that crossed the threshold.
        assert_eq!(incident.tracking_id.as_str(), "a-3");
        // Timeline: three anomaly entries plus the creation entry.
        assert_eq!(incident.timeline.len(), 4);

        let expected_key = SuppressKey::derive(
            "mv-aurora", "system", "cpu-monitor", "cpu_pressure", None, "high",
        );
        assert_eq!(incident.suppress_key, expected_key);
    }

    #[tokio::test]
    async fn test_immediate_repeat_is_suppressed() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = correlator(bus.clone(), clock.clone());
        let mut sub = bus.subscribe(subjects::INCIDENTS_CREATED);

        let before = metrics::counter_value("correlator.duplicates_suppressed");

        for id in ["a-1", "a-2", "a-3"] {
            service.process(enriched(id, Severity::High, "2026-03-01T12:00:00Z")).await;
        }
        assert!(recv_incident(&mut sub).await.is_some());

        // Same fingerprint again, inside the dedup TTL: no publication.
        clock.advance(chrono::Duration::seconds(60));
        for id in ["b-1", "b-2", "b-3"] {
            service.process(enriched(id, Severity::High, "2026-03-01T12:01:00Z")).await;
        }
        assert!(recv_incident(&mut sub).await.is_none());
        assert_eq!(
            metrics::counter_value("correlator.duplicates_suppressed"),
            before + 1
        );
    }

    #[tokio::test]
    async fn test_incident_carries_representative_metric_name() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = correlator(bus.clone(), clock.clone());
        let mut sub = bus.subscribe(subjects::INCIDENTS_CREATED);

        for (id, ts) in [
            ("m-1", "2026-03-01T12:00:00Z"),
            ("m-2", "2026-03-01T12:00:10Z"),
            ("m-3", "2026-03-01T12:00:20Z"),
        ] {
            let mut member = enriched(id, Severity::High, ts);
            member.anomaly.metric_name = Some("cpu_load".to_string());
            member.anomaly.metric_value = Some(97.0);
            service.process(member).await;
        }

        let incident = recv_incident(&mut sub).await.unwrap();
        assert_eq!(
            incident.extensions.get("metric_name").and_then(|v| v.as_str()),
            Some("cpu_load")
        );
    }

    #[tokio::test]
    async fn test_severity_is_max_over_members() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = correlator(bus.clone(), clock.clone());
        let mut sub = bus.subscribe(subjects::INCIDENTS_CREATED);

        service.process(enriched("a-1", Severity::Low, "2026-03-01T12:00:00Z")).await;
        service.process(enriched("a-2", Severity::Crit, "2026-03-01T12:00:10Z")).await;
        service.process(enriched("a-3", Severity::Med, "2026-03-01T12:00:20Z")).await;

        let incident = recv_incident(&mut sub).await.unwrap();
        assert_eq!(incident.severity, Severity::Crit);
    }

    #[tokio::test]
    async fn test_below_threshold_window_expires_silently() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = correlator(bus.clone(), clock.clone());
        let mut sub = bus.subscribe(subjects::INCIDENTS_CREATED);

        service.process(enriched("a-1", Severity::High, "2026-03-01T12:00:00Z")).await;
        service.process(enriched("a-2", Severity::High, "2026-03-01T12:00:30Z")).await;

        // System window is 10 minutes; jump past it and sweep.
        clock.advance(chrono::Duration::seconds(601));
        let mut cursor = 0;
        let mut stats = SweepStats::default();
        // One full pass over all stripes may take several budgeted calls.
        for _ in 0..8 {
            let s = service.sweep_now(&mut cursor);
            stats.expired += s.expired;
            if !s.truncated {
                break;
            }
        }
        assert_eq!(stats.expired, 1);
        assert!(recv_incident(&mut sub).await.is_none());
    }
}
