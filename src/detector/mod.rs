//! Anomaly detector (stage D).
//!
//! Consumes `logs.anomalous`, validates each record, runs the enabled
//! detectors in policy order and publishes every match on
//! `anomaly.detected`. Stateless per record apart from the statistical
//! detector's rolling windows.

mod pattern;
mod severity_tag;
mod zscore;

pub use pattern::PatternDetector;
pub use zscore::ZscoreDetector;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{publish_with_retry, subjects, RetryPolicy, SharedBus};
use crate::clock::SharedClock;
use crate::metrics;
use crate::policy::SharedPolicy;
use crate::store::{record_stage_best_effort, SharedStore};
use crate::types::{AnomalyDetected, LogRecord, Stage, TrackingId, UNKNOWN_SHIP};
use crate::workers::{default_pool_size, BoundedQueue, DEFAULT_QUEUE_CAPACITY};

/// Log record after boundary validation: tracking id present, ship id
/// substituted, timestamp sanity-checked.
#[derive(Debug, Clone)]
pub struct ValidatedRecord {
    pub tracking_id: TrackingId,
    pub synthetic: bool,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub ship_id: String,
    pub service: String,
    pub severity_hint: Option<String>,
    pub device_id: Option<String>,
    pub raw_message: String,
    pub parsed_fields: BTreeMap<String, serde_json::Value>,
    pub evidence_ref: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("timestamp {0} outside the ±24h ingest horizon")]
    StaleTimestamp(chrono::DateTime<chrono::Utc>),
}

pub struct DetectorService {
    bus: SharedBus,
    store: SharedStore,
    policy: SharedPolicy,
    clock: SharedClock,
    patterns: PatternDetector,
    zscore: ZscoreDetector,
}

impl DetectorService {
    pub fn new(bus: SharedBus, store: SharedStore, policy: SharedPolicy, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            policy,
            clock,
            patterns: PatternDetector::new(),
            zscore: ZscoreDetector::new(),
        })
    }

    /// Validate a raw record at the subscribe boundary.
    ///
    /// Missing tracking id → synthesized and tagged. Missing or unregistered
    /// ship id → `unknown-ship` (documented default substitution — optional
    /// ship ids are never compared directly). Timestamps outside ±24h of now
    /// are rejected.
    pub fn validate(&self, record: LogRecord) -> Result<ValidatedRecord, ValidationError> {
        let now = self.clock.now();
        let skew_secs = record.ts.signed_duration_since(now).num_seconds().abs();
        if skew_secs > 24 * 3600 {
            return Err(ValidationError::StaleTimestamp(record.ts));
        }

        let (tracking_id, synthetic) = match record.tracking_id.as_deref().and_then(TrackingId::from_wire) {
            Some(id) => (id, false),
            None => (TrackingId::synthesize(), true),
        };

        let registry = &self.policy.load().detect.ship_registry;
        let ship_id = match record.ship_id {
            Some(ref ship) if !ship.is_empty() => {
                if registry.is_empty() || registry.iter().any(|s| s == ship) {
                    ship.clone()
                } else {
                    debug!(ship_id = %ship, "Ship not in registry, tagging unknown");
                    UNKNOWN_SHIP.to_string()
                }
            }
            _ => UNKNOWN_SHIP.to_string(),
        };

        let device_id = record.device_id().map(str::to_string);
        let evidence_ref = format!("log:{}:{}:{}", ship_id, record.ts.timestamp_millis(), tracking_id);

        Ok(ValidatedRecord {
            tracking_id,
            synthetic,
            ts: record.ts,
            ship_id,
            service: record.service,
            severity_hint: record.severity_hint,
            device_id,
            raw_message: record.raw_message,
            parsed_fields: record.parsed_fields,
            evidence_ref,
        })
    }

    /// Public detection contract: one validated record in, zero or more
    /// anomalies out. Detectors run in policy order; when several match,
    /// each emits its own anomaly.
    pub fn process_log(&self, record: &ValidatedRecord) -> Vec<AnomalyDetected> {
        let policy = self.policy.load();
        let mut anomalies = Vec::new();

        for detector in &policy.detect.detectors {
            match detector.as_str() {
                "severity_tag" => {
                    anomalies.extend(severity_tag::detect(record, &policy.detect.severity_tags));
                }
                "pattern" => {
                    anomalies.extend(self.patterns.detect(record, &policy));
                }
                "zscore" => {
                    anomalies.extend(self.zscore.detect(record, &policy, self.clock.now()));
                }
                other => {
                    debug!(detector = other, "Unknown detector name in policy, skipping");
                }
            }
        }

        metrics::add("detector.anomalies_emitted", anomalies.len() as u64);
        anomalies
    }

    /// Run the stage until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Detector starting");
        let mut sub = self.bus.subscribe(subjects::LOGS_ANOMALOUS);
        let queue: Arc<BoundedQueue<Arc<Vec<u8>>>> =
            BoundedQueue::new("detector", DEFAULT_QUEUE_CAPACITY);

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
        info!("Detector stopped");
    }

    async fn handle(&self, payload: &[u8]) {
        let started = std::time::Instant::now();

        let record: LogRecord = match serde_json::from_slice(payload) {
            Ok(record) => record,
            Err(e) => {
                metrics::inc("detector.drops");
                warn!(error = %e, "Malformed log record dropped");
                return;
            }
        };

        let validated = match self.validate(record) {
            Ok(validated) => validated,
            Err(e) => {
                metrics::inc("detector.drops");
                warn!(error = %e, "Log record failed validation, dropped");
                return;
            }
        };

        let anomalies = self.process_log(&validated);
        if anomalies.is_empty() {
            return;
        }

        for anomaly in &anomalies {
            if let Err(e) = publish_with_retry(
                self.bus.as_ref(),
                subjects::ANOMALY_DETECTED,
                anomaly,
                "detector",
                RetryPolicy::default(),
                self.clock.now(),
            )
            .await
            {
                warn!(
                    tracking_id = %anomaly.tracking_id,
                    error = %e,
                    "Anomaly publish dead-lettered"
                );
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        metrics::observe_ms("detector.latency_ms", latency_ms);
        record_stage_best_effort(
            self.store.as_ref(),
            validated.tracking_id.as_str(),
            Stage::Detect,
            self.clock.now(),
            latency_ms,
            "ok",
        )
        .await;
    }
}

/// Shared helper for the three detectors: assemble an anomaly with the
/// fields every detector fills the same way.
pub(crate) fn base_anomaly(
    record: &ValidatedRecord,
    domain: crate::types::Domain,
    anomaly_type: &str,
    detector: &str,
    score: f64,
) -> AnomalyDetected {
    AnomalyDetected {
        tracking_id: record.tracking_id.clone(),
        ts: record.ts,
        ship_id: record.ship_id.clone(),
        domain,
        anomaly_type: anomaly_type.to_string(),
        detector: detector.to_string(),
        service: record.service.clone(),
        device_id: record.device_id.clone(),
        score: score.clamp(0.0, 1.0),
        metric_name: None,
        metric_value: None,
        threshold: None,
        evidence_ref: Some(record.evidence_ref.clone()),
        synthetic: record.synthetic,
        extensions: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::clock::ManualClock;
    use crate::policy::Policy;
    use crate::store::MemoryColumnStore;

    fn service(clock: SharedClock) -> Arc<DetectorService> {
        DetectorService::new(
            MemoryBus::new(),
            MemoryColumnStore::new(),
            Policy::default().into_shared(),
            clock,
        )
    }

    fn record(json: serde_json::Value) -> LogRecord {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_validate_synthesizes_tracking_id() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = service(clock);

        let validated = service
            .validate(record(serde_json::json!({
                "ts": "2026-03-01T11:59:00Z",
                "ship_id": "mv-aurora",
                "service": "nav",
                "raw_message": "x"
            })))
            .unwrap();
        assert!(validated.synthetic);
        assert!(validated.tracking_id.is_synthetic());
    }

    #[test]
    fn test_validate_rejects_stale_timestamp() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = service(clock);

        let result = service.validate(record(serde_json::json!({
            "tracking_id": "t-1",
            "ts": "2026-02-20T12:00:00Z",
            "raw_message": "x"
        })));
        assert!(matches!(result, Err(ValidationError::StaleTimestamp(_))));
    }

    #[test]
    fn test_validate_substitutes_unknown_ship() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let policy = {
            let mut p = Policy::default();
            p.detect.ship_registry = vec!["mv-aurora".to_string()];
            p
        };
        let service = DetectorService::new(
            MemoryBus::new(),
            MemoryColumnStore::new(),
            policy.into_shared(),
            clock,
        );

        let validated = service
            .validate(record(serde_json::json!({
                "tracking_id": "t-1",
                "ts": "2026-03-01T12:00:00Z",
                "ship_id": "mv-ghost",
                "raw_message": "x"
            })))
            .unwrap();
        assert_eq!(validated.ship_id, UNKNOWN_SHIP);

        let validated = service
            .validate(record(serde_json::json!({
                "tracking_id": "t-2",
                "ts": "2026-03-01T12:00:00Z",
                "ship_id": "mv-aurora",
                "raw_message": "x"
            })))
            .unwrap();
        assert_eq!(validated.ship_id, "mv-aurora");
    }

    #[test]
    fn test_multiple_detectors_each_emit() {
        let clock = ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap());
        let service = service(clock);

        // Matches both the severity-tag rule (error) and the OOM pattern.
        let validated = service
            .validate(record(serde_json::json!({
                "tracking_id": "t-3",
                "ts": "2026-03-01T12:00:00Z",
                "ship_id": "mv-aurora",
                "service": "kernel",
                "severity_hint": "error",
                "raw_message": "oom-killer invoked for process 4211"
            })))
            .unwrap();

        let anomalies = service.process_log(&validated);
        assert_eq!(anomalies.len(), 2);
        // Emission order equals detector config order.
        assert_eq!(anomalies[0].detector, "severity_tag");
        assert_eq!(anomalies[1].detector, "pattern");
        assert_eq!(anomalies[1].anomaly_type, "oom");
        for anomaly in &anomalies {
            assert_eq!(anomaly.tracking_id.as_str(), "t-3");
        }
    }
}
