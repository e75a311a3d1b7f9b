//! Insight-path enricher (stage E2).
//!
//! Consumes `incidents.created`, attaches an AI root-cause narrative,
//! retrieval-augmented similar incidents and remediation steps, and
//! publishes `incidents.enriched`. Runs entirely off the fast path; on any
//! external failure the rule-based fallback answers instead, so every
//! incident gets an enrichment — nothing is dropped silently.

mod fallback;
mod llm;
mod vector;

pub use fallback::fallback_insight;
pub use llm::{HttpLanguageModel, LanguageModel, LlmError};
pub use vector::{
    feature_embedding, HttpSimilarityIndex, SearchHit, SimilarityIndex, VectorError,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{publish_with_retry, subjects, RetryPolicy, SharedBus};
use crate::clock::SharedClock;
use crate::metrics;
use crate::policy::SharedPolicy;
use crate::store::{LlmCacheRow, SharedStore};
use crate::types::{
    AiInsight, Confidence, IncidentCreated, IncidentEnriched, SimilarIncident,
};
use crate::workers::{default_pool_size, BoundedQueue, DEFAULT_QUEUE_CAPACITY};

/// Idempotency version stamped on every publication; bump when the
/// enrichment semantics change so replays are distinguishable.
pub const ENRICHMENT_VERSION: u32 = 1;

/// Cache-store access budget. The cache is an optimization: a slow lookup
/// must not eat the insight-path SLO.
const CACHE_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Payload cached in the `llm_cache` table.
#[derive(Debug, Serialize, Deserialize)]
struct CachedInsight {
    ai: AiInsight,
    confidence: Confidence,
}

pub struct InsightEnricher {
    bus: SharedBus,
    store: SharedStore,
    policy: SharedPolicy,
    clock: SharedClock,
    llm: Arc<dyn LanguageModel>,
    vector: Arc<dyn SimilarityIndex>,
}

impl InsightEnricher {
    pub fn new(
        bus: SharedBus,
        store: SharedStore,
        policy: SharedPolicy,
        clock: SharedClock,
        llm: Arc<dyn LanguageModel>,
        vector: Arc<dyn SimilarityIndex>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            policy,
            clock,
            llm,
            vector,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Insight enricher starting");
        let mut sub = self.bus.subscribe(subjects::INCIDENTS_CREATED);
        let queue: Arc<BoundedQueue<Arc<Vec<u8>>>> =
            BoundedQueue::new("insight", DEFAULT_QUEUE_CAPACITY);

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
        info!("Insight enricher stopped");
    }

    async fn handle(&self, payload: &[u8]) {
        let incident: IncidentCreated = match serde_json::from_slice(payload) {
            Ok(incident) => incident,
            Err(e) => {
                metrics::inc("insight.drops");
                warn!(error = %e, "Malformed incident dropped");
                return;
            }
        };

        let enriched = self.enrich_incident(incident).await;

        if let Err(e) = publish_with_retry(
            self.bus.as_ref(),
            subjects::INCIDENTS_ENRICHED,
            &enriched,
            "insight",
            RetryPolicy::default(),
            self.clock.now(),
        )
        .await
        {
            warn!(
                incident_id = %enriched.incident.incident_id,
                error = %e,
                "Enriched incident publish dead-lettered"
            );
        }
    }

    /// Enrich one incident. Always returns a full enrichment — the
    /// fallback answers when any external dependency fails.
    pub async fn enrich_incident(&self, incident: IncidentCreated) -> IncidentEnriched {
        let started = std::time::Instant::now();
        let policy = self.policy.load();
        let now = self.clock.now();

        let cache_key = cache_key_for(&incident);

        // 1. Cache lookup (best-effort).
        let cached = tokio::time::timeout(CACHE_TIMEOUT, self.store.cache_get(&cache_key, now))
            .await
            .ok()
            .and_then(Result::ok)
            .flatten()
            .and_then(|row| serde_json::from_str::<CachedInsight>(&row.response_json).ok());

        if let Some(cached) = cached {
            metrics::inc("insight.cache_hits");
            let processing_time_ms = started.elapsed().as_millis() as u64;
            metrics::observe_ms("insight.latency_ms", processing_time_ms);
            return IncidentEnriched {
                incident,
                ai: cached.ai,
                cache_hit: true,
                processing_time_ms,
                confidence: cached.confidence,
                enrichment_version: ENRICHMENT_VERSION,
            };
        }

        // 2. Miss: LLM narrative + RAG retrieval + LLM remediation. Any
        // external failure flips the whole incident onto the fallback.
        let llm_timeout = Duration::from_millis(policy.llm.timeout_ms);
        let vector_timeout = Duration::from_millis(policy.llm.vector_timeout_ms);

        let (ai, confidence) = match self
            .generate_insight(&incident, &policy, llm_timeout, vector_timeout)
            .await
        {
            Ok((ai, confidence)) => {
                // 3. Best-effort cache write and vector upsert for future
                // retrieval; neither failure affects this publication.
                let cache_row = CachedInsight {
                    ai: ai.clone(),
                    confidence,
                };
                if let Ok(response_json) = serde_json::to_string(&cache_row) {
                    let row = LlmCacheRow {
                        cache_key: cache_key.clone(),
                        response_json,
                        created_at: now,
                        ttl_sec: policy.llm.cache_ttl_sec,
                    };
                    if let Err(e) =
                        tokio::time::timeout(CACHE_TIMEOUT, self.store.cache_put(row))
                            .await
                            .unwrap_or(Err(crate::store::StoreError::Timeout))
                    {
                        debug!(error = %e, "Insight cache write failed");
                    }
                }

                let embedding = feature_embedding(
                    &incident.incident_type,
                    primary_service(&incident),
                    incident.severity.as_str(),
                );
                let metadata = serde_json::json!({
                    "incident_type": incident.incident_type,
                    "ship_id": incident.ship_id,
                    "severity": incident.severity,
                    "created_at": incident.created_at,
                });
                if let Err(e) = self
                    .vector
                    .upsert(
                        &incident.incident_id.to_string(),
                        embedding,
                        metadata,
                        vector_timeout,
                    )
                    .await
                {
                    debug!(error = %e, "Vector upsert failed");
                }

                (ai, confidence)
            }
            Err(reason) => {
                metrics::inc("insight.fallbacks");
                warn!(
                    incident_id = %incident.incident_id,
                    reason = %reason,
                    "Insight generation failed, using rule-based fallback"
                );
                (fallback_insight(&incident, &policy), Confidence::Low)
            }
        };

        let processing_time_ms = started.elapsed().as_millis() as u64;
        metrics::observe_ms("insight.latency_ms", processing_time_ms);

        IncidentEnriched {
            incident,
            ai,
            cache_hit: false,
            processing_time_ms,
            confidence,
            enrichment_version: ENRICHMENT_VERSION,
        }
    }

    async fn generate_insight(
        &self,
        incident: &IncidentCreated,
        policy: &crate::policy::Policy,
        llm_timeout: Duration,
        vector_timeout: Duration,
    ) -> Result<(AiInsight, Confidence), String> {
        let root_cause = self
            .llm
            .generate(
                &policy.llm.model,
                &root_cause_prompt(incident),
                llm_timeout,
            )
            .await
            .map_err(|e| format!("root-cause generation: {e}"))?;

        let embedding = feature_embedding(
            &incident.incident_type,
            primary_service(incident),
            incident.severity.as_str(),
        );
        let filter = serde_json::json!({"incident_type": incident.incident_type});
        let hits = self
            .vector
            .search(embedding, policy.llm.vector_top_k, filter, vector_timeout)
            .await
            .map_err(|e| format!("similarity search: {e}"))?;

        let remediation_text = self
            .llm
            .generate(
                &policy.llm.model,
                &remediation_prompt(incident, &root_cause),
                llm_timeout,
            )
            .await
            .map_err(|e| format!("remediation generation: {e}"))?;

        let similar_incidents: Vec<SimilarIncident> = hits
            .into_iter()
            // The incident being enriched may already be indexed.
            .filter(|hit| hit.id != incident.incident_id.to_string())
            .map(|hit| SimilarIncident {
                incident_id: hit.id,
                similarity_score: hit.score,
                resolution: hit
                    .metadata
                    .get("resolution")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
            .collect();

        let remediation_steps = parse_steps(&remediation_text);
        if remediation_steps.is_empty() {
            return Err("remediation generation: empty response".to_string());
        }

        // Confidence: a substantial narrative grounded by at least one
        // similar case reads as high; an ungrounded or thin one as med.
        let confidence = if root_cause.len() >= 200 && !similar_incidents.is_empty() {
            Confidence::High
        } else {
            Confidence::Med
        };

        Ok((
            AiInsight {
                root_cause: root_cause.trim().to_string(),
                remediation_steps,
                similar_incidents,
            },
            confidence,
        ))
    }
}

/// Cache key: digest of `(incident_type, severity, service, metric|"")`.
fn cache_key_for(incident: &IncidentCreated) -> String {
    let metric = incident
        .extensions
        .get("metric_name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let material = format!(
        "{}|{}|{}|{}",
        incident.incident_type,
        incident.severity,
        primary_service(incident),
        metric,
    );
    format!("{:x}", md5::compute(material.as_bytes()))
}

fn primary_service(incident: &IncidentCreated) -> &str {
    incident
        .scope
        .first()
        .map(|s| s.service.as_str())
        .unwrap_or("")
}

fn root_cause_prompt(incident: &IncidentCreated) -> String {
    format!(
        "You are the fleet operations assistant for a merchant vessel.\n\
         Incident: {} ({} severity) on ship {}.\n\
         Affected services: {}.\n\
         {} member anomalies were correlated.\n\
         In two or three sentences, state the most likely root cause.",
        incident.incident_type,
        incident.severity,
        incident.ship_id,
        incident
            .scope
            .iter()
            .map(|s| s.service.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        incident.member_anomaly_ids.len(),
    )
}

fn remediation_prompt(incident: &IncidentCreated, root_cause: &str) -> String {
    format!(
        "Incident {} on ship {} with likely root cause: {}\n\
         List 3 to 5 ordered remediation steps the crew should take, one per line.",
        incident.incident_type, incident.ship_id, root_cause,
    )
}

/// Split an LLM step list into clean ordered steps, stripping bullets and
/// numbering.
fn parse_steps(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == '-' || c == '*')
                .trim()
        })
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::clock::ManualClock;
    use crate::policy::Policy;
    use crate::store::MemoryColumnStore;
    use crate::types::{IncidentStatus, ScopeEntry, Severity, SuppressKey, TrackingId};
    use async_trait::async_trait;

    struct ScriptedModel {
        response: Option<String>,
        delay: Duration,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(
            &self,
            _model: &str,
            _prompt: &str,
            timeout: Duration,
        ) -> Result<String, LlmError> {
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(LlmError::Timeout);
            }
            tokio::time::sleep(self.delay).await;
            self.response.clone().ok_or(LlmError::Status(500))
        }
    }

    struct ScriptedIndex {
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl SimilarityIndex for ScriptedIndex {
        async fn upsert(
            &self,
            _id: &str,
            _embedding: Vec<f32>,
            _metadata: serde_json::Value,
            _timeout: Duration,
        ) -> Result<(), VectorError> {
            Ok(())
        }

        async fn search(
            &self,
            _embedding: Vec<f32>,
            k: usize,
            _filter: serde_json::Value,
            _timeout: Duration,
        ) -> Result<Vec<SearchHit>, VectorError> {
            Ok(self.hits.iter().take(k).cloned().collect())
        }
    }

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
            correlation_keys: Vec::new(),
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

    fn enricher(
        store: Arc<MemoryColumnStore>,
        llm: Arc<dyn LanguageModel>,
        vector: Arc<dyn SimilarityIndex>,
        policy: Policy,
    ) -> Arc<InsightEnricher> {
        InsightEnricher::new(
            MemoryBus::new(),
            store,
            policy.into_shared(),
            ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()),
            llm,
            vector,
        )
    }

    #[tokio::test]
    async fn test_successful_generation_with_similars() {
        let long_narrative = "The sustained elevation of CPU load across three correlated \
            anomalies indicates a runaway process on the application host, most likely the \
            chart-sync daemon which has a known leak under intermittent connectivity."
            .to_string();
        let llm = Arc::new(ScriptedModel {
            response: Some(long_narrative),
            delay: Duration::ZERO,
        });
        let vector = Arc::new(ScriptedIndex {
            hits: vec![SearchHit {
                id: "prior-incident".to_string(),
                score: 0.91,
                metadata: serde_json::json!({"resolution": "restarted chart-sync"}),
            }],
        });
        let service = enricher(MemoryColumnStore::new(), llm, vector, Policy::default());

        let enriched = service.enrich_incident(incident()).await;
        assert!(!enriched.cache_hit);
        assert_eq!(enriched.confidence, Confidence::High);
        assert_eq!(enriched.ai.similar_incidents.len(), 1);
        assert_eq!(
            enriched.ai.similar_incidents[0].resolution.as_deref(),
            Some("restarted chart-sync")
        );
        assert!(!enriched.ai.remediation_steps.is_empty());
        assert_eq!(enriched.enrichment_version, ENRICHMENT_VERSION);
    }

    #[tokio::test]
    async fn test_llm_timeout_falls_back() {
        let mut policy = Policy::default();
        policy.llm.timeout_ms = 100;

        // Model hangs far beyond the timeout.
        let llm = Arc::new(ScriptedModel {
            response: Some("never delivered".to_string()),
            delay: Duration::from_secs(30),
        });
        let vector = Arc::new(ScriptedIndex { hits: Vec::new() });
        let service = enricher(MemoryColumnStore::new(), llm, vector, policy.clone());

        let started = std::time::Instant::now();
        let enriched = service.enrich_incident(incident()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(enriched.confidence, Confidence::Low);
        assert!(!enriched.cache_hit);
        assert!(enriched.ai.similar_incidents.is_empty());
        assert!(enriched.ai.root_cause.contains("mv-aurora"));
        assert_eq!(
            enriched.ai.remediation_steps,
            policy.remediate.steps_for("cpu_pressure")
        );
    }

    #[tokio::test]
    async fn test_second_identical_incident_hits_cache() {
        let llm = Arc::new(ScriptedModel {
            response: Some("Short but useful narrative.\nStep one\nStep two".to_string()),
            delay: Duration::ZERO,
        });
        let vector = Arc::new(ScriptedIndex { hits: Vec::new() });
        let store = MemoryColumnStore::new();
        let service = enricher(Arc::clone(&store), llm, vector, Policy::default());

        let first = service.enrich_incident(incident()).await;
        assert!(!first.cache_hit);

        // Same (type, severity, service) → same cache key.
        let second = service.enrich_incident(incident()).await;
        assert!(second.cache_hit);
        assert_eq!(second.ai.root_cause, first.ai.root_cause);
        assert_eq!(second.confidence, first.confidence);
    }

    #[tokio::test]
    async fn test_llm_error_status_falls_back() {
        let llm = Arc::new(ScriptedModel {
            response: None,
            delay: Duration::ZERO,
        });
        let vector = Arc::new(ScriptedIndex { hits: Vec::new() });
        let service = enricher(MemoryColumnStore::new(), llm, vector, Policy::default());

        let enriched = service.enrich_incident(incident()).await;
        assert_eq!(enriched.confidence, Confidence::Low);
        assert!(!enriched.ai.remediation_steps.is_empty());
    }

    #[test]
    fn test_cache_key_ignores_member_identity() {
        let a = incident();
        let mut b = incident();
        b.member_anomaly_ids = vec![TrackingId::from_wire("other").unwrap()];
        assert_eq!(cache_key_for(&a), cache_key_for(&b));

        let mut c = incident();
        c.severity = Severity::Crit;
        c.suppress_key = SuppressKey::derive(
            "mv-aurora", "system", "cpu-monitor", "cpu_pressure", None, "crit",
        );
        assert_ne!(cache_key_for(&a), cache_key_for(&c));
    }

    #[test]
    fn test_cache_key_includes_metric_name_extension() {
        // The correlator forwards the representative member's metric in the
        // incident extensions; metric-scoped incidents key separately.
        let plain = incident();
        let mut with_metric = incident();
        with_metric.extensions.insert(
            "metric_name".to_string(),
            serde_json::Value::String("cpu_load".to_string()),
        );
        assert_ne!(cache_key_for(&plain), cache_key_for(&with_metric));

        let mut same_metric = incident();
        same_metric.extensions.insert(
            "metric_name".to_string(),
            serde_json::Value::String("cpu_load".to_string()),
        );
        assert_eq!(cache_key_for(&with_metric), cache_key_for(&same_metric));
    }

    #[test]
    fn test_parse_steps_strips_numbering() {
        let steps = parse_steps("1. Check the pump\n2) Restart the service\n- Escalate\n\n");
        assert_eq!(steps, vec!["Check the pump", "Restart the service", "Escalate"]);
    }
}
