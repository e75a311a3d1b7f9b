//! Pattern detector: ordered regexes over the raw message, first match wins.
//!
//! Rules come from `policy.detect.patterns`. Compiled regexes are cached per
//! policy snapshot so a hot reload picks up new rules without recompiling on
//! every record.

use regex::Regex;
use std::sync::{Arc, Mutex};

use crate::policy::Policy;
use crate::types::{AnomalyDetected, Domain};

use super::{base_anomaly, ValidatedRecord};

struct CompiledRule {
    regex: Regex,
    domain: Domain,
    anomaly_type: String,
    score: f64,
}

pub struct PatternDetector {
    /// Compiled rule set keyed by the address of the policy snapshot it was
    /// built from; refreshed when the policy is swapped.
    cache: Mutex<Option<(usize, Arc<Vec<CompiledRule>>)>>,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }

    fn rules(&self, policy: &Policy) -> Arc<Vec<CompiledRule>> {
        let key = policy as *const Policy as usize;
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((cached_key, rules)) = cache.as_ref() {
            if *cached_key == key {
                return Arc::clone(rules);
            }
        }

        let compiled: Vec<CompiledRule> = policy
            .detect
            .patterns
            .iter()
            .filter_map(|rule| {
                // Validation compiles these at load; a failure here means a
                // rule slipped past it, so skip rather than crash the stage.
                match Regex::new(&rule.pattern) {
                    Ok(regex) => Some(CompiledRule {
                        regex,
                        domain: Domain::parse(&rule.domain).unwrap_or(Domain::System),
                        anomaly_type: rule.anomaly_type.clone(),
                        score: rule.score,
                    }),
                    Err(e) => {
                        tracing::error!(pattern = %rule.pattern, error = %e, "Unusable pattern rule skipped");
                        None
                    }
                }
            })
            .collect();

        let rules = Arc::new(compiled);
        *cache = Some((key, Arc::clone(&rules)));
        rules
    }

    /// First matching rule (by config index) emits; later rules are ignored
    /// for this record, keeping emission deterministic.
    pub fn detect(&self, record: &ValidatedRecord, policy: &Policy) -> Option<AnomalyDetected> {
        let rules = self.rules(policy);
        rules
            .iter()
            .find(|rule| rule.regex.is_match(&record.raw_message))
            .map(|rule| {
                base_anomaly(
                    record,
                    rule.domain,
                    &rule.anomaly_type,
                    "pattern",
                    rule.score,
                )
            })
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PatternRule;
    use crate::types::TrackingId;
    use std::collections::BTreeMap;

    fn record(message: &str) -> ValidatedRecord {
        ValidatedRecord {
            tracking_id: TrackingId::from_wire("t-1").unwrap(),
            synthetic: false,
            ts: "2026-03-01T12:00:00Z".parse().unwrap(),
            ship_id: "mv-aurora".to_string(),
            service: "vsat".to_string(),
            severity_hint: None,
            device_id: None,
            raw_message: message.to_string(),
            parsed_fields: BTreeMap::new(),
            evidence_ref: "log:mv-aurora:0:t-1".to_string(),
        }
    }

    #[test]
    fn test_default_rules_match() {
        let detector = PatternDetector::new();
        let policy = Policy::default().into_shared();

        let anomaly = detector
            .detect(&record("eth1: Link down detected"), &policy.load())
            .unwrap();
        assert_eq!(anomaly.domain, Domain::Network);
        assert_eq!(anomaly.anomaly_type, "link_flap");
        assert!((anomaly.score - 0.75).abs() < 1e-9);

        assert!(detector
            .detect(&record("routine heartbeat"), &policy.load())
            .is_none());
    }

    #[test]
    fn test_first_match_wins_by_config_index() {
        let mut policy = Policy::default();
        policy.detect.patterns = vec![
            serde_json::from_value::<PatternRule>(serde_json::json!({
                "pattern": "(?i)fail", "domain": "system",
                "anomaly_type": "generic_failure", "score": 0.5
            }))
            .unwrap(),
            serde_json::from_value::<PatternRule>(serde_json::json!({
                "pattern": "(?i)auth fail", "domain": "security",
                "anomaly_type": "auth_failure", "score": 0.9
            }))
            .unwrap(),
        ];
        let shared = policy.into_shared();
        let detector = PatternDetector::new();

        // Both rules match; the one with the lower config index wins.
        let anomaly = detector
            .detect(&record("auth failure for user nav"), &shared.load())
            .unwrap();
        assert_eq!(anomaly.anomaly_type, "generic_failure");
    }

    #[test]
    fn test_cache_refreshes_on_policy_swap() {
        let detector = PatternDetector::new();
        let shared = Policy::default().into_shared();
        assert!(detector
            .detect(&record("custom beacon drop"), &shared.load())
            .is_none());

        let mut updated = Policy::default();
        updated.detect.patterns.insert(
            0,
            serde_json::from_value::<PatternRule>(serde_json::json!({
                "pattern": "beacon drop", "domain": "comms",
                "anomaly_type": "beacon_loss", "score": 0.6
            }))
            .unwrap(),
        );
        shared.store(std::sync::Arc::new(updated));

        let anomaly = detector
            .detect(&record("custom beacon drop"), &shared.load())
            .unwrap();
        assert_eq!(anomaly.anomaly_type, "beacon_loss");
    }
}
