//! Operating policy for the event pipeline.
//!
//! The policy file replaces all hardcoded detection, correlation and LLM
//! knobs with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `TIDEWATCH_POLICY` environment variable (path to TOML file)
//! 2. `policy.toml` in the current working directory
//! 3. Built-in defaults
//!
//! Environment overrides for the most commonly tuned knobs are applied on
//! top of whatever file (or default set) was loaded.
//!
//! The loaded policy lives in an [`arc_swap::ArcSwap`] so the watcher task
//! can hot-swap it without locking the event path; every stage reads a
//! consistent snapshot per event via [`SharedPolicy::load`].

mod settings;
pub mod watcher;

pub use settings::Settings;

use crate::types::Domain;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Hot-swappable policy handle shared by all stages.
pub type SharedPolicy = Arc<ArcSwap<Policy>>;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Top-level policy document. Sections the core does not interpret
/// (`ingest`, `notify`, `privacy`) are carried opaquely so a shared policy
/// file round-trips through this service untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub schema_version: u32,
    pub detect: DetectPolicy,
    pub correlate: CorrelatePolicy,
    pub llm: LlmPolicy,
    pub remediate: RemediatePolicy,
    pub retention: RetentionPolicy,
    pub slo: SloPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<toml::Value>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            schema_version: 1,
            detect: DetectPolicy::default(),
            correlate: CorrelatePolicy::default(),
            llm: LlmPolicy::default(),
            remediate: RemediatePolicy::default(),
            retention: RetentionPolicy::default(),
            slo: SloPolicy::default(),
            ingest: None,
            notify: None,
            privacy: None,
        }
    }
}

// ============================================================================
// Detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectPolicy {
    pub thresholds: DetectThresholds,
    /// Rolling-window capacity per `(ship_id, metric_name)` key.
    pub rolling_window_size: usize,
    /// Samples older than this are evicted from rolling windows.
    pub rolling_window_ttl_sec: u64,
    /// Enabled detectors, in emission order.
    pub detectors: Vec<String>,
    /// Severity-tag detector rules. The anomaly-type list varies per fleet,
    /// so it is policy data rather than code.
    pub severity_tags: Vec<SeverityTagRule>,
    /// Pattern detector rules, evaluated in order; first match wins.
    pub patterns: Vec<PatternRule>,
    /// Known ship ids. Empty means "accept any"; a non-empty registry maps
    /// unknown ships to `unknown-ship`.
    pub ship_registry: Vec<String>,
}

impl Default for DetectPolicy {
    fn default() -> Self {
        Self {
            thresholds: DetectThresholds::default(),
            rolling_window_size: 128,
            rolling_window_ttl_sec: 600,
            detectors: vec![
                "severity_tag".to_string(),
                "pattern".to_string(),
                "zscore".to_string(),
            ],
            severity_tags: vec![
                SeverityTagRule::new("error", 0, "log_error", "system"),
                SeverityTagRule::new("critical", 1, "log_critical", "system"),
                SeverityTagRule::new("emergency", 2, "log_emergency", "system"),
            ],
            patterns: vec![
                PatternRule::new(r"(?i)link (down|flap)", "network", "link_flap", 0.75),
                PatternRule::new(r"(?i)auth(entication)? fail", "security", "auth_failure", 0.7),
                PatternRule::new(r"(?i)gps (fix |signal )?lost", "comms", "gps_signal_loss", 0.8),
                PatternRule::new(r"(?i)out of memory|oom[- ]kill", "system", "oom", 0.85),
                PatternRule::new(r"(?i)disk (full|failure)", "system", "disk_failure", 0.8),
            ],
            ship_registry: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectThresholds {
    /// |z| at or above which the statistical detector emits.
    pub zscore: f64,
    /// Minimum window population before z is considered meaningful.
    pub zscore_min_samples: usize,
}

impl Default for DetectThresholds {
    fn default() -> Self {
        Self {
            zscore: 3.0,
            zscore_min_samples: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityTagRule {
    /// Parsed severity word this rule matches (`error`, `critical`, ...).
    pub severity: String,
    /// Rank feeding `score = 0.6 + 0.1 * rank`.
    pub rank: u8,
    pub anomaly_type: String,
    pub domain: String,
}

impl SeverityTagRule {
    fn new(severity: &str, rank: u8, anomaly_type: &str, domain: &str) -> Self {
        Self {
            severity: severity.to_string(),
            rank,
            anomaly_type: anomaly_type.to_string(),
            domain: domain.to_string(),
        }
    }

    pub fn score(&self) -> f64 {
        (0.6 + 0.1 * f64::from(self.rank)).min(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub domain: String,
    pub anomaly_type: String,
    pub score: f64,
}

impl PatternRule {
    fn new(pattern: &str, domain: &str, anomaly_type: &str, score: f64) -> Self {
        Self {
            pattern: pattern.to_string(),
            domain: domain.to_string(),
            anomaly_type: anomaly_type.to_string(),
            score,
        }
    }
}

// ============================================================================
// Correlation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatePolicy {
    /// Tumbling-window duration per domain, seconds.
    pub window_by_domain: BTreeMap<String, u64>,
    /// Window duration for domains missing from the table, seconds.
    pub default_window_sec: u64,
    /// Member count at which a window fires an incident.
    pub threshold: usize,
    /// Identical-fingerprint suppression horizon, seconds.
    pub dedup_ttl_sec: u64,
    /// Lock stripes protecting window state.
    pub stripes: usize,
    /// When set, the dedup cache persists to this sled path and survives
    /// restarts. Default is in-memory: cheaper writes, but a restart within
    /// the TTL can let one duplicate incident through.
    pub dedup_persist_path: Option<String>,
    pub sweep_interval_sec: u64,
    pub sweep_budget_ms: u64,
}

impl Default for CorrelatePolicy {
    fn default() -> Self {
        let mut window_by_domain = BTreeMap::new();
        window_by_domain.insert("comms".to_string(), 300);
        window_by_domain.insert("network".to_string(), 300);
        window_by_domain.insert("security".to_string(), 600);
        window_by_domain.insert("system".to_string(), 600);
        window_by_domain.insert("application".to_string(), 1200);
        Self {
            window_by_domain,
            default_window_sec: 900,
            threshold: 3,
            dedup_ttl_sec: 900,
            stripes: 64,
            dedup_persist_path: None,
            sweep_interval_sec: 10,
            sweep_budget_ms: 100,
        }
    }
}

impl CorrelatePolicy {
    /// Window duration for a domain, falling back to the default.
    pub fn window_for(&self, domain: Domain) -> chrono::Duration {
        let secs = self
            .window_by_domain
            .iter()
            .find(|(k, _)| Domain::parse(k) == Some(domain))
            .map(|(_, v)| *v)
            .unwrap_or(self.default_window_sec);
        chrono::Duration::seconds(secs as i64)
    }
}

// ============================================================================
// LLM / Insight path
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmPolicy {
    pub model: String,
    pub timeout_ms: u64,
    pub cache_ttl_sec: u64,
    pub vector_timeout_ms: u64,
    pub vector_top_k: usize,
}

impl Default for LlmPolicy {
    fn default() -> Self {
        Self {
            model: "mistral-7b-instruct".to_string(),
            timeout_ms: 10_000,
            cache_ttl_sec: 86_400,
            vector_timeout_ms: 5_000,
            vector_top_k: 3,
        }
    }
}

// ============================================================================
// Remediation runbooks (fallback path)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediatePolicy {
    /// Ordered remediation steps per incident type; `default` is the
    /// catch-all used by the rule-based fallback.
    pub runbooks: BTreeMap<String, Vec<String>>,
}

impl Default for RemediatePolicy {
    fn default() -> Self {
        let mut runbooks = BTreeMap::new();
        runbooks.insert(
            "cpu_pressure".to_string(),
            vec![
                "Identify the top CPU consumers on the affected host".to_string(),
                "Check for runaway or recently deployed processes".to_string(),
                "Restart the offending service if load does not subside".to_string(),
            ],
        );
        runbooks.insert(
            "link_flap".to_string(),
            vec![
                "Check VSAT/LTE modem status and signal strength".to_string(),
                "Verify antenna tracking and blockage zones".to_string(),
                "Fail over to the secondary uplink if flapping persists".to_string(),
            ],
        );
        runbooks.insert(
            "auth_failure".to_string(),
            vec![
                "Review the source addresses of the failed attempts".to_string(),
                "Confirm no credential rollout is in progress".to_string(),
                "Block the offending source and notify the security officer".to_string(),
            ],
        );
        runbooks.insert(
            "disk_failure".to_string(),
            vec![
                "Check SMART status and filesystem errors on the device".to_string(),
                "Free or expand storage if the volume is full".to_string(),
                "Schedule a disk replacement at the next port call".to_string(),
            ],
        );
        runbooks.insert(
            "default".to_string(),
            vec![
                "Review the incident timeline and member anomalies".to_string(),
                "Check recent configuration or software changes on the ship".to_string(),
                "Escalate to the fleet operations center if the condition persists".to_string(),
            ],
        );
        Self { runbooks }
    }
}

impl RemediatePolicy {
    pub fn steps_for(&self, incident_type: &str) -> Vec<String> {
        self.runbooks
            .get(incident_type)
            .or_else(|| self.runbooks.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================================================
// Retention & SLOs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub anomalies_days: u32,
    pub incidents_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            anomalies_days: 7,
            incidents_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SloPolicy {
    pub fast_path_p99_ms: u64,
    pub insight_path_p99_ms: u64,
    /// Per-query timeout inside the fast enricher.
    pub enrich_query_timeout_ms: u64,
    /// Combined budget for all fast-enricher queries.
    pub enrich_total_budget_ms: u64,
}

impl Default for SloPolicy {
    fn default() -> Self {
        Self {
            fast_path_p99_ms: 500,
            insight_path_p99_ms: 5_000,
            enrich_query_timeout_ms: 150,
            enrich_total_budget_ms: 400,
        }
    }
}

// ============================================================================
// Loading & validation
// ============================================================================

impl Policy {
    /// Load the policy per the documented loading order and apply
    /// environment overrides. Returns the built-in defaults when no file is
    /// present.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, PolicyError> {
        let candidate = explicit_path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("TIDEWATCH_POLICY").ok().map(Into::into))
            .or_else(|| {
                let local = std::path::PathBuf::from("policy.toml");
                local.exists().then_some(local)
            });

        let mut policy = match candidate {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                let policy: Policy = toml::from_str(&text)?;
                tracing::info!(path = %path.display(), "Loaded policy file");
                policy
            }
            None => {
                tracing::info!("No policy file found, using built-in defaults");
                Policy::default()
            }
        };

        policy.apply_env_overrides();
        policy.validate()?;
        Ok(policy)
    }

    /// Load a specific file without fallbacks (used by the hot-reload
    /// watcher, which must not silently fall back to defaults).
    pub fn load_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        let mut policy: Policy = toml::from_str(&text)?;
        policy.apply_env_overrides();
        policy.validate()?;
        Ok(policy)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("TIDEWATCH_CORRELATION_THRESHOLD") {
            self.correlate.threshold = v;
        }
        if let Some(v) = env_parse::<u64>("TIDEWATCH_DEDUP_TTL_SEC") {
            self.correlate.dedup_ttl_sec = v;
        }
        if let Some(v) = env_parse::<u64>("TIDEWATCH_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = v;
        }
        if let Ok(v) = std::env::var("TIDEWATCH_LLM_MODEL") {
            if !v.is_empty() {
                self.llm.model = v;
            }
        }
        if let Some(v) = env_parse::<f64>("TIDEWATCH_ZSCORE_THRESHOLD") {
            self.detect.thresholds.zscore = v;
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.correlate.threshold == 0 {
            return Err(PolicyError::Invalid(
                "correlate.threshold must be at least 1".to_string(),
            ));
        }
        if self.correlate.stripes == 0 {
            return Err(PolicyError::Invalid(
                "correlate.stripes must be at least 1".to_string(),
            ));
        }
        if self.correlate.default_window_sec == 0 {
            return Err(PolicyError::Invalid(
                "correlate.default_window_sec must be positive".to_string(),
            ));
        }
        for (domain, secs) in &self.correlate.window_by_domain {
            if Domain::parse(domain).is_none() {
                return Err(PolicyError::Invalid(format!(
                    "correlate.window_by_domain has unknown domain '{domain}'"
                )));
            }
            if *secs == 0 {
                return Err(PolicyError::Invalid(format!(
                    "correlate.window_by_domain['{domain}'] must be positive"
                )));
            }
        }
        if self.detect.thresholds.zscore <= 0.0 {
            return Err(PolicyError::Invalid(
                "detect.thresholds.zscore must be positive".to_string(),
            ));
        }
        if self.detect.rolling_window_size == 0 {
            return Err(PolicyError::Invalid(
                "detect.rolling_window_size must be positive".to_string(),
            ));
        }
        for rule in &self.detect.patterns {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                return Err(PolicyError::Invalid(format!(
                    "detect.patterns: bad regex '{}': {e}",
                    rule.pattern
                )));
            }
            if !(0.0..=1.0).contains(&rule.score) {
                return Err(PolicyError::Invalid(format!(
                    "detect.patterns['{}'].score must be in [0, 1]",
                    rule.anomaly_type
                )));
            }
            if Domain::parse(&rule.domain).is_none() {
                return Err(PolicyError::Invalid(format!(
                    "detect.patterns['{}'] has unknown domain '{}'",
                    rule.anomaly_type, rule.domain
                )));
            }
        }
        for rule in &self.detect.severity_tags {
            if Domain::parse(&rule.domain).is_none() {
                return Err(PolicyError::Invalid(format!(
                    "detect.severity_tags['{}'] has unknown domain '{}'",
                    rule.severity, rule.domain
                )));
            }
        }
        if self.llm.timeout_ms == 0 {
            return Err(PolicyError::Invalid(
                "llm.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Wrap this policy in the shared hot-swappable handle.
    pub fn into_shared(self) -> SharedPolicy {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let policy = Policy::default();
        policy.validate().unwrap();
        assert_eq!(policy.correlate.threshold, 3);
        assert_eq!(policy.correlate.dedup_ttl_sec, 900);
        assert_eq!(policy.slo.fast_path_p99_ms, 500);
    }

    #[test]
    fn test_window_lookup_matches_domain_table() {
        let policy = CorrelatePolicy::default();
        assert_eq!(policy.window_for(Domain::Comms), chrono::Duration::minutes(5));
        assert_eq!(policy.window_for(Domain::Network), chrono::Duration::minutes(5));
        assert_eq!(policy.window_for(Domain::Security), chrono::Duration::minutes(10));
        assert_eq!(policy.window_for(Domain::System), chrono::Duration::minutes(10));
        assert_eq!(policy.window_for(Domain::Application), chrono::Duration::minutes(20));
    }

    #[test]
    fn test_window_lookup_accepts_long_domain_key() {
        let mut policy = CorrelatePolicy::default();
        policy.window_by_domain.remove("comms");
        policy
            .window_by_domain
            .insert("communications".to_string(), 420);
        assert_eq!(policy.window_for(Domain::Comms), chrono::Duration::seconds(420));
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let mut policy = Policy::default();
        policy.correlate.threshold = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_regex() {
        let mut policy = Policy::default();
        policy.detect.patterns.push(PatternRule::new("([", "system", "broken", 0.5));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let toml_text = r#"
            schema_version = 2

            [correlate]
            threshold = 5

            [llm]
            model = "qwen2.5-7b"
        "#;
        let policy: Policy = toml::from_str(toml_text).unwrap();
        assert_eq!(policy.schema_version, 2);
        assert_eq!(policy.correlate.threshold, 5);
        assert_eq!(policy.llm.model, "qwen2.5-7b");
        // Untouched sections keep defaults.
        assert_eq!(policy.correlate.dedup_ttl_sec, 900);
        assert_eq!(policy.detect.thresholds.zscore, 3.0);
    }

    #[test]
    fn test_severity_tag_score_formula() {
        let rule = SeverityTagRule::new("critical", 1, "log_critical", "system");
        assert!((rule.score() - 0.7).abs() < 1e-9);
        let rule = SeverityTagRule::new("emergency", 2, "log_emergency", "system");
        assert!((rule.score() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_runbook_fallback_to_default() {
        let remediate = RemediatePolicy::default();
        assert!(!remediate.steps_for("cpu_pressure").is_empty());
        let steps = remediate.steps_for("never_seen_type");
        assert_eq!(steps, remediate.runbooks["default"]);
    }
}
