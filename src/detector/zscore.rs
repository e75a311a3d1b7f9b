//! Statistical z-score detector.
//!
//! Keeps a rolling window per `(ship_id, metric_name)` over the numeric
//! parsed fields of incoming records. A sample whose |z| against the prior
//! window meets the threshold emits an anomaly with `score = min(1, |z|/6)`.
//! Windows are bounded (default 128 samples) and TTL-evicted (default
//! 10 min) so an idle metric does not pin stale statistics.

use chrono::{DateTime, Duration, Utc};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::policy::Policy;
use crate::types::{AnomalyDetected, Domain};

use super::{base_anomaly, ValidatedRecord};

/// Below this standard deviation the metric is considered flat and no z is
/// computed (a constant series would otherwise divide by ~zero).
const MIN_STDDEV: f64 = 1e-9;

struct RollingWindow {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl RollingWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>, ttl: Duration, cap: usize) {
        let horizon = now - ttl;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > cap {
            self.samples.pop_front();
        }
    }

    /// Sample mean and standard deviation (n-1 denominator).
    fn stats(&self) -> Option<(f64, f64)> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let mean = self.samples.iter().map(|(_, v)| *v).sum::<f64>() / n as f64;
        let variance = self
            .samples
            .iter()
            .map(|(_, v)| (*v - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        Some((mean, variance.sqrt()))
    }
}

pub struct ZscoreDetector {
    windows: Mutex<HashMap<(String, String), RollingWindow>>,
}

impl ZscoreDetector {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Observe every numeric parsed field of the record and emit an anomaly
    /// per metric whose deviation meets the threshold.
    pub fn detect(
        &self,
        record: &ValidatedRecord,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyDetected> {
        let cap = policy.detect.rolling_window_size;
        let ttl = Duration::seconds(policy.detect.rolling_window_ttl_sec as i64);
        let threshold = policy.detect.thresholds.zscore;
        let min_samples = policy.detect.thresholds.zscore_min_samples;

        // Metric anomalies default to the system domain unless the ingest
        // agent tagged the record with one (documented substitution).
        let domain = record
            .parsed_fields
            .get("domain")
            .and_then(|v| v.as_str())
            .and_then(Domain::parse)
            .unwrap_or(Domain::System);

        let mut anomalies = Vec::new();
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());

        for (metric, value) in record
            .parsed_fields
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
        {
            if metric == "device_id" {
                continue;
            }
            let key = (record.ship_id.clone(), metric.to_string());
            let window = windows.entry(key).or_insert_with(RollingWindow::new);
            window.evict(now, ttl, cap);

            // z is computed against the window *before* this sample joins
            // it, so a burst of identical outliers still scores high.
            if window.samples.len() >= min_samples {
                if let Some((mean, std_dev)) = window.stats() {
                    if std_dev > MIN_STDDEV {
                        let z = (value - mean) / std_dev;
                        if z.abs() >= threshold {
                            let mut anomaly = base_anomaly(
                                record,
                                domain,
                                &format!("{metric}_outlier"),
                                "zscore",
                                (z.abs() / 6.0).min(1.0),
                            );
                            anomaly.metric_name = Some(metric.to_string());
                            anomaly.metric_value = Some(value);
                            anomaly.threshold = Some(threshold);
                            if let Some(p) = two_sided_p_value(z) {
                                anomaly
                                    .extensions
                                    .insert("p_value".to_string(), serde_json::json!(p));
                            }
                            anomalies.push(anomaly);
                        }
                    }
                }
            }

            window.samples.push_back((now, value));
            if window.samples.len() > cap {
                window.samples.pop_front();
            }
        }

        // Drop keys whose entire window aged out, so idle metrics release
        // their memory.
        windows.retain(|_, w| !w.samples.is_empty());

        anomalies
    }

    #[cfg(test)]
    fn window_len(&self, ship_id: &str, metric: &str) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(ship_id.to_string(), metric.to_string()))
            .map(|w| w.samples.len())
            .unwrap_or(0)
    }
}

impl Default for ZscoreDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-sided tail probability of a z observation under the standard normal.
/// Carried in the anomaly extensions for operator tooling.
fn two_sided_p_value(z: f64) -> Option<f64> {
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some(2.0 * (1.0 - normal.cdf(z.abs())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackingId;
    use std::collections::BTreeMap;

    fn record(ship: &str, metric: &str, value: f64) -> ValidatedRecord {
        let mut parsed_fields = BTreeMap::new();
        parsed_fields.insert(metric.to_string(), serde_json::json!(value));
        ValidatedRecord {
            tracking_id: TrackingId::from_wire("t-1").unwrap(),
            synthetic: false,
            ts: "2026-03-01T12:00:00Z".parse().unwrap(),
            ship_id: ship.to_string(),
            service: "telemetry".to_string(),
            severity_hint: None,
            device_id: None,
            raw_message: String::new(),
            parsed_fields,
            evidence_ref: "log:x:0:t-1".to_string(),
        }
    }

    fn now_at(secs: i64) -> DateTime<Utc> {
        let base: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        base + Duration::seconds(secs)
    }

    #[test]
    fn test_outlier_emits_after_warmup() {
        let detector = ZscoreDetector::new();
        let policy = Policy::default();

        // Warm the window with a noisy-but-stable series.
        for i in 0..32 {
            let value = 50.0 + if i % 2 == 0 { 0.5 } else { -0.5 };
            let emitted = detector.detect(&record("mv-aurora", "cpu_load", value), &policy, now_at(i));
            assert!(emitted.is_empty(), "stable series must not emit");
        }

        // A far outlier must emit with a saturated score.
        let anomalies = detector.detect(&record("mv-aurora", "cpu_load", 95.0), &policy, now_at(40));
        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.anomaly_type, "cpu_load_outlier");
        assert_eq!(anomaly.metric_name.as_deref(), Some("cpu_load"));
        assert_eq!(anomaly.metric_value, Some(95.0));
        assert!((anomaly.score - 1.0).abs() < 1e-9, "|z| >> 6 saturates at 1.0");

        let p = anomaly.extensions.get("p_value").and_then(|v| v.as_f64()).unwrap();
        assert!(p < 0.001, "a far outlier carries a vanishing tail probability");
    }

    #[test]
    fn test_below_min_samples_is_silent() {
        let detector = ZscoreDetector::new();
        let policy = Policy::default();

        for i in 0..10 {
            detector.detect(&record("mv-aurora", "latency", 10.0 + i as f64), &policy, now_at(i));
        }
        // Window smaller than zscore_min_samples: even a wild value is quiet.
        let anomalies = detector.detect(&record("mv-aurora", "latency", 10_000.0), &policy, now_at(11));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_flat_series_never_divides_by_zero() {
        let detector = ZscoreDetector::new();
        let policy = Policy::default();

        for i in 0..32 {
            detector.detect(&record("mv-aurora", "rpm", 1500.0), &policy, now_at(i));
        }
        let anomalies = detector.detect(&record("mv-aurora", "rpm", 1500.0), &policy, now_at(40));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_ttl_evicts_stale_samples() {
        let detector = ZscoreDetector::new();
        let policy = Policy::default();

        for i in 0..20 {
            detector.detect(&record("mv-aurora", "flow", 7.0 + (i % 3) as f64), &policy, now_at(i));
        }
        assert_eq!(detector.window_len("mv-aurora", "flow"), 20);

        // Eleven minutes later the whole window has aged out.
        detector.detect(&record("mv-aurora", "flow", 7.5), &policy, now_at(11 * 60 + 30));
        assert_eq!(detector.window_len("mv-aurora", "flow"), 1);
    }

    #[test]
    fn test_windows_keyed_per_ship_and_metric() {
        let detector = ZscoreDetector::new();
        let policy = Policy::default();

        for i in 0..32 {
            detector.detect(&record("mv-aurora", "cpu_load", 50.0 + (i % 2) as f64), &policy, now_at(i));
        }
        // Same metric on a different ship has no window yet, so no emission.
        let anomalies = detector.detect(&record("mv-borealis", "cpu_load", 95.0), &policy, now_at(40));
        assert!(anomalies.is_empty());
    }
}
