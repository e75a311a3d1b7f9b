//! Process-local metrics registry.
//!
//! Counters and latency histograms are hand-maintained atomics rendered in
//! Prometheus text format (version 0.0.4) by the `/metrics` endpoint — no
//! exporter crate required. Metric names use the pipeline's dotted
//! convention (`detector.drops`, `correlator.duplicates_suppressed`); the
//! renderer maps dots to underscores for Prometheus.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Histogram bucket upper bounds, milliseconds.
const LATENCY_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

#[derive(Default)]
struct Registry {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: Mutex<BTreeMap<String, Arc<Histogram>>>,
}

/// Fixed-bucket latency histogram.
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    overflow: AtomicU64,
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        match LATENCY_BUCKETS_MS.iter().position(|&b| ms <= b) {
            Some(i) => {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Upper-bound estimate of the p-quantile from bucket boundaries.
    /// Returns `None` when the histogram is empty.
    pub fn quantile_ms(&self, q: f64) -> Option<u64> {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let rank = ((total as f64) * q).ceil() as u64;
        let mut seen = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return Some(LATENCY_BUCKETS_MS[i]);
            }
        }
        // Rank falls into the overflow bucket; report the largest bound.
        Some(u64::MAX)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Increment a named counter by 1.
pub fn inc(name: &str) {
    add(name, 1);
}

/// Increment a named counter by `delta`.
pub fn add(name: &str, delta: u64) {
    let counter = {
        let mut counters = registry()
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        Arc::clone(counters.entry(name.to_string()).or_default())
    };
    counter.fetch_add(delta, Ordering::Relaxed);
}

/// Current value of a counter (0 if never touched).
pub fn counter_value(name: &str) -> u64 {
    let counters = registry()
        .counters
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    counters
        .get(name)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Record a latency observation into a named histogram.
pub fn observe_ms(name: &str, ms: u64) {
    let histogram = {
        let mut histograms = registry()
            .histograms
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        Arc::clone(histograms.entry(name.to_string()).or_default())
    };
    histogram.record(ms);
}

/// Fetch a histogram handle for quantile queries.
pub fn histogram(name: &str) -> Option<Arc<Histogram>> {
    let histograms = registry()
        .histograms
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    histograms.get(name).cloned()
}

/// Render the registry in Prometheus text format.
pub fn render() -> String {
    let mut body = String::with_capacity(2048);

    {
        let counters = registry()
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for (name, value) in counters.iter() {
            let prom = prom_name(name);
            body.push_str(&format!("# TYPE {prom} counter\n"));
            body.push_str(&format!("{prom} {}\n", value.load(Ordering::Relaxed)));
        }
    }

    {
        let histograms = registry()
            .histograms
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for (name, histogram) in histograms.iter() {
            let prom = prom_name(name);
            body.push_str(&format!("# TYPE {prom} histogram\n"));
            let mut cumulative = 0u64;
            for (i, bucket) in histogram.buckets.iter().enumerate() {
                cumulative += bucket.load(Ordering::Relaxed);
                body.push_str(&format!(
                    "{prom}_bucket{{le=\"{}\"}} {cumulative}\n",
                    LATENCY_BUCKETS_MS[i]
                ));
            }
            cumulative += histogram.overflow.load(Ordering::Relaxed);
            body.push_str(&format!("{prom}_bucket{{le=\"+Inf\"}} {cumulative}\n"));
            body.push_str(&format!(
                "{prom}_sum {}\n",
                histogram.sum_ms.load(Ordering::Relaxed)
            ));
            body.push_str(&format!(
                "{prom}_count {}\n",
                histogram.count.load(Ordering::Relaxed)
            ));
        }
    }

    body
}

fn prom_name(name: &str) -> String {
    format!("tidewatch_{}", name.replace(['.', '-'], "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        inc("test.counter_increments");
        add("test.counter_increments", 4);
        assert_eq!(counter_value("test.counter_increments"), 5);
    }

    #[test]
    fn test_histogram_quantile_upper_bound() {
        for _ in 0..99 {
            observe_ms("test.quantile", 40);
        }
        observe_ms("test.quantile", 2_000);

        let h = histogram("test.quantile").unwrap();
        assert_eq!(h.count(), 100);
        // 99 of 100 observations fit in the 50 ms bucket.
        assert_eq!(h.quantile_ms(0.99), Some(50));
        assert_eq!(h.quantile_ms(1.0), Some(2_500));
    }

    #[test]
    fn test_render_contains_prometheus_names() {
        inc("render.check.total");
        observe_ms("render.latency_ms", 12);

        let text = render();
        assert!(text.contains("tidewatch_render_check_total"));
        assert!(text.contains("tidewatch_render_latency_ms_bucket{le=\"25\"}"));
        assert!(text.contains("tidewatch_render_latency_ms_count"));
    }
}
