//! Time-windowed anomaly accumulation.
//!
//! One tumbling window per `(ship_id, domain)` key, anchored at the first
//! arrival for that key. State machine per window:
//! `empty → accumulating → (fired | expired)`. A fired window accepts no
//! further members; a late arrival opens a fresh window. Expiry is swept in
//! the background under a per-tick budget.
//!
//! Window state is guarded by striped locks keyed by
//! `hash(ship_id, domain) mod K`; the striped worker dispatch already
//! serializes same-key events, the locks protect against the sweeper.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::types::{AnomalyEnriched, Domain};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub ship_id: String,
    pub domain: Domain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accumulating,
    Fired,
}

struct Window {
    deadline: DateTime<Utc>,
    members: Vec<AnomalyEnriched>,
    phase: Phase,
}

/// Outcome of offering an anomaly to its window.
pub enum Offer {
    /// Below threshold; the anomaly joined its window.
    Accumulated { members: usize },
    /// Threshold reached: the window fired with these members.
    Fired(Vec<AnomalyEnriched>),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Below-threshold windows expired (members discarded).
    pub expired: usize,
    /// Fired windows past their deadline cleaned up.
    pub cleared: usize,
    /// True when the tick budget ran out before the table was fully swept.
    pub truncated: bool,
}

pub struct WindowTable {
    stripes: Vec<Mutex<HashMap<WindowKey, Window>>>,
}

impl WindowTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, key: &WindowKey) -> &Mutex<HashMap<WindowKey, Window>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Offer an anomaly to its window, firing when the threshold is met.
    pub fn offer(
        &self,
        anomaly: AnomalyEnriched,
        duration: Duration,
        threshold: usize,
        now: DateTime<Utc>,
    ) -> Offer {
        let key = WindowKey {
            ship_id: anomaly.anomaly.ship_id.clone(),
            domain: anomaly.anomaly.domain,
        };
        let mut stripe = self.stripe(&key).lock().unwrap_or_else(|p| p.into_inner());

        let window = stripe.entry(key).or_insert_with(|| Window {
            deadline: now + duration,
            members: Vec::new(),
            phase: Phase::Accumulating,
        });

        // A fired window never re-opens; an overdue accumulating window has
        // silently expired. Either way this arrival anchors a new window.
        if window.phase == Phase::Fired || now >= window.deadline {
            if window.phase == Phase::Accumulating && !window.members.is_empty() {
                crate::metrics::inc("correlator.windows_expired");
            }
            *window = Window {
                deadline: now + duration,
                members: Vec::new(),
                phase: Phase::Accumulating,
            };
        }

        window.members.push(anomaly);

        if window.members.len() >= threshold {
            window.phase = Phase::Fired;
            Offer::Fired(std::mem::take(&mut window.members))
        } else {
            Offer::Accumulated {
                members: window.members.len(),
            }
        }
    }

    /// Sweep expired windows, resuming from `cursor` and stopping once
    /// `budget` is spent. The cursor wraps so every stripe is eventually
    /// visited even under constant budget pressure.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        budget: std::time::Duration,
        cursor: &mut usize,
    ) -> SweepStats {
        let started = std::time::Instant::now();
        let mut stats = SweepStats::default();

        for _ in 0..self.stripes.len() {
            if started.elapsed() >= budget {
                stats.truncated = true;
                break;
            }
            let index = *cursor % self.stripes.len();
            *cursor = (*cursor + 1) % self.stripes.len();

            let mut stripe = self.stripes[index].lock().unwrap_or_else(|p| p.into_inner());
            stripe.retain(|_, window| {
                if now < window.deadline {
                    return true;
                }
                match window.phase {
                    Phase::Accumulating => {
                        // Below threshold past the deadline: discard the
                        // members; the raw anomalies stay queryable in the
                        // store.
                        stats.expired += 1;
                        crate::metrics::inc("correlator.windows_expired");
                    }
                    Phase::Fired => {
                        stats.cleared += 1;
                    }
                }
                false
            });
        }

        stats
    }

    #[cfg(test)]
    pub fn window_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }
}
