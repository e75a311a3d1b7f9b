//! Shared data structures for the maritime AIOps event pipeline
//!
//! This module defines the event types that flow across the bus:
//! - Stage D: LogRecord in, AnomalyDetected out
//! - Stage E1: AnomalyEnriched (anomaly + historical context + severity)
//! - Stage C: IncidentCreated (windowed, deduplicated anomaly clusters)
//! - Stage E2: IncidentEnriched (AI narrative + similar-case retrieval)
//!
//! Events are immutable per publication: a stage owns an event until it is
//! published, downstream stages receive their own copy and republish an
//! extended record under a new subject. Unknown JSON fields are preserved in
//! each event's flattened extensions map and round-tripped verbatim.

mod anomaly;
mod incident;
mod log_record;
mod tracking;

pub use anomaly::*;
pub use incident::*;
pub use log_record::*;
pub use tracking::*;

use serde::{Deserialize, Serialize};

/// Pipeline stage names as they appear in trace records and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detect,
    Enrich,
    Correlate,
    Persist,
    Insight,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Detect => "detect",
            Stage::Enrich => "enrich",
            Stage::Correlate => "correlate",
            Stage::Persist => "persist",
            Stage::Insight => "insight",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
