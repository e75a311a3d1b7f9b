//! Tidewatch: maritime fleet AIOps event pipeline
//!
//! Strictly-ordered asynchronous pipeline turning raw ship telemetry/log
//! signals into correlated incidents:
//!
//! ```text
//! logs.anomalous → Detector → anomaly.detected
//!                → Fast Enricher → anomaly.enriched
//!                → Correlator → incidents.created → { Incident API, Insight Enricher }
//!                → incidents.enriched
//! ```
//!
//! ## Architecture
//!
//! - **Detector**: classifies ingress log records into typed anomalies
//! - **Fast Enricher**: historical context under a strict latency budget
//! - **Correlator**: time-windowed grouping, dedup, incident formation
//! - **Insight Enricher**: LLM narrative + RAG similar cases, with fallback
//! - **Incident API**: append-only persistence and the query surface
//!
//! Stages 1–3 compose the Fast Path (p99 ≤ 500 ms, never blocks on the
//! LLM); the Insight Path runs asynchronously off `incidents.created`.
//! Every event carries a tracking id end to end.

pub mod api;
pub mod bus;
pub mod clock;
pub mod correlator;
pub mod detector;
pub mod enricher;
pub mod insight;
pub mod metrics;
pub mod policy;
pub mod store;
pub mod types;
pub mod workers;

// Re-export the event model
pub use types::{
    AnomalyDetected, AnomalyEnriched, Confidence, Domain, IncidentCreated, IncidentEnriched,
    IncidentStatus, LogRecord, Severity, Stage, SuppressKey, TrackingId,
};

// Re-export the stage services
pub use api::{create_app, ApiState, IncidentPersister};
pub use correlator::Correlator;
pub use detector::DetectorService;
pub use enricher::FastEnricher;
pub use insight::InsightEnricher;

// Re-export the shared plumbing handles
pub use bus::{Bus, MemoryBus, SharedBus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use policy::{Policy, Settings, SharedPolicy};
pub use store::{ColumnStore, HttpColumnStore, MemoryColumnStore, SharedStore};
