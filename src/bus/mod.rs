//! Publish/subscribe bus abstraction.
//!
//! Every stage talks to one input subject and one output subject; delivery
//! is at-least-once with UTF-8 JSON payloads. The transport below this
//! abstraction is out of scope — the in-process [`MemoryBus`] is the
//! reference implementation and the test substrate. Events the pipeline
//! cannot publish after retries are wrapped in an [`ErrorEnvelope`] and
//! dead-lettered on `dlq.<stage>`.

mod memory;
mod retry;

pub use memory::MemoryBus;
pub use retry::{publish_with_retry, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Well-known bus subjects.
pub mod subjects {
    pub const LOGS_ANOMALOUS: &str = "logs.anomalous";
    pub const ANOMALY_DETECTED: &str = "anomaly.detected";
    pub const ANOMALY_ENRICHED: &str = "anomaly.enriched";
    pub const INCIDENTS_CREATED: &str = "incidents.created";
    pub const INCIDENTS_ENRICHED: &str = "incidents.enriched";

    /// Dead-letter subject for a stage.
    pub fn dlq(stage: &str) -> String {
        format!("dlq.{stage}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("subject closed: {0}")]
    Closed(String),
    #[error("publish failed on {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SharedBus = Arc<dyn Bus>;

/// Minimal pub/sub surface used by every stage.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a JSON payload to a subject. At-least-once: a success means
    /// the transport accepted the message, not that anyone consumed it.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Open a subscription on a subject. Messages published after this call
    /// are delivered; a slow consumer may observe gaps, which are surfaced
    /// as `lagged` counts rather than errors.
    fn subscribe(&self, subject: &str) -> Subscription;
}

/// Receiving half of a subscription.
pub struct Subscription {
    subject: String,
    rx: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
}

impl Subscription {
    pub(crate) fn new(subject: String, rx: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>) -> Self {
        Self { subject, rx }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receive the next message. Lagged deliveries (ring-buffer overrun) are
    /// counted under `<subject>.lagged` and skipped; `None` means the
    /// subject was closed.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(missed)) => {
                    crate::metrics::add(&format!("{}.lagged", self.subject), missed);
                    tracing::warn!(
                        subject = %self.subject,
                        missed = missed,
                        "Subscriber lagged, messages skipped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Dead-letter wrapper: the original payload plus an error description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub stage: String,
    /// Subject the payload was destined for.
    pub subject: String,
    pub error: String,
    pub ts: DateTime<Utc>,
    /// Original payload, verbatim.
    pub payload: serde_json::Value,
}

/// Serialize and publish a typed event.
pub async fn publish_json<T: Serialize>(
    bus: &dyn Bus,
    subject: &str,
    event: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(event)?;
    bus.publish(subject, payload).await
}
