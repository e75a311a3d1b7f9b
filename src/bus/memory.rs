//! In-process bus over tokio broadcast channels, one channel per subject.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use super::{Bus, BusError, Subscription};

/// Per-subject ring-buffer capacity. Sized to absorb bursts from the
/// ingestion agent without lagging the fast path.
const SUBJECT_CAPACITY: usize = 4096;

/// In-process pub/sub bus.
///
/// Subjects are created lazily on first publish or subscribe. Publishing to
/// a subject with no subscribers is not an error — at-least-once semantics
/// only apply to attached consumers, matching the external bus contract.
pub struct MemoryBus {
    subjects: RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subjects: RwLock::new(HashMap::new()),
        })
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<Arc<Vec<u8>>> {
        if let Some(tx) = self
            .subjects
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(subject)
        {
            return tx.clone();
        }
        let mut subjects = self.subjects.write().unwrap_or_else(|p| p.into_inner());
        subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(SUBJECT_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let tx = self.sender(subject);
        // A send error only means no receiver is currently attached; the
        // message is dropped exactly as a broker drops to zero consumers.
        let _ = tx.send(Arc::new(payload));
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> Subscription {
        let rx = self.sender(subject).subscribe();
        Subscription::new(subject.to_string(), rx)
    }
}
