//! Shared state for the API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::policy::SharedPolicy;
use crate::store::SharedStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: SharedStore,
    pub bus: SharedBus,
    pub policy: SharedPolicy,
    pub clock: SharedClock,
    pub started_at: Instant,
    /// Readiness flag: cleared on permanent dependency failure so the
    /// orchestrator stops routing traffic here.
    ready: Arc<AtomicBool>,
}

impl ApiState {
    pub fn new(
        store: SharedStore,
        bus: SharedBus,
        policy: SharedPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            bus,
            policy,
            clock,
            started_at: Instant::now(),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
