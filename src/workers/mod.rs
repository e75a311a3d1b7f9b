//! Bounded worker queues for stage dispatch.
//!
//! Each stage pulls bus messages onto a bounded in-memory queue drained by a
//! pool of worker tasks. On overflow the oldest item is evicted and counted
//! under `<component>.drops_overflow` — producers are never blocked.
//!
//! The correlator needs per-`(ship_id, domain)` serialization, so it uses
//! [`StripedPool`]: one queue and one worker per stripe, with events routed
//! by key hash. Events for the same key always land on the same worker.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default per-queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default worker pool size: min(32, CPU * 4).
pub fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    (cpus * 4).min(32)
}

/// Bounded MPMC queue with drop-oldest overflow behavior.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
        })
    }

    /// Push an item. On overflow the oldest queued item is evicted, the
    /// `<name>.drops_overflow` counter is bumped and a WARN is emitted.
    pub fn push(&self, item: T) {
        {
            let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            if items.len() >= self.capacity {
                items.pop_front();
                crate::metrics::inc(&format!("{}.drops_overflow", self.name));
                tracing::warn!(
                    queue = %self.name,
                    capacity = self.capacity,
                    "Queue overflow, oldest event dropped"
                );
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Pop the next item, waiting if the queue is empty.
    pub async fn pop(&self) -> T {
        loop {
            {
                let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(item) = items.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop for drain loops.
    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queues partitioned by key hash: one queue per stripe, one worker per
/// stripe, so all events for a key are processed in arrival order.
pub struct StripedPool<T> {
    queues: Vec<Arc<BoundedQueue<T>>>,
}

impl<T> StripedPool<T> {
    pub fn new(name: &str, stripes: usize, capacity_per_stripe: usize) -> Self {
        let stripes = stripes.max(1);
        // All stripes share the component name so overflow counts aggregate
        // under one `<component>.drops_overflow` metric.
        let queues = (0..stripes)
            .map(|_| BoundedQueue::new(name, capacity_per_stripe))
            .collect();
        Self { queues }
    }

    pub fn stripes(&self) -> usize {
        self.queues.len()
    }

    /// Route an item to its stripe queue.
    pub fn dispatch<K: Hash>(&self, key: &K, item: T) {
        let stripe = self.stripe_for(key);
        self.queues[stripe].push(item);
    }

    /// Stripe index for a key.
    pub fn stripe_for<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.queues.len()
    }

    /// Queue handle for a stripe worker.
    pub fn queue(&self, stripe: usize) -> Arc<BoundedQueue<T>> {
        Arc::clone(&self.queues[stripe])
    }
}
