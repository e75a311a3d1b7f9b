//! Incident fingerprint dedup cache.
//!
//! Maps a [`SuppressKey`] to the incident that most recently claimed it.
//! A second formation with the same key inside the TTL is suppressed and
//! handed the suppressing incident's id for cross-reference. The cache is
//! updated *before* publish, so a failed publish cannot lead to a duplicate
//! emission on retry.
//!
//! Default backend is in-memory behind a single rwlock with TTL sweeping.
//! Setting `correlate.dedup_persist_path` selects the sled backend, which
//! survives restarts at the cost of a disk write per incident; without it a
//! restart inside the TTL can let one duplicate incident through.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::SuppressKey;

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("dedup persistence error: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    incident_id: String,
    created_at: DateTime<Utc>,
}

enum Backend {
    Memory(RwLock<HashMap<String, Entry>>),
    Sled(sled::Db),
}

pub struct DedupCache {
    backend: Backend,
    ttl: Duration,
}

impl DedupCache {
    pub fn in_memory(ttl_sec: u64) -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
            ttl: Duration::seconds(ttl_sec as i64),
        }
    }

    pub fn persistent(path: &str, ttl_sec: u64) -> Result<Self, DedupError> {
        let db = sled::open(path).map_err(|e| DedupError::Persistence(e.to_string()))?;
        Ok(Self {
            backend: Backend::Sled(db),
            ttl: Duration::seconds(ttl_sec as i64),
        })
    }

    /// Register `incident_id` under `key` unless a live entry exists.
    ///
    /// Returns `Some(existing_incident_id)` when the new formation must be
    /// suppressed; `None` when the key was claimed.
    pub fn check_and_insert(
        &self,
        key: &SuppressKey,
        incident_id: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.write().unwrap_or_else(|p| p.into_inner());
                if let Some(entry) = map.get(key.as_str()) {
                    if now.signed_duration_since(entry.created_at) < self.ttl {
                        return Some(entry.incident_id.clone());
                    }
                }
                map.insert(
                    key.as_str().to_string(),
                    Entry {
                        incident_id: incident_id.to_string(),
                        created_at: now,
                    },
                );
                None
            }
            Backend::Sled(db) => {
                if let Ok(Some(bytes)) = db.get(key.as_str()) {
                    if let Ok(entry) = serde_json::from_slice::<Entry>(&bytes) {
                        if now.signed_duration_since(entry.created_at) < self.ttl {
                            return Some(entry.incident_id);
                        }
                    }
                }
                let entry = Entry {
                    incident_id: incident_id.to_string(),
                    created_at: now,
                };
                match serde_json::to_vec(&entry) {
                    Ok(bytes) => {
                        if let Err(e) = db.insert(key.as_str(), bytes) {
                            tracing::warn!(error = %e, "Dedup cache write failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dedup entry serialization failed"),
                }
                None
            }
        }
    }

    /// Drop entries older than the TTL. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.write().unwrap_or_else(|p| p.into_inner());
                let before = map.len();
                map.retain(|_, entry| now.signed_duration_since(entry.created_at) < self.ttl);
                before - map.len()
            }
            Backend::Sled(db) => {
                let mut removed = 0;
                let stale: Vec<sled::IVec> = db
                    .iter()
                    .filter_map(|item| item.ok())
                    .filter(|(_, value)| {
                        serde_json::from_slice::<Entry>(value)
                            .map(|e| now.signed_duration_since(e.created_at) >= self.ttl)
                            .unwrap_or(true)
                    })
                    .map(|(key, _)| key)
                    .collect();
                for key in stale {
                    if db.remove(&key).is_ok() {
                        removed += 1;
                    }
                }
                removed
            }
        }
    }
}
