//! First-class identifier types: `TrackingId` and `SuppressKey`.
//!
//! Both were plain strings in earlier revisions of the pipeline, which made it
//! too easy to pass a ship id where a tracking id was expected. They are now
//! newtypes with documented formats and constructors.

use serde::{Deserialize, Serialize};

/// End-to-end tracking identifier carried on every event and log line.
///
/// Format: opaque, non-empty UTF-8. Upstream producers may use any scheme;
/// the value is propagated verbatim across all stages. When a record arrives
/// at ingress without one, [`TrackingId::synthesize`] mints a
/// `syn-<uuid>` identifier and the record is tagged `synthetic=true`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(String);

impl TrackingId {
    /// Wrap an identifier received on the wire. Returns `None` for empty
    /// input — callers must synthesize instead of propagating an empty id.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Mint a synthetic tracking id for a record that arrived without one.
    pub fn synthesize() -> Self {
        Self(format!("syn-{}", uuid::Uuid::new_v4()))
    }

    /// True if this id was minted at ingress rather than received.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with("syn-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic incident fingerprint used for duplicate suppression.
///
/// Format: `md5(ship_id|domain|service|anomaly_type|device_id|severity)` as
/// 32 lowercase hex characters. `device_id` substitutes `-` when absent; the
/// severity component is the max member severity of the incident (the
/// "severity bucket"). Two incidents with the same key formed within the
/// dedup TTL are duplicates; the later formation is suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuppressKey(String);

impl SuppressKey {
    /// Derive the fingerprint from the ordered identity tuple.
    pub fn derive(
        ship_id: &str,
        domain: &str,
        service: &str,
        anomaly_type: &str,
        device_id: Option<&str>,
        severity_bucket: &str,
    ) -> Self {
        let material = format!(
            "{}|{}|{}|{}|{}|{}",
            ship_id,
            domain,
            service,
            anomaly_type,
            device_id.unwrap_or("-"),
            severity_bucket,
        );
        Self(format!("{:x}", md5::compute(material.as_bytes())))
    }

    /// Wrap a key received on the wire (e.g. when replaying persisted
    /// incidents). Returns `None` unless it looks like a valid digest.
    pub fn from_wire(raw: &str) -> Option<Self> {
        if raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SuppressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_id_rejects_empty() {
        assert!(TrackingId::from_wire("").is_none());
        assert!(TrackingId::from_wire("   ").is_none());
        assert!(TrackingId::from_wire("abc-123").is_some());
    }

    #[test]
    fn test_tracking_id_synthetic_flag() {
        let synth = TrackingId::synthesize();
        assert!(synth.is_synthetic());

        let wire = TrackingId::from_wire("req-9f2c").unwrap();
        assert!(!wire.is_synthetic());
    }

    #[test]
    fn test_tracking_id_json_round_trip() {
        let id = TrackingId::from_wire("trace-42").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"trace-42\"");

        let back: TrackingId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_suppress_key_deterministic() {
        let a = SuppressKey::derive("mv-aurora", "system", "cpu-monitor", "cpu_pressure", None, "high");
        let b = SuppressKey::derive("mv-aurora", "system", "cpu-monitor", "cpu_pressure", None, "high");
        assert_eq!(a, b);

        let c = SuppressKey::derive("mv-aurora", "system", "cpu-monitor", "cpu_pressure", None, "crit");
        assert_ne!(a, c, "severity bucket must participate in the fingerprint");
    }

    #[test]
    fn test_suppress_key_device_substitution() {
        let missing = SuppressKey::derive("s", "system", "svc", "t", None, "low");
        let dash = SuppressKey::derive("s", "system", "svc", "t", Some("-"), "low");
        // Documented default substitution: missing device_id reads as "-".
        assert_eq!(missing, dash);

        let real = SuppressKey::derive("s", "system", "svc", "t", Some("gps-1"), "low");
        assert_ne!(missing, real);
    }

    #[test]
    fn test_suppress_key_round_trip() {
        let key = SuppressKey::derive("s", "network", "svc", "t", Some("dev"), "med");
        let parsed = SuppressKey::from_wire(key.as_str()).unwrap();
        assert_eq!(parsed, key);

        assert!(SuppressKey::from_wire("not-a-digest").is_none());
    }
}
