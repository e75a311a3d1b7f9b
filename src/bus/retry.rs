//! Publish retry with exponential backoff, jitter, and dead-lettering.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

use super::{subjects, Bus, BusError, ErrorEnvelope};

/// Backoff schedule for publish retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 50ms, 100ms, 200ms, ... capped at 2s, 5 attempts.
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based, attempt 0 is the first
    /// retry after the initial failure).
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Publish an event with retries; on exhaustion, dead-letter it.
///
/// The event is serialized once. After the final attempt fails, an
/// [`ErrorEnvelope`] wrapping the original payload goes to `dlq.<stage>`
/// (best-effort) and `<stage>.dlq_published` is incremented. The original
/// error is returned so callers can mark downstream state accordingly.
/// `now` stamps the envelope; callers pass their injected clock's time so
/// dead-letter timestamps stay test-controllable.
pub async fn publish_with_retry<T: Serialize>(
    bus: &dyn Bus,
    subject: &str,
    event: &T,
    stage: &str,
    policy: RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(event)?;

    let mut last_err = None;
    for attempt in 0..policy.attempts {
        match bus.publish(subject, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    subject = subject,
                    attempt = attempt + 1,
                    error = %e,
                    "Publish failed, retrying"
                );
                last_err = Some(e);
                if attempt + 1 < policy.attempts {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
        }
    }

    let err = last_err.unwrap_or_else(|| BusError::Publish {
        subject: subject.to_string(),
        reason: "exhausted retries".to_string(),
    });

    let envelope = ErrorEnvelope {
        stage: stage.to_string(),
        subject: subject.to_string(),
        error: err.to_string(),
        ts: now,
        payload: serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null),
    };
    let dlq_subject = subjects::dlq(stage);
    if let Ok(bytes) = serde_json::to_vec(&envelope) {
        if let Err(dlq_err) = bus.publish(&dlq_subject, bytes).await {
            tracing::error!(
                subject = %dlq_subject,
                error = %dlq_err,
                "Dead-letter publish failed, event lost"
            );
        }
    }
    crate::metrics::inc(&format!("{stage}.dlq_published"));
    tracing::error!(
        subject = subject,
        dlq = %dlq_subject,
        "Publish exhausted retries, event dead-lettered"
    );

    Err(err)
}
