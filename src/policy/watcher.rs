//! Polling-based policy file watcher.
//!
//! Checks the policy file's mtime every 2 seconds. When a change is
//! detected, debounces for 500 ms (editors often write in stages), then
//! reloads and atomically swaps the shared policy. An invalid new file is
//! rejected with a WARN and the previous policy stays active.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use super::{Policy, SharedPolicy};

/// Interval between mtime checks.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Debounce delay after detecting a change.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Run the policy file watcher loop until cancelled.
pub async fn run_policy_watcher(path: PathBuf, shared: SharedPolicy, cancel: CancellationToken) {
    tracing::info!(path = %path.display(), "Policy watcher started");

    let mut last_mtime = mtime(&path);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Policy watcher shutting down");
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let current = match mtime(&path) {
            Some(t) => t,
            None => {
                if last_mtime.is_some() {
                    tracing::warn!(
                        path = %path.display(),
                        "Policy file not accessible, keeping current policy"
                    );
                    last_mtime = None;
                }
                continue;
            }
        };

        let changed = match last_mtime {
            Some(prev) => current != prev,
            None => true,
        };
        if !changed {
            continue;
        }

        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if mtime(&path) != Some(current) {
            // Still being written; pick it up on the next poll.
            continue;
        }
        last_mtime = Some(current);

        match Policy::load_file(&path) {
            Ok(policy) => {
                shared.store(std::sync::Arc::new(policy));
                tracing::info!(path = %path.display(), "Policy reloaded");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Policy reload rejected, keeping previous policy");
            }
        }
    }
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_swaps_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "[correlate]\nthreshold = 3\n").unwrap();

        let shared = Policy::default().into_shared();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_policy_watcher(
            path.clone(),
            shared.clone(),
            cancel.clone(),
        ));

        // Rewrite with a new threshold; mtime granularity means the change
        // is only visible after the file content differs.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "[correlate]\nthreshold = 7\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if shared.load().correlate.threshold == 7 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "watcher did not pick up the policy change"
            );
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "[correlate]\nthreshold = 5\n").unwrap();

        let shared = Policy::default().into_shared();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_policy_watcher(
            path.clone(),
            shared.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // threshold = 0 fails validation; the previous policy must survive.
        std::fs::write(&path, "[correlate]\nthreshold = 0\n").unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(shared.load().correlate.threshold, 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
