use std::str::FromStr;
use std::time::Duration;

use kairo_apply::RetryPolicy;
use kairo_core::DeletePropagation;

fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

/// Knobs for sync attempts. Defaults suit a real cluster; tests shrink the waits.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Concurrent cluster calls within one bucket.
    pub workers: usize,
    pub retry: RetryPolicy,
    pub health_timeout: Duration,
    pub hook_timeout: Duration,
    /// Re-poll interval while waiting on health, hooks or deletions.
    pub poll: Duration,
    pub propagation: DeletePropagation,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            retry: RetryPolicy::default(),
            health_timeout: Duration::from_secs(300),
            hook_timeout: Duration::from_secs(600),
            poll: Duration::from_millis(2000),
            propagation: DeletePropagation::Foreground,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Defaults overridden by whatever `lookup` returns for the `KAIRO_*` keys.
    /// Unparsable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let backoff_ms = env_or(&lookup, "KAIRO_RETRY_BACKOFF_MS", d.retry.backoff.as_millis() as u64);
        Self {
            workers: env_or(&lookup, "KAIRO_SYNC_WORKERS", d.workers).max(1),
            retry: RetryPolicy {
                limit: env_or(&lookup, "KAIRO_RETRY_LIMIT", d.retry.limit).max(1),
                backoff: Duration::from_millis(backoff_ms),
                backoff_max: d.retry.backoff_max,
            },
            health_timeout: Duration::from_secs(env_or(&lookup, "KAIRO_HEALTH_TIMEOUT_SECS", d.health_timeout.as_secs())),
            hook_timeout: Duration::from_secs(env_or(&lookup, "KAIRO_HOOK_TIMEOUT_SECS", d.hook_timeout.as_secs())),
            poll: Duration::from_millis(env_or(&lookup, "KAIRO_POLL_MS", d.poll.as_millis() as u64).max(1)),
            propagation: d.propagation,
        }
    }

    /// Short waits for in-memory clusters.
    pub fn fast() -> Self {
        Self {
            retry: RetryPolicy { limit: 3, backoff: Duration::from_millis(1), backoff_max: Duration::from_millis(5) },
            health_timeout: Duration::from_secs(2),
            hook_timeout: Duration::from_secs(2),
            poll: Duration::from_millis(10),
            ..Self::default()
        }
    }
}
