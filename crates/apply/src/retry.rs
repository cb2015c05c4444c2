use std::future::Future;
use std::time::Duration;

use kairo_core::ClusterError;
use metrics::counter;
use tracing::warn;

/// Bounded exponential backoff for transient cluster errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub limit: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { limit: 3, backoff: Duration::from_millis(200), backoff_max: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    fn next_delay(&self, delay: Duration) -> Duration { delay.saturating_mul(2).min(self.backoff_max) }

    /// Run `call` until it succeeds, fails non-transiently or the attempt limit is hit.
    /// Returns the last result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> (Result<T, ClusterError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let limit = self.limit.max(1);
        let mut delay = self.backoff.min(self.backoff_max);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Err(e) if e.is_transient() && attempt < limit => {
                    counter!("sync_retry_total", 1u64);
                    warn!(what, attempt, limit, error = %e, delay_ms = delay.as_millis() as u64, "transient error; retrying");
                    tokio::time::sleep(delay).await;
                    delay = self.next_delay(delay);
                }
                res => return (res, attempt),
            }
        }
    }
}
