//! Bounded-backoff retry for cluster API calls.
//!
//! Every cluster-facing call carries a timeout; exceeding it counts as a
//! transient fault. Transient faults are retried with exponential
//! backoff up to a capped attempt count, then surfaced. Terminal faults
//! are returned immediately.

use std::time::Duration;

use tracing::debug;

use devgrid_cluster::{ApiResult, ClusterApiError};
use devgrid_core::DevGridConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DevGridConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            call_timeout: config.call_timeout(),
        }
    }

    /// Backoff before retry number `attempt` (1-based), doubling from the
    /// base up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        (self.base_backoff * factor).min(self.max_backoff)
    }

    /// Run a cluster call with timeout, retrying transient faults.
    pub async fn call<T, F, Fut>(&self, op: &str, f: F) -> ApiResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ClusterApiError::Timeout(format!(
                    "{op} exceeded {:?}",
                    self.call_timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    debug!(%op, attempt, error = %e, ?backoff, "transient cluster fault, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}
