// quotaflow-sink: retry with decorrelated-jitter backoff, so a fleet of
// sidecars retrying the same outage doesn't re-synchronize into a thundering
// herd against the sink (the "decorrelated jitter" shape from AWS's
// Exponential Backoff And Jitter architecture post, the same family the
// teacher workspace reaches for via its `rand` dependency).

use crate::error::{is_retryable, SinkError, SinkResult};
use rand::Rng;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

/// Tracks the decorrelated-jitter sequence across attempts: each delay is a
/// random draw from `[base, previous * 3]`, clamped to `max`, rather than a
/// deterministic doubling. This keeps retries from many callers spread out
/// even when they all started failing at the same moment.
struct JitterSequence {
    base_ms: u64,
    max_ms: u64,
    previous_ms: u64,
}

impl JitterSequence {
    fn new(config: &RetryConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms.max(1),
            max_ms: config.max_delay_ms,
            previous_ms: config.base_delay_ms.max(1),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let upper = self.previous_ms.saturating_mul(3).clamp(self.base_ms, self.max_ms);
        let delay_ms = rand::thread_rng().gen_range(self.base_ms..=upper);
        self.previous_ms = delay_ms;
        Duration::from_millis(delay_ms)
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn execute<F, Fut, T>(&self, mut attempt: F) -> SinkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SinkResult<T>>,
    {
        let mut jitter = JitterSequence::new(&self.config);
        let mut attempts_made = 0;

        loop {
            let outcome = attempt().await;
            attempts_made += 1;

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => e,
            };

            if attempts_made > self.config.max_retries {
                return Err(SinkError::RetryExhausted(format!(
                    "gave up after {attempts_made} attempts, last error: {err}"
                )));
            }
            sleep(jitter.next_delay()).await;
        }
    }
}
