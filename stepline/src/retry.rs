//! Retry-with-backoff executor.
//!
//! Transient transport errors never surface as permanent failures unless
//! they persist through every attempt. Delay policy is chosen per call site:
//! sends use a small constant delay with a high attempt count to block on
//! slow commits, fetches use a growing backoff to avoid hammering an empty
//! queue.
//!
//! Delay computation is a pure function of the configuration and the attempt
//! number, so retry state stays reentrant and testable in isolation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backoff {
    /// delay = base (constant)
    Constant,
    /// delay = base * (attempt + 1)
    #[default]
    Linear,
    /// delay = base * 2^attempt
    Exponential,
}

/// Jitter applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Jitter {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to the computed delay.
    Full,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the initial one.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub base_delay: Duration,
    /// Cap applied to the computed delay.
    pub max_delay: Duration,
    /// Backoff strategy.
    pub backoff: Backoff,
    /// Jitter strategy.
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Linear,
            jitter: Jitter::None,
        }
    }
}

impl RetryConfig {
    /// Creates a retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay before retrying after the given zero-based attempt.
    ///
    /// Pure with respect to the config; jitter draws fresh randomness on
    /// each call.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let raw = match self.backoff {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(u64::from(attempt) + 1),
            Backoff::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)),
        };
        let capped = raw.min(cap);

        let jittered = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                if capped == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=capped)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Executes an operation with retry and backoff.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt + 1 >= attempts {
                    return Err(error);
                }
                let delay = config.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
