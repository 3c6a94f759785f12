//! Retry with backoff for source fetches and destination writes.
//!
//! Both the fetch path and the load path run their remote call through
//! [`with_retry`]; only the [`RetryConfig`] differs between them.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base_delay * attempt`.
    #[default]
    Linear,
    /// `base_delay * 2^(attempt - 1)`.
    Exponential,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit the backoff is computed from.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Growth strategy.
    pub backoff: Backoff,
    /// Whether to add up to 25% jitter on top of the computed delay.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_fetch()
    }
}

impl RetryConfig {
    /// Source page fetches: 5 attempts, 2s per attempt, capped at 30s.
    pub fn for_fetch() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Linear,
            add_jitter: false,
        }
    }

    /// Destination batch writes: 3 attempts, 2s per attempt.
    pub fn for_load() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Linear,
            add_jitter: false,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Linear,
            add_jitter: false,
        }
    }

    /// Delay to wait after `attempt` failed attempts (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = match self.backoff {
            Backoff::Linear => f64::from(attempt),
            Backoff::Exponential => 2f64.powi(attempt.saturating_sub(1) as i32),
        };

        let capped = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());

        let delay = if self.add_jitter {
            capped + capped * 0.25 * rand_jitter()
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Delay after `attempt` failures, stretched to honour a server-provided hint.
    fn delay_after(&self, attempt: u32, err: &Error) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match err.retry_after() {
            Some(hint) => computed.max(hint.min(self.max_delay)),
            None => computed,
        }
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Whether another attempt could change the outcome.
///
/// Every transport, source and destination failure is retried; only
/// configuration mistakes are not.
pub fn is_retryable_error(error: &Error) -> bool {
    !error.is_fatal()
}

/// Executes an async operation, retrying failures per `config`.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{}: succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if is_retryable_error(&e) && attempt < max_attempts => {
                let delay = config.delay_after(attempt, &e);
                warn!(
                    "{}: attempt {}/{} failed: {} (retrying in {:?})",
                    operation_name, attempt, max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    "{}: giving up after {} attempt(s): {}",
                    operation_name, attempt, e
                );
                return Err(e);
            }
        }
    }
}
