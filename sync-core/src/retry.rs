// sync-core/src/retry.rs

//! Backoff policy for workers dialing back to the coordinator.
//!
//! Spawned workers usually start before (or while) the coordinator's
//! listener is accepting, so the first few connection attempts may be
//! refused. Retries use exponential backoff with a small jitter.

use std::io;
use std::time::Duration;

use crate::config::WorkerConfig;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each delay.
    pub jitter: bool,
    /// Mixed into the jitter so peers retrying together spread out.
    pub jitter_seed: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for RetryConfig {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            max_retries: worker.connect_retries,
            initial_delay: Duration::from_millis(worker.retry_delay_ms),
            max_delay: Duration::from_millis(worker.max_retry_delay_ms),
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_seed: 0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Use `seed` (typically the worker identity) for jitter.
    pub fn with_jitter_seed(mut self, seed: u32) -> Self {
        self.jitter_seed = seed;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * (1.0 + jitter_fraction(self.jitter_seed, attempt) * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Value in [0, 1) derived from the seed and attempt number.
///
/// Deterministic for a given pair, so tests can pin delays.
fn jitter_fraction(seed: u32, attempt: u32) -> f64 {
    let mixed = seed.wrapping_mul(0x9E37_79B9) ^ attempt;
    let x = mixed.wrapping_mul(1103515245).wrapping_add(12345);
    (x as f64) / (u32::MAX as f64 + 1.0)
}

/// Outcome of one attempt of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Ok(T),
    /// Transient failure; try again if the budget allows.
    Retry(E),
    /// Permanent failure.
    Fail(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Retry(e) | Self::Fail(e) => Err(e),
        }
    }
}

/// Whether a failed connect is worth retrying.
///
/// Refused, reset and timed-out connects are expected while the listener is
/// still coming up; anything else (bad address, permission) is permanent.
pub fn is_transient_connect_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Run `operation` until it succeeds, fails permanently, or the retry budget
/// is spent.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RetryResult<T, E>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => {
                if !config.should_retry(attempt) {
                    return Err(error);
                }
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!("attempt {} failed, retrying in {:?}", attempt + 1, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
            jitter: false,
            jitter_seed: 0,
        }
    }

    #[test]
    fn test_from_worker_config() {
        let worker = WorkerConfig {
            connect_retries: 4,
            retry_delay_ms: 20,
            max_retry_delay_ms: 500,
        };
        let config = RetryConfig::from(&worker);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.initial_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, Duration::from_millis(500));
        assert!(!RetryConfig::no_retry().should_retry(0));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
            jitter_seed: 0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(10), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..fast(3)
        };
        let delay = config.delay_for_attempt(0);
        assert!(delay >= Duration::from_millis(1));
        assert!(delay <= Duration::from_micros(1250));
    }

    #[test]
    fn test_jitter_seed_spreads_peers() {
        let base = RetryConfig {
            initial_delay: Duration::from_millis(10),
            jitter: true,
            ..fast(3)
        };
        let delays: Vec<Duration> = (0..8)
            .map(|identity| base.clone().with_jitter_seed(identity).delay_for_attempt(0))
            .collect();
        for delay in &delays {
            assert!(*delay >= Duration::from_millis(10));
            assert!(*delay <= Duration::from_micros(12_500));
        }
        let mut distinct = delays.clone();
        distinct.sort();
        distinct.dedup();
        assert!(distinct.len() > 1, "all peers got {:?}", delays[0]);

        // Same seed, same delay.
        assert_eq!(delays[3], base.with_jitter_seed(3).delay_for_attempt(0));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_connect_error(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient_connect_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_async(&fast(5), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    RetryResult::Retry("refused")
                } else {
                    RetryResult::Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let attempts = AtomicU32::new(0);
        let result = retry_async(&fast(2), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryResult::Retry::<(), _>("refused") }
        })
        .await;
        assert_eq!(result, Err("refused"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let result = retry_async(&fast(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryResult::Fail::<(), _>("bad address") }
        })
        .await;
        assert_eq!(result, Err("bad address"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(RetryResult::<u8, &str>::Ok(1).into_result(), Ok(1));
    }
}
