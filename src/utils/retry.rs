use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Exponential Backoff Retry
// ============================================================================
//
// Used where a failure must not be given up on immediately: refunds owed to
// a buyer and order re-creation while draining compensations. Transition
// commits are never retried here; a version conflict goes back to the caller.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Refunds: a few more tries before the failure lands in the compensation ledger.
    pub fn refunds() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    /// Immediate attempts with no waiting, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let grown = Duration::from_millis((current.as_millis() as f64 * self.multiplier) as u64);
        grown.min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Every attempt failed; carries the last error.
    Failed(E),
    /// The error was not worth retrying.
    PermanentFailure(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => Err(e),
        }
    }
}

/// Whether an error may go away on its own.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

async fn run<F, Fut, T, E, P>(
    config: RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return RetryResult::Success(value);
            }
            Err(error) if !retryable(&error) => {
                tracing::warn!(
                    operation = operation_name,
                    error = %error,
                    "Permanent failure, not retrying"
                );
                return RetryResult::PermanentFailure(error);
            }
            Err(error) if attempt >= config.max_attempts => {
                tracing::error!(
                    operation = operation_name,
                    attempt,
                    error = %error,
                    "Failed after all attempts"
                );
                return RetryResult::Failed(error);
            }
            Err(error) => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying after delay"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Retry every error until attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: RetryConfig,
    operation_name: &str,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run(config, operation_name, operation, |_| true).await
}

/// Retry only errors that report themselves as transient.
pub async fn retry_on_transient<F, Fut, T, E>(
    config: RetryConfig,
    operation_name: &str,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    run(config, operation_name, operation, |e: &E| e.is_transient()).await
}
