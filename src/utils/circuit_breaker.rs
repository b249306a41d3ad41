use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards calls to the payment gateway. After enough consecutive failures
// the breaker opens and calls fail fast until the cool-down has passed;
// then a limited number of trial calls decide whether it closes again.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0=Closed, 1=Open, 2=HalfOpen.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub cool_down: Duration,
    /// Successful trial calls needed to close it again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

type StateObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    inner: Arc<Mutex<Inner>>,
    config: CircuitBreakerConfig,
    observer: Option<StateObserver>,
}

#[derive(Debug, PartialEq)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            })),
            config,
            observer: None,
        }
    }

    /// Called with `(from, to)` on every state change.
    pub fn on_transition<F>(mut self, observer: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == CircuitState::Open {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cool_down);
                if !cooled {
                    return Err(CircuitBreakerError::CircuitOpen);
                }
                inner.successes = 0;
                self.move_to(&mut inner, CircuitState::HalfOpen);
            }
        }

        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    fn move_to(&self, inner: &mut Inner, next: CircuitState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        tracing::info!(
            breaker = self.name,
            from = previous.as_str(),
            to = next.as_str(),
            "Circuit breaker state changed"
        );
        if let Some(observer) = &self.observer {
            observer(previous, next);
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    self.move_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures += 1;

        match inner.state {
            CircuitState::Closed if inner.failures >= self.config.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.move_to(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                inner.successes = 0;
                inner.opened_at = Some(Instant::now());
                self.move_to(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
        self.move_to(&mut inner, CircuitState::Closed);
    }
}
