pub mod circuit_breaker;
pub mod masking;
pub mod order_code;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use masking::mask_charge_id;
pub use order_code::generate_order_code;
pub use retry::{retry_on_transient, retry_with_backoff, IsTransient, RetryConfig, RetryResult};
