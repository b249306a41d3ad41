use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::fulfillment::Money;
use crate::metrics::Metrics;
use crate::utils::{mask_charge_id, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, IsTransient};

// ============================================================================
// Payment Gateway Port
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    pub order_code: String,
    pub amount: Money,
    pub buyer_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayAuthorization {
    /// `synchronous` is false when the gateway accepted the charge but will
    /// confirm settlement later (e.g. bank transfer).
    Approved { synchronous: bool },
    Pending,
    Declined { reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Gateway circuit is open")]
    CircuitOpen,

    #[error("Gateway rejected the request: {0}")]
    Rejected(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl IsTransient for GatewayError {
    fn is_transient(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Register the charge intent and return the gateway's charge id.
    async fn register_charge(&self, request: &ChargeRequest) -> Result<String, GatewayError>;

    async fn authorization_status(&self, charge_id: &str) -> Result<GatewayAuthorization, GatewayError>;

    async fn refund(&self, charge_id: &str, amount: Money, reason: &str) -> Result<(), GatewayError>;
}

// ============================================================================
// Guarded Client
// ============================================================================
//
// Every call gets a deadline and goes through the circuit breaker; outcomes
// and latency are recorded per operation.
//
// ============================================================================

#[derive(Clone)]
pub struct GatewayClient {
    gateway: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
    default_timeout: Duration,
}

impl GatewayClient {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        breaker_config: CircuitBreakerConfig,
        metrics: Arc<Metrics>,
        default_timeout: Duration,
    ) -> Self {
        let observed = metrics.clone();
        let breaker = CircuitBreaker::new("payment_gateway", breaker_config).on_transition(move |from, to| {
            observed.record_circuit_transition(from.as_str(), to.as_str(), to.as_gauge());
        });

        Self {
            gateway,
            breaker,
            metrics,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn register_charge(&self, request: &ChargeRequest, timeout: Duration) -> Result<String, GatewayError> {
        self.guarded("register_charge", timeout, self.gateway.register_charge(request))
            .await
    }

    pub async fn authorization_status(
        &self,
        charge_id: &str,
        timeout: Duration,
    ) -> Result<GatewayAuthorization, GatewayError> {
        self.guarded("authorization_status", timeout, self.gateway.authorization_status(charge_id))
            .await
    }

    pub async fn refund(&self, charge_id: &str, amount: Money, reason: &str) -> Result<(), GatewayError> {
        tracing::info!(
            charge_id = %mask_charge_id(charge_id),
            amount = amount.amount(),
            "Requesting refund"
        );
        self.guarded("refund", self.default_timeout, self.gateway.refund(charge_id, amount, reason))
            .await
    }

    async fn guarded<T, F>(&self, operation: &'static str, timeout: Duration, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let started = Instant::now();

        let result = self
            .breaker
            .call(async {
                tokio::time::timeout(timeout, call)
                    .await
                    .map_err(|_| GatewayError::Timeout {
                        operation,
                        timeout_ms: timeout.as_millis() as u64,
                    })?
            })
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen => GatewayError::CircuitOpen,
                CircuitBreakerError::OperationFailed(inner) => inner,
            });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(GatewayError::Timeout { .. }) => "timeout",
            Err(GatewayError::CircuitOpen) => "circuit_open",
            Err(GatewayError::Rejected(_)) => "rejected",
            Err(GatewayError::Unavailable(_)) => "unavailable",
        };
        self.metrics
            .record_gateway_call(operation, outcome, started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            tracing::warn!(operation, error = %e, "Payment gateway call failed");
        }
        result
    }
}

// ============================================================================
// Simulated Gateway
// ============================================================================
//
// Scriptable stand-in used by the demo binary and the tests.
//
// ============================================================================

struct SimulatedCharge {
    amount: Money,
    refunded: Money,
}

struct SimulatedState {
    authorization: GatewayAuthorization,
    latency: Duration,
    unavailable: bool,
    failing_refunds: u32,
    charges: HashMap<String, SimulatedCharge>,
    refunds: Vec<(String, Money)>,
    refund_reasons: Vec<String>,
}

pub struct SimulatedGateway {
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGateway {
    /// Approves every charge synchronously with no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                authorization: GatewayAuthorization::Approved { synchronous: true },
                latency: Duration::ZERO,
                unavailable: false,
                failing_refunds: 0,
                charges: HashMap::new(),
                refunds: Vec::new(),
                refund_reasons: Vec::new(),
            }),
        }
    }

    pub async fn set_authorization(&self, authorization: GatewayAuthorization) {
        self.state.lock().await.authorization = authorization;
    }

    /// Delay applied to authorization status lookups.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn fail_next_refunds(&self, count: u32) {
        self.state.lock().await.failing_refunds = count;
    }

    pub async fn refunds(&self) -> Vec<(String, Money)> {
        self.state.lock().await.refunds.clone()
    }

    /// Reasons sent with successful refunds, in the same order as `refunds`.
    pub async fn refund_reasons(&self) -> Vec<String> {
        self.state.lock().await.refund_reasons.clone()
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn register_charge(&self, request: &ChargeRequest) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(GatewayError::Unavailable("simulated outage".to_string()));
        }

        let charge_id = format!("sim_{}", Uuid::new_v4().simple());
        state.charges.insert(
            charge_id.clone(),
            SimulatedCharge { amount: request.amount, refunded: Money::ZERO },
        );
        Ok(charge_id)
    }

    async fn authorization_status(&self, charge_id: &str) -> Result<GatewayAuthorization, GatewayError> {
        let (latency, known, unavailable, authorization) = {
            let state = self.state.lock().await;
            (
                state.latency,
                state.charges.contains_key(charge_id),
                state.unavailable,
                state.authorization.clone(),
            )
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if unavailable {
            return Err(GatewayError::Unavailable("simulated outage".to_string()));
        }
        if !known {
            return Err(GatewayError::Rejected(format!("unknown charge {}", charge_id)));
        }
        Ok(authorization)
    }

    async fn refund(&self, charge_id: &str, amount: Money, reason: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        if state.failing_refunds > 0 {
            state.failing_refunds -= 1;
            return Err(GatewayError::Unavailable("simulated refund failure".to_string()));
        }

        let charge = state
            .charges
            .get_mut(charge_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown charge {}", charge_id)))?;
        if charge.refunded + amount > charge.amount {
            return Err(GatewayError::Rejected("refund exceeds charged amount".to_string()));
        }
        charge.refunded = charge.refunded + amount;
        state.refunds.push((charge_id.to_string(), amount));
        state.refund_reasons.push(reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(gateway: Arc<SimulatedGateway>, failure_threshold: u32) -> GatewayClient {
        GatewayClient::new(
            gateway,
            CircuitBreakerConfig {
                failure_threshold,
                cool_down: Duration::from_secs(60),
                success_threshold: 1,
            },
            Arc::new(Metrics::new().unwrap()),
            Duration::from_millis(500),
        )
    }

    fn request(amount: i64) -> ChargeRequest {
        ChargeRequest {
            order_code: "241019ABCD".to_string(),
            amount: Money(amount),
            buyer_name: "Lee".to_string(),
        }
    }

    #[tokio::test]
    async fn test_slow_authorization_times_out() {
        let gateway = Arc::new(SimulatedGateway::new());
        let client = client(gateway.clone(), 5);
        let charge_id = client.register_charge(&request(10_000), Duration::from_secs(1)).await.unwrap();

        gateway.set_latency(Duration::from_millis(200)).await;
        let err = client
            .authorization_status(&charge_id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { operation: "authorization_status", .. }));
    }

    #[tokio::test]
    async fn test_repeated_outages_open_the_circuit() {
        let gateway = Arc::new(SimulatedGateway::new());
        let client = client(gateway.clone(), 2);
        gateway.set_unavailable(true).await;

        for _ in 0..2 {
            assert!(client.register_charge(&request(1_000), Duration::from_secs(1)).await.is_err());
        }
        let err = client.register_charge(&request(1_000), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, GatewayError::CircuitOpen);
    }

    #[tokio::test]
    async fn test_refund_cannot_exceed_charge() {
        let gateway = Arc::new(SimulatedGateway::new());
        let client = client(gateway.clone(), 5);
        let charge_id = client.register_charge(&request(10_000), Duration::from_secs(1)).await.unwrap();

        client.refund(&charge_id, Money(6_000), "cancel").await.unwrap();
        let err = client.refund(&charge_id, Money(6_000), "cancel").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert_eq!(gateway.refunds().await, vec![(charge_id, Money(6_000))]);
    }
}
