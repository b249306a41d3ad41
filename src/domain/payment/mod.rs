// ============================================================================
// Payment Domain
// ============================================================================
//
// - Charge and compensation ledger records
// - Gateway port with a timeout + circuit breaker client
// - Reconciler turning approved charges into orders
//
// ============================================================================

pub mod ledger;
pub mod gateway;
pub mod reconciler;

pub use ledger::{ChargeRecord, ChargeState, CompensationKind, CompensationRecord, CompensationStatus};
pub use gateway::{
    ChargeRequest, GatewayAuthorization, GatewayClient, GatewayError, PaymentGateway, SimulatedGateway,
};
pub use reconciler::{AuthorizationOutcome, ClaimResolution, DrainReport, PaymentReconciler, PendingCharge};
