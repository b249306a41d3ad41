use uuid::Uuid;

use crate::domain::fulfillment::{DraftError, TransitionError};
use crate::domain::inventory::{InventoryError, ReservationError};
use crate::domain::payment::GatewayError;
use crate::domain::review::ReviewError;
use crate::store::StoreError;

// ============================================================================
// Fulfillment Errors
// ============================================================================
//
// What callers of the service facade see. Caller mistakes (Transition,
// InvalidDraft, Review) are final; Conflict means reload and decide again;
// PendingCompensation means money moved and the ledger has a record of it.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Line item {line_item_id} changed concurrently: expected version {expected}, found {actual:?}")]
    Conflict {
        line_item_id: Uuid,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid order draft: {0}")]
    InvalidDraft(#[from] DraftError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Charge {charge_id} cannot be processed in state {state}")]
    ChargeState { charge_id: String, state: String },

    #[error("Charge {charge_id} needs compensation ({compensation_id}): {reason}")]
    PendingCompensation {
        compensation_id: Uuid,
        charge_id: String,
        reason: String,
    },

    #[error("Compensation {id} cannot be processed: {reason}")]
    CompensationNotActionable { id: Uuid, reason: String },

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ReservationError> for FulfillmentError {
    fn from(error: ReservationError) -> Self {
        match error {
            ReservationError::Insufficient {
                variant_id,
                requested,
                available,
            } => TransitionError::InsufficientStock {
                variant_id,
                requested,
                available,
            }
            .into(),
            ReservationError::Inventory(e) => FulfillmentError::Inventory(e),
        }
    }
}

impl FulfillmentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        FulfillmentError::NotFound { entity, id: id.to_string() }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FulfillmentError::Conflict { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FulfillmentError::Transition(TransitionError::IllegalTransition { .. }) => "illegal_transition",
            FulfillmentError::Transition(TransitionError::InvalidActor { .. }) => "invalid_actor",
            FulfillmentError::Transition(TransitionError::InvalidQuantity { .. }) => "invalid_quantity",
            FulfillmentError::Transition(TransitionError::GuardNotSatisfied { .. }) => "guard_not_satisfied",
            FulfillmentError::Transition(TransitionError::InsufficientStock { .. }) => "insufficient_stock",
            FulfillmentError::Transition(TransitionError::MissingInput(_)) => "missing_input",
            FulfillmentError::Conflict { .. } => "conflict",
            FulfillmentError::NotFound { .. } => "not_found",
            FulfillmentError::InvalidDraft(_) => "invalid_draft",
            FulfillmentError::Gateway(_) => "gateway",
            FulfillmentError::ChargeState { .. } => "charge_state",
            FulfillmentError::PendingCompensation { .. } => "pending_compensation",
            FulfillmentError::CompensationNotActionable { .. } => "compensation_not_actionable",
            FulfillmentError::Review(_) => "review",
            FulfillmentError::Inventory(_) => "inventory",
            FulfillmentError::Store(_) => "store",
        }
    }
}
