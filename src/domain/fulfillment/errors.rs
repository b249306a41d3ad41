use uuid::Uuid;

use super::commands::{Action, RequiredInput};
use super::value_objects::{ActorRole, LineItemStatus};

// ============================================================================
// Fulfillment Business Rule Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("Action {action} is not allowed from status {from}")]
    IllegalTransition { from: LineItemStatus, action: Action },

    #[error("Actor {actor} may not perform {action}")]
    InvalidActor { actor: ActorRole, action: Action },

    #[error("Requested quantity {requested} is outside 1..={available}")]
    InvalidQuantity { requested: u32, available: u32 },

    #[error("Guard not satisfied for {action}: {reason}")]
    GuardNotSatisfied { action: Action, reason: String },

    #[error("Insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: Uuid,
        requested: u32,
        available: u32,
    },

    #[error("Missing required input: {0}")]
    MissingInput(RequiredInput),
}

/// Rejections raised while validating an order draft before charging.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DraftError {
    #[error("Order must contain at least one line item")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(u32),

    #[error("Invalid discount rate: {0}")]
    InvalidDiscount(u32),

    #[error("Invalid unit price: {0}")]
    InvalidPrice(i64),
}
