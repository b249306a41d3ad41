use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::delivery::DeliveryType;
use super::value_objects::ActorRole;

// ============================================================================
// Fulfillment Commands
// ============================================================================

/// Named transition a caller can request on a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ConfirmPayment,
    StartPreparing,
    Ship,
    MarkDelivered,
    ConfirmPurchase,
    RequestCancel,
    ApproveCancel,
    RequestReturn,
    ApproveReturn,
    CompleteReturn,
    RequestExchange,
    ApproveExchange,
    PrepareExchange,
    DispatchExchange,
    CompleteExchange,
}

impl Action {
    /// Actions that carry a quantity and reason from the buyer.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Action::RequestCancel | Action::RequestReturn | Action::RequestExchange
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ConfirmPayment => "CONFIRM_PAYMENT",
            Action::StartPreparing => "START_PREPARING",
            Action::Ship => "SHIP",
            Action::MarkDelivered => "MARK_DELIVERED",
            Action::ConfirmPurchase => "CONFIRM_PURCHASE",
            Action::RequestCancel => "REQUEST_CANCEL",
            Action::ApproveCancel => "APPROVE_CANCEL",
            Action::RequestReturn => "REQUEST_RETURN",
            Action::ApproveReturn => "APPROVE_RETURN",
            Action::CompleteReturn => "COMPLETE_RETURN",
            Action::RequestExchange => "REQUEST_EXCHANGE",
            Action::ApproveExchange => "APPROVE_EXCHANGE",
            Action::PrepareExchange => "PREPARE_EXCHANGE",
            Action::DispatchExchange => "DISPATCH_EXCHANGE",
            Action::CompleteExchange => "COMPLETE_EXCHANGE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied inputs for a transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionPayload {
    pub quantity: Option<u32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub action: Action,
    pub actor: ActorRole,
    #[serde(default)]
    pub payload: TransitionPayload,
}

impl TransitionRequest {
    pub fn new(action: Action, actor: ActorRole) -> Self {
        Self {
            action,
            actor,
            payload: TransitionPayload::default(),
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.payload.quantity = Some(quantity);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.payload.reason = Some(reason.into());
        self
    }
}

/// Something a caller must supply (or have recorded) before an action is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "delivery_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredInput {
    Quantity,
    Reason,
    /// A delivery event of this type must be registered first.
    DeliveryEvent(DeliveryType),
    /// A delivery event of this type must be registered and completed.
    CompletedDeliveryEvent(DeliveryType),
}

impl fmt::Display for RequiredInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredInput::Quantity => f.write_str("quantity"),
            RequiredInput::Reason => f.write_str("reason"),
            RequiredInput::DeliveryEvent(t) => write!(f, "{} delivery event", t),
            RequiredInput::CompletedDeliveryEvent(t) => write!(f, "completed {} delivery event", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = TransitionRequest::new(Action::RequestReturn, ActorRole::Buyer)
            .with_quantity(2)
            .with_reason("wrong size");

        assert_eq!(request.payload.quantity, Some(2));
        assert_eq!(request.payload.reason.as_deref(), Some("wrong size"));
        assert!(request.action.is_request());
    }

    #[test]
    fn test_request_deserializes_without_payload() {
        let request: TransitionRequest =
            serde_json::from_str(r#"{"action":"SHIP","actor":"ADMIN"}"#).unwrap();
        assert_eq!(request.action, Action::Ship);
        assert_eq!(request.payload, TransitionPayload::default());
    }
}
