use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::domain::delivery::DeliveryTracker;
use crate::domain::fulfillment::{
    evaluate, GuardContext, Money, OrderLineItem, SideEffect, StatusHistoryEntry, TransitionRequest,
};
use crate::domain::inventory::{release_all, reserve_all, Inventory};
use crate::domain::payment::PaymentReconciler;
use crate::error::FulfillmentError;
use crate::metrics::Metrics;
use crate::store::{LineItemRepository, OrderRepository, StoreError};

// ============================================================================
// Concurrency Controller
// ============================================================================
//
// Optimistic concurrency per line item:
//
//   1. load snapshot, compare version with the caller's expected version
//   2. evaluate the transition (pure)
//   3. pre-commit effects (stock reservation)
//   4. CAS write of snapshot + history entry
//   5. post-commit effects (release, refund, delivery marks)
//
// Conflicts at step 1 or 4 go back to the caller. Nothing here retries.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedTransition {
    pub item: OrderLineItem,
    pub history: StatusHistoryEntry,
    pub effects: Vec<SideEffect>,
    /// Compensation records written for post-commit refunds that failed.
    pub compensations: Vec<Uuid>,
}

#[derive(Clone)]
pub struct ConcurrencyController {
    line_items: Arc<dyn LineItemRepository>,
    orders: Arc<dyn OrderRepository>,
    tracker: DeliveryTracker,
    inventory: Arc<dyn Inventory>,
    reconciler: Arc<PaymentReconciler>,
    metrics: Arc<Metrics>,
}

impl ConcurrencyController {
    pub fn new(
        line_items: Arc<dyn LineItemRepository>,
        orders: Arc<dyn OrderRepository>,
        tracker: DeliveryTracker,
        inventory: Arc<dyn Inventory>,
        reconciler: Arc<PaymentReconciler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            line_items,
            orders,
            tracker,
            inventory,
            reconciler,
            metrics,
        }
    }

    pub async fn apply(
        &self,
        line_item_id: Uuid,
        expected_version: i64,
        request: TransitionRequest,
    ) -> Result<AppliedTransition, FulfillmentError> {
        let started = Instant::now();
        let action = request.action;

        let result = self.apply_inner(line_item_id, expected_version, &request).await;

        match &result {
            Ok(applied) => {
                self.metrics
                    .record_transition(action.as_str(), started.elapsed().as_secs_f64());
                tracing::info!(
                    line_item_id = %line_item_id,
                    action = %action,
                    actor = %request.actor,
                    status = %applied.item.status,
                    version = applied.item.version,
                    "✅ Transition applied"
                );
            }
            Err(e) => {
                self.metrics.record_rejection(action.as_str(), e.kind());
                tracing::warn!(
                    line_item_id = %line_item_id,
                    action = %action,
                    expected_version,
                    error = %e,
                    "Transition rejected"
                );
            }
        }
        result
    }

    async fn apply_inner(
        &self,
        line_item_id: Uuid,
        expected_version: i64,
        request: &TransitionRequest,
    ) -> Result<AppliedTransition, FulfillmentError> {
        let item = self
            .line_items
            .get_line_item(line_item_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("line item", line_item_id))?;

        if item.version != expected_version {
            self.metrics.record_conflict("load");
            return Err(FulfillmentError::Conflict {
                line_item_id,
                expected: expected_version,
                actual: Some(item.version),
            });
        }

        let deliveries = self.tracker.history(line_item_id).await?;
        let transition = evaluate(&item, request, &GuardContext { deliveries: &deliveries }, Utc::now())?;

        let reserved = self.run_pre_commit(&transition.effects).await?;

        match self
            .line_items
            .commit_transition(expected_version, &transition.item, &transition.history)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                self.roll_back(&reserved).await;
                return Err(match e {
                    StoreError::Conflict { actual, .. } => {
                        self.metrics.record_conflict("commit");
                        FulfillmentError::Conflict {
                            line_item_id,
                            expected: expected_version,
                            actual,
                        }
                    }
                    other => other.into(),
                });
            }
        }

        let compensations = self
            .run_post_commit(&transition.item, &transition.history, &transition.effects)
            .await;

        Ok(AppliedTransition {
            item: transition.item,
            history: transition.history,
            effects: transition.effects,
            compensations,
        })
    }

    /// Reserve stock for the transition, all or nothing.
    async fn run_pre_commit(&self, effects: &[SideEffect]) -> Result<Vec<(Uuid, u32)>, FulfillmentError> {
        let lines: Vec<_> = effects
            .iter()
            .filter_map(|effect| match *effect {
                SideEffect::ReserveStock { variant_id, quantity } => Some((variant_id, quantity)),
                _ => None,
            })
            .collect();

        reserve_all(self.inventory.as_ref(), &lines).await?;
        Ok(lines)
    }

    async fn roll_back(&self, reserved: &[(Uuid, u32)]) {
        release_all(self.inventory.as_ref(), reserved).await;
    }

    /// The transition is already committed here, so failures are logged or
    /// written to the compensation ledger rather than returned.
    async fn run_post_commit(
        &self,
        item: &OrderLineItem,
        history: &StatusHistoryEntry,
        effects: &[SideEffect],
    ) -> Vec<Uuid> {
        let mut compensations = Vec::new();

        for effect in effects.iter().filter(|e| !e.is_pre_commit()) {
            match effect {
                SideEffect::ReleaseStock { variant_id, quantity } => {
                    if let Err(e) = self.inventory.release(*variant_id, *quantity).await {
                        tracing::error!(
                            line_item_id = %item.id,
                            variant_id = %variant_id,
                            quantity,
                            error = %e,
                            "Failed to release stock"
                        );
                    }
                }
                SideEffect::Refund { amount } => {
                    if let Some(id) = self.refund(item, history.reason.as_deref(), *amount).await {
                        compensations.push(id);
                    }
                }
                SideEffect::MarkDelivery { delivery_type, status } => {
                    if let Err(e) = self.tracker.mark_latest(item.id, *delivery_type, *status).await {
                        tracing::warn!(line_item_id = %item.id, delivery_type = %delivery_type, error = %e, "Failed to update delivery status");
                    }
                }
                SideEffect::CompleteDelivery { delivery_type } => {
                    if let Err(e) = self.tracker.complete_latest(item.id, *delivery_type).await {
                        tracing::warn!(line_item_id = %item.id, delivery_type = %delivery_type, error = %e, "Failed to complete delivery event");
                    }
                }
                SideEffect::ReserveStock { .. } => {}
            }
        }
        compensations
    }

    async fn refund(&self, item: &OrderLineItem, reason: Option<&str>, amount: Money) -> Option<Uuid> {
        if amount.is_zero() {
            return None;
        }

        let charge_id = match self.orders.get_order(item.order_id).await {
            Ok(Some(order)) => order.charge_id,
            Ok(None) => None,
            Err(e) => {
                tracing::error!(line_item_id = %item.id, error = %e, "Failed to load order for refund");
                None
            }
        };
        let Some(charge_id) = charge_id else {
            tracing::warn!(line_item_id = %item.id, amount = amount.amount(), "No charge on order, refund skipped");
            return None;
        };

        // The approved request's reason is carried on the history entry.
        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} refund", item.status));
        match self.reconciler.refund_line_item(&charge_id, item.id, amount, &reason).await {
            Ok(()) => None,
            Err(FulfillmentError::PendingCompensation { compensation_id, .. }) => Some(compensation_id),
            Err(e) => {
                tracing::error!(
                    line_item_id = %item.id,
                    amount = amount.amount(),
                    error = %e,
                    "💀 Refund failed and could not be recorded"
                );
                None
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::{DeliveryType, NewDeliveryEvent};
    use crate::domain::fulfillment::aggregate::tests::sample_draft;
    use crate::domain::fulfillment::{Action, ActorRole, LineItemStatus, TransitionError};
    use crate::domain::inventory::InMemoryInventory;
    use crate::domain::payment::{GatewayClient, SimulatedGateway};
    use crate::store::{MemoryStore, Stores};
    use crate::utils::{CircuitBreakerConfig, RetryConfig};
    use std::time::Duration;

    struct Harness {
        controller: ConcurrencyController,
        inventory: Arc<InMemoryInventory>,
        tracker: DeliveryTracker,
        store: Arc<MemoryStore>,
        items: Vec<OrderLineItem>,
    }

    async fn harness(status: LineItemStatus) -> Harness {
        let (stores, store) = Stores::memory();
        let metrics = Arc::new(Metrics::new().unwrap());
        let client = GatewayClient::new(
            Arc::new(SimulatedGateway::new()),
            CircuitBreakerConfig::default(),
            metrics.clone(),
            Duration::from_millis(200),
        );
        let inventory = Arc::new(InMemoryInventory::new());
        let reconciler = Arc::new(PaymentReconciler::new(
            client,
            stores.clone(),
            inventory.clone(),
            metrics.clone(),
            RetryConfig::immediate(1),
        ));
        // Seeded directly, so nothing was reserved for these items.
        let (order, items) = sample_draft().build("241019CTRL", None, status, Utc::now());
        stores.orders.create_order(&order, &items).await.unwrap();

        let tracker = DeliveryTracker::new(stores.deliveries.clone(), stores.line_items.clone(), metrics.clone());
        let controller = ConcurrencyController::new(
            stores.line_items.clone(),
            stores.orders.clone(),
            tracker.clone(),
            inventory.clone(),
            reconciler,
            metrics,
        );
        Harness { controller, inventory, tracker, store, items }
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let h = harness(LineItemStatus::PaymentCompleted).await;
        let item = &h.items[0];

        let err = h
            .controller
            .apply(item.id, item.version + 1, TransitionRequest::new(Action::StartPreparing, ActorRole::Admin))
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Conflict { expected: 1, actual: Some(0), .. }));
    }

    #[tokio::test]
    async fn test_applied_transition_is_persisted_with_history() {
        let h = harness(LineItemStatus::PaymentCompleted).await;
        let item = &h.items[0];

        let applied = h
            .controller
            .apply(item.id, 0, TransitionRequest::new(Action::StartPreparing, ActorRole::Admin))
            .await
            .unwrap();
        assert_eq!(applied.item.version, 1);
        assert_eq!(applied.item.status, LineItemStatus::Preparing);

        let history = h.store.history(item.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status_to, LineItemStatus::Preparing);
        assert_eq!(history[1].sequence, 1);
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_snapshot_untouched() {
        let h = harness(LineItemStatus::PaymentCompleted).await;
        let item = &h.items[0];

        let err = h
            .controller
            .apply(item.id, 0, TransitionRequest::new(Action::MarkDelivered, ActorRole::Admin))
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Transition(TransitionError::IllegalTransition { .. })));

        let stored = h.store.get_line_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored, *item);
    }

    #[tokio::test]
    async fn test_exchange_without_stock_is_rejected() {
        let h = harness(LineItemStatus::Delivered).await;
        let item = &h.items[0];

        let request = TransitionRequest::new(Action::RequestExchange, ActorRole::Buyer)
            .with_quantity(1)
            .with_reason("wrong size");
        let err = h.controller.apply(item.id, 0, request.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::Transition(TransitionError::InsufficientStock { requested: 1, available: 0, .. })
        ));

        h.inventory.set_stock(item.variant_id, 1).await;
        let applied = h.controller.apply(item.id, 0, request).await.unwrap();
        assert_eq!(applied.item.status, LineItemStatus::ExchangeRequested);
        assert_eq!(h.inventory.available(item.variant_id).await, 0);
    }

    #[tokio::test]
    async fn test_ship_marks_outbound_delivery() {
        let h = harness(LineItemStatus::Preparing).await;
        let item = &h.items[0];
        h.tracker
            .append_event(item.id, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "6301"))
            .await
            .unwrap();

        h.controller
            .apply(item.id, 0, TransitionRequest::new(Action::Ship, ActorRole::Admin))
            .await
            .unwrap();
        assert_eq!(
            h.tracker.latest_status(item.id, Some(DeliveryType::OrderOut)).await.unwrap(),
            Some(crate::domain::delivery::DeliveryStatus::Delivering)
        );
    }

    #[tokio::test]
    async fn test_cancel_without_charge_skips_refund() {
        let h = harness(LineItemStatus::PaymentCompleted).await;
        let item = &h.items[1];

        let request = TransitionRequest::new(Action::RequestCancel, ActorRole::Buyer)
            .with_quantity(1)
            .with_reason("changed mind");
        h.controller.apply(item.id, 0, request).await.unwrap();

        let applied = h
            .controller
            .apply(item.id, 1, TransitionRequest::new(Action::ApproveCancel, ActorRole::Admin))
            .await
            .unwrap();
        assert_eq!(applied.item.status, LineItemStatus::Cancelled);
        assert!(applied.effects.contains(&SideEffect::Refund { amount: Money(15_000) }));
        assert!(applied.compensations.is_empty());
        assert_eq!(h.inventory.available(item.variant_id).await, 1);
    }
}
