use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::controller::{AppliedTransition, ConcurrencyController};
use crate::domain::delivery::{DeliveryEvent, DeliveryTracker};
use crate::domain::fulfillment::{
    legal_actions, legal_actions_for, ActorRole, LegalAction, Money, Order, OrderLineItem, StatusHistoryEntry,
    TransitionRequest,
};
use crate::domain::inventory::Inventory;
use crate::domain::payment::{GatewayClient, PaymentReconciler};
use crate::domain::review::{ReviewEligibility, ReviewService};
use crate::error::FulfillmentError;
use crate::metrics::Metrics;
use crate::store::Stores;
use crate::utils::RetryConfig;

// ============================================================================
// Fulfillment Service
// ============================================================================
//
// Entry point for callers. Wires the controller, delivery tracker, review
// service and payment reconciler over one set of stores.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSummary {
    pub order: Order,
    pub items: Vec<OrderLineItem>,
    /// Sum over active quantities plus the delivery fee, derived on read.
    pub current_total: Money,
}

#[derive(Clone)]
pub struct FulfillmentService {
    stores: Stores,
    controller: ConcurrencyController,
    tracker: DeliveryTracker,
    reviews: ReviewService,
    reconciler: Arc<PaymentReconciler>,
}

impl FulfillmentService {
    pub fn new(
        stores: Stores,
        inventory: Arc<dyn Inventory>,
        gateway: GatewayClient,
        metrics: Arc<Metrics>,
        retry: RetryConfig,
    ) -> Self {
        let tracker = DeliveryTracker::new(stores.deliveries.clone(), stores.line_items.clone(), metrics.clone());
        let reconciler = Arc::new(PaymentReconciler::new(
            gateway,
            stores.clone(),
            inventory.clone(),
            metrics.clone(),
            retry,
        ));
        let controller = ConcurrencyController::new(
            stores.line_items.clone(),
            stores.orders.clone(),
            tracker.clone(),
            inventory,
            reconciler.clone(),
            metrics,
        );
        let reviews = ReviewService::new(stores.reviews.clone(), stores.line_items.clone());

        Self {
            stores,
            controller,
            tracker,
            reviews,
            reconciler,
        }
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn reviews(&self) -> &ReviewService {
        &self.reviews
    }

    pub fn reconciler(&self) -> &Arc<PaymentReconciler> {
        &self.reconciler
    }

    pub async fn line_item(&self, line_item_id: Uuid) -> Result<OrderLineItem, FulfillmentError> {
        self.stores
            .line_items
            .get_line_item(line_item_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("line item", line_item_id))
    }

    /// Actions valid from the current status, optionally only those `role`
    /// may perform.
    pub async fn list_legal_actions(
        &self,
        line_item_id: Uuid,
        role: Option<ActorRole>,
    ) -> Result<Vec<LegalAction>, FulfillmentError> {
        let item = self.line_item(line_item_id).await?;
        Ok(match role {
            Some(role) => legal_actions_for(&item, role),
            None => legal_actions(&item),
        })
    }

    pub async fn apply_transition(
        &self,
        line_item_id: Uuid,
        expected_version: i64,
        request: TransitionRequest,
    ) -> Result<AppliedTransition, FulfillmentError> {
        self.controller.apply(line_item_id, expected_version, request).await
    }

    pub async fn delivery_history(&self, line_item_id: Uuid) -> Result<Vec<DeliveryEvent>, FulfillmentError> {
        self.tracker.history(line_item_id).await
    }

    pub async fn review_eligibility(&self, line_item_id: Uuid) -> Result<ReviewEligibility, FulfillmentError> {
        self.reviews.eligibility(line_item_id).await
    }

    pub async fn status_history(&self, line_item_id: Uuid) -> Result<Vec<StatusHistoryEntry>, FulfillmentError> {
        Ok(self.stores.line_items.history(line_item_id).await?)
    }

    pub async fn order_summary(&self, order_id: Uuid) -> Result<OrderSummary, FulfillmentError> {
        let order = self
            .stores
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("order", order_id))?;
        let items = self.stores.line_items.list_by_order(order_id).await?;
        let current_total = order.current_total(&items);

        Ok(OrderSummary {
            order,
            items,
            current_total,
        })
    }
}
