use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::fulfillment::{LineItemStatus, Money, Order, OrderDraft, OrderLineItem};
use crate::domain::inventory::{release_all, reserve_all, Inventory};
use crate::error::FulfillmentError;
use crate::metrics::Metrics;
use crate::store::{Stores, StoreError};
use crate::utils::{
    generate_order_code, mask_charge_id, retry_on_transient, retry_with_backoff, RetryConfig,
};

use super::gateway::{ChargeRequest, GatewayAuthorization, GatewayClient, GatewayError};
use super::ledger::{
    ChargeRecord, ChargeState, CompensationKind, CompensationRecord, CompensationStatus,
};

// ============================================================================
// Payment Reconciler
// ============================================================================
//
// Two phases, and the order only exists after the second one succeeds:
//
//   prepare    draft -> stock held -> gateway charge intent + ledger record (Prepared)
//   authorize  gateway says Approved -> claim charge -> create order
//
// Stock for the draft is held from `prepare` on. It goes back on a decline
// and when a charge whose order never got written is refunded.
//
// A claim that never reached Consumed or PendingCompensation (a crash, or a
// ledger write that failed) is picked up once it is older than
// `stale_claim_after`: finished if its order exists, compensated if not.
//
// If the order write fails after the gateway approved the charge, the money
// is already taken. That case is written to the compensation ledger and
// surfaced as `FulfillmentError::PendingCompensation`; the ledger is drained
// later by retrying the order write or refunding the charge.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCharge {
    pub charge_id: String,
    pub order_code: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationOutcome {
    Approved {
        order: Order,
        items: Vec<OrderLineItem>,
    },
    Declined { reason: String },
    /// The gateway did not give a final answer in time. Not a decline: poll
    /// `authorize` again later.
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Stale claims finished or moved into the compensation ledger.
    pub claims_settled: usize,
    pub recreated: usize,
    pub refunded: usize,
    pub still_pending: usize,
}

/// What became of a charge left in `Claimed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResolution {
    Consumed { order_id: Uuid },
    Compensation { compensation_id: Uuid },
}

const UNCONFIRMED_ORDER_REASON: &str = "order write not confirmed";

pub struct PaymentReconciler {
    gateway: GatewayClient,
    stores: Stores,
    inventory: Arc<dyn Inventory>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
    stale_claim_after: ChronoDuration,
}

impl PaymentReconciler {
    pub fn new(
        gateway: GatewayClient,
        stores: Stores,
        inventory: Arc<dyn Inventory>,
        metrics: Arc<Metrics>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            gateway,
            stores,
            inventory,
            metrics,
            retry,
            stale_claim_after: ChronoDuration::minutes(5),
        }
    }

    /// How long a claim may sit before it is treated as abandoned.
    pub fn with_stale_claim_after(mut self, after: ChronoDuration) -> Self {
        self.stale_claim_after = after;
        self
    }

    /// Hold stock and register the charge intent. A shortage fails before
    /// the gateway is called; a gateway or ledger failure hands the stock
    /// back and persists nothing.
    pub async fn prepare(&self, draft: OrderDraft, timeout: Duration) -> Result<PendingCharge, FulfillmentError> {
        draft.validate()?;

        let lines = draft.stock_lines();
        reserve_all(self.inventory.as_ref(), &lines).await?;

        match self.register(draft, timeout).await {
            Ok(pending) => Ok(pending),
            Err(e) => {
                release_all(self.inventory.as_ref(), &lines).await;
                Err(e)
            }
        }
    }

    async fn register(&self, draft: OrderDraft, timeout: Duration) -> Result<PendingCharge, FulfillmentError> {
        let now = Utc::now();
        let order_code = generate_order_code(now);
        let amount = draft.total();

        let request = ChargeRequest {
            order_code: order_code.clone(),
            amount,
            buyer_name: draft.buyer.name.clone(),
        };
        let charge_id = self.gateway.register_charge(&request, timeout).await?;

        let record = ChargeRecord {
            charge_id: charge_id.clone(),
            order_code: order_code.clone(),
            amount,
            draft,
            state: ChargeState::Prepared,
            order_id: None,
            created_at: now,
            updated_at: now,
        };
        self.stores.ledger.insert_charge(&record).await?;

        tracing::info!(
            charge_id = %mask_charge_id(&charge_id),
            order_code = %order_code,
            amount = amount.amount(),
            "Charge prepared"
        );

        Ok(PendingCharge { charge_id, order_code, amount })
    }

    /// Ask the gateway for the charge result and, once approved, create the
    /// order. Calling this again for a consumed charge returns the same order.
    pub async fn authorize(&self, charge_id: &str, timeout: Duration) -> Result<AuthorizationOutcome, FulfillmentError> {
        let charge = self.load_charge(charge_id).await?;

        match charge.state {
            ChargeState::Consumed => return self.existing_order(&charge).await,
            ChargeState::Claimed => return self.authorize_claimed(charge).await,
            ChargeState::Declined => {
                return Ok(AuthorizationOutcome::Declined {
                    reason: "charge was declined earlier".to_string(),
                })
            }
            state if !state.is_authorizable() => {
                return Err(FulfillmentError::ChargeState {
                    charge_id: mask_charge_id(charge_id),
                    state: state.to_string(),
                })
            }
            _ => {}
        }

        let status = match self.gateway.authorization_status(charge_id, timeout).await {
            Ok(status) => status,
            Err(GatewayError::Timeout { .. }) => {
                self.mark_unknown(charge_id).await?;
                return Ok(AuthorizationOutcome::Unknown);
            }
            Err(e) => return Err(e.into()),
        };

        match status {
            GatewayAuthorization::Pending => {
                self.mark_unknown(charge_id).await?;
                Ok(AuthorizationOutcome::Unknown)
            }
            GatewayAuthorization::Declined { reason } => {
                self.stores
                    .ledger
                    .transition_charge(charge_id, &[ChargeState::Prepared, ChargeState::Unknown], ChargeState::Declined, None)
                    .await
                    .map_err(|e| self.charge_state_error(charge_id, e))?;
                release_all(self.inventory.as_ref(), &charge.draft.stock_lines()).await;

                tracing::info!(charge_id = %mask_charge_id(charge_id), reason = %reason, "Charge declined");
                Ok(AuthorizationOutcome::Declined { reason })
            }
            GatewayAuthorization::Approved { synchronous } => self.create_order(charge, synchronous).await,
        }
    }

    async fn create_order(&self, charge: ChargeRecord, synchronous: bool) -> Result<AuthorizationOutcome, FulfillmentError> {
        let charge_id = charge.charge_id.as_str();

        let initial = if synchronous {
            LineItemStatus::PaymentCompleted
        } else {
            LineItemStatus::PaymentPending
        };
        let (order, items) = charge
            .draft
            .build(&charge.order_code, Some(charge.charge_id.clone()), initial, Utc::now());

        // Only the caller that wins the claim writes the order. The claim
        // names the order so a stale claim can tell whether it was written.
        self.stores
            .ledger
            .transition_charge(
                charge_id,
                &[ChargeState::Prepared, ChargeState::Unknown],
                ChargeState::Claimed,
                Some(order.id),
            )
            .await
            .map_err(|e| self.charge_state_error(charge_id, e))?;

        if let Err(e) = self.stores.orders.create_order(&order, &items).await {
            let reason = e.to_string();
            let record = CompensationRecord::new(
                charge_id,
                charge.amount,
                CompensationKind::OrderCreationFailed,
                reason.clone(),
            );
            let recorded = match self.stores.ledger.record_compensation(&record).await {
                Ok(()) => {
                    self.stores
                        .ledger
                        .transition_charge(charge_id, &[ChargeState::Claimed], ChargeState::PendingCompensation, None)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(ledger_error) = recorded {
                tracing::error!(
                    charge_id = %mask_charge_id(charge_id),
                    amount = charge.amount.amount(),
                    order_error = %reason,
                    error = %ledger_error,
                    "💀 Order creation failed and the ledger could not be updated, charge left claimed"
                );
                return Err(ledger_error.into());
            }
            self.metrics.record_compensation("order_creation_failed");

            tracing::error!(
                charge_id = %mask_charge_id(charge_id),
                compensation_id = %record.id,
                amount = charge.amount.amount(),
                error = %reason,
                "💀 Charge approved but order creation failed, compensation recorded"
            );

            return Err(FulfillmentError::PendingCompensation {
                compensation_id: record.id,
                charge_id: mask_charge_id(charge_id),
                reason,
            });
        }

        if let Err(e) = self
            .stores
            .ledger
            .transition_charge(charge_id, &[ChargeState::Claimed], ChargeState::Consumed, Some(order.id))
            .await
        {
            // The order exists; the stale claim sweep finishes the ledger.
            tracing::error!(
                charge_id = %mask_charge_id(charge_id),
                order_id = %order.id,
                error = %e,
                "Order created but charge could not be marked consumed"
            );
        }

        tracing::info!(
            charge_id = %mask_charge_id(charge_id),
            order_id = %order.id,
            order_code = %order.order_code,
            line_items = items.len(),
            synchronous,
            "✅ Order created from approved charge"
        );

        Ok(AuthorizationOutcome::Approved { order, items })
    }

    async fn existing_order(&self, charge: &ChargeRecord) -> Result<AuthorizationOutcome, FulfillmentError> {
        let order_id = charge.order_id.ok_or_else(|| FulfillmentError::ChargeState {
            charge_id: mask_charge_id(&charge.charge_id),
            state: "CONSUMED without order".to_string(),
        })?;
        let order = self
            .stores
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("order", order_id))?;
        let items = self.stores.line_items.list_by_order(order_id).await?;
        Ok(AuthorizationOutcome::Approved { order, items })
    }

    /// A second caller found the charge claimed. Finish it if the order is
    /// there, settle it if the claim is stale, otherwise report it busy.
    async fn authorize_claimed(&self, charge: ChargeRecord) -> Result<AuthorizationOutcome, FulfillmentError> {
        let written = self.order_written(&charge).await?;
        if !written && !self.is_stale(&charge, Utc::now()) {
            return Err(FulfillmentError::ChargeState {
                charge_id: mask_charge_id(&charge.charge_id),
                state: ChargeState::Claimed.to_string(),
            });
        }

        match self.settle_claim(&charge).await? {
            ClaimResolution::Consumed { .. } => {
                let charge = self.load_charge(&charge.charge_id).await?;
                self.existing_order(&charge).await
            }
            ClaimResolution::Compensation { compensation_id } => Err(FulfillmentError::PendingCompensation {
                compensation_id,
                charge_id: mask_charge_id(&charge.charge_id),
                reason: UNCONFIRMED_ORDER_REASON.to_string(),
            }),
        }
    }

    async fn order_written(&self, charge: &ChargeRecord) -> Result<bool, FulfillmentError> {
        match charge.order_id {
            Some(order_id) => Ok(self.stores.orders.get_order(order_id).await?.is_some()),
            None => Ok(false),
        }
    }

    fn is_stale(&self, charge: &ChargeRecord, now: DateTime<Utc>) -> bool {
        charge.updated_at <= now - self.stale_claim_after
    }

    /// Claimed charges nobody has touched for `stale_claim_after`.
    pub async fn stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<ChargeRecord>, FulfillmentError> {
        Ok(self
            .stores
            .ledger
            .list_charges(ChargeState::Claimed)
            .await?
            .into_iter()
            .filter(|c| self.is_stale(c, now))
            .collect())
    }

    /// Move a claimed charge on: to Consumed when its order was written, to
    /// the compensation ledger when it was not.
    pub async fn settle_claim(&self, charge: &ChargeRecord) -> Result<ClaimResolution, FulfillmentError> {
        let charge_id = charge.charge_id.as_str();

        if let (Some(order_id), true) = (charge.order_id, self.order_written(charge).await?) {
            self.stores
                .ledger
                .transition_charge(charge_id, &[ChargeState::Claimed], ChargeState::Consumed, Some(order_id))
                .await
                .map_err(|e| self.charge_state_error(charge_id, e))?;
            tracing::info!(charge_id = %mask_charge_id(charge_id), order_id = %order_id, "Claimed charge marked consumed");
            return Ok(ClaimResolution::Consumed { order_id });
        }

        let record = CompensationRecord::new(
            charge_id,
            charge.amount,
            CompensationKind::OrderCreationFailed,
            UNCONFIRMED_ORDER_REASON,
        );
        self.stores.ledger.record_compensation(&record).await?;
        self.stores
            .ledger
            .transition_charge(charge_id, &[ChargeState::Claimed], ChargeState::PendingCompensation, None)
            .await
            .map_err(|e| self.charge_state_error(charge_id, e))?;
        self.metrics.record_compensation("stale_claim");

        tracing::error!(
            charge_id = %mask_charge_id(charge_id),
            compensation_id = %record.id,
            amount = charge.amount.amount(),
            "💀 Stale claim without an order, compensation recorded"
        );
        Ok(ClaimResolution::Compensation { compensation_id: record.id })
    }

    async fn mark_unknown(&self, charge_id: &str) -> Result<(), FulfillmentError> {
        self.stores
            .ledger
            .transition_charge(charge_id, &[ChargeState::Prepared, ChargeState::Unknown], ChargeState::Unknown, None)
            .await
            .map_err(|e| self.charge_state_error(charge_id, e))?;
        tracing::warn!(charge_id = %mask_charge_id(charge_id), "Charge outcome unknown, needs reconciliation");
        Ok(())
    }

    async fn load_charge(&self, charge_id: &str) -> Result<ChargeRecord, FulfillmentError> {
        self.stores
            .ledger
            .get_charge(charge_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("charge", mask_charge_id(charge_id)))
    }

    fn charge_state_error(&self, charge_id: &str, error: StoreError) -> FulfillmentError {
        match error {
            StoreError::StateMismatch { actual, .. } => FulfillmentError::ChargeState {
                charge_id: mask_charge_id(charge_id),
                state: actual,
            },
            other => other.into(),
        }
    }

    // ========================================================================
    // Compensation Ledger
    // ========================================================================

    pub async fn pending_compensations(&self) -> Result<Vec<CompensationRecord>, FulfillmentError> {
        let pending: Vec<_> = self
            .stores
            .ledger
            .list_compensations()
            .await?
            .into_iter()
            .filter(CompensationRecord::is_pending)
            .collect();
        self.metrics.set_pending_compensations(pending.len());
        Ok(pending)
    }

    /// Refund money owed for a line item. Retries with backoff; if the
    /// refund still fails, the debt is written to the ledger.
    pub async fn refund_line_item(
        &self,
        charge_id: &str,
        line_item_id: Uuid,
        amount: Money,
        reason: &str,
    ) -> Result<(), FulfillmentError> {
        let result = retry_with_backoff(self.retry.clone(), "refund", move |_attempt| {
            self.gateway.refund(charge_id, amount, reason)
        })
        .await
        .into_result();

        let error = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let record = CompensationRecord::new(
            charge_id,
            amount,
            CompensationKind::RefundFailed { line_item_id },
            error.to_string(),
        );
        self.stores.ledger.record_compensation(&record).await?;
        self.metrics.record_compensation("refund_failed");

        tracing::error!(
            charge_id = %mask_charge_id(charge_id),
            line_item_id = %line_item_id,
            compensation_id = %record.id,
            amount = amount.amount(),
            error = %error,
            "💀 Refund failed, compensation recorded"
        );

        Err(FulfillmentError::PendingCompensation {
            compensation_id: record.id,
            charge_id: mask_charge_id(charge_id),
            reason: error.to_string(),
        })
    }

    async fn load_pending(&self, id: Uuid) -> Result<CompensationRecord, FulfillmentError> {
        let record = self
            .stores
            .ledger
            .get_compensation(id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("compensation", id))?;

        if !record.is_pending() {
            return Err(FulfillmentError::CompensationNotActionable {
                id,
                reason: "already resolved".to_string(),
            });
        }
        Ok(record)
    }

    async fn save_attempt(&self, mut record: CompensationRecord, status: CompensationStatus, reason: Option<String>) -> Result<CompensationRecord, FulfillmentError> {
        let expected_attempts = record.attempts;
        record.attempts += 1;
        record.status = status;
        if let Some(reason) = reason {
            record.reason = reason;
        }
        record.updated_at = Utc::now();

        self.stores
            .ledger
            .update_compensation(&record, expected_attempts)
            .await
            .map_err(|e| match e {
                StoreError::Conflict { .. } => FulfillmentError::CompensationNotActionable {
                    id: record.id,
                    reason: "processed concurrently".to_string(),
                },
                other => other.into(),
            })?;
        Ok(record)
    }

    /// Try once more to create the order an approved charge paid for.
    pub async fn retry_order_creation(&self, compensation_id: Uuid) -> Result<Order, FulfillmentError> {
        let record = self.load_pending(compensation_id).await?;
        if record.kind != CompensationKind::OrderCreationFailed {
            return Err(FulfillmentError::CompensationNotActionable {
                id: compensation_id,
                reason: "not an order creation failure".to_string(),
            });
        }

        let charge = self.load_charge(&record.charge_id).await?;

        // A late write from the original claim may have landed after all.
        if let (Some(order_id), true) = (charge.order_id, self.order_written(&charge).await?) {
            let order = self
                .stores
                .orders
                .get_order(order_id)
                .await?
                .ok_or_else(|| FulfillmentError::not_found("order", order_id))?;
            self.save_attempt(record, CompensationStatus::OrderCreated { order_id }, None)
                .await?;
            self.stores
                .ledger
                .transition_charge(&charge.charge_id, &[ChargeState::PendingCompensation], ChargeState::Consumed, Some(order_id))
                .await?;
            self.metrics.record_compensation_resolved("order_found");
            tracing::info!(compensation_id = %compensation_id, order_id = %order_id, "Order already existed for compensation");
            return Ok(order);
        }

        // The gateway decides whether the items start paid or pending.
        let initial = match self
            .gateway
            .authorization_status(&charge.charge_id, self.gateway.default_timeout())
            .await?
        {
            GatewayAuthorization::Approved { synchronous: true } => LineItemStatus::PaymentCompleted,
            _ => LineItemStatus::PaymentPending,
        };

        let (order, items) = charge
            .draft
            .build(&charge.order_code, Some(charge.charge_id.clone()), initial, Utc::now());

        let orders = self.stores.orders.clone();
        let written = retry_on_transient(self.retry.clone(), "order_recreation", |_attempt| {
            let orders = orders.clone();
            let order = order.clone();
            let items = items.clone();
            async move { orders.create_order(&order, &items).await }
        })
        .await
        .into_result();

        if let Err(e) = written {
            self.save_attempt(record, CompensationStatus::Pending, Some(e.to_string())).await?;
            return Err(e.into());
        }

        self.save_attempt(record, CompensationStatus::OrderCreated { order_id: order.id }, None)
            .await?;
        self.stores
            .ledger
            .transition_charge(&charge.charge_id, &[ChargeState::PendingCompensation], ChargeState::Consumed, Some(order.id))
            .await?;
        self.metrics.record_compensation_resolved("order_created");

        tracing::info!(
            compensation_id = %compensation_id,
            order_id = %order.id,
            charge_id = %mask_charge_id(&charge.charge_id),
            "✅ Order re-created from compensation ledger"
        );
        Ok(order)
    }

    /// Give the money back for a pending compensation.
    pub async fn refund_compensation(&self, compensation_id: Uuid) -> Result<(), FulfillmentError> {
        let record = self.load_pending(compensation_id).await?;

        let refunded = self
            .gateway
            .refund(&record.charge_id, record.amount, &record.reason)
            .await;

        if let Err(e) = refunded {
            self.save_attempt(record, CompensationStatus::Pending, Some(e.to_string())).await?;
            return Err(e.into());
        }

        let charge_id = record.charge_id.clone();
        let kind = record.kind.clone();
        self.save_attempt(record, CompensationStatus::Refunded, None).await?;

        if kind == CompensationKind::OrderCreationFailed {
            let charge = self
                .stores
                .ledger
                .transition_charge(&charge_id, &[ChargeState::PendingCompensation], ChargeState::Refunded, None)
                .await?;
            // No order will ever ship these units.
            release_all(self.inventory.as_ref(), &charge.draft.stock_lines()).await;
        }
        self.metrics.record_compensation_resolved("refunded");

        tracing::info!(
            compensation_id = %compensation_id,
            charge_id = %mask_charge_id(&charge_id),
            "✅ Compensation refunded"
        );
        Ok(())
    }

    /// Work through every pending record once. Order creation failures are
    /// retried first and refunded if the retry fails; refund failures are
    /// simply refunded again.
    pub async fn drain_compensations(&self) -> Result<DrainReport, FulfillmentError> {
        let mut report = DrainReport::default();

        for charge in self.stale_claims(Utc::now()).await? {
            match self.settle_claim(&charge).await {
                Ok(_) => report.claims_settled += 1,
                Err(e) => {
                    tracing::warn!(charge_id = %mask_charge_id(&charge.charge_id), error = %e, "Stale claim not settled");
                }
            }
        }

        for record in self.pending_compensations().await? {
            let resolved = match record.kind {
                CompensationKind::OrderCreationFailed => match self.retry_order_creation(record.id).await {
                    Ok(_) => {
                        report.recreated += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(compensation_id = %record.id, error = %e, "Order re-creation failed, refunding");
                        self.refund_compensation(record.id).await
                    }
                },
                CompensationKind::RefundFailed { .. } => self.refund_compensation(record.id).await,
            };

            match resolved {
                Ok(()) => report.refunded += 1,
                Err(e) => {
                    tracing::warn!(compensation_id = %record.id, error = %e, "Compensation still pending");
                    report.still_pending += 1;
                }
            }
        }

        tracing::info!(
            claims_settled = report.claims_settled,
            recreated = report.recreated,
            refunded = report.refunded,
            still_pending = report.still_pending,
            "Compensation drain finished"
        );
        Ok(report)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
