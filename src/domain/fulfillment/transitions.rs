use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::delivery::{latest_of, DeliveryEvent, DeliveryStatus, DeliveryType};
use super::aggregate::OrderLineItem;
use super::commands::{Action, RequiredInput, TransitionRequest};
use super::errors::TransitionError;
use super::history::StatusHistoryEntry;
use super::value_objects::{ActorRole, LineItemStatus, Money};

use LineItemStatus::*;

// ============================================================================
// Transition Table
// ============================================================================
//
// Pure function over a line item snapshot:
//
//   (snapshot, request, guard context) -> Transition | TransitionError
//
// It never loads or stores anything. The caller supplies the delivery
// history the guards need and persists whatever comes back.
//
// ============================================================================

pub struct Edge {
    pub action: Action,
    pub from: &'static [LineItemStatus],
    pub to: LineItemStatus,
    pub roles: &'static [ActorRole],
}

const BUYER: &[ActorRole] = &[ActorRole::Buyer];
const ADMIN: &[ActorRole] = &[ActorRole::Admin];
const ADMIN_OR_SYSTEM: &[ActorRole] = &[ActorRole::Admin, ActorRole::System];
const ANYONE: &[ActorRole] = &[ActorRole::Buyer, ActorRole::Admin, ActorRole::System];

pub const EDGES: [Edge; 15] = [
    Edge { action: Action::ConfirmPayment, from: &[PaymentPending], to: PaymentCompleted, roles: ADMIN_OR_SYSTEM },
    Edge { action: Action::StartPreparing, from: &[PaymentCompleted], to: Preparing, roles: ADMIN },
    Edge { action: Action::Ship, from: &[Preparing], to: Delivering, roles: ADMIN },
    Edge { action: Action::MarkDelivered, from: &[Delivering], to: Delivered, roles: ADMIN_OR_SYSTEM },
    Edge { action: Action::ConfirmPurchase, from: &[Delivered], to: DeliveryConfirmed, roles: ANYONE },
    Edge { action: Action::RequestCancel, from: &[PaymentPending, PaymentCompleted], to: CancelRequested, roles: BUYER },
    Edge { action: Action::ApproveCancel, from: &[CancelRequested], to: Cancelled, roles: ADMIN },
    Edge { action: Action::RequestReturn, from: &[Delivered], to: ReturnRequested, roles: BUYER },
    Edge { action: Action::ApproveReturn, from: &[ReturnRequested], to: Returning, roles: ADMIN },
    Edge { action: Action::CompleteReturn, from: &[Returning], to: Returned, roles: ADMIN },
    Edge { action: Action::RequestExchange, from: &[Delivered], to: ExchangeRequested, roles: BUYER },
    Edge { action: Action::ApproveExchange, from: &[ExchangeRequested], to: ExchangeReturning, roles: ADMIN },
    Edge { action: Action::PrepareExchange, from: &[ExchangeReturning], to: ExchangePreparing, roles: ADMIN },
    Edge { action: Action::DispatchExchange, from: &[ExchangePreparing], to: ExchangeDelivering, roles: ADMIN },
    Edge { action: Action::CompleteExchange, from: &[ExchangeDelivering], to: ExchangeDelivered, roles: ADMIN_OR_SYSTEM },
];

pub fn edge(action: Action) -> Option<&'static Edge> {
    EDGES.iter().find(|e| e.action == action)
}

/// Work the caller has to carry out around the commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffect {
    /// Must succeed before the transition is committed.
    ReserveStock { variant_id: Uuid, quantity: u32 },
    ReleaseStock { variant_id: Uuid, quantity: u32 },
    Refund { amount: Money },
    MarkDelivery { delivery_type: DeliveryType, status: DeliveryStatus },
    CompleteDelivery { delivery_type: DeliveryType },
}

impl SideEffect {
    pub fn is_pre_commit(&self) -> bool {
        matches!(self, SideEffect::ReserveStock { .. })
    }
}

/// Facts the guards look at besides the snapshot itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardContext<'a> {
    pub deliveries: &'a [DeliveryEvent],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub item: OrderLineItem,
    pub history: StatusHistoryEntry,
    pub effects: Vec<SideEffect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegalAction {
    pub action: Action,
    pub target: LineItemStatus,
    pub roles: Vec<ActorRole>,
    pub required_inputs: Vec<RequiredInput>,
}

fn required_inputs(action: Action) -> Vec<RequiredInput> {
    match action {
        Action::RequestCancel | Action::RequestReturn | Action::RequestExchange => {
            vec![RequiredInput::Quantity, RequiredInput::Reason]
        }
        Action::Ship => vec![RequiredInput::DeliveryEvent(DeliveryType::OrderOut)],
        Action::CompleteReturn => vec![RequiredInput::DeliveryEvent(DeliveryType::ReturnIn)],
        Action::PrepareExchange => vec![RequiredInput::CompletedDeliveryEvent(DeliveryType::ExchangeIn)],
        Action::DispatchExchange => vec![RequiredInput::DeliveryEvent(DeliveryType::ExchangeOut)],
        _ => Vec::new(),
    }
}

/// Every action the table accepts from the item's current status.
pub fn legal_actions(item: &OrderLineItem) -> Vec<LegalAction> {
    EDGES
        .iter()
        .filter(|e| e.from.contains(&item.status))
        .map(|e| LegalAction {
            action: e.action,
            target: e.to,
            roles: e.roles.to_vec(),
            required_inputs: required_inputs(e.action),
        })
        .collect()
}

/// Same as [`legal_actions`], narrowed to what one role may do.
pub fn legal_actions_for(item: &OrderLineItem, role: ActorRole) -> Vec<LegalAction> {
    legal_actions(item)
        .into_iter()
        .filter(|a| a.roles.contains(&role))
        .collect()
}

/// Validate a request against the snapshot and compute the next snapshot.
/// The returned item already carries `version + 1`.
pub fn evaluate(
    item: &OrderLineItem,
    request: &TransitionRequest,
    ctx: &GuardContext<'_>,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let action = request.action;
    let edge = edge(action)
        .filter(|e| e.from.contains(&item.status))
        .ok_or(TransitionError::IllegalTransition { from: item.status, action })?;

    if !edge.roles.contains(&request.actor) {
        return Err(TransitionError::InvalidActor { actor: request.actor, action });
    }

    let mut reason = request
        .payload
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    check_guards(item, action, ctx)?;

    let mut next = item.clone();
    next.version = item.version + 1;
    next.updated_at = now;
    next.status = edge.to;

    let mut effects = Vec::new();
    let mut recorded_quantity = None;

    match action {
        Action::RequestCancel | Action::RequestReturn | Action::RequestExchange => {
            let quantity = request
                .payload
                .quantity
                .ok_or(TransitionError::MissingInput(RequiredInput::Quantity))?;
            if quantity == 0 || quantity > item.active_quantity {
                return Err(TransitionError::InvalidQuantity {
                    requested: quantity,
                    available: item.active_quantity,
                });
            }
            if reason.is_none() {
                return Err(TransitionError::MissingInput(RequiredInput::Reason));
            }

            next.requested_quantity = Some(quantity);
            next.request_reason = reason.clone();
            next.resume_status = Some(item.status);
            next.request_opened_at = Some(now);
            recorded_quantity = Some(quantity);

            if action == Action::RequestExchange {
                effects.push(SideEffect::ReserveStock { variant_id: item.variant_id, quantity });
            }
        }
        Action::ApproveCancel | Action::CompleteReturn => {
            let quantity = approved_quantity(item);
            // Without an approver note the history keeps the buyer's reason.
            if reason.is_none() {
                reason = item.request_reason.clone();
            }
            let remaining = item.active_quantity - quantity;

            next.active_quantity = remaining;
            if remaining > 0 {
                next.status = item.resume_status.unwrap_or(match action {
                    Action::ApproveCancel => PaymentCompleted,
                    _ => Delivered,
                });
            }
            next.clear_request();
            recorded_quantity = Some(quantity);

            effects.push(SideEffect::ReleaseStock { variant_id: item.variant_id, quantity });
            effects.push(SideEffect::Refund { amount: item.final_price * quantity });
            if action == Action::CompleteReturn {
                effects.push(SideEffect::CompleteDelivery { delivery_type: DeliveryType::ReturnIn });
            }
        }
        Action::ApproveReturn | Action::ApproveExchange => {
            recorded_quantity = Some(approved_quantity(item));
            effects.push(SideEffect::MarkDelivery {
                delivery_type: DeliveryType::OrderOut,
                status: DeliveryStatus::Return,
            });
        }
        Action::PrepareExchange => {
            let quantity = approved_quantity(item);
            recorded_quantity = Some(quantity);
            effects.push(SideEffect::ReleaseStock { variant_id: item.variant_id, quantity });
        }
        Action::CompleteExchange => {
            recorded_quantity = item.requested_quantity;
            next.clear_request();
            effects.push(SideEffect::CompleteDelivery { delivery_type: DeliveryType::ExchangeOut });
        }
        Action::Ship => {
            effects.push(SideEffect::MarkDelivery {
                delivery_type: DeliveryType::OrderOut,
                status: DeliveryStatus::Delivering,
            });
        }
        Action::DispatchExchange => {
            effects.push(SideEffect::MarkDelivery {
                delivery_type: DeliveryType::ExchangeOut,
                status: DeliveryStatus::Delivering,
            });
        }
        Action::MarkDelivered => {
            effects.push(SideEffect::CompleteDelivery { delivery_type: DeliveryType::OrderOut });
        }
        Action::ConfirmPurchase => {
            effects.push(SideEffect::MarkDelivery {
                delivery_type: DeliveryType::OrderOut,
                status: DeliveryStatus::Confirmed,
            });
        }
        Action::ConfirmPayment | Action::StartPreparing => {}
    }

    let history = StatusHistoryEntry::transition(item, &next, recorded_quantity, reason);

    Ok(Transition { item: next, history, effects })
}

fn approved_quantity(item: &OrderLineItem) -> u32 {
    item.requested_quantity
        .unwrap_or(item.active_quantity)
        .min(item.active_quantity)
}

fn check_guards(
    item: &OrderLineItem,
    action: Action,
    ctx: &GuardContext<'_>,
) -> Result<(), TransitionError> {
    let unmet = |reason: String| TransitionError::GuardNotSatisfied { action, reason };

    match action {
        Action::Ship => {
            let shipment = latest_in_cycle(item, ctx, DeliveryType::OrderOut)
                .filter(|e| e.has_tracking())
                .ok_or_else(|| unmet("no ORDER_OUT delivery with carrier and tracking number".to_string()))?;

            let scanned = shipment.barcodes.len();
            if scanned > 0 && scanned != item.active_quantity as usize {
                return Err(unmet(format!(
                    "scanned {} barcodes for quantity {}",
                    scanned, item.active_quantity
                )));
            }
        }
        Action::CompleteReturn => {
            latest_in_cycle(item, ctx, DeliveryType::ReturnIn)
                .ok_or_else(|| unmet("no RETURN_IN delivery recorded for this return".to_string()))?;
        }
        Action::PrepareExchange => {
            latest_in_cycle(item, ctx, DeliveryType::ExchangeIn)
                .filter(|e| e.is_completed())
                .ok_or_else(|| unmet("no completed EXCHANGE_IN delivery for this exchange".to_string()))?;
        }
        Action::DispatchExchange => {
            latest_in_cycle(item, ctx, DeliveryType::ExchangeOut)
                .filter(|e| e.has_tracking())
                .ok_or_else(|| unmet("no EXCHANGE_OUT delivery with carrier and tracking number".to_string()))?;
        }
        _ => {}
    }

    Ok(())
}

/// Latest event of a type recorded since the open request was made. With no
/// request open every event counts.
fn latest_in_cycle<'a>(
    item: &OrderLineItem,
    ctx: &GuardContext<'a>,
    delivery_type: DeliveryType,
) -> Option<&'a DeliveryEvent> {
    let deliveries: &'a [DeliveryEvent] = ctx.deliveries;
    match item.request_opened_at {
        None => latest_of(deliveries, delivery_type),
        Some(opened) => deliveries
            .iter()
            .filter(|e| e.delivery_type == delivery_type && e.created_at >= opened)
            .max_by_key(|e| (e.created_at, e.id)),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::delivery::NewDeliveryEvent;
    use std::collections::{HashSet, VecDeque};

    pub(crate) fn item_in(status: LineItemStatus, quantity: u32) -> OrderLineItem {
        let now = Utc::now();
        OrderLineItem {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            version: 3,
            product_id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            size: "M".to_string(),
            color: "Navy".to_string(),
            unit_price: Money(10_000),
            discount_rate: 0,
            final_price: Money(10_000),
            quantity,
            active_quantity: quantity,
            status,
            requested_quantity: None,
            request_reason: None,
            resume_status: None,
            request_opened_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn delivery(item: &OrderLineItem, new: NewDeliveryEvent) -> DeliveryEvent {
        DeliveryEvent::from_new(item.id, new, Utc::now())
    }

    fn run(
        item: &OrderLineItem,
        request: TransitionRequest,
        deliveries: &[DeliveryEvent],
    ) -> Result<Transition, TransitionError> {
        evaluate(item, &request, &GuardContext { deliveries }, Utc::now())
    }

    #[test]
    fn test_accepted_transition_bumps_version_and_records_history() {
        let item = item_in(PaymentCompleted, 1);
        let transition = run(&item, TransitionRequest::new(Action::StartPreparing, ActorRole::Admin), &[]).unwrap();

        assert_eq!(transition.item.status, Preparing);
        assert_eq!(transition.item.version, item.version + 1);
        assert_eq!(transition.history.sequence, item.version + 1);
        assert_eq!(transition.history.status_from, Some(PaymentCompleted));
        assert_eq!(transition.history.status_to, Preparing);
    }

    #[test]
    fn test_every_illegal_pair_is_rejected_without_touching_snapshot() {
        for status in LineItemStatus::ALL {
            for edge in EDGES.iter().filter(|e| !e.from.contains(&status)) {
                let item = item_in(status, 2);
                let before = item.clone();
                let request = TransitionRequest::new(edge.action, edge.roles[0])
                    .with_quantity(1)
                    .with_reason("changed my mind");

                let err = run(&item, request, &[]).unwrap_err();
                assert_eq!(err, TransitionError::IllegalTransition { from: status, action: edge.action });
                assert_eq!(item, before);
            }
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_legal_actions() {
        for status in LineItemStatus::ALL.iter().filter(|s| s.is_terminal()) {
            assert!(legal_actions(&item_in(*status, 1)).is_empty(), "{status} should be terminal");
        }
    }

    #[test]
    fn test_wrong_role_is_rejected() {
        let item = item_in(Delivered, 1);
        let err = run(
            &item,
            TransitionRequest::new(Action::RequestReturn, ActorRole::Admin)
                .with_quantity(1)
                .with_reason("damaged"),
            &[],
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::InvalidActor { actor: ActorRole::Admin, action: Action::RequestReturn });

        let err = run(&item_in(CancelRequested, 1), TransitionRequest::new(Action::ApproveCancel, ActorRole::Buyer), &[])
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidActor { .. }));
    }

    #[test]
    fn test_request_quantity_bounds() {
        let item = item_in(Delivered, 2);

        for quantity in [0, 3] {
            let err = run(
                &item,
                TransitionRequest::new(Action::RequestReturn, ActorRole::Buyer)
                    .with_quantity(quantity)
                    .with_reason("too small"),
                &[],
            )
            .unwrap_err();
            assert_eq!(err, TransitionError::InvalidQuantity { requested: quantity, available: 2 });
        }

        let err = run(
            &item,
            TransitionRequest::new(Action::RequestReturn, ActorRole::Buyer).with_reason("too small"),
            &[],
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::MissingInput(RequiredInput::Quantity));

        let err = run(
            &item,
            TransitionRequest::new(Action::RequestReturn, ActorRole::Buyer)
                .with_quantity(1)
                .with_reason("   "),
            &[],
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::MissingInput(RequiredInput::Reason));
    }

    #[test]
    fn test_full_cancel_reaches_cancelled_with_refund_and_release() {
        let item = item_in(PaymentCompleted, 2);
        let requested = run(
            &item,
            TransitionRequest::new(Action::RequestCancel, ActorRole::Buyer)
                .with_quantity(2)
                .with_reason("ordered by mistake"),
            &[],
        )
        .unwrap();
        assert_eq!(requested.item.status, CancelRequested);
        assert_eq!(requested.item.resume_status, Some(PaymentCompleted));

        let approved = run(&requested.item, TransitionRequest::new(Action::ApproveCancel, ActorRole::Admin), &[]).unwrap();
        assert_eq!(approved.item.status, Cancelled);
        assert_eq!(approved.item.active_quantity, 0);
        assert_eq!(approved.item.version, item.version + 2);
        assert!(approved.effects.contains(&SideEffect::Refund { amount: Money(20_000) }));
        assert!(approved.effects.contains(&SideEffect::ReleaseStock { variant_id: item.variant_id, quantity: 2 }));
    }

    #[test]
    fn test_approval_history_keeps_buyer_reason() {
        let item = item_in(PaymentCompleted, 1);
        let requested = run(
            &item,
            TransitionRequest::new(Action::RequestCancel, ActorRole::Buyer)
                .with_quantity(1)
                .with_reason("found it cheaper"),
            &[],
        )
        .unwrap();

        let approved = run(&requested.item, TransitionRequest::new(Action::ApproveCancel, ActorRole::Admin), &[]).unwrap();
        assert_eq!(approved.item.request_reason, None);
        assert_eq!(approved.history.reason.as_deref(), Some("found it cheaper"));

        let noted = run(
            &requested.item,
            TransitionRequest::new(Action::ApproveCancel, ActorRole::Admin).with_reason("approved by cs"),
            &[],
        )
        .unwrap();
        assert_eq!(noted.history.reason.as_deref(), Some("approved by cs"));
    }

    #[test]
    fn test_partial_cancel_resumes_previous_status() {
        let item = item_in(PaymentPending, 3);
        let requested = run(
            &item,
            TransitionRequest::new(Action::RequestCancel, ActorRole::Buyer)
                .with_quantity(1)
                .with_reason("only need two"),
            &[],
        )
        .unwrap();

        let approved = run(&requested.item, TransitionRequest::new(Action::ApproveCancel, ActorRole::Admin), &[]).unwrap();
        assert_eq!(approved.item.status, PaymentPending);
        assert_eq!(approved.item.active_quantity, 2);
        assert_eq!(approved.item.requested_quantity, None);
        assert_eq!(approved.history.requested_quantity, Some(1));
        assert!(approved.effects.contains(&SideEffect::Refund { amount: Money(10_000) }));
    }

    #[test]
    fn test_cancelled_is_only_reachable_through_cancel_request() {
        // Walk every path from the initial statuses over the table edges.
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Vec<LineItemStatus>> =
            VecDeque::from(vec![vec![PaymentPending], vec![PaymentCompleted]]);

        while let Some(path) = queue.pop_front() {
            let current = *path.last().unwrap();
            if current == Cancelled {
                let n = path.len();
                assert!(n >= 2 && path[n - 2] == CancelRequested, "bad path {path:?}");
                if n >= 3 {
                    assert!(matches!(path[n - 3], PaymentPending | PaymentCompleted), "bad path {path:?}");
                }
            }
            for edge in EDGES.iter().filter(|e| e.from.contains(&current)) {
                if seen.insert((current, edge.to)) {
                    let mut next = path.clone();
                    next.push(edge.to);
                    queue.push_back(next);
                }
            }
        }

        let into_cancelled: Vec<_> = EDGES.iter().filter(|e| e.to == Cancelled).collect();
        assert_eq!(into_cancelled.len(), 1);
        assert_eq!(into_cancelled[0].from, &[CancelRequested]);
    }

    #[test]
    fn test_ship_requires_tracked_outbound_delivery() {
        let item = item_in(Preparing, 2);
        let request = TransitionRequest::new(Action::Ship, ActorRole::Admin);

        let err = run(&item, request.clone(), &[]).unwrap_err();
        assert!(matches!(err, TransitionError::GuardNotSatisfied { action: Action::Ship, .. }));

        let untracked = delivery(&item, NewDeliveryEvent::new(DeliveryType::OrderOut));
        assert!(run(&item, request.clone(), &[untracked]).is_err());

        let short_scan = delivery(
            &item,
            NewDeliveryEvent::new(DeliveryType::OrderOut)
                .with_tracking("CJ", "1234567890123")
                .with_barcodes(vec!["8801234567890".to_string()]),
        );
        assert!(run(&item, request.clone(), &[short_scan]).is_err());

        let tracked = delivery(&item, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "1234567890123"));
        let shipped = run(&item, request, &[tracked]).unwrap();
        assert_eq!(shipped.item.status, Delivering);
    }

    #[test]
    fn test_dispatch_exchange_requires_exchange_out_with_tracking() {
        let mut item = item_in(ExchangePreparing, 1);
        item.requested_quantity = Some(1);
        let request = TransitionRequest::new(Action::DispatchExchange, ActorRole::Admin);

        let err = run(&item, request.clone(), &[]).unwrap_err();
        assert!(matches!(err, TransitionError::GuardNotSatisfied { action: Action::DispatchExchange, .. }));

        // An outbound shipment of the wrong type does not count.
        let wrong_type = delivery(&item, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "1"));
        assert!(run(&item, request.clone(), &[wrong_type]).is_err());

        let out = delivery(&item, NewDeliveryEvent::new(DeliveryType::ExchangeOut).with_tracking("CJ", "1234567890123"));
        let dispatched = run(&item, request, &[out]).unwrap();
        assert_eq!(dispatched.item.status, ExchangeDelivering);
    }

    #[test]
    fn test_prepare_exchange_requires_completed_pickup() {
        let mut item = item_in(ExchangeReturning, 1);
        item.requested_quantity = Some(1);
        let request = TransitionRequest::new(Action::PrepareExchange, ActorRole::Admin);

        let mut pickup = delivery(&item, NewDeliveryEvent::new(DeliveryType::ExchangeIn));
        assert!(run(&item, request.clone(), std::slice::from_ref(&pickup)).is_err());

        pickup.completed_at = Some(Utc::now());
        let prepared = run(&item, request, &[pickup]).unwrap();
        assert_eq!(prepared.item.status, ExchangePreparing);
        assert!(prepared.effects.contains(&SideEffect::ReleaseStock { variant_id: item.variant_id, quantity: 1 }));
    }

    #[test]
    fn test_exchange_request_reserves_replacement_stock() {
        let item = item_in(Delivered, 2);
        let transition = run(
            &item,
            TransitionRequest::new(Action::RequestExchange, ActorRole::Buyer)
                .with_quantity(1)
                .with_reason("size swap"),
            &[],
        )
        .unwrap();

        assert_eq!(transition.effects, vec![SideEffect::ReserveStock { variant_id: item.variant_id, quantity: 1 }]);
        assert!(transition.effects[0].is_pre_commit());
    }

    #[test]
    fn test_partial_return_goes_back_to_delivered() {
        let mut item = item_in(Returning, 2);
        item.requested_quantity = Some(1);
        item.resume_status = Some(Delivered);
        let pickup = delivery(&item, NewDeliveryEvent::new(DeliveryType::ReturnIn));

        let done = run(&item, TransitionRequest::new(Action::CompleteReturn, ActorRole::Admin), &[pickup]).unwrap();
        assert_eq!(done.item.status, Delivered);
        assert_eq!(done.item.active_quantity, 1);
    }

    #[test]
    fn test_second_return_needs_its_own_pickup() {
        let base = Utc::now();
        let at = |minutes: i64| base + chrono::Duration::minutes(minutes);
        let pickup_at = |item: &OrderLineItem, minutes: i64| {
            DeliveryEvent::from_new(item.id, NewDeliveryEvent::new(DeliveryType::ReturnIn), at(minutes))
        };
        let request = || {
            TransitionRequest::new(Action::RequestReturn, ActorRole::Buyer)
                .with_quantity(1)
                .with_reason("does not fit")
        };
        let approve = TransitionRequest::new(Action::ApproveReturn, ActorRole::Admin);
        let complete = TransitionRequest::new(Action::CompleteReturn, ActorRole::Admin);
        let no_ctx = GuardContext::default();

        let item = item_in(Delivered, 3);
        let first = evaluate(&item, &request(), &no_ctx, at(0)).unwrap().item;
        assert_eq!(first.request_opened_at, Some(at(0)));
        let first = evaluate(&first, &approve, &no_ctx, at(1)).unwrap().item;
        let first_pickup = pickup_at(&first, 2);
        let back = evaluate(&first, &complete, &GuardContext { deliveries: std::slice::from_ref(&first_pickup) }, at(3))
            .unwrap()
            .item;
        assert_eq!((back.status, back.active_quantity), (Delivered, 2));
        assert_eq!(back.request_opened_at, None);

        let second = evaluate(&back, &request(), &no_ctx, at(4)).unwrap().item;
        let second = evaluate(&second, &approve, &no_ctx, at(5)).unwrap().item;

        let stale = [first_pickup.clone()];
        let err = evaluate(&second, &complete, &GuardContext { deliveries: &stale }, at(6)).unwrap_err();
        assert!(matches!(err, TransitionError::GuardNotSatisfied { action: Action::CompleteReturn, .. }));

        let both = [first_pickup, pickup_at(&second, 6)];
        let done = evaluate(&second, &complete, &GuardContext { deliveries: &both }, at(7)).unwrap().item;
        assert_eq!((done.status, done.active_quantity), (Delivered, 1));
    }

    #[test]
    fn test_exchange_pickup_from_before_the_request_is_ignored() {
        let base = Utc::now();
        let mut item = item_in(ExchangeReturning, 1);
        item.requested_quantity = Some(1);
        item.request_opened_at = Some(base);

        let mut old_pickup = DeliveryEvent::from_new(
            item.id,
            NewDeliveryEvent::new(DeliveryType::ExchangeIn),
            base - chrono::Duration::hours(1),
        );
        old_pickup.completed_at = Some(base - chrono::Duration::minutes(30));

        let request = TransitionRequest::new(Action::PrepareExchange, ActorRole::Admin);
        let stale = [old_pickup];
        assert!(evaluate(&item, &request, &GuardContext { deliveries: &stale }, base).is_err());
    }

    #[test]
    fn test_legal_actions_carry_required_inputs() {
        let actions = legal_actions(&item_in(Delivered, 1));
        let names: Vec<_> = actions.iter().map(|a| a.action).collect();
        assert_eq!(names, vec![Action::ConfirmPurchase, Action::RequestReturn, Action::RequestExchange]);

        let ret = actions.iter().find(|a| a.action == Action::RequestReturn).unwrap();
        assert_eq!(ret.required_inputs, vec![RequiredInput::Quantity, RequiredInput::Reason]);

        let buyer_only = legal_actions_for(&item_in(Preparing, 1), ActorRole::Buyer);
        assert!(buyer_only.is_empty());
    }

    #[test]
    fn test_every_listed_action_is_accepted_with_its_inputs() {
        for status in LineItemStatus::ALL {
            let mut item = item_in(status, 2);
            item.requested_quantity = Some(1);

            for legal in legal_actions(&item) {
                let mut request = TransitionRequest::new(legal.action, legal.roles[0]);
                let mut deliveries = Vec::new();
                for input in &legal.required_inputs {
                    match input {
                        RequiredInput::Quantity => request = request.with_quantity(1),
                        RequiredInput::Reason => request = request.with_reason("requested"),
                        RequiredInput::DeliveryEvent(t) => deliveries.push(delivery(
                            &item,
                            NewDeliveryEvent::new(*t).with_tracking("CJ", "1234567890123"),
                        )),
                        RequiredInput::CompletedDeliveryEvent(t) => {
                            let mut event = delivery(&item, NewDeliveryEvent::new(*t));
                            event.completed_at = Some(Utc::now());
                            deliveries.push(event);
                        }
                    }
                }

                let result = run(&item, request, &deliveries);
                assert!(result.is_ok(), "{} from {} rejected: {:?}", legal.action, status, result);
            }
        }
    }
}
