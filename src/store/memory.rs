use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::delivery::DeliveryEvent;
use crate::domain::fulfillment::{LineItemStatus, Order, OrderLineItem, StatusHistoryEntry};
use crate::domain::payment::{ChargeRecord, ChargeState, CompensationRecord};
use crate::domain::review::ReviewRecord;

use super::{
    DeliveryEventStore, LineItemRepository, OrderRepository, PaymentLedger, ReviewStore, StoreError,
};

// ============================================================================
// In-Memory Store
// ============================================================================
//
// All maps sit behind one mutex, so every trait method is a single critical
// section. That is what makes `commit_transition` and `create_order` atomic
// here.
//
// ============================================================================

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    line_items: HashMap<Uuid, OrderLineItem>,
    order_items: HashMap<Uuid, Vec<Uuid>>,
    history: HashMap<Uuid, Vec<StatusHistoryEntry>>,
    deliveries: HashMap<Uuid, DeliveryEvent>,
    deliveries_by_item: HashMap<Uuid, Vec<Uuid>>,
    reviews: HashMap<Uuid, ReviewRecord>,
    charges: HashMap<String, ChargeRecord>,
    compensations: HashMap<Uuid, CompensationRecord>,
    failing_charge_transitions: HashMap<ChargeState, u32>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_order_writes: AtomicU32,
    failing_compensation_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `create_order` fail with a backend error.
    pub fn fail_next_order_writes(&self, count: u32) {
        self.failing_order_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `record_compensation` fail.
    pub fn fail_next_compensation_writes(&self, count: u32) {
        self.failing_compensation_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` charge transitions into `next` fail.
    pub async fn fail_next_charge_transitions(&self, next: ChargeState, count: u32) {
        self.state.lock().await.failing_charge_transitions.insert(next, count);
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }
}

#[async_trait]
impl LineItemRepository for MemoryStore {
    async fn get_line_item(&self, line_item_id: Uuid) -> Result<Option<OrderLineItem>, StoreError> {
        Ok(self.state.lock().await.line_items.get(&line_item_id).cloned())
    }

    async fn list_by_order(&self, order_id: Uuid) -> Result<Vec<OrderLineItem>, StoreError> {
        let state = self.state.lock().await;
        let items = state
            .order_items
            .get(&order_id)
            .map(|ids| ids.iter().filter_map(|id| state.line_items.get(id).cloned()).collect())
            .unwrap_or_default();
        Ok(items)
    }

    async fn list_by_status(&self, status: LineItemStatus) -> Result<Vec<OrderLineItem>, StoreError> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .line_items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn commit_transition(
        &self,
        expected_version: i64,
        item: &OrderLineItem,
        entry: &StatusHistoryEntry,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        let stored = state
            .line_items
            .get_mut(&item.id)
            .ok_or_else(|| StoreError::not_found("line item", item.id))?;

        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: Some(stored.version),
            });
        }

        *stored = item.clone();
        state.history.entry(item.id).or_default().push(entry.clone());
        Ok(())
    }

    async fn history(&self, line_item_id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries = state.history.get(&line_item_id).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order(&self, order: &Order, items: &[OrderLineItem]) -> Result<(), StoreError> {
        if Self::take_injected_failure(&self.failing_order_writes) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected write failure for order {}",
                order.id
            )));
        }

        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate { entity: "order", id: order.id.to_string() });
        }

        state.orders.insert(order.id, order.clone());
        state
            .order_items
            .insert(order.id, items.iter().map(|item| item.id).collect());
        for item in items {
            state.line_items.insert(item.id, item.clone());
            state.history.insert(item.id, vec![StatusHistoryEntry::creation(item)]);
        }
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }
}

#[async_trait]
impl DeliveryEventStore for MemoryStore {
    async fn append_event(&self, event: &DeliveryEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.deliveries.contains_key(&event.id) {
            return Err(StoreError::Duplicate { entity: "delivery event", id: event.id.to_string() });
        }
        state.deliveries.insert(event.id, event.clone());
        state
            .deliveries_by_item
            .entry(event.line_item_id)
            .or_default()
            .push(event.id);
        Ok(())
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<DeliveryEvent>, StoreError> {
        Ok(self.state.lock().await.deliveries.get(&event_id).cloned())
    }

    async fn update_event(&self, event: &DeliveryEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .deliveries
            .get_mut(&event.id)
            .ok_or_else(|| StoreError::not_found("delivery event", event.id))?;
        stored.status = event.status;
        stored.completed_at = event.completed_at;
        Ok(())
    }

    async fn list_events(&self, line_item_id: Uuid) -> Result<Vec<DeliveryEvent>, StoreError> {
        let state = self.state.lock().await;
        let events = state
            .deliveries_by_item
            .get(&line_item_id)
            .map(|ids| ids.iter().filter_map(|id| state.deliveries.get(id).cloned()).collect())
            .unwrap_or_default();
        Ok(events)
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn get_for_line_item(&self, line_item_id: Uuid) -> Result<Option<ReviewRecord>, StoreError> {
        Ok(self.state.lock().await.reviews.get(&line_item_id).cloned())
    }

    async fn insert_review(&self, review: &ReviewRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.reviews.contains_key(&review.line_item_id) {
            return Err(StoreError::Duplicate {
                entity: "review",
                id: review.line_item_id.to_string(),
            });
        }
        state.reviews.insert(review.line_item_id, review.clone());
        Ok(())
    }

    async fn update_review(&self, review: &ReviewRecord, expected_version: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .reviews
            .get_mut(&review.line_item_id)
            .ok_or_else(|| StoreError::not_found("review", review.line_item_id))?;

        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: Some(stored.version),
            });
        }
        *stored = review.clone();
        Ok(())
    }
}

#[async_trait]
impl PaymentLedger for MemoryStore {
    async fn insert_charge(&self, charge: &ChargeRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.charges.contains_key(&charge.charge_id) {
            return Err(StoreError::Duplicate { entity: "charge", id: charge.charge_id.clone() });
        }
        state.charges.insert(charge.charge_id.clone(), charge.clone());
        Ok(())
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, StoreError> {
        Ok(self.state.lock().await.charges.get(charge_id).cloned())
    }

    async fn list_charges(&self, state: ChargeState) -> Result<Vec<ChargeRecord>, StoreError> {
        let guard = self.state.lock().await;
        let mut charges: Vec<_> = guard
            .charges
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect();
        charges.sort_by_key(|c| c.created_at);
        Ok(charges)
    }

    async fn transition_charge(
        &self,
        charge_id: &str,
        expected: &[ChargeState],
        next: ChargeState,
        order_id: Option<Uuid>,
    ) -> Result<ChargeRecord, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(remaining) = state.failing_charge_transitions.get_mut(&next) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "injected failure moving charge to {}",
                    next
                )));
            }
        }

        let charge = state
            .charges
            .get_mut(charge_id)
            .ok_or_else(|| StoreError::not_found("charge", charge_id))?;

        if !expected.contains(&charge.state) {
            return Err(StoreError::StateMismatch {
                entity: "charge",
                id: charge_id.to_string(),
                actual: charge.state.to_string(),
            });
        }

        charge.state = next;
        if order_id.is_some() {
            charge.order_id = order_id;
        }
        charge.updated_at = Utc::now();
        Ok(charge.clone())
    }

    async fn record_compensation(&self, record: &CompensationRecord) -> Result<(), StoreError> {
        if Self::take_injected_failure(&self.failing_compensation_writes) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected write failure for compensation {}",
                record.id
            )));
        }

        self.state
            .lock()
            .await
            .compensations
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_compensation(&self, id: Uuid) -> Result<Option<CompensationRecord>, StoreError> {
        Ok(self.state.lock().await.compensations.get(&id).cloned())
    }

    async fn list_compensations(&self) -> Result<Vec<CompensationRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.compensations.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn update_compensation(
        &self,
        record: &CompensationRecord,
        expected_attempts: u32,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .compensations
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::not_found("compensation", record.id))?;

        if stored.attempts != expected_attempts {
            return Err(StoreError::Conflict {
                expected: i64::from(expected_attempts),
                actual: Some(i64::from(stored.attempts)),
            });
        }
        *stored = record.clone();
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fulfillment::aggregate::tests::sample_draft;

    async fn seeded() -> (MemoryStore, Order, Vec<OrderLineItem>) {
        let store = MemoryStore::new();
        let (order, items) = sample_draft().build("2410190A1B", None, LineItemStatus::PaymentCompleted, Utc::now());
        store.create_order(&order, &items).await.unwrap();
        (store, order, items)
    }

    #[tokio::test]
    async fn test_create_order_writes_items_and_creation_history() {
        let (store, order, items) = seeded().await;

        let listed = store.list_by_order(order.id).await.unwrap();
        assert_eq!(listed.len(), items.len());

        let history = store.history(items[0].id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status_from, None);
        assert_eq!(history[0].status_to, LineItemStatus::PaymentCompleted);
    }

    #[tokio::test]
    async fn test_commit_transition_rejects_stale_version() {
        let (store, _, items) = seeded().await;
        let before = items[0].clone();

        let mut next = before.clone();
        next.version = 1;
        next.status = LineItemStatus::Preparing;
        let entry = StatusHistoryEntry::transition(&before, &next, None, None);

        store.commit_transition(0, &next, &entry).await.unwrap();
        let err = store.commit_transition(0, &next, &entry).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: Some(1) }));

        // The losing write left no trace in the history.
        assert_eq!(store.history(before.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_order_write_failure_is_consumed_once() {
        let store = MemoryStore::new();
        store.fail_next_order_writes(1);
        let (order, items) = sample_draft().build("2410190A1B", None, LineItemStatus::PaymentCompleted, Utc::now());

        assert!(store.create_order(&order, &items).await.is_err());
        assert!(store.create_order(&order, &items).await.is_ok());
        assert_eq!(store.order_count().await, 1);
    }
}
