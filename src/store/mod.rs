use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::delivery::DeliveryEvent;
use crate::domain::fulfillment::{LineItemStatus, Order, OrderLineItem, StatusHistoryEntry};
use crate::domain::payment::{ChargeRecord, ChargeState, CompensationRecord};
use crate::domain::review::ReviewRecord;

mod errors;
pub mod memory;
pub mod scylla;

pub use errors::StoreError;
pub use memory::MemoryStore;
pub use self::scylla::ScyllaStore;

// ============================================================================
// Persistence Ports
// ============================================================================
//
// Each trait is a narrow port the domain depends on. Both backends
// implement all of them on one struct, `Stores` hands them out as trait
// objects.
//
// ============================================================================

#[async_trait]
pub trait LineItemRepository: Send + Sync {
    async fn get_line_item(&self, line_item_id: Uuid) -> Result<Option<OrderLineItem>, StoreError>;

    async fn list_by_order(&self, order_id: Uuid) -> Result<Vec<OrderLineItem>, StoreError>;

    async fn list_by_status(&self, status: LineItemStatus) -> Result<Vec<OrderLineItem>, StoreError>;

    /// Replace the stored snapshot with `item` and append `entry` in one
    /// atomic step, only if the stored version still equals
    /// `expected_version`. Fails with `StoreError::Conflict` otherwise.
    async fn commit_transition(
        &self,
        expected_version: i64,
        item: &OrderLineItem,
        entry: &StatusHistoryEntry,
    ) -> Result<(), StoreError>;

    /// Status history, ascending by sequence.
    async fn history(&self, line_item_id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist the header, its line items and their creation history entries.
    async fn create_order(&self, order: &Order, items: &[OrderLineItem]) -> Result<(), StoreError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;
}

#[async_trait]
pub trait DeliveryEventStore: Send + Sync {
    async fn append_event(&self, event: &DeliveryEvent) -> Result<(), StoreError>;

    async fn get_event(&self, event_id: Uuid) -> Result<Option<DeliveryEvent>, StoreError>;

    /// Overwrite the mutable fields (`status`, `completed_at`) of an event.
    async fn update_event(&self, event: &DeliveryEvent) -> Result<(), StoreError>;

    /// Events of one line item, ascending by creation.
    async fn list_events(&self, line_item_id: Uuid) -> Result<Vec<DeliveryEvent>, StoreError>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn get_for_line_item(&self, line_item_id: Uuid) -> Result<Option<ReviewRecord>, StoreError>;

    /// Fails with `StoreError::Duplicate` when the line item already has a
    /// review, deleted or not.
    async fn insert_review(&self, review: &ReviewRecord) -> Result<(), StoreError>;

    /// Compare-and-set on `expected_version`.
    async fn update_review(&self, review: &ReviewRecord, expected_version: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn insert_charge(&self, charge: &ChargeRecord) -> Result<(), StoreError>;

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, StoreError>;

    /// Charges currently in `state`, oldest first.
    async fn list_charges(&self, state: ChargeState) -> Result<Vec<ChargeRecord>, StoreError>;

    /// Move a charge to `next` only if it is currently in one of `expected`.
    async fn transition_charge(
        &self,
        charge_id: &str,
        expected: &[ChargeState],
        next: ChargeState,
        order_id: Option<Uuid>,
    ) -> Result<ChargeRecord, StoreError>;

    async fn record_compensation(&self, record: &CompensationRecord) -> Result<(), StoreError>;

    async fn get_compensation(&self, id: Uuid) -> Result<Option<CompensationRecord>, StoreError>;

    /// All compensation records, oldest first.
    async fn list_compensations(&self) -> Result<Vec<CompensationRecord>, StoreError>;

    /// Compare-and-set on the stored attempt counter.
    async fn update_compensation(
        &self,
        record: &CompensationRecord,
        expected_attempts: u32,
    ) -> Result<(), StoreError>;
}

/// The full set of ports, shared by the service components.
#[derive(Clone)]
pub struct Stores {
    pub line_items: Arc<dyn LineItemRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub deliveries: Arc<dyn DeliveryEventStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub ledger: Arc<dyn PaymentLedger>,
}

impl Stores {
    pub fn memory() -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Self::from_backend(store.clone()), store)
    }

    pub fn scylla(store: Arc<ScyllaStore>) -> Self {
        Self::from_backend(store)
    }

    fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: LineItemRepository + OrderRepository + DeliveryEventStore + ReviewStore + PaymentLedger + 'static,
    {
        Self {
            line_items: store.clone(),
            orders: store.clone(),
            deliveries: store.clone(),
            reviews: store.clone(),
            ledger: store,
        }
    }
}
