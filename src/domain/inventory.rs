use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Inventory Port
// ============================================================================
//
// Stock per product variant lives in the catalog service. The fulfillment
// core only reserves units for exchanges and hands units back when a cancel,
// return or exchange pickup is processed.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Insufficient { available: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Inventory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn reserve(&self, variant_id: Uuid, quantity: u32) -> Result<ReserveOutcome, InventoryError>;

    async fn release(&self, variant_id: Uuid, quantity: u32) -> Result<(), InventoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("Insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    Insufficient {
        variant_id: Uuid,
        requested: u32,
        available: u32,
    },

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Reserve every `(variant, quantity)` line or none of them.
pub async fn reserve_all(inventory: &dyn Inventory, lines: &[(Uuid, u32)]) -> Result<(), ReservationError> {
    for (done, &(variant_id, quantity)) in lines.iter().enumerate() {
        let outcome = match inventory.reserve(variant_id, quantity).await {
            Ok(outcome) => outcome,
            Err(e) => {
                release_all(inventory, &lines[..done]).await;
                return Err(e.into());
            }
        };

        if let ReserveOutcome::Insufficient { available } = outcome {
            release_all(inventory, &lines[..done]).await;
            return Err(ReservationError::Insufficient {
                variant_id,
                requested: quantity,
                available,
            });
        }
    }
    Ok(())
}

/// Hand units back. Failures are logged, the caller has nothing to undo.
pub async fn release_all(inventory: &dyn Inventory, lines: &[(Uuid, u32)]) {
    for &(variant_id, quantity) in lines {
        if let Err(e) = inventory.release(variant_id, quantity).await {
            tracing::error!(variant_id = %variant_id, quantity, error = %e, "Failed to release stock");
        }
    }
}

/// Stock counts kept in process. Unknown variants have zero stock.
#[derive(Default)]
pub struct InMemoryInventory {
    stock: Mutex<HashMap<Uuid, u32>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_stock(&self, variant_id: Uuid, quantity: u32) {
        self.stock.lock().await.insert(variant_id, quantity);
    }

    pub async fn available(&self, variant_id: Uuid) -> u32 {
        self.stock.lock().await.get(&variant_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Inventory for InMemoryInventory {
    async fn reserve(&self, variant_id: Uuid, quantity: u32) -> Result<ReserveOutcome, InventoryError> {
        let mut stock = self.stock.lock().await;
        let available = stock.get(&variant_id).copied().unwrap_or(0);

        if available < quantity {
            tracing::debug!(variant_id = %variant_id, available, quantity, "Not enough stock to reserve");
            return Ok(ReserveOutcome::Insufficient { available });
        }

        stock.insert(variant_id, available - quantity);
        Ok(ReserveOutcome::Reserved)
    }

    async fn release(&self, variant_id: Uuid, quantity: u32) -> Result<(), InventoryError> {
        let mut stock = self.stock.lock().await;
        *stock.entry(variant_id).or_insert(0) += quantity;
        Ok(())
    }
}
