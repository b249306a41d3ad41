use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DraftError;
use super::value_objects::{LineItemStatus, Money};

// ============================================================================
// Order Aggregate
// ============================================================================
//
// The order header carries no status of its own. Every line item moves
// through the fulfillment lifecycle independently and is versioned on its
// own, so two line items of the same order never contend with each other.
// Order-level figures that depend on line item state are derived on read.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub name: String,
    pub phone: String,
    pub zip_code: String,
    pub address: String,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub order_code: String,

    pub buyer: BuyerInfo,
    pub recipient: ShippingInfo,

    pub delivery_fee: Money,
    /// Amount charged at checkout. Never changes afterwards.
    pub total_price: Money,
    pub charge_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Order {
    /// What the order is currently worth: every line item at its final price
    /// times the quantity still being fulfilled, plus the delivery fee while
    /// anything remains.
    pub fn current_total(&self, items: &[OrderLineItem]) -> Money {
        let goods: Money = items
            .iter()
            .filter(|item| item.order_id == self.id)
            .map(|item| item.final_price * item.active_quantity)
            .sum();

        if goods.is_zero() {
            goods
        } else {
            goods + self.delivery_fee
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineItem {
    // Identity
    pub id: Uuid,
    pub order_id: Uuid,
    pub version: i64,

    // Product reference
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub size: String,
    pub color: String,

    // Pricing
    pub unit_price: Money,
    pub discount_rate: u32,
    pub final_price: Money,

    // Quantities
    pub quantity: u32,
    pub active_quantity: u32,

    // Lifecycle
    pub status: LineItemStatus,
    pub requested_quantity: Option<u32>,
    pub request_reason: Option<String>,
    /// Status to return to when a partial cancel or return is approved.
    pub resume_status: Option<LineItemStatus>,
    /// When the open cancel, return or exchange request was made. Delivery
    /// guards only look at events recorded since then.
    #[serde(default)]
    pub request_opened_at: Option<DateTime<Utc>>,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderLineItem {
    pub fn new(
        order_id: Uuid,
        line: &NewLineItem,
        status: LineItemStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            version: 0,
            product_id: line.product_id,
            variant_id: line.variant_id,
            size: line.size.clone(),
            color: line.color.clone(),
            unit_price: line.unit_price,
            discount_rate: line.discount_rate,
            final_price: line.final_price(),
            quantity: line.quantity,
            active_quantity: line.quantity,
            status,
            requested_quantity: None,
            request_reason: None,
            resume_status: None,
            request_opened_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn clear_request(&mut self) {
        self.requested_quantity = None;
        self.request_reason = None;
        self.resume_status = None;
        self.request_opened_at = None;
    }
}

/// A line item as submitted at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub size: String,
    pub color: String,
    pub unit_price: Money,
    pub discount_rate: u32,
    pub quantity: u32,
}

impl NewLineItem {
    pub fn final_price(&self) -> Money {
        self.unit_price.discounted(self.discount_rate)
    }
}

/// Everything needed to create an order once the charge is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub buyer: BuyerInfo,
    pub recipient: ShippingInfo,
    pub delivery_fee: Money,
    pub items: Vec<NewLineItem>,
}

impl OrderDraft {
    pub fn validate(&self) -> Result<(), DraftError> {
        if self.items.is_empty() {
            return Err(DraftError::EmptyItems);
        }

        for item in &self.items {
            if item.quantity == 0 {
                return Err(DraftError::InvalidQuantity(item.quantity));
            }
            if item.discount_rate > 100 {
                return Err(DraftError::InvalidDiscount(item.discount_rate));
            }
            if item.unit_price.amount() < 0 {
                return Err(DraftError::InvalidPrice(item.unit_price.amount()));
            }
        }

        Ok(())
    }

    /// Amount to charge for this draft.
    pub fn total(&self) -> Money {
        let goods: Money = self
            .items
            .iter()
            .map(|item| item.final_price() * item.quantity)
            .sum();
        goods + self.delivery_fee
    }

    /// Units per variant that have to be held for this draft.
    pub fn stock_lines(&self) -> Vec<(Uuid, u32)> {
        self.items.iter().map(|item| (item.variant_id, item.quantity)).collect()
    }

    /// Materialize the order header and its line items.
    pub fn build(
        &self,
        order_code: &str,
        charge_id: Option<String>,
        initial_status: LineItemStatus,
        now: DateTime<Utc>,
    ) -> (Order, Vec<OrderLineItem>) {
        let order = Order {
            id: Uuid::new_v4(),
            order_code: order_code.to_string(),
            buyer: self.buyer.clone(),
            recipient: self.recipient.clone(),
            delivery_fee: self.delivery_fee,
            total_price: self.total(),
            charge_id,
            created_at: now,
        };

        let items = self
            .items
            .iter()
            .map(|line| OrderLineItem::new(order.id, line, initial_status, now))
            .collect();

        (order, items)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_draft() -> OrderDraft {
        OrderDraft {
            buyer: BuyerInfo {
                name: "Kim Minji".to_string(),
                email: "minji@example.com".to_string(),
                phone: "010-1234-5678".to_string(),
            },
            recipient: ShippingInfo {
                name: "Kim Minji".to_string(),
                phone: "010-1234-5678".to_string(),
                zip_code: "04524".to_string(),
                address: "Seoul, Jung-gu, Sejong-daero 110".to_string(),
                memo: None,
            },
            delivery_fee: Money(3_000),
            items: vec![
                NewLineItem {
                    product_id: Uuid::new_v4(),
                    variant_id: Uuid::new_v4(),
                    size: "M".to_string(),
                    color: "Black".to_string(),
                    unit_price: Money(20_000),
                    discount_rate: 10,
                    quantity: 2,
                },
                NewLineItem {
                    product_id: Uuid::new_v4(),
                    variant_id: Uuid::new_v4(),
                    size: "L".to_string(),
                    color: "White".to_string(),
                    unit_price: Money(15_000),
                    discount_rate: 0,
                    quantity: 1,
                },
            ],
        }
    }

    #[test]
    fn test_draft_total_includes_discount_and_fee() {
        let draft = sample_draft();
        // 18,000 * 2 + 15,000 * 1 + 3,000
        assert_eq!(draft.total(), Money(54_000));
    }

    #[test]
    fn test_draft_validation() {
        let mut draft = sample_draft();
        assert!(draft.validate().is_ok());

        draft.items[0].quantity = 0;
        assert_eq!(draft.validate(), Err(DraftError::InvalidQuantity(0)));

        draft.items.clear();
        assert_eq!(draft.validate(), Err(DraftError::EmptyItems));
    }

    #[test]
    fn test_build_creates_items_at_version_zero() {
        let draft = sample_draft();
        let (order, items) = draft.build("2410190A1B", None, LineItemStatus::PaymentCompleted, Utc::now());

        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.order_id == order.id));
        assert!(items.iter().all(|i| i.version == 0));
        assert!(items.iter().all(|i| i.active_quantity == i.quantity));
        assert_eq!(order.total_price, Money(54_000));
    }

    #[test]
    fn test_current_total_tracks_active_quantity() {
        let draft = sample_draft();
        let (order, mut items) = draft.build("2410190A1B", None, LineItemStatus::Delivered, Utc::now());
        assert_eq!(order.current_total(&items), Money(54_000));

        items[0].active_quantity = 1;
        assert_eq!(order.current_total(&items), Money(36_000));

        items[0].active_quantity = 0;
        items[1].active_quantity = 0;
        assert_eq!(order.current_total(&items), Money::ZERO);
    }
}
