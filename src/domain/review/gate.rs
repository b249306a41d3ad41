use crate::domain::fulfillment::{LineItemStatus, OrderLineItem};

use super::record::ReviewRecord;

// ============================================================================
// Review Eligibility
// ============================================================================
//
// Pure checks, no I/O. A soft-deleted review still counts as "exists" for
// creation, so a line item is reviewed at most once.
//
// ============================================================================

pub fn can_create(item: &OrderLineItem, existing: Option<&ReviewRecord>) -> bool {
    item.status == LineItemStatus::DeliveryConfirmed && existing.is_none()
}

pub fn can_update_or_delete(existing: Option<&ReviewRecord>) -> bool {
    existing.is_some_and(|review| !review.deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fulfillment::transitions::tests::item_in;
    use chrono::Utc;
    use uuid::Uuid;

    fn review(deleted: bool) -> ReviewRecord {
        let now = Utc::now();
        ReviewRecord {
            id: Uuid::new_v4(),
            line_item_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            rating: 4,
            comment: "fits well".to_string(),
            deleted,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_only_confirmed_items_without_review_can_be_reviewed() {
        for status in LineItemStatus::ALL {
            let item = item_in(status, 1);
            assert_eq!(can_create(&item, None), status == LineItemStatus::DeliveryConfirmed);
        }
    }

    #[test]
    fn test_soft_deleted_review_still_blocks_creation() {
        let item = item_in(LineItemStatus::DeliveryConfirmed, 1);
        assert!(!can_create(&item, Some(&review(false))));
        assert!(!can_create(&item, Some(&review(true))));
    }

    #[test]
    fn test_update_or_delete_needs_live_review() {
        assert!(can_update_or_delete(Some(&review(false))));
        assert!(!can_update_or_delete(Some(&review(true))));
        assert!(!can_update_or_delete(None));
    }
}
