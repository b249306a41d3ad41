use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::FulfillmentError;
use crate::store::{LineItemRepository, ReviewStore, StoreError};

use super::errors::ReviewError;
use super::gate::{can_create, can_update_or_delete};
use super::record::{ReviewDraft, ReviewRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReviewEligibility {
    pub can_create: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

/// Review lifecycle for one line item: create once, edit, soft delete.
#[derive(Clone)]
pub struct ReviewService {
    reviews: Arc<dyn ReviewStore>,
    line_items: Arc<dyn LineItemRepository>,
}

impl ReviewService {
    pub fn new(reviews: Arc<dyn ReviewStore>, line_items: Arc<dyn LineItemRepository>) -> Self {
        Self { reviews, line_items }
    }

    pub async fn eligibility(&self, line_item_id: Uuid) -> Result<ReviewEligibility, FulfillmentError> {
        let item = self
            .line_items
            .get_line_item(line_item_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("line item", line_item_id))?;
        let existing = self.reviews.get_for_line_item(line_item_id).await?;

        let editable = can_update_or_delete(existing.as_ref());
        Ok(ReviewEligibility {
            can_create: can_create(&item, existing.as_ref()),
            can_update: editable,
            can_delete: editable,
        })
    }

    pub async fn get(&self, line_item_id: Uuid) -> Result<Option<ReviewRecord>, FulfillmentError> {
        Ok(self.reviews.get_for_line_item(line_item_id).await?)
    }

    pub async fn create(&self, line_item_id: Uuid, draft: ReviewDraft) -> Result<ReviewRecord, FulfillmentError> {
        validate_rating(draft.rating)?;

        let item = self
            .line_items
            .get_line_item(line_item_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("line item", line_item_id))?;
        let existing = self.reviews.get_for_line_item(line_item_id).await?;

        if !can_create(&item, existing.as_ref()) {
            return Err(match existing {
                Some(_) => ReviewError::AlreadyReviewed { line_item_id },
                None => ReviewError::NotEligible { status: item.status },
            }
            .into());
        }

        let now = Utc::now();
        let review = ReviewRecord {
            id: Uuid::now_v7(),
            line_item_id,
            product_id: item.product_id,
            rating: draft.rating,
            comment: draft.comment.trim().to_string(),
            deleted: false,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        self.reviews.insert_review(&review).await.map_err(|e| match e {
            StoreError::Duplicate { .. } => FulfillmentError::from(ReviewError::AlreadyReviewed { line_item_id }),
            other => FulfillmentError::from(other),
        })?;

        tracing::info!(line_item_id = %line_item_id, review_id = %review.id, rating = review.rating, "Review created");
        Ok(review)
    }

    pub async fn update(
        &self,
        line_item_id: Uuid,
        expected_version: i64,
        draft: ReviewDraft,
    ) -> Result<ReviewRecord, FulfillmentError> {
        validate_rating(draft.rating)?;
        let mut review = self.editable(line_item_id).await?;

        review.rating = draft.rating;
        review.comment = draft.comment.trim().to_string();
        self.save(review, expected_version).await
    }

    /// Soft delete. The record is kept and still blocks a new review.
    pub async fn delete(&self, line_item_id: Uuid, expected_version: i64) -> Result<ReviewRecord, FulfillmentError> {
        let mut review = self.editable(line_item_id).await?;
        review.deleted = true;
        self.save(review, expected_version).await
    }

    async fn editable(&self, line_item_id: Uuid) -> Result<ReviewRecord, FulfillmentError> {
        let existing = self.reviews.get_for_line_item(line_item_id).await?;
        if can_update_or_delete(existing.as_ref()) {
            if let Some(review) = existing {
                return Ok(review);
            }
        }
        Err(match existing {
            Some(_) => ReviewError::Deleted { line_item_id },
            None => ReviewError::NotFound { line_item_id },
        }
        .into())
    }

    async fn save(&self, mut review: ReviewRecord, expected_version: i64) -> Result<ReviewRecord, FulfillmentError> {
        if review.version != expected_version {
            return Err(ReviewError::VersionConflict {
                expected: expected_version,
                actual: Some(review.version),
            }
            .into());
        }

        review.version = expected_version + 1;
        review.updated_at = Utc::now();

        self.reviews
            .update_review(&review, expected_version)
            .await
            .map_err(|e| match e {
                StoreError::Conflict { expected, actual } => {
                    FulfillmentError::from(ReviewError::VersionConflict { expected, actual })
                }
                other => FulfillmentError::from(other),
            })?;

        tracing::info!(
            line_item_id = %review.line_item_id,
            version = review.version,
            deleted = review.deleted,
            "Review saved"
        );
        Ok(review)
    }
}

fn validate_rating(rating: u8) -> Result<(), ReviewError> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(ReviewError::InvalidRating(rating))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fulfillment::transitions::tests::item_in;
    use crate::domain::fulfillment::{LineItemStatus, Order, OrderLineItem};
    use crate::store::{MemoryStore, OrderRepository};
    use crate::domain::fulfillment::aggregate::tests::sample_draft;

    async fn service_with(status: LineItemStatus) -> (ReviewService, OrderLineItem) {
        let store = Arc::new(MemoryStore::new());
        let (order, _): (Order, _) = sample_draft().build("241019REVW", None, status, Utc::now());
        let mut item = item_in(status, 1);
        item.order_id = order.id;
        store.create_order(&order, std::slice::from_ref(&item)).await.unwrap();
        (ReviewService::new(store.clone(), store), item)
    }

    fn draft(rating: u8) -> ReviewDraft {
        ReviewDraft {
            rating,
            comment: "  good quality  ".to_string(),
        }
    }

    #[tokio::test]
    async fn test_review_requires_confirmed_purchase() {
        let (service, item) = service_with(LineItemStatus::Delivered).await;
        let err = service.create(item.id, draft(5)).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::Review(ReviewError::NotEligible { status: LineItemStatus::Delivered })
        ));
    }

    #[tokio::test]
    async fn test_review_lifecycle_with_soft_delete() {
        let (service, item) = service_with(LineItemStatus::DeliveryConfirmed).await;

        let created = service.create(item.id, draft(4)).await.unwrap();
        assert_eq!(created.comment, "good quality");
        assert_eq!(created.product_id, item.product_id);

        let eligibility = service.eligibility(item.id).await.unwrap();
        assert_eq!(
            eligibility,
            ReviewEligibility { can_create: false, can_update: true, can_delete: true }
        );

        let updated = service.update(item.id, 0, draft(5)).await.unwrap();
        assert_eq!((updated.rating, updated.version), (5, 1));

        let deleted = service.delete(item.id, 1).await.unwrap();
        assert!(deleted.deleted);

        let eligibility = service.eligibility(item.id).await.unwrap();
        assert_eq!(
            eligibility,
            ReviewEligibility { can_create: false, can_update: false, can_delete: false }
        );

        let err = service.create(item.id, draft(3)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Review(ReviewError::AlreadyReviewed { .. })));
        let err = service.update(item.id, 2, draft(3)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Review(ReviewError::Deleted { .. })));
    }

    #[tokio::test]
    async fn test_stale_review_version_is_rejected() {
        let (service, item) = service_with(LineItemStatus::DeliveryConfirmed).await;
        service.create(item.id, draft(4)).await.unwrap();
        service.update(item.id, 0, draft(5)).await.unwrap();

        let err = service.update(item.id, 0, draft(2)).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::Review(ReviewError::VersionConflict { expected: 0, actual: Some(1) })
        ));
    }

    #[tokio::test]
    async fn test_rating_out_of_range() {
        let (service, item) = service_with(LineItemStatus::DeliveryConfirmed).await;
        let err = service.create(item.id, draft(0)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Review(ReviewError::InvalidRating(0))));
    }
}
