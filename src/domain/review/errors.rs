use uuid::Uuid;

use crate::domain::fulfillment::LineItemStatus;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReviewError {
    #[error("Line item in status {status} cannot be reviewed")]
    NotEligible { status: LineItemStatus },

    #[error("Line item {line_item_id} already has a review")]
    AlreadyReviewed { line_item_id: Uuid },

    #[error("No review for line item {line_item_id}")]
    NotFound { line_item_id: Uuid },

    #[error("Review for line item {line_item_id} was deleted")]
    Deleted { line_item_id: Uuid },

    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("Review changed concurrently: expected version {expected}, found {actual:?}")]
    VersionConflict { expected: i64, actual: Option<i64> },
}
