use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Review written for one line item. Deletion is soft: the record stays and
/// keeps blocking a second review for the same line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: Uuid,
    pub line_item_id: Uuid,
    pub product_id: Uuid,
    pub rating: u8,
    pub comment: String,
    pub deleted: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDraft {
    pub rating: u8,
    pub comment: String,
}
