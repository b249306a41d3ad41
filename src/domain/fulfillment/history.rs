use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::aggregate::OrderLineItem;
use super::value_objects::LineItemStatus;

pub const ORDER_RECEIVED_REASON: &str = "order received";

/// One accepted status change of a line item. `sequence` equals the line
/// item version the change produced, so entries never collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: Uuid,
    pub line_item_id: Uuid,
    pub sequence: i64,
    /// Absent only on the entry written when the line item is created.
    pub status_from: Option<LineItemStatus>,
    pub status_to: LineItemStatus,
    pub requested_quantity: Option<u32>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub fn creation(item: &OrderLineItem) -> Self {
        Self {
            id: Uuid::now_v7(),
            line_item_id: item.id,
            sequence: item.version,
            status_from: None,
            status_to: item.status,
            requested_quantity: None,
            reason: Some(ORDER_RECEIVED_REASON.to_string()),
            recorded_at: item.created_at,
        }
    }

    pub fn transition(
        before: &OrderLineItem,
        after: &OrderLineItem,
        requested_quantity: Option<u32>,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            line_item_id: after.id,
            sequence: after.version,
            status_from: Some(before.status),
            status_to: after.status,
            requested_quantity,
            reason,
            recorded_at: after.updated_at,
        }
    }
}
