use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::fulfillment::{Money, OrderDraft};

// ============================================================================
// Charge Ledger
// ============================================================================
//
// Every charge the gateway knows about has a ledger record, so an approved
// charge is turned into an order at most once and a charge whose order
// could not be created is never forgotten.
//
//   Prepared ─┬─> Unknown ──┐
//             ├─> Declined  │
//             └─> Claimed <─┘
//                   ├─> Consumed
//                   └─> PendingCompensation ─┬─> Consumed
//                                            └─> Refunded
//
// A claim records the id of the order it is about to write, so a claim left
// behind can be settled later by checking whether that order exists.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeState {
    Prepared,
    /// Gateway did not answer in time or still reports the charge pending.
    Unknown,
    Declined,
    /// Approved and claimed by one caller who is creating the order.
    Claimed,
    Consumed,
    PendingCompensation,
    Refunded,
}

impl ChargeState {
    pub const ALL: [ChargeState; 7] = [
        ChargeState::Prepared,
        ChargeState::Unknown,
        ChargeState::Declined,
        ChargeState::Claimed,
        ChargeState::Consumed,
        ChargeState::PendingCompensation,
        ChargeState::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeState::Prepared => "PREPARED",
            ChargeState::Unknown => "UNKNOWN",
            ChargeState::Declined => "DECLINED",
            ChargeState::Claimed => "CLAIMED",
            ChargeState::Consumed => "CONSUMED",
            ChargeState::PendingCompensation => "PENDING_COMPENSATION",
            ChargeState::Refunded => "REFUNDED",
        }
    }

    /// States from which the gateway may still be polled.
    pub fn is_authorizable(&self) -> bool {
        matches!(self, ChargeState::Prepared | ChargeState::Unknown)
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChargeState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChargeState::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown charge state: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub charge_id: String,
    pub order_code: String,
    pub amount: Money,
    pub draft: OrderDraft,
    pub state: ChargeState,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationKind {
    /// Gateway approved the charge but the order was never persisted.
    OrderCreationFailed,
    /// A refund owed after a cancel or return did not go through.
    RefundFailed { line_item_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    Pending,
    OrderCreated { order_id: Uuid },
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub id: Uuid,
    pub charge_id: String,
    pub amount: Money,
    pub kind: CompensationKind,
    pub reason: String,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompensationRecord {
    pub fn new(charge_id: &str, amount: Money, kind: CompensationKind, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            charge_id: charge_id.to_string(),
            amount,
            kind,
            reason: reason.into(),
            status: CompensationStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == CompensationStatus::Pending
    }
}
