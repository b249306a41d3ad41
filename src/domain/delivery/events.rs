use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Delivery Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType {
    OrderOut,
    ExchangeOut,
    ExchangeIn,
    ReturnIn,
}

impl DeliveryType {
    pub const ALL: [DeliveryType; 4] = [
        DeliveryType::OrderOut,
        DeliveryType::ExchangeOut,
        DeliveryType::ExchangeIn,
        DeliveryType::ReturnIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::OrderOut => "ORDER_OUT",
            DeliveryType::ExchangeOut => "EXCHANGE_OUT",
            DeliveryType::ExchangeIn => "EXCHANGE_IN",
            DeliveryType::ReturnIn => "RETURN_IN",
        }
    }

    /// Shipments heading to the buyer, as opposed to pickups coming back.
    pub fn is_outbound(&self) -> bool {
        matches!(self, DeliveryType::OrderOut | DeliveryType::ExchangeOut)
    }

    pub fn initial_status(&self) -> DeliveryStatus {
        if self.is_outbound() {
            DeliveryStatus::Preparing
        } else {
            DeliveryStatus::Delivering
        }
    }
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryType {
    type Err = UnknownDeliveryValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownDeliveryValue(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Preparing,
    Delivering,
    Delivered,
    Confirmed,
    Return,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 5] = [
        DeliveryStatus::Preparing,
        DeliveryStatus::Delivering,
        DeliveryStatus::Delivered,
        DeliveryStatus::Confirmed,
        DeliveryStatus::Return,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Preparing => "PREPARING",
            DeliveryStatus::Delivering => "DELIVERING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Confirmed => "CONFIRMED",
            DeliveryStatus::Return => "RETURN",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownDeliveryValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownDeliveryValue(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown delivery value: {0}")]
pub struct UnknownDeliveryValue(pub String);

/// One shipment or pickup for a line item. Events are only ever appended;
/// `status` and `completed_at` are the only fields that change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// Time-ordered id (UUIDv7).
    pub id: Uuid,
    pub line_item_id: Uuid,
    pub delivery_type: DeliveryType,
    pub status: DeliveryStatus,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub barcodes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn from_new(line_item_id: Uuid, new: NewDeliveryEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            line_item_id,
            delivery_type: new.delivery_type,
            status: new.delivery_type.initial_status(),
            carrier: new.carrier,
            tracking_number: new.tracking_number,
            barcodes: new.barcodes,
            started_at: new.started_at,
            completed_at: None,
            created_at: now,
        }
    }

    pub fn has_tracking(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.carrier) && filled(&self.tracking_number)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeliveryEvent {
    pub delivery_type: DeliveryType,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub barcodes: Vec<String>,
}

impl NewDeliveryEvent {
    pub fn new(delivery_type: DeliveryType) -> Self {
        Self {
            delivery_type,
            carrier: None,
            tracking_number: None,
            started_at: None,
            barcodes: Vec::new(),
        }
    }

    pub fn with_tracking(mut self, carrier: impl Into<String>, tracking_number: impl Into<String>) -> Self {
        self.carrier = Some(carrier.into());
        self.tracking_number = Some(tracking_number.into());
        self
    }

    pub fn with_barcodes(mut self, barcodes: Vec<String>) -> Self {
        self.barcodes = barcodes;
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }
}

/// Latest event of a given type, by creation order.
pub fn latest_of(events: &[DeliveryEvent], delivery_type: DeliveryType) -> Option<&DeliveryEvent> {
    events
        .iter()
        .filter(|e| e.delivery_type == delivery_type)
        .max_by_key(|e| (e.created_at, e.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_events_start_in_transit() {
        let now = Utc::now();
        let pickup = DeliveryEvent::from_new(Uuid::new_v4(), NewDeliveryEvent::new(DeliveryType::ReturnIn), now);
        let shipment = DeliveryEvent::from_new(Uuid::new_v4(), NewDeliveryEvent::new(DeliveryType::OrderOut), now);

        assert_eq!(pickup.status, DeliveryStatus::Delivering);
        assert_eq!(shipment.status, DeliveryStatus::Preparing);
    }

    #[test]
    fn test_has_tracking_requires_both_fields() {
        let now = Utc::now();
        let mut event = DeliveryEvent::from_new(
            Uuid::new_v4(),
            NewDeliveryEvent::new(DeliveryType::ExchangeOut).with_tracking("CJ", "1234567890123"),
            now,
        );
        assert!(event.has_tracking());

        event.tracking_number = Some("  ".to_string());
        assert!(!event.has_tracking());
    }

    #[test]
    fn test_delivery_text_parsing() {
        assert_eq!("RETURN_IN".parse::<DeliveryType>().unwrap(), DeliveryType::ReturnIn);
        assert_eq!("CONFIRMED".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Confirmed);
        assert!("LOST".parse::<DeliveryStatus>().is_err());
    }
}
