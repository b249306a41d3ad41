use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

// ============================================================================
// Fulfillment Value Objects
// ============================================================================

/// Lifecycle status of a single order line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineItemStatus {
    PaymentPending,
    PaymentCompleted,
    Preparing,
    Delivering,
    Delivered,
    DeliveryConfirmed,
    CancelRequested,
    Cancelled,
    ReturnRequested,
    Returning,
    Returned,
    ExchangeRequested,
    ExchangeReturning,
    ExchangePreparing,
    ExchangeDelivering,
    ExchangeDelivered,
}

impl LineItemStatus {
    pub const ALL: [LineItemStatus; 16] = [
        LineItemStatus::PaymentPending,
        LineItemStatus::PaymentCompleted,
        LineItemStatus::Preparing,
        LineItemStatus::Delivering,
        LineItemStatus::Delivered,
        LineItemStatus::DeliveryConfirmed,
        LineItemStatus::CancelRequested,
        LineItemStatus::Cancelled,
        LineItemStatus::ReturnRequested,
        LineItemStatus::Returning,
        LineItemStatus::Returned,
        LineItemStatus::ExchangeRequested,
        LineItemStatus::ExchangeReturning,
        LineItemStatus::ExchangePreparing,
        LineItemStatus::ExchangeDelivering,
        LineItemStatus::ExchangeDelivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemStatus::PaymentPending => "PAYMENT_PENDING",
            LineItemStatus::PaymentCompleted => "PAYMENT_COMPLETED",
            LineItemStatus::Preparing => "PREPARING",
            LineItemStatus::Delivering => "DELIVERING",
            LineItemStatus::Delivered => "DELIVERED",
            LineItemStatus::DeliveryConfirmed => "DELIVERY_CONFIRMED",
            LineItemStatus::CancelRequested => "CANCEL_REQUESTED",
            LineItemStatus::Cancelled => "CANCELLED",
            LineItemStatus::ReturnRequested => "RETURN_REQUESTED",
            LineItemStatus::Returning => "RETURNING",
            LineItemStatus::Returned => "RETURNED",
            LineItemStatus::ExchangeRequested => "EXCHANGE_REQUESTED",
            LineItemStatus::ExchangeReturning => "EXCHANGE_RETURNING",
            LineItemStatus::ExchangePreparing => "EXCHANGE_PREPARING",
            LineItemStatus::ExchangeDelivering => "EXCHANGE_DELIVERING",
            LineItemStatus::ExchangeDelivered => "EXCHANGE_DELIVERED",
        }
    }

    /// No action leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LineItemStatus::Cancelled
                | LineItemStatus::Returned
                | LineItemStatus::DeliveryConfirmed
                | LineItemStatus::ExchangeDelivered
        )
    }
}

impl fmt::Display for LineItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown line item status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for LineItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LineItemStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRole {
    Buyer,
    Admin,
    System,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorRole::Buyer => "BUYER",
            ActorRole::Admin => "ADMIN",
            ActorRole::System => "SYSTEM",
        };
        f.write_str(name)
    }
}

/// Amount in the smallest currency unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn amount(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Price after a percentage discount, rounded down.
    pub fn discounted(&self, discount_rate: u32) -> Money {
        let rate = i64::from(discount_rate.min(100));
        Money(self.0 * (100 - rate) / 100)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Mul<u32> for Money {
    type Output = Money;

    fn mul(self, rhs: u32) -> Money {
        Money(self.0 * i64::from(rhs))
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip_covers_all_variants() {
        for status in LineItemStatus::ALL {
            let parsed: LineItemStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_unknown_status_text_is_rejected() {
        let err = "CANCELED".parse::<LineItemStatus>().unwrap_err();
        assert_eq!(err, UnknownStatus("CANCELED".to_string()));
    }

    #[test]
    fn test_status_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&LineItemStatus::ExchangeDelivering).unwrap();
        assert_eq!(json, "\"EXCHANGE_DELIVERING\"");
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = LineItemStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 4);
        assert!(LineItemStatus::Cancelled.is_terminal());
        assert!(!LineItemStatus::Delivered.is_terminal());
    }

    #[test]
    fn test_money_arithmetic() {
        assert_eq!(Money(10_000).discounted(15), Money(8_500));
        assert_eq!(Money(999).discounted(10), Money(899));
        assert_eq!(Money(1_500) * 3, Money(4_500));
        let total: Money = vec![Money(100), Money(250)].into_iter().sum();
        assert_eq!(total, Money(350));
    }
}
