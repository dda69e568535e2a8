//! Shared wire and domain types for the trading core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Decision signal from the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Flat,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Flat => "FLAT",
        }
    }
}

/// One OHLCV candle. `time` is the candle close time, most recent last.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Normalized order status across venue adapters.
/// Unknown strings map to `Unknown` and keep the poller polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    PendingCancel,
    Unknown,
}

impl OrderStatus {
    pub fn from_venue(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "NEW" | "OPEN" | "LIVE" | "ACCEPTED" => OrderStatus::New,
            "PARTIALLY_FILLED" | "PARTIAL_FILL" => OrderStatus::PartiallyFilled,
            "FILLED" | "DONE" | "MATCHED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            "PENDING_CANCEL" => OrderStatus::PendingCancel,
            _ => OrderStatus::Unknown,
        }
    }

    /// Terminal means the venue will not fill this order any further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// A single execution against an order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub base_size: f64,
    pub fee_usd: f64,
}

/// Venue view of an order, as returned by place/get calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    /// Average execution price; 0.0 when nothing filled yet.
    pub price: f64,
    /// Cumulative filled base; 0.0 when nothing filled yet.
    pub base_size: f64,
    /// Cumulative quote spent/received.
    pub quote_spent: f64,
    /// Venue-reported commission in USD; 0.0 when unreported.
    pub commission_usd: f64,
    pub status: OrderStatus,
    pub fills: Vec<Fill>,
}

/// Balance of one leg of the product.
#[derive(Debug, Clone)]
pub struct BalanceInfo {
    pub asset: String,
    pub available: f64,
    pub step: f64,
}

/// Per-product venue trading filters.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeFilters {
    pub price_tick: f64,
    pub base_step: f64,
    pub quote_step: f64,
    pub min_notional: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_normalization() {
        assert_eq!(OrderStatus::from_venue("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_venue("filled"), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_venue("CANCELLED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_venue("LIVE"), OrderStatus::New);
        assert_eq!(OrderStatus::from_venue("whatever"), OrderStatus::Unknown);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
        assert!(!OrderStatus::PendingCancel.is_terminal());
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
