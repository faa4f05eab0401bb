use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub const BOTH: [Side; 2] = [Side::Buy, Side::Sell];
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

impl OrderStatus {
    /// True while the order can still rest on the book.
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

/// A resting order as tracked in the per-side slot.
///
/// Slots are replaced wholesale on every requote; the price of a live order
/// is never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub status: OrderStatus,
}

/// Best bid/ask snapshot from the reference market
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BestBidAsk {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl BestBidAsk {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Bid-ask spread in basis points of the midpoint.
    pub fn spread_bp(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        let mid = self.mid();
        if mid.is_zero() {
            return 0.0;
        }
        ((self.ask - self.bid) / mid * Decimal::from(10_000))
            .to_f64()
            .unwrap_or(0.0)
    }
}

/// One spread observation in the rolling window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpreadSample {
    pub timestamp: DateTime<Utc>,
    pub spread_bp: f64,
}

/// Events delivered by the market-data transport.
///
/// The orchestrator is the only consumer; everything the bot reacts to
/// arrives through this one channel or the fixed-interval timer.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    ReferencePrice {
        symbol: String,
        price: Decimal,
        timestamp: DateTime<Utc>,
    },
    OrderStatus {
        order_id: String,
        status: OrderStatus,
        filled_qty: Decimal,
        avg_fill_price: Option<Decimal>,
    },
    PositionChanged {
        quantity: Decimal,
    },
    ConnectivityRestored,
}
