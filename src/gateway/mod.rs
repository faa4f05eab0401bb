use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{BestBidAsk, Order, OrderStatus, OrderType, Side};

/// Order placement request as handed to the venue
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    /// None for market orders
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub order_type: OrderType,
}

/// Venue acknowledgement of a placement
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub error: Option<String>,
}

/// Execution interface to the trading venue.
///
/// Implementations own transport, auth and retry; the engines treat every
/// call as a single attempt with a fixed timeout.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, req: PlaceOrderRequest) -> anyhow::Result<OrderAck>;
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<bool>;
    async fn get_order(&self, order_id: &str) -> anyhow::Result<Option<Order>>;
    async fn open_orders(&self, symbol: &str) -> anyhow::Result<Vec<Order>>;
    /// Signed net position for the symbol (positive = long)
    async fn position(&self, symbol: &str) -> anyhow::Result<Decimal>;
    /// Venue mark price; quotes are placed relative to this
    async fn mark_price(&self, symbol: &str) -> anyhow::Result<Decimal>;
}

/// Correlated reference market polled for its best bid/ask
#[async_trait]
pub trait ReferenceSpreadSource: Send + Sync {
    async fn best_bid_ask(&self, symbol: &str) -> anyhow::Result<BestBidAsk>;
}
