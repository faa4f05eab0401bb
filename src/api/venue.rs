use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

use crate::gateway::{ExchangeGateway, OrderAck, PlaceOrderRequest};
use crate::models::{Order, OrderStatus, OrderType, Side};

const RATE_LIMIT_RPS: u32 = 10;
const MAX_RETRIES: u32 = 3;

// Type alias for the rate limiter to simplify signatures
type VenueRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// REST client for the trading venue.
///
/// Cloneable; all clones share the rate limiter. Every placement carries a
/// fresh client order id so a repeated request cannot double-place.
#[derive(Clone)]
pub struct VenueClient {
    client: Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<VenueRateLimiter>,
}

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    client_order_id: String,
    symbol: &'a str,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    side: String,
    #[serde(default)]
    price: Option<Decimal>,
    qty: Decimal,
    filled_qty: Decimal,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    canceled: bool,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    quantity: Decimal,
}

#[derive(Debug, Deserialize)]
struct MarkPriceResponse {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
}

fn parse_side(s: &str) -> Result<Side> {
    match s {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => anyhow::bail!("unknown order side: {other}"),
    }
}

fn parse_status(s: &str) -> Result<OrderStatus> {
    match s {
        "open" => Ok(OrderStatus::Open),
        "partially_filled" => Ok(OrderStatus::PartiallyFilled),
        "filled" => Ok(OrderStatus::Filled),
        "canceled" => Ok(OrderStatus::Canceled),
        "rejected" => Ok(OrderStatus::Failed),
        other => anyhow::bail!("unknown order status: {other}"),
    }
}

impl TryFrom<OrderResponse> for Order {
    type Error = anyhow::Error;

    fn try_from(r: OrderResponse) -> Result<Order> {
        Ok(Order {
            id: r.order_id,
            side: parse_side(&r.side)?,
            price: r.price.unwrap_or_default(),
            qty: r.qty,
            filled_qty: r.filled_qty,
            status: parse_status(&r.status)?,
        })
    }
}

impl VenueClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap());
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter,
        })
    }

    /// Rate-limited GET with retry on 5xx and transport errors. Reads are
    /// safe to repeat; order placement never goes through here.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self
                .client
                .get(&url)
                .header("X-API-KEY", &self.api_key)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(Some(response.json().await.context("Failed to parse body")?));
                    }
                    if status.as_u16() == 404 {
                        return Ok(None);
                    }
                    if status.is_server_error() && attempt < MAX_RETRIES {
                        let backoff_ms = 200u64 * 2u64.pow(attempt);
                        tracing::warn!(
                            "Server error {} from venue, retrying in {}ms (attempt {}/{})",
                            status,
                            backoff_ms,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        continue;
                    }
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    anyhow::bail!("Venue API error ({}): {}", status, error_text);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_ms = 200u64 * 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {}ms (attempt {}/{})",
                        e,
                        backoff_ms,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => anyhow::bail!("Network error after {} retries: {}", MAX_RETRIES, e),
            }
        }

        anyhow::bail!("Failed after {} retries", MAX_RETRIES)
    }
}

#[async_trait]
impl ExchangeGateway for VenueClient {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<OrderAck> {
        self.rate_limiter.until_ready().await;

        let body = PlaceOrderBody {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: &req.symbol,
            side: match req.side {
                Side::Buy => "buy",
                Side::Sell => "sell",
            },
            order_type: match req.order_type {
                OrderType::Limit => "limit",
                OrderType::Market => "market",
            },
            qty: req.qty,
            price: req.price,
            reduce_only: req.reduce_only,
        };

        // Single attempt: retrying a placement on an ambiguous failure could
        // double the exposure.
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("place order request failed")?;

        let status = response.status();
        if status.is_success() {
            let r: OrderResponse = response.json().await.context("Failed to parse order ack")?;
            return Ok(OrderAck {
                order_id: r.order_id,
                status: parse_status(&r.status)?,
                filled_qty: r.filled_qty,
                error: None,
            });
        }

        if status.is_client_error() {
            // Venue rejection: the engines treat this as a declined order,
            // not a transport failure
            let err: ErrorResponse = response.json().await.unwrap_or(ErrorResponse { error: None });
            return Ok(OrderAck {
                order_id: String::new(),
                status: OrderStatus::Failed,
                filled_qty: Decimal::ZERO,
                error: err.error.or_else(|| Some(format!("rejected ({status})"))),
            });
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        anyhow::bail!("Venue API error ({}): {}", status, error_text)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .delete(format!("{}/orders/{}", self.base_url, order_id))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .context("cancel request failed")?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(false);
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Venue API error ({}): {}", status, error_text);
        }

        let r: CancelResponse = response.json().await.context("Failed to parse cancel ack")?;
        Ok(r.canceled)
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        let response: Option<OrderResponse> =
            self.get_json(&format!("/orders/{order_id}")).await?;
        response.map(Order::try_from).transpose()
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let response: Option<Vec<OrderResponse>> = self
            .get_json(&format!("/orders?symbol={symbol}&open=true"))
            .await?;
        response
            .unwrap_or_default()
            .into_iter()
            .map(Order::try_from)
            .collect()
    }

    async fn position(&self, symbol: &str) -> Result<Decimal> {
        let response: Option<PositionResponse> =
            self.get_json(&format!("/positions/{symbol}")).await?;
        // A symbol with no position history may 404; that is a flat book
        Ok(response.map(|r| r.quantity).unwrap_or_default())
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        let response: Option<MarkPriceResponse> =
            self.get_json(&format!("/mark-price/{symbol}")).await?;
        response
            .map(|r| r.price)
            .context("no mark price for symbol")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client(server: &mockito::ServerGuard) -> VenueClient {
        VenueClient::new(server.url(), "test-key".to_string()).unwrap()
    }

    fn limit_request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "BTC-PERP".to_string(),
            side: Side::Buy,
            qty: dec!(0.001),
            price: Some(dec!(93486)),
            reduce_only: false,
            order_type: OrderType::Limit,
        }
    }

    #[tokio::test]
    async fn test_place_order_parses_ack() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(
                r#"{"order_id":"abc-1","side":"buy","price":"93486","qty":"0.001","filled_qty":"0","status":"open"}"#,
            )
            .create_async()
            .await;

        let ack = client(&server).place_order(limit_request()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(ack.order_id, "abc-1");
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(ack.filled_qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rejection_maps_to_failed_ack() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/orders")
            .with_status(400)
            .with_body(r#"{"error":"insufficient margin"}"#)
            .create_async()
            .await;

        let ack = client(&server).place_order(limit_request()).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Failed);
        assert_eq!(ack.error.as_deref(), Some("insufficient margin"));
    }

    #[tokio::test]
    async fn test_get_order_missing_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/orders/nope")
            .with_status(404)
            .create_async()
            .await;

        let order = client(&server).get_order("nope").await.unwrap();
        assert!(order.is_none());
    }

    #[tokio::test]
    async fn test_cancel_parses_ack() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/orders/abc-1")
            .with_status(200)
            .with_body(r#"{"canceled":true}"#)
            .create_async()
            .await;

        assert!(client(&server).cancel_order("abc-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_position_missing_symbol_is_flat() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/positions/BTC-PERP")
            .with_status(404)
            .create_async()
            .await;

        let position = client(&server).position("BTC-PERP").await.unwrap();
        assert_eq!(position, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_mark_price_parse() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/mark-price/BTC-PERP")
            .with_status(200)
            .with_body(r#"{"price":"93580.5"}"#)
            .create_async()
            .await;

        let price = client(&server).mark_price("BTC-PERP").await.unwrap();
        assert_eq!(price, dec!(93580.5));
    }

    #[tokio::test]
    async fn test_open_orders_parse() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/orders")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"order_id":"a","side":"buy","price":"93486","qty":"0.001","filled_qty":"0","status":"open"},
                    {"order_id":"b","side":"sell","price":"93674","qty":"0.001","filled_qty":"0","status":"partially_filled"}]"#,
            )
            .create_async()
            .await;

        let orders = client(&server).open_orders("BTC-PERP").await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[1].status, OrderStatus::PartiallyFilled);
        assert_eq!(orders[1].price, dec!(93674));
    }
}
