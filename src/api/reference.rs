use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use crate::gateway::ReferenceSpreadSource;
use crate::models::BestBidAsk;

const BINANCE_API_BASE: &str = "https://api.binance.com";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Binance spot book-ticker client, used as the external reference market.
#[derive(Clone)]
pub struct BinanceReferenceClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTickerResponse {
    #[allow(dead_code)]
    symbol: String,
    bid_price: String,
    ask_price: String,
}

impl BinanceReferenceClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(BINANCE_API_BASE.to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_once(&self, symbol: &str) -> Result<BestBidAsk> {
        let url = format!(
            "{}/api/v3/ticker/bookTicker?symbol={}",
            self.base_url, symbol
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Binance API error ({}): {}", status, error_text);
        }

        let ticker: BookTickerResponse = response
            .json()
            .await
            .context("Failed to parse book ticker")?;

        let bid: Decimal = ticker.bid_price.parse().context("bad bid price")?;
        let ask: Decimal = ticker.ask_price.parse().context("bad ask price")?;
        if bid <= Decimal::ZERO || ask < bid {
            anyhow::bail!("crossed or empty book: bid {bid}, ask {ask}");
        }

        Ok(BestBidAsk { bid, ask })
    }
}

#[async_trait]
impl ReferenceSpreadSource for BinanceReferenceClient {
    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.fetch_once(symbol).await {
                Ok(quote) => return Ok(quote),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                        tracing::warn!(
                            "Book ticker attempt {}/{} failed for {}: {}. Retrying in {}ms",
                            attempt,
                            MAX_RETRIES,
                            symbol,
                            last_error.as_ref().unwrap(),
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("all book ticker attempts failed")))
    }
}
