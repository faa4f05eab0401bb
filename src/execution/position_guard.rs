use rust_decimal::{Decimal, RoundingStrategy};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::{CloseConfig, CloseMode};
use crate::error::BotError;
use crate::execution::state::BotState;
use crate::gateway::{ExchangeGateway, PlaceOrderRequest};
use crate::models::{OrderStatus, OrderType, Side};

/// How a flatten request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenOutcome {
    /// Exposure confirmed back at zero after closing
    Flattened,
    /// Venue reported zero position, nothing to close
    AlreadyFlat,
    /// Another flatten was already running; this trigger was dropped
    InFlight,
}

/// Returns exposure to zero after any fill, or stops the bot trying.
///
/// One flatten runs at a time; errors from this engine are fatal because a
/// failed flatten means unknown nonzero exposure.
pub struct PositionGuard {
    cfg: CloseConfig,
    symbol: String,
    tick_size: Decimal,
}

impl PositionGuard {
    pub fn new(symbol: String, tick_size: Decimal, cfg: CloseConfig) -> Self {
        Self {
            cfg,
            symbol,
            tick_size,
        }
    }

    /// Cancel everything resting, close whatever position the venue reports,
    /// and confirm exposure is back at zero.
    pub async fn flatten<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
        reason: &str,
    ) -> anyhow::Result<FlattenOutcome> {
        if state.flatten_in_flight {
            tracing::debug!(reason, "flatten already in flight, trigger dropped");
            return Ok(FlattenOutcome::InFlight);
        }

        tracing::warn!(reason, "flattening position");
        state.flatten_in_flight = true;
        let result = self.flatten_inner(gateway, state).await;
        state.flatten_in_flight = false;
        result
    }

    async fn flatten_inner<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
    ) -> anyhow::Result<FlattenOutcome> {
        // Both sides come off the book first: the other leg could fill while
        // the close is working.
        for side in Side::BOTH {
            if let Some(order) = state.orders.get_mut(side).take() {
                match gateway.cancel_order(&order.id).await {
                    Ok(true) => state.counters.canceled += 1,
                    Ok(false) => {
                        tracing::warn!(%side, order_id = %order.id, "cancel returned false")
                    }
                    Err(e) => tracing::warn!(%side, order_id = %order.id, "cancel failed: {e}"),
                }
            }
        }

        // From here on a gateway error is fatal: exposure is unknown.
        let position = gateway
            .position(&self.symbol)
            .await
            .map_err(|e| BotError::FlattenFailed(format!("position query failed: {e}")))?;
        state.position = position;

        if position.is_zero() {
            tracing::info!("position already flat");
            return Ok(FlattenOutcome::AlreadyFlat);
        }

        tracing::warn!(%position, mode = ?self.cfg.mode, "closing position");

        if self.cfg.mode == CloseMode::LimitWithTimeout {
            self.limit_close(gateway, state.reference_price, position)
                .await?;
        }

        // Market path also mops up whatever a partially-filled limit close
        // left behind.
        let remaining = gateway
            .position(&self.symbol)
            .await
            .map_err(|e| BotError::FlattenFailed(format!("position query failed: {e}")))?;
        if !remaining.is_zero() {
            self.market_close(gateway, remaining).await?;
        }

        let residual = gateway
            .position(&self.symbol)
            .await
            .map_err(|e| BotError::FlattenFailed(format!("position query failed: {e}")))?;
        if !residual.is_zero() {
            return Err(BotError::FlattenFailed(format!(
                "position still {residual} after market close"
            ))
            .into());
        }

        state.position = Decimal::ZERO;
        tracing::info!("position flattened");
        Ok(FlattenOutcome::Flattened)
    }

    fn close_side(position: Decimal) -> Side {
        if position > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Passive reduce-only limit at the configured offset; waits out the
    /// timeout, then cancels the remainder. Rejections are not fatal here
    /// because the market fallback follows.
    async fn limit_close<G: ExchangeGateway>(
        &self,
        gateway: &G,
        reference: Option<Decimal>,
        position: Decimal,
    ) -> anyhow::Result<()> {
        let Some(reference) = reference else {
            tracing::warn!("no reference price for limit close, going straight to market");
            return Ok(());
        };

        let side = Self::close_side(position);
        let offset = reference * self.cfg.limit_offset_bp / Decimal::from(10_000);
        let raw = match side {
            // Passive: the close rests on its own side of the book
            Side::Sell => reference + offset,
            Side::Buy => reference - offset,
        };
        let price = (raw / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            * self.tick_size;

        let ack = match gateway
            .place_order(PlaceOrderRequest {
                symbol: self.symbol.clone(),
                side,
                qty: position.abs(),
                price: Some(price),
                reduce_only: true,
                order_type: OrderType::Limit,
            })
            .await
        {
            Ok(ack) if ack.status != OrderStatus::Failed => ack,
            Ok(ack) => {
                tracing::warn!(
                    error = ack.error.as_deref().unwrap_or("unknown"),
                    "limit close rejected, falling back to market"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("limit close failed ({e}), falling back to market");
                return Ok(());
            }
        };

        tracing::info!(order_id = %ack.order_id, %price, "limit close placed");

        let deadline = Instant::now() + Duration::from_millis(self.cfg.limit_timeout_ms);
        loop {
            if let Ok(Some(order)) = gateway.get_order(&ack.order_id).await {
                if order.status == OrderStatus::Filled {
                    tracing::info!(order_id = %ack.order_id, "limit close filled");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(self.cfg.confirm_poll_ms)).await;
        }

        tracing::warn!(order_id = %ack.order_id, "limit close timed out, canceling");
        if let Err(e) = gateway.cancel_order(&ack.order_id).await {
            tracing::warn!("limit close cancel failed: {e}");
        }
        Ok(())
    }

    /// Market reduce-only close; must confirm filled or the run stops.
    async fn market_close<G: ExchangeGateway>(
        &self,
        gateway: &G,
        position: Decimal,
    ) -> anyhow::Result<()> {
        let side = Self::close_side(position);
        let ack = gateway
            .place_order(PlaceOrderRequest {
                symbol: self.symbol.clone(),
                side,
                qty: position.abs(),
                price: None,
                reduce_only: true,
                order_type: OrderType::Market,
            })
            .await
            .map_err(|e| BotError::FlattenFailed(format!("market close failed: {e}")))?;

        if ack.status == OrderStatus::Failed {
            return Err(BotError::FlattenFailed(format!(
                "market close rejected: {}",
                ack.error.as_deref().unwrap_or("unknown")
            ))
            .into());
        }
        if ack.status == OrderStatus::Filled {
            return Ok(());
        }

        // Poll until the venue confirms the fill
        let deadline = Instant::now() + Duration::from_millis(self.cfg.confirm_timeout_ms);
        loop {
            if let Ok(Some(order)) = gateway.get_order(&ack.order_id).await {
                if order.status == OrderStatus::Filled {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(BotError::FlattenFailed(format!(
                    "market close {} never confirmed filled",
                    ack.order_id
                ))
                .into());
            }
            sleep(Duration::from_millis(self.cfg.confirm_poll_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::models::Order;
    use rust_decimal_macros::dec;

    fn fast_close(mode: CloseMode) -> CloseConfig {
        CloseConfig {
            mode,
            limit_offset_bp: dec!(1),
            limit_timeout_ms: 20,
            confirm_poll_ms: 5,
            confirm_timeout_ms: 50,
        }
    }

    fn guard(mode: CloseMode) -> PositionGuard {
        PositionGuard::new("BTC-PERP".to_string(), dec!(1), fast_close(mode))
    }

    fn resting(id: &str, side: Side) -> Order {
        Order {
            id: id.to_string(),
            side,
            price: dec!(93580),
            qty: dec!(0.001),
            filled_qty: dec!(0),
            status: OrderStatus::Open,
        }
    }

    #[tokio::test]
    async fn test_market_close_flattens_long() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(0.0001));
        let guard = guard(CloseMode::Market);
        let mut state = BotState::new();
        state.reference_price = Some(dec!(93580));

        let outcome = guard.flatten(&gateway, &mut state, "fill").await.unwrap();
        assert_eq!(outcome, FlattenOutcome::Flattened);
        assert_eq!(state.position, Decimal::ZERO);
        assert_eq!(*gateway.net_position.lock().unwrap(), Decimal::ZERO);

        let placed = gateway.placed_requests();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].qty, dec!(0.0001));
        assert!(placed[0].reduce_only);
        assert_eq!(placed[0].order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn test_short_position_closes_with_buy() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(-0.002));
        let guard = guard(CloseMode::Market);
        let mut state = BotState::new();

        let outcome = guard.flatten(&gateway, &mut state, "watchdog").await.unwrap();
        assert_eq!(outcome, FlattenOutcome::Flattened);

        let placed = gateway.placed_requests();
        assert_eq!(placed[0].side, Side::Buy);
        assert_eq!(placed[0].qty, dec!(0.002));
    }

    #[tokio::test]
    async fn test_cancels_both_sides_before_closing() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(0.0001));
        let guard = guard(CloseMode::Market);
        let mut state = BotState::new();
        state.orders.buy = Some(resting("B1", Side::Buy));
        state.orders.sell = Some(resting("S1", Side::Sell));

        guard.flatten(&gateway, &mut state, "fill").await.unwrap();
        assert_eq!(gateway.cancel_count(), 2);
        assert!(state.orders.buy.is_none());
        assert!(state.orders.sell.is_none());
    }

    #[tokio::test]
    async fn test_already_flat_places_nothing() {
        let gateway = MockGateway::new();
        let guard = guard(CloseMode::Market);
        let mut state = BotState::new();

        let outcome = guard.flatten(&gateway, &mut state, "watchdog").await.unwrap();
        assert_eq!(outcome, FlattenOutcome::AlreadyFlat);
        assert!(gateway.placed_requests().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_flatten_suppresses_trigger() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(0.0001));
        let guard = guard(CloseMode::Market);
        let mut state = BotState::new();
        state.flatten_in_flight = true;

        let outcome = guard.flatten(&gateway, &mut state, "fill").await.unwrap();
        assert_eq!(outcome, FlattenOutcome::InFlight);
        assert!(gateway.placed_requests().is_empty());
        // The original owner of the flag keeps it
        assert!(state.flatten_in_flight);
    }

    #[tokio::test]
    async fn test_limit_close_fills_without_market_fallback() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(0.0001));
        *gateway.fill_limit_orders.lock().unwrap() = true;
        let guard = guard(CloseMode::LimitWithTimeout);
        let mut state = BotState::new();
        state.reference_price = Some(dec!(93580));

        let outcome = guard.flatten(&gateway, &mut state, "fill").await.unwrap();
        assert_eq!(outcome, FlattenOutcome::Flattened);

        let placed = gateway.placed_requests();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert!(placed[0].reduce_only);
        // Passive sell close rests above the reference: 93580 × 1.0001 → 93589
        assert_eq!(placed[0].price, Some(dec!(93589)));
    }

    #[tokio::test]
    async fn test_limit_timeout_falls_back_to_market() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(0.0001));
        // Limit orders never fill, market orders do
        let guard = guard(CloseMode::LimitWithTimeout);
        let mut state = BotState::new();
        state.reference_price = Some(dec!(93580));

        let outcome = guard.flatten(&gateway, &mut state, "fill").await.unwrap();
        assert_eq!(outcome, FlattenOutcome::Flattened);

        let placed = gateway.placed_requests();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[1].order_type, OrderType::Market);
        // The stuck limit close was canceled before the fallback
        assert_eq!(gateway.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_market_close_is_fatal() {
        let gateway = MockGateway::new();
        gateway.set_position(dec!(0.0001));
        *gateway.fill_market_orders.lock().unwrap() = false;
        let guard = guard(CloseMode::Market);
        let mut state = BotState::new();

        let err = guard
            .flatten(&gateway, &mut state, "fill")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<BotError>().is_some());
        // Flag released even on the fatal path
        assert!(!state.flatten_in_flight);
    }
}
