use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::config::QuoteConfig;
use crate::execution::state::BotState;
use crate::gateway::{ExchangeGateway, PlaceOrderRequest};
use crate::models::{Order, OrderStatus, OrderType, Side};

const BP: Decimal = dec!(10000);

/// Where an order's distance to the reference price falls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    TooClose,
    DeadZone,
    Valid,
    TooFar,
}

/// Keeps one resting order per side inside the configured distance band.
///
/// Stateless apart from its configuration: all run-time state lives in the
/// `BotState` the orchestrator passes in.
pub struct OrderLifecycleManager {
    cfg: QuoteConfig,
}

impl OrderLifecycleManager {
    pub fn new(cfg: QuoteConfig) -> Self {
        Self { cfg }
    }

    /// Quote price at the configured target distance from the reference.
    pub fn price_for(&self, side: Side, reference: Decimal) -> Decimal {
        self.price_at_distance(side, reference, self.cfg.target_distance_bp)
    }

    /// `reference × (1 ∓ bp/10000)`, rounded half-up to the venue tick.
    pub fn price_at_distance(&self, side: Side, reference: Decimal, distance_bp: Decimal) -> Decimal {
        let offset = reference * distance_bp / BP;
        let raw = match side {
            Side::Buy => reference - offset,
            Side::Sell => reference + offset,
        };
        self.round_to_tick(raw)
    }

    fn round_to_tick(&self, price: Decimal) -> Decimal {
        let ticks = (price / self.cfg.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        ticks * self.cfg.tick_size
    }

    /// Distance between an order and the reference, in bp of the order price.
    pub fn distance_bp(order_price: Decimal, reference: Decimal) -> Decimal {
        (reference - order_price).abs() / order_price * BP
    }

    /// Classify a distance against the band, with dead-zone hysteresis.
    pub fn classify(&self, distance_bp: Decimal) -> Zone {
        let min = self.cfg.min_distance_bp;
        let max = self.cfg.max_distance_bp;
        let d = self.cfg.dead_zone_bp;

        if distance_bp < min - d {
            Zone::TooClose
        } else if distance_bp > max + d {
            Zone::TooFar
        } else if distance_bp >= min && distance_bp <= max {
            Zone::Valid
        } else {
            Zone::DeadZone
        }
    }

    /// Place a fresh quote if the side has no resting order.
    pub async fn ensure_quoted<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
        side: Side,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if state.orders.get(side).is_some() {
            return Ok(());
        }
        let Some(reference) = state.reference_price else {
            return Ok(());
        };
        let price = self.price_for(side, reference);
        self.place_quote(gateway, state, side, price, now).await
    }

    /// Re-check a side's resting order against the current reference price.
    pub async fn evaluate<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
        side: Side,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(reference) = state.reference_price else {
            return Ok(());
        };
        let Some(order) = state.orders.get(side).as_ref() else {
            return self.ensure_quoted(gateway, state, side, now).await;
        };

        let distance = Self::distance_bp(order.price, reference);
        match self.classify(distance) {
            Zone::Valid | Zone::DeadZone => Ok(()),
            zone @ (Zone::TooClose | Zone::TooFar) => {
                self.replace(gateway, state, side, zone, distance, now).await
            }
        }
    }

    /// Cancel-and-requote, throttled per side.
    async fn replace<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
        side: Side,
        zone: Zone,
        distance: Decimal,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if *state.replace_in_flight.get(side) {
            return Ok(());
        }
        let min_interval = Duration::milliseconds(self.cfg.min_replace_interval_ms as i64);
        if let Some(last) = state.last_replace.get(side) {
            if now - *last < min_interval {
                tracing::debug!(%side, ?zone, "replace throttled");
                return Ok(());
            }
        }

        *state.replace_in_flight.get_mut(side) = true;
        *state.last_replace.get_mut(side) = Some(now);

        let result = self
            .replace_inner(gateway, state, side, zone, distance, now)
            .await;

        *state.replace_in_flight.get_mut(side) = false;
        result
    }

    async fn replace_inner<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
        side: Side,
        zone: Zone,
        distance: Decimal,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if let Some(order) = state.orders.get_mut(side).take() {
            // Best-effort: a cancel can legitimately fail if the order was
            // just filled, in which case the fill event cleans up.
            match gateway.cancel_order(&order.id).await {
                Ok(true) => state.counters.canceled += 1,
                Ok(false) => {
                    tracing::warn!(%side, order_id = %order.id, "cancel returned false")
                }
                Err(e) => tracing::warn!(%side, order_id = %order.id, "cancel failed: {e}"),
            }
        }

        // Price comes from the reference as of now, not the tick that
        // triggered the replace.
        let Some(reference) = state.reference_price else {
            return Ok(());
        };
        let price = self.price_for(side, reference);

        tracing::info!(
            %side,
            ?zone,
            distance_bp = %distance.round_dp(2),
            new_price = %price,
            "replacing order"
        );

        self.place_quote(gateway, state, side, price, now).await
    }

    async fn place_quote<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut BotState,
        side: Side,
        price: Decimal,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let req = PlaceOrderRequest {
            symbol: self.cfg.symbol.clone(),
            side,
            qty: self.cfg.order_qty,
            price: Some(price),
            reduce_only: false,
            order_type: OrderType::Limit,
        };

        match gateway.place_order(req).await {
            Ok(ack) if ack.status != OrderStatus::Failed => {
                tracing::info!(%side, %price, order_id = %ack.order_id, "order placed");
                *state.orders.get_mut(side) = Some(Order {
                    id: ack.order_id,
                    side,
                    price,
                    qty: self.cfg.order_qty,
                    filled_qty: ack.filled_qty,
                    status: ack.status,
                });
                state.counters.placed += 1;
            }
            Ok(ack) => {
                // Rejection is non-fatal: the side stays unquoted until the
                // next evaluation cycle.
                tracing::warn!(
                    %side,
                    %price,
                    error = ack.error.as_deref().unwrap_or("unknown"),
                    "order placement rejected"
                );
            }
            Err(e) => {
                tracing::warn!(%side, %price, "order placement failed: {e}");
            }
        }
        Ok(())
    }
}
