use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::BotConfig;
use crate::execution::lifecycle::OrderLifecycleManager;
use crate::execution::position_guard::PositionGuard;
use crate::execution::state::BotState;
use crate::gateway::{ExchangeGateway, ReferenceSpreadSource};
use crate::models::{MarketEvent, OrderStatus, Side, SpreadSample};
use crate::risk::{GuardDecision, SpreadAnomalyGuard};

/// Status snapshot logged every this many timer ticks
const STATUS_LOG_EVERY_TICKS: u64 = 30;

/// Owns the bot state and the single decision loop.
///
/// Everything the bot reacts to funnels through here: market events from the
/// feed channel, and the fixed-interval timer for spread polling and position
/// reconciliation. The engines never run concurrently against the state.
pub struct Orchestrator<G, R> {
    cfg: BotConfig,
    gateway: Arc<G>,
    reference: Arc<R>,
    lifecycle: OrderLifecycleManager,
    position_guard: PositionGuard,
    spread_guard: SpreadAnomalyGuard,
    state: BotState,
    events: Option<mpsc::Receiver<MarketEvent>>,
    ticks: u64,
}

impl<G, R> Orchestrator<G, R>
where
    G: ExchangeGateway,
    R: ReferenceSpreadSource,
{
    pub fn new(
        cfg: BotConfig,
        gateway: Arc<G>,
        reference: Arc<R>,
        events: mpsc::Receiver<MarketEvent>,
    ) -> Self {
        let lifecycle = OrderLifecycleManager::new(cfg.quote.clone());
        let position_guard = PositionGuard::new(
            cfg.quote.symbol.clone(),
            cfg.quote.tick_size,
            cfg.close.clone(),
        );
        let spread_guard = SpreadAnomalyGuard::new(cfg.spread_guard.clone(), cfg.sample_capacity());

        Self {
            cfg,
            gateway,
            reference,
            lifecycle,
            position_guard,
            spread_guard,
            state: BotState::new(),
            events: Some(events),
            ticks: 0,
        }
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    /// Main loop; returns Err only on a fatal stop (failed flatten).
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.startup().await?;

        let mut events = self.events.take().context("orchestrator already running")?;
        let mut timer =
            tokio::time::interval(Duration::from_millis(self.cfg.poll_interval_ms));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(symbol = %self.cfg.quote.symbol, "🚀 quoting loop started");

        loop {
            if !self.state.running {
                break;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event, Utc::now()).await {
                            self.halt().await;
                            return Err(e);
                        }
                    }
                    None => {
                        tracing::warn!("market feed closed, shutting down");
                        break;
                    }
                },
                _ = timer.tick() => {
                    if let Err(e) = self.on_timer(Utc::now()).await {
                        self.halt().await;
                        return Err(e);
                    }
                }
            }
        }

        self.halt().await;
        Ok(())
    }

    /// Venue state is authoritative at startup: clear whatever a previous
    /// run left behind before quoting begins.
    pub async fn startup(&mut self) -> anyhow::Result<()> {
        let open = self
            .gateway
            .open_orders(&self.cfg.quote.symbol)
            .await
            .context("startup: open orders query failed")?;
        for order in open {
            tracing::warn!(order_id = %order.id, "canceling stale order from previous run");
            match self.gateway.cancel_order(&order.id).await {
                Ok(true) => self.state.counters.canceled += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(order_id = %order.id, "stale cancel failed: {e}"),
            }
        }

        let position = self
            .gateway
            .position(&self.cfg.quote.symbol)
            .await
            .context("startup: position query failed")?;
        self.state.position = position;
        if !position.is_zero() {
            tracing::warn!(%position, "nonzero position at startup");
            self.position_guard
                .flatten(self.gateway.as_ref(), &mut self.state, "startup")
                .await?;
        }

        tracing::info!("startup reconciliation done");
        Ok(())
    }

    pub async fn handle_event(
        &mut self,
        event: MarketEvent,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match event {
            MarketEvent::ReferencePrice { price, .. } => {
                self.state.reference_price = Some(price);
                if self.state.is_suspended(now) || self.state.flatten_in_flight {
                    return Ok(());
                }
                for side in Side::BOTH {
                    self.lifecycle
                        .evaluate(self.gateway.as_ref(), &mut self.state, side, now)
                        .await?;
                }
            }
            MarketEvent::OrderStatus {
                order_id,
                status,
                filled_qty,
                ..
            } => {
                let Some(side) = self.state.side_of_order(&order_id) else {
                    tracing::debug!(%order_id, "status event for untracked order");
                    return Ok(());
                };
                match status {
                    OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                        tracing::info!(%side, %order_id, %filled_qty, "💰 quote filled");
                        self.state.counters.filled += 1;
                        if status == OrderStatus::Filled {
                            // Gone from the book; a partial fill stays in its
                            // slot so the flatten cancels the remainder.
                            *self.state.orders.get_mut(side) = None;
                        }
                        self.position_guard
                            .flatten(self.gateway.as_ref(), &mut self.state, "fill")
                            .await?;
                        self.requote(now).await?;
                    }
                    OrderStatus::Canceled | OrderStatus::Failed => {
                        tracing::info!(%side, %order_id, ?status, "order left the book");
                        *self.state.orders.get_mut(side) = None;
                    }
                    OrderStatus::Open => {}
                }
            }
            MarketEvent::PositionChanged { quantity } => {
                self.state.position = quantity;
                if !quantity.is_zero() {
                    tracing::warn!(%quantity, "position drift reported");
                    self.position_guard
                        .flatten(self.gateway.as_ref(), &mut self.state, "position drift")
                        .await?;
                    self.requote(now).await?;
                }
            }
            MarketEvent::ConnectivityRestored => {
                self.resync(now).await?;
            }
        }
        Ok(())
    }

    pub async fn on_timer(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.poll_spread(now).await;

        // Reconcile against the venue's own position number
        match self.gateway.position(&self.cfg.quote.symbol).await {
            Ok(position) => {
                if position != self.state.position {
                    tracing::warn!(
                        tracked = %self.state.position,
                        venue = %position,
                        "position reconciliation mismatch"
                    );
                }
                self.state.position = position;
                if !position.is_zero() {
                    self.position_guard
                        .flatten(self.gateway.as_ref(), &mut self.state, "reconciliation")
                        .await?;
                }
            }
            Err(e) => tracing::warn!("position poll failed: {e}"),
        }

        self.requote(now).await?;

        self.ticks += 1;
        if self.ticks % STATUS_LOG_EVERY_TICKS == 0 {
            tracing::info!(snapshot = ?self.state.snapshot(), "📊 status");
        }
        Ok(())
    }

    /// Sample the reference market spread and suspend on an anomaly.
    async fn poll_spread(&mut self, now: DateTime<Utc>) {
        if !self.cfg.spread_guard.enabled {
            return;
        }
        let quote = match self
            .reference
            .best_bid_ask(&self.cfg.reference_symbol)
            .await
        {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!("reference spread poll failed: {e}");
                return;
            }
        };

        let sample = SpreadSample {
            timestamp: now,
            spread_bp: quote.spread_bp(),
        };
        let decision = self
            .spread_guard
            .observe(sample, self.state.reference_price, quote.mid());

        if let GuardDecision::Anomaly { reason, .. } = decision {
            self.suspend(now, reason).await;
        }
    }

    async fn suspend(&mut self, now: DateTime<Utc>, reason: crate::risk::AnomalyReason) {
        let until = now + chrono::Duration::milliseconds(self.cfg.spread_guard.cooldown_ms as i64);
        tracing::warn!(?reason, %until, "🛑 suspending quoting");
        self.state.suspended_until = Some(until);
        for side in Side::BOTH {
            self.cancel_slot(side).await;
        }
    }

    /// Top up empty order slots, unless quoting is paused.
    async fn requote(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        if self.state.is_suspended(now)
            || self.state.flatten_in_flight
            || self.state.reference_price.is_none()
        {
            return Ok(());
        }
        for side in Side::BOTH {
            self.lifecycle
                .ensure_quoted(self.gateway.as_ref(), &mut self.state, side, now)
                .await?;
        }
        Ok(())
    }

    /// After a connectivity gap: drop all local order knowledge, sweep the
    /// venue clean, re-query the position, then quote fresh.
    async fn resync(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        tracing::warn!("connectivity restored, resyncing with venue");

        let open = match self.gateway.open_orders(&self.cfg.quote.symbol).await {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!("resync open orders query failed, retrying next cycle: {e}");
                return Ok(());
            }
        };
        for order in open {
            match self.gateway.cancel_order(&order.id).await {
                Ok(true) => self.state.counters.canceled += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(order_id = %order.id, "resync cancel failed: {e}"),
            }
        }
        self.state.clear_order_slots();

        match self.gateway.position(&self.cfg.quote.symbol).await {
            Ok(position) => {
                self.state.position = position;
                if !position.is_zero() {
                    self.position_guard
                        .flatten(self.gateway.as_ref(), &mut self.state, "resync")
                        .await?;
                }
            }
            Err(e) => tracing::warn!("resync position query failed: {e}"),
        }

        self.requote(now).await
    }

    async fn cancel_slot(&mut self, side: Side) {
        if let Some(order) = self.state.orders.get_mut(side).take() {
            match self.gateway.cancel_order(&order.id).await {
                Ok(true) => self.state.counters.canceled += 1,
                Ok(false) => {
                    tracing::warn!(%side, order_id = %order.id, "cancel returned false")
                }
                Err(e) => tracing::warn!(%side, order_id = %order.id, "cancel failed: {e}"),
            }
        }
    }

    /// Best-effort cleanup on any exit path, fatal or not.
    async fn halt(&mut self) {
        self.state.running = false;
        for side in Side::BOTH {
            self.cancel_slot(side).await;
        }
        if let Ok(open) = self.gateway.open_orders(&self.cfg.quote.symbol).await {
            for order in open {
                if let Err(e) = self.gateway.cancel_order(&order.id).await {
                    tracing::warn!(order_id = %order.id, "halt cancel failed: {e}");
                }
            }
        }
        tracing::info!(snapshot = ?self.state.snapshot(), "🏁 halted");
    }
}
