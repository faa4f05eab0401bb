use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Order, Side};

/// One value per order side
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerSide<T> {
    pub buy: T,
    pub sell: T,
}

impl<T> PerSide<T> {
    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub placed: u64,
    pub canceled: u64,
    pub filled: u64,
}

/// The single authoritative run-time state.
///
/// Owned by the orchestrator; the engines mutate it through their decision
/// methods, everything else reads a `StateSnapshot`.
#[derive(Debug)]
pub struct BotState {
    pub running: bool,
    pub reference_price: Option<Decimal>,
    pub position: Decimal,
    /// At most one live order per side; None exactly while nothing rests
    pub orders: PerSide<Option<Order>>,
    pub last_replace: PerSide<Option<DateTime<Utc>>>,
    pub replace_in_flight: PerSide<bool>,
    pub flatten_in_flight: bool,
    pub suspended_until: Option<DateTime<Utc>>,
    pub counters: Counters,
}

impl BotState {
    pub fn new() -> Self {
        Self {
            running: true,
            reference_price: None,
            position: Decimal::ZERO,
            orders: PerSide::default(),
            last_replace: PerSide::default(),
            replace_in_flight: PerSide::default(),
            flatten_in_flight: false,
            suspended_until: None,
            counters: Counters::default(),
        }
    }

    /// Quoting suspended by the spread guard?
    pub fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        matches!(self.suspended_until, Some(until) if now < until)
    }

    /// Find the side slot holding the given order id, if any.
    pub fn side_of_order(&self, order_id: &str) -> Option<Side> {
        Side::BOTH.into_iter().find(|&side| {
            self.orders
                .get(side)
                .as_ref()
                .is_some_and(|o| o.id == order_id)
        })
    }

    pub fn clear_order_slots(&mut self) {
        self.orders.buy = None;
        self.orders.sell = None;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            running: self.running,
            reference_price: self.reference_price,
            position: self.position,
            buy_order: self.orders.buy.clone(),
            sell_order: self.orders.sell.clone(),
            suspended_until: self.suspended_until,
            counters: self.counters,
        }
    }
}

impl Default for BotState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only copy for telemetry and status logging
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub running: bool,
    pub reference_price: Option<Decimal>,
    pub position: Decimal,
    pub buy_order: Option<Order>,
    pub sell_order: Option<Order>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub counters: Counters,
}
