use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Quoting thresholds: where orders rest and when they get replaced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    pub symbol: String,
    pub order_qty: Decimal,
    pub tick_size: Decimal,
    /// Distance from the reference price at which fresh quotes are placed
    pub target_distance_bp: Decimal,
    /// Below this distance the order is too close and must move away
    pub min_distance_bp: Decimal,
    /// Above this distance the order is too far and must move back
    pub max_distance_bp: Decimal,
    /// Buffer band around min/max where no action is taken
    pub dead_zone_bp: Decimal,
    /// A side is never replaced twice within this interval
    pub min_replace_interval_ms: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC-PERP".to_string(),
            order_qty: dec!(0.001),
            tick_size: dec!(1),
            target_distance_bp: dec!(10),
            min_distance_bp: dec!(5),
            max_distance_bp: dec!(15),
            dead_zone_bp: dec!(1),
            min_replace_interval_ms: 3_000,
        }
    }
}

/// How an accidental position gets closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    /// Market reduce-only immediately
    Market,
    /// Passive limit at an offset first, market fallback after the timeout
    LimitWithTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseConfig {
    pub mode: CloseMode,
    /// Offset from the reference price for the limit close, in bp
    pub limit_offset_bp: Decimal,
    /// How long the limit close may rest before the market fallback
    pub limit_timeout_ms: u64,
    /// Poll cadence while waiting for a close order to confirm
    pub confirm_poll_ms: u64,
    /// Total budget for confirming the market close filled
    pub confirm_timeout_ms: u64,
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            mode: CloseMode::LimitWithTimeout,
            limit_offset_bp: dec!(1),
            limit_timeout_ms: 5_000,
            confirm_poll_ms: 250,
            confirm_timeout_ms: 10_000,
        }
    }
}

/// How the basis-diff softening combines with the regime multiplier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BasisCombine {
    /// Basis multiplier stacks on top of the regime multiplier
    Multiply,
    /// Basis multiplier replaces the regime multiplier
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadGuardConfig {
    pub enabled: bool,
    /// Anomaly when spread exceeds the rolling baseline by this much
    pub jump_threshold_bp: f64,
    /// Absolute ceiling, also the fallback when the quantile lacks samples
    pub max_spread_bp: f64,
    /// Window for the mean baseline
    pub lookback_samples: usize,
    /// Window for the dynamic max quantile
    pub quantile_samples: usize,
    /// Window for the volatility classification
    pub vol_samples: usize,
    /// Quantile level for the dynamic max, e.g. 0.95
    pub quantile: f64,
    /// Spread-volatility (bp std dev) at or above which the regime is high
    pub vol_high_bp: f64,
    /// Spread-volatility at or below which the regime is low
    pub vol_low_bp: f64,
    /// Threshold multiplier in the high regime (relaxes sensitivity)
    pub high_regime_multiplier: f64,
    /// Threshold multiplier in the low regime (tightens sensitivity)
    pub low_regime_multiplier: f64,
    /// Relative venue-vs-reference price gap that triggers softening
    pub basis_diff_threshold: f64,
    pub basis_diff_multiplier: f64,
    pub basis_combine: BasisCombine,
    /// Quoting stays suspended this long after an anomaly
    pub cooldown_ms: u64,
}

impl Default for SpreadGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jump_threshold_bp: 10.0,
            max_spread_bp: 30.0,
            lookback_samples: 60,
            quantile_samples: 120,
            vol_samples: 60,
            quantile: 0.95,
            vol_high_bp: 4.0,
            vol_low_bp: 1.0,
            high_regime_multiplier: 1.5,
            low_regime_multiplier: 0.8,
            basis_diff_threshold: 0.001,
            basis_diff_multiplier: 1.3,
            basis_combine: BasisCombine::Multiply,
            cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub quote: QuoteConfig,
    pub close: CloseConfig,
    pub spread_guard: SpreadGuardConfig,
    /// Symbol queried on the external reference market for spread samples
    pub reference_symbol: String,
    /// Cadence of the spread poll / position reconciliation timer
    pub poll_interval_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            quote: QuoteConfig::default(),
            close: CloseConfig::default(),
            spread_guard: SpreadGuardConfig::default(),
            reference_symbol: "BTCUSDT".to_string(),
            poll_interval_ms: 1_000,
        }
    }
}

impl BotConfig {
    /// Load from optional `quotebot.toml` overlaid with `QUOTEBOT__*` env vars
    pub fn load() -> anyhow::Result<BotConfig> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("quotebot").required(false))
            .add_source(config::Environment::with_prefix("QUOTEBOT").separator("__"))
            .build()?;

        let mut bot: BotConfig = cfg.try_deserialize()?;
        bot.sanitize();
        Ok(bot)
    }

    /// Clamp nonsensical values instead of failing the run
    pub fn sanitize(&mut self) {
        let defaults = QuoteConfig::default();

        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = 1_000;
        }
        if self.quote.tick_size <= Decimal::ZERO {
            tracing::warn!("tick_size must be positive, using default");
            self.quote.tick_size = defaults.tick_size;
        }
        if self.quote.order_qty <= Decimal::ZERO {
            tracing::warn!("order_qty must be positive, using default");
            self.quote.order_qty = defaults.order_qty;
        }
        if self.quote.min_distance_bp <= Decimal::ZERO {
            self.quote.min_distance_bp = defaults.min_distance_bp;
        }
        if self.quote.max_distance_bp < self.quote.min_distance_bp {
            tracing::warn!(
                "max_distance_bp below min_distance_bp, widening to min + 10bp"
            );
            self.quote.max_distance_bp = self.quote.min_distance_bp + dec!(10);
        }
        if self.quote.target_distance_bp < self.quote.min_distance_bp
            || self.quote.target_distance_bp > self.quote.max_distance_bp
        {
            tracing::warn!("target_distance_bp outside [min, max], recentering");
            self.quote.target_distance_bp =
                (self.quote.min_distance_bp + self.quote.max_distance_bp) / Decimal::TWO;
        }
        if self.quote.dead_zone_bp < Decimal::ZERO {
            self.quote.dead_zone_bp = Decimal::ZERO;
        }

        if !(0.0..=1.0).contains(&self.spread_guard.quantile) {
            tracing::warn!("quantile must be in [0, 1], using default");
            self.spread_guard.quantile = SpreadGuardConfig::default().quantile;
        }
        if self.spread_guard.lookback_samples == 0 {
            self.spread_guard.lookback_samples = 1;
        }
        for mult in [
            &mut self.spread_guard.high_regime_multiplier,
            &mut self.spread_guard.low_regime_multiplier,
            &mut self.spread_guard.basis_diff_multiplier,
        ] {
            if !mult.is_finite() || *mult <= 0.0 {
                *mult = 1.0;
            }
        }

        if self.close.confirm_poll_ms == 0 {
            self.close.confirm_poll_ms = 100;
        }
    }

    /// Rolling-buffer capacity: large enough for all three windows
    pub fn sample_capacity(&self) -> usize {
        self.spread_guard
            .lookback_samples
            .max(self.spread_guard.quantile_samples)
            .max(self.spread_guard.vol_samples)
    }
}
