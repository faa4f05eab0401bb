use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::{BasisCombine, SpreadGuardConfig};
use crate::indicators::{mean, quantile, sample_std_dev, RollingWindow};
use crate::models::SpreadSample;

/// Coarse classification of recent spread volatility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyReason {
    /// Spread jumped over the rolling baseline by more than the threshold
    Jump,
    /// Spread crossed the (dynamic or absolute) max threshold
    MaxSpread,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Normal,
    Anomaly {
        reason: AnomalyReason,
        spread_bp: f64,
        baseline_bp: Option<f64>,
        threshold_bp: f64,
        regime: VolatilityRegime,
    },
}

/// Suspends quoting when the reference market's spread turns abnormal.
///
/// Thresholds adapt to conditions: a rolling mean baseline for the jump
/// check, an order-statistic quantile for the max check, and a volatility
/// regime that scales both. The guard is a backstop only; it never touches
/// quoting distances.
pub struct SpreadAnomalyGuard {
    cfg: SpreadGuardConfig,
    window: RollingWindow,
}

impl SpreadAnomalyGuard {
    pub fn new(cfg: SpreadGuardConfig, capacity: usize) -> Self {
        Self {
            cfg,
            window: RollingWindow::new(capacity),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Mean of the most recent lookback samples; None until one exists.
    pub fn baseline_bp(&self) -> Option<f64> {
        mean(&self.window.last_values(self.cfg.lookback_samples))
    }

    /// Quantile-based max threshold; absolute max until the quantile window
    /// has filled.
    pub fn max_threshold_bp(&self) -> f64 {
        if self.window.len() < self.cfg.quantile_samples {
            return self.cfg.max_spread_bp;
        }
        quantile(
            &self.window.last_values(self.cfg.quantile_samples),
            self.cfg.quantile,
        )
        .unwrap_or(self.cfg.max_spread_bp)
    }

    pub fn regime(&self) -> VolatilityRegime {
        let values = self.window.last_values(self.cfg.vol_samples);
        match sample_std_dev(&values) {
            Some(std) if std >= self.cfg.vol_high_bp => VolatilityRegime::High,
            Some(std) if std <= self.cfg.vol_low_bp => VolatilityRegime::Low,
            Some(_) => VolatilityRegime::Normal,
            None => VolatilityRegime::Normal,
        }
    }

    fn regime_multiplier(&self, regime: VolatilityRegime) -> f64 {
        match regime {
            VolatilityRegime::High => self.cfg.high_regime_multiplier,
            VolatilityRegime::Low => self.cfg.low_regime_multiplier,
            VolatilityRegime::Normal => 1.0,
        }
    }

    /// Regime multiplier, softened further when the venue price has drifted
    /// from the external reference (expected basis, not an anomaly).
    fn threshold_multiplier(
        &self,
        regime: VolatilityRegime,
        venue_reference: Option<Decimal>,
        external_mid: Decimal,
    ) -> f64 {
        let regime_mult = self.regime_multiplier(regime);

        let basis = match (venue_reference, external_mid.to_f64()) {
            (Some(venue), Some(mid)) if mid != 0.0 => {
                let venue = venue.to_f64().unwrap_or(mid);
                ((venue - mid) / mid).abs()
            }
            _ => 0.0,
        };
        if basis <= self.cfg.basis_diff_threshold {
            return regime_mult;
        }

        match self.cfg.basis_combine {
            BasisCombine::Multiply => regime_mult * self.cfg.basis_diff_multiplier,
            BasisCombine::Override => self.cfg.basis_diff_multiplier,
        }
    }

    /// Evaluate one observation against the statistics of the prior samples,
    /// then record it.
    pub fn observe(
        &mut self,
        sample: SpreadSample,
        venue_reference: Option<Decimal>,
        external_mid: Decimal,
    ) -> GuardDecision {
        let baseline = self.baseline_bp();
        let regime = self.regime();
        let mult = self.threshold_multiplier(regime, venue_reference, external_mid);
        let jump_threshold = self.cfg.jump_threshold_bp * mult;
        let max_threshold = self.max_threshold_bp() * mult;

        let spread = sample.spread_bp;
        self.window.push(sample);

        if let Some(baseline) = baseline {
            if spread - baseline >= jump_threshold {
                tracing::warn!(
                    spread_bp = spread,
                    baseline_bp = baseline,
                    threshold_bp = jump_threshold,
                    ?regime,
                    "spread jump anomaly"
                );
                return GuardDecision::Anomaly {
                    reason: AnomalyReason::Jump,
                    spread_bp: spread,
                    baseline_bp: Some(baseline),
                    threshold_bp: jump_threshold,
                    regime,
                };
            }
        }

        if spread >= max_threshold {
            tracing::warn!(
                spread_bp = spread,
                threshold_bp = max_threshold,
                ?regime,
                "spread max anomaly"
            );
            return GuardDecision::Anomaly {
                reason: AnomalyReason::MaxSpread,
                spread_bp: spread,
                baseline_bp: baseline,
                threshold_bp: max_threshold,
                regime,
            };
        }

        GuardDecision::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn test_cfg() -> SpreadGuardConfig {
        SpreadGuardConfig {
            enabled: true,
            jump_threshold_bp: 10.0,
            max_spread_bp: 100.0,
            lookback_samples: 5,
            quantile_samples: 10,
            vol_samples: 5,
            quantile: 0.95,
            vol_high_bp: 4.0,
            vol_low_bp: 0.5,
            high_regime_multiplier: 1.5,
            low_regime_multiplier: 0.8,
            basis_diff_threshold: 0.001,
            basis_diff_multiplier: 2.0,
            basis_combine: BasisCombine::Multiply,
            cooldown_ms: 60_000,
        }
    }

    fn guard_with(cfg: SpreadGuardConfig) -> SpreadAnomalyGuard {
        let capacity = cfg
            .lookback_samples
            .max(cfg.quantile_samples)
            .max(cfg.vol_samples);
        SpreadAnomalyGuard::new(cfg, capacity)
    }

    fn sample(spread_bp: f64) -> SpreadSample {
        SpreadSample {
            timestamp: Utc::now(),
            spread_bp,
        }
    }

    fn observe(guard: &mut SpreadAnomalyGuard, spread_bp: f64) -> GuardDecision {
        guard.observe(sample(spread_bp), None, dec!(93580))
    }

    #[test]
    fn test_step_function_fires_exactly_at_the_jump() {
        let mut guard = guard_with(test_cfg());

        // Calm 2bp tape: every sample normal
        for _ in 0..5 {
            assert_eq!(observe(&mut guard, 2.0), GuardDecision::Normal);
        }

        // The step to 20bp fires against the clean 2bp baseline
        let decision = observe(&mut guard, 20.0);
        match decision {
            GuardDecision::Anomaly {
                reason,
                baseline_bp,
                ..
            } => {
                assert_eq!(reason, AnomalyReason::Jump);
                assert_eq!(baseline_bp, Some(2.0));
            }
            other => panic!("expected anomaly, got {other:?}"),
        }
    }

    #[test]
    fn test_first_sample_cannot_jump() {
        let mut guard = guard_with(test_cfg());
        // No prior baseline and below the absolute max: normal
        assert_eq!(observe(&mut guard, 50.0), GuardDecision::Normal);
    }

    #[test]
    fn test_absolute_max_fires_without_baseline_jump() {
        let mut guard = guard_with(test_cfg());
        let decision = observe(&mut guard, 150.0);
        assert!(matches!(
            decision,
            GuardDecision::Anomaly {
                reason: AnomalyReason::MaxSpread,
                ..
            }
        ));
    }

    #[test]
    fn test_quantile_threshold_replaces_absolute_max() {
        let mut guard = guard_with(test_cfg());
        for v in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0] {
            observe(&mut guard, v);
        }
        // q95 of 1..10 = 9.55
        assert!((guard.max_threshold_bp() - 9.55).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_falls_back_until_window_fills() {
        let mut guard = guard_with(test_cfg());
        for _ in 0..9 {
            observe(&mut guard, 2.0);
        }
        assert_eq!(guard.max_threshold_bp(), 100.0);
    }

    #[test]
    fn test_regime_classification() {
        let mut guard = guard_with(test_cfg());
        for v in [2.0, 2.1, 2.0, 1.9, 2.0] {
            observe(&mut guard, v);
        }
        assert_eq!(guard.regime(), VolatilityRegime::Low);

        let mut guard = guard_with(test_cfg());
        for v in [2.0, 12.0, 2.0, 12.0, 2.0] {
            observe(&mut guard, v);
        }
        assert_eq!(guard.regime(), VolatilityRegime::High);

        let mut guard = guard_with(test_cfg());
        for v in [2.0, 4.0, 2.0, 4.0, 2.0] {
            observe(&mut guard, v);
        }
        assert_eq!(guard.regime(), VolatilityRegime::Normal);
    }

    #[test]
    fn test_high_regime_relaxes_jump_threshold() {
        // 12bp over a 7bp baseline fires in the calm regime but not once the
        // high-regime multiplier lifts the threshold to 15bp
        let mut cfg = test_cfg();
        cfg.vol_high_bp = 100.0; // flat tape classifies low, multiplier 0.8
        let mut guard = guard_with(cfg);
        for v in [7.0, 7.0, 7.0, 7.0, 7.0] {
            observe(&mut guard, v);
        }
        assert!(matches!(
            observe(&mut guard, 19.0),
            GuardDecision::Anomaly { .. }
        ));

        let mut cfg = test_cfg();
        cfg.vol_high_bp = 0.0; // pin regime to high, jump threshold 15bp
        let mut guard = guard_with(cfg);
        for v in [7.0, 7.0, 7.0, 7.0, 7.0] {
            observe(&mut guard, v);
        }
        assert_eq!(observe(&mut guard, 19.0), GuardDecision::Normal);
    }

    #[test]
    fn test_basis_diff_softens_thresholds() {
        // Venue trades 1% away from the reference: the ×2 softening doubles
        // the jump threshold, so a 15bp move over baseline stays normal
        let mut cfg = test_cfg();
        cfg.vol_high_bp = 100.0;
        cfg.vol_low_bp = 0.0;
        let mut guard = guard_with(cfg);
        for _ in 0..5 {
            guard.observe(sample(2.0), Some(dec!(94516)), dec!(93580));
        }
        let decision = guard.observe(sample(17.0), Some(dec!(94516)), dec!(93580));
        assert_eq!(decision, GuardDecision::Normal);

        // Without the basis gap the same move fires
        let mut cfg = test_cfg();
        cfg.vol_high_bp = 100.0;
        cfg.vol_low_bp = 0.0;
        let mut guard = guard_with(cfg);
        for _ in 0..5 {
            guard.observe(sample(2.0), Some(dec!(93580)), dec!(93580));
        }
        let decision = guard.observe(sample(17.0), Some(dec!(93580)), dec!(93580));
        assert!(matches!(decision, GuardDecision::Anomaly { .. }));
    }

    #[test]
    fn test_basis_override_replaces_regime_multiplier() {
        // High regime (×1.5) with basis gap in override mode: multiplier
        // becomes exactly the basis multiplier (×2.0), not 1.5 × 2.0
        let mut cfg = test_cfg();
        cfg.vol_high_bp = 0.0; // force high regime
        cfg.basis_combine = BasisCombine::Override;
        let guard = guard_with(cfg);

        let mult = guard.threshold_multiplier(
            VolatilityRegime::High,
            Some(dec!(94516)),
            dec!(93580),
        );
        assert_eq!(mult, 2.0);

        let mut cfg = test_cfg();
        cfg.vol_high_bp = 0.0;
        cfg.basis_combine = BasisCombine::Multiply;
        let guard = guard_with(cfg);
        let mult = guard.threshold_multiplier(
            VolatilityRegime::High,
            Some(dec!(94516)),
            dec!(93580),
        );
        assert_eq!(mult, 3.0);
    }
}
