// Protective guards that can suspend quoting
pub mod spread_guard;

pub use spread_guard::{AnomalyReason, GuardDecision, SpreadAnomalyGuard, VolatilityRegime};
