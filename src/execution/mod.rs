// Order placement and position management engines
pub mod lifecycle;
pub mod orchestrator;
pub mod position_guard;
pub mod state;

pub use lifecycle::{OrderLifecycleManager, Zone};
pub use orchestrator::Orchestrator;
pub use position_guard::{FlattenOutcome, PositionGuard};
pub use state::{BotState, StateSnapshot};
