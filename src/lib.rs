// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod models;
pub mod risk;

// Re-export commonly used types
pub use config::BotConfig;
pub use error::BotError;
pub use models::*;
