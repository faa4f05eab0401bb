use thiserror::Error;

/// Errors that cannot be retried away.
///
/// Transient failures (network, venue API hiccups) travel as `anyhow::Error`
/// and are logged and dropped at the call site; the next tick retries
/// naturally. `BotError` is reserved for conditions that stop the run.
#[derive(Debug, Error)]
pub enum BotError {
    /// A flatten attempt exhausted both the limit and market close paths
    /// without confirming zero exposure. The bot must not keep quoting.
    #[error("failed to flatten position: {0}")]
    FlattenFailed(String),
}
