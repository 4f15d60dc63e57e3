use crate::error::{EngineError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber from a filter string (e.g.
/// `"tsengine=debug,info"`). No-op-safe to call more than once in tests:
/// a second call returns an error rather than panicking.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| EngineError::invalid(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| EngineError::invalid("logging already initialized"))
}
