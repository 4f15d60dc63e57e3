use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the storage engine core.
///
/// Corruption and protocol-violation variants are the ones callers should
/// treat as non-fatal at the call site: whether to escalate them to a
/// fatal assertion in debug builds is decided locally (see the cache and
/// datafile manager, which follow the debug-fatal / release-rate-limited
/// split described in the design).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("page already deleted")]
    PageDeleted,

    #[error("capacity exhausted: {0}")]
    Capacity(&'static str),

    #[error("tier is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        EngineError::Corruption(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}
