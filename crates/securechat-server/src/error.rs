//! Server error types

use securechat_core::ChatError;
use thiserror::Error;

/// Errors raised by the engine and the accept loop
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No idle connection handler (pool capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("Connection handler {handler} is no longer accepting connections")]
    HandlerUnavailable { handler: String },

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] ChatError),
}

/// Result type for server operations
pub type ServerResult<T> = core::result::Result<T, ServerError>;
