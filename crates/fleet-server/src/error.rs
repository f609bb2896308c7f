//! Server error types.

use thiserror::Error;

/// Errors surfaced while starting or running the listeners.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind a listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Any other socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
