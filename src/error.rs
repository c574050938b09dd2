//! Error taxonomy for the connection-handling engine.
//!
//! Every variant maps to one of the kinds in the propagation policy: most
//! are request-recoverable (reply `FAILED`/`BAD:` and keep the connection
//! open); `Transport`, `Identity`, and `Internal` tear the connection down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Errors that tear down the connection rather than just failing the
    /// current request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::Transport(_) | ServerError::Identity(_) | ServerError::Internal(_)
        )
    }

    /// The line sent back to the client for a non-fatal error.
    pub fn reply_line(&self) -> String {
        match self {
            ServerError::Authorization(msg) | ServerError::Resource(msg) | ServerError::Protocol(msg) => {
                format!("BAD: {}", msg)
            }
            _ => crate::consts::FAILED.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
