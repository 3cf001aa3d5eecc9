//! Error taxonomy for downstream session and registry operations.

use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server not found: {0}")]
    NotFound(String),

    #[error("server already exists: {0}")]
    AlreadyExists(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("registry is not initialized")]
    NotInitialized,

    #[error("session for '{0}' is not ready")]
    NotReady(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),
}
