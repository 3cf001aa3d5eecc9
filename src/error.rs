//! Error taxonomy for the composer, mapped to HTTP status codes at the API boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use composer_registry::RegistryError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ComposerResult<T> = Result<T, ComposerError>;

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("dependency violation: {0}")]
    DependencyViolation(String),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("configuration is corrupt: {0}")]
    CorruptConfig(String),
    #[error("failed to persist configuration: {0}")]
    PersistenceError(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ComposerError {
    fn status(&self) -> StatusCode {
        match self {
            ComposerError::NotFound(_) => StatusCode::NOT_FOUND,
            ComposerError::Conflict(_)
            | ComposerError::DependencyViolation(_)
            | ComposerError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ComposerError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ComposerError::CorruptConfig(_) | ComposerError::PersistenceError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ComposerError::Registry(e) => match e {
                RegistryError::NotFound(_) | RegistryError::ToolNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                RegistryError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
                RegistryError::NotInitialized
                | RegistryError::NotReady(_)
                | RegistryError::TransportError(_)
                | RegistryError::ProtocolError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ComposerError {
    fn into_response(self) -> Response {
        let status = self.status();
        error!(error = %self, status = %status, "request failed");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
