//! HTTP error responses.
//!
//! Handlers return `Result<_, ApiError>`. Client mistakes keep their message;
//! store and storage failures are logged and answered with a generic body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use tfmirror_core::{QueryError, StorageError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("invalid or expired link")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) | StorageError::InvalidPath(key) => Self::NotFound(key),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Query(e) => match e {
                QueryError::InvalidVersion(_) | QueryError::InvalidPlatform(_) => {
                    StatusCode::BAD_REQUEST
                }
                QueryError::MirrorNotFound(_) | QueryError::NotFound(_) => StatusCode::NOT_FOUND,
                QueryError::NotYetAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                QueryError::Db(_) | QueryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
