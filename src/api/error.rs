//! Error responses for the HTTP surface

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::EngineError;
use crate::infrastructure::history_repository::HistoryError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Validation(message) => Self::Validation(message),
            EngineError::UnknownStore(_) => Self::NotFound(error.to_string()),
            EngineError::Cancelled => Self::Cancelled(error.to_string()),
            EngineError::Backend(_) => Self::Backend(error.to_string()),
            EngineError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(error: HistoryError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            Self::Validation(message) => (StatusCode::BAD_REQUEST, "validation_error", message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::Cancelled(message) => (StatusCode::CONFLICT, "cancelled", message),
            Self::Backend(message) => (StatusCode::BAD_GATEWAY, "backend_error", message),
            Self::Internal(message) => {
                tracing::error!("Internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An unexpected error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: error_code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendError, StoreId};

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::validation("bad"), StatusCode::BAD_REQUEST),
            (EngineError::UnknownStore(StoreId(9)), StatusCode::NOT_FOUND),
            (EngineError::Cancelled, StatusCode::CONFLICT),
            (
                EngineError::Backend(BackendError::Connectivity("down".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (EngineError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }
}
