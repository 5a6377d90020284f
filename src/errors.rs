use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::access::{Code, Status};
use crate::prices::SourceError;

/// Gateway-facing error. Every variant renders as `{"error": "<message>"}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the outcome metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Unavailable(_) => "unavailable",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<Status> for AppError {
    fn from(status: Status) -> Self {
        let Status { code, message } = status;
        match code {
            Code::InvalidArgument => AppError::InvalidArgument(message),
            Code::Unauthenticated => AppError::Unauthenticated(message),
            Code::Forbidden => AppError::Forbidden(message),
            Code::NotFound => AppError::NotFound(message),
            Code::Unavailable => AppError::Unavailable(message),
            Code::Internal => AppError::Internal(message),
        }
    }
}

impl From<SourceError> for AppError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::UnsupportedExchange(_) => AppError::InvalidArgument(e.to_string()),
            SourceError::Rejected { message, .. } => AppError::InvalidArgument(message),
            SourceError::Unreachable(_) | SourceError::Timeout => {
                AppError::Unavailable("price source not available".into())
            }
            SourceError::Upstream { .. } | SourceError::Decode(_) | SourceError::Interrupted(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let msg = match &self {
            AppError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
