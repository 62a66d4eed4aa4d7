//! Error handling for the proxy core.
//!
//! Handlers report failures through [`AppError`], which maps each error kind
//! to the HTTP status it surfaces as. Bodies stay empty or carry a short
//! literal; details go to the logs.

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Application-level error kinds with their HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Io(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        // Client errors carry the short message, server errors an empty body.
        let body = match &self {
            AppError::BadRequest(msg) => Body::from(msg.clone()),
            _ => Body::empty(),
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
    }
}

/// Convenient result type for proxy operations.
pub type AppResult<T> = Result<T, AppError>;
