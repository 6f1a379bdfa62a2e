use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

use crate::protocol::Operation;

/// Failure of a delegated store call.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No response arrived within the configured IPC timeout.
    #[error("no response from the coordinator within {0:?}")]
    Timeout(Duration),

    /// The channel to the coordinator is gone.
    #[error("coordinator channel closed")]
    Disconnected,

    /// The coordinator answered with a different operation than was asked.
    #[error("expected a {expected} response, got {actual}")]
    UnexpectedReply {
        expected: Operation,
        actual: Operation,
    },
}

impl StoreError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Disconnected)
    }
}

/// Errors produced by the application handler. Each maps to a plain-text
/// HTTP response.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::NotFound(message) | ApiError::BadRequest(message) => {
                (status, message).into_response()
            }
            ApiError::Store(error) => {
                warn!(%error, transient = error.is_transient(), "store call failed");
                (status, "Store Unavailable").into_response()
            }
        }
    }
}
