//! Error types and handling for the balancer.
//!
//! [`AppError`] is what a handler returns to the client. [`AttemptError`] classifies
//! one failed upstream attempt, and [`RelayError`] is raised while copying an
//! upstream body to the client.

use crate::core::error_types::{
    ErrorCategoryCode, ERROR_TYPE_API, ERROR_TYPE_INVALID_REQUEST, ERROR_TYPE_UNAVAILABLE,
    ERROR_TYPE_UPSTREAM,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Boxed error carried by upstream body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the HTTP layer.
#[derive(Error, Debug)]
pub enum AppError {
    /// Client sent a body that is not a usable JSON request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The registry is empty
    #[error("No backends available")]
    NoBackends,

    /// Every configured attempt failed; carries the last attempt's detail
    #[error("All backends failed: {last_error}")]
    AllBackendsFailed { attempts: u32, last_error: String },

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST),
            AppError::NoBackends => (StatusCode::SERVICE_UNAVAILABLE, ERROR_TYPE_UNAVAILABLE),
            AppError::AllBackendsFailed { .. } => (StatusCode::BAD_GATEWAY, ERROR_TYPE_UPSTREAM),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API),
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

/// Why a single upstream attempt failed. Every variant is retryable on another backend.
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Connection refused, DNS failure, timeout and similar
    #[error("request failed: {source}")]
    Transport {
        category: ErrorCategoryCode,
        #[source]
        source: reqwest::Error,
    },

    /// No response headers or first event within the configured timeout
    #[error("no response within {0:?}")]
    HeaderTimeout(Duration),

    /// Upstream answered with status >= 400; body kept for diagnostics only
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The chosen backend has neither a default model nor a model list
    #[error("backend {backend} has no usable model")]
    NoUsableModel { backend: String },

    /// The event stream failed before anything reached the client
    #[error("stream failed before first event: {0}")]
    Stream(#[from] RelayError),
}

impl AttemptError {
    pub fn transport(source: reqwest::Error) -> Self {
        let category = if source.is_timeout() {
            ErrorCategoryCode::Timeout
        } else if source.is_connect() {
            ErrorCategoryCode::ConnectError
        } else {
            ErrorCategoryCode::NetworkError
        };
        Self::Transport { category, source }
    }

    pub fn category(&self) -> ErrorCategoryCode {
        match self {
            Self::Transport { category, .. } => *category,
            Self::HeaderTimeout(_) => ErrorCategoryCode::Timeout,
            Self::Status { status, .. } => ErrorCategoryCode::from_status(*status),
            Self::NoUsableModel { .. } => ErrorCategoryCode::NoUsableModel,
            Self::Stream(_) => ErrorCategoryCode::StreamError,
        }
    }
}

/// Failure while relaying an upstream body.
///
/// Once the response is committed these end the body stream; the client sees a
/// truncated response and nothing is retried.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("event line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("upstream read failed: {0}")]
    Upstream(#[source] BoxError),
}
