//! Shared constants for structured API errors and attempt failure categories.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_UNAVAILABLE: &str = "service_unavailable";

pub const ERROR_CATEGORY_BACKEND_4XX: &str = "backend_4xx";
pub const ERROR_CATEGORY_BACKEND_5XX: &str = "backend_5xx";
pub const ERROR_CATEGORY_TIMEOUT: &str = "timeout";
pub const ERROR_CATEGORY_NETWORK_ERROR: &str = "network_error";
pub const ERROR_CATEGORY_CONNECT_ERROR: &str = "connect_error";
pub const ERROR_CATEGORY_STREAM_ERROR: &str = "stream_error";
pub const ERROR_CATEGORY_NO_MODEL: &str = "no_usable_model";

/// Coarse classification of a failed attempt, used as a log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategoryCode {
    Backend4xx,
    Backend5xx,
    Timeout,
    NetworkError,
    ConnectError,
    StreamError,
    NoUsableModel,
}

impl ErrorCategoryCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backend4xx => ERROR_CATEGORY_BACKEND_4XX,
            Self::Backend5xx => ERROR_CATEGORY_BACKEND_5XX,
            Self::Timeout => ERROR_CATEGORY_TIMEOUT,
            Self::NetworkError => ERROR_CATEGORY_NETWORK_ERROR,
            Self::ConnectError => ERROR_CATEGORY_CONNECT_ERROR,
            Self::StreamError => ERROR_CATEGORY_STREAM_ERROR,
            Self::NoUsableModel => ERROR_CATEGORY_NO_MODEL,
        }
    }

    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            Self::Backend5xx
        } else {
            Self::Backend4xx
        }
    }
}

impl fmt::Display for ErrorCategoryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
