//! Core functionality for the balancer.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Request-scoped logging context
//! - HTTP middleware

pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod middleware;

// Re-export commonly used types
pub use config::{AppConfig, BackendConfig, ConfigError, SelectionMode, ServerConfig};
pub use error::{AppError, AttemptError, RelayError, Result};
pub use logging::{get_backend_context, get_request_id, BACKEND_CONTEXT, REQUEST_ID};
pub use middleware::request_id_middleware;
