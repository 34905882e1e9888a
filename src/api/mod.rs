//! API layer for the balancer.
//!
//! This module contains the HTTP handlers, request/response models, upstream
//! dispatch and the streaming relay.

pub mod disconnect;
pub mod handlers;
pub mod models;
pub mod streaming;
pub mod upstream;

// Re-export commonly used types
pub use handlers::{build_router, chat_completions, health, list_models, AppState};
pub use models::{Backend, ChatRequest, HealthResponse, ModelInfo, ModelList};
pub use streaming::{LineReader, PrimedRelay};
pub use upstream::{create_http_client, dispatch};
