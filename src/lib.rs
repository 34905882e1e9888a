//! LLM Balancer - a load-balancing reverse proxy for chat-completion APIs
//!
//! This library provides the routing engine and HTTP surface of a proxy that
//! spreads OpenAI-style chat completion requests over several upstream backends:
//!
//! - **Backend Selection**: exact model matching, round-robin rotation or weighted random draws
//! - **Retries**: failed attempts move on to backends not yet tried for the request
//! - **Streaming Support**: Server-Sent Events relayed line by line with a flush per event
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, errors, logging, middleware)
//! - [`api`]: HTTP handlers, request/response models, upstream dispatch and relay
//! - [`services`]: Business logic (backend selection, retry orchestration)
//!
//! # Configuration
//!
//! Backends are read from a YAML file (`config.yaml` by default).
//!
//! Optional environment variables override the file:
//! - `HOST`: Server bind address (default: 0.0.0.0)
//! - `PORT`: Server port (default: 8080)
//! - `REQUEST_TIMEOUT_SECS`: Upstream timeout in seconds (default: 180)
//! - `RETRY`: Attempts per request (default: 3)
//! - `BALANCE_MODE`: `round-robin` or weighted random (default)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState, Backend, ChatRequest};
pub use core::{AppConfig, AppError, Result, SelectionMode};
pub use services::{BackendSelector, RetryOrchestrator};
