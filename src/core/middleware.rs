//! HTTP middleware for request tracking.
//!
//! Assigns every request an id, scopes it for the handler's log lines, echoes
//! it back in `x-request-id` and logs one summary line per request.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extension type for storing the resolved model name in the response
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Extension type for storing the serving backend name in the response
#[derive(Clone, Debug)]
pub struct BackendName(pub String);

/// Attach a request id and log the outcome of every request.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    let backend = response
        .extensions()
        .get::<BackendName>()
        .map(|b| b.0.as_str())
        .unwrap_or("-");
    let model = response
        .extensions()
        .get::<ModelName>()
        .map(|m| m.0.as_str())
        .unwrap_or("-");

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        backend = %backend,
        model = %model,
        duration_ms = start.elapsed().as_millis() as u64,
        "Request handled"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    response
}
