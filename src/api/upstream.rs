//! Upstream request execution.
//!
//! One call to [`dispatch`] is one attempt against one backend. Every failure
//! is returned as an [`AttemptError`] so the orchestrator can decide whether to
//! move on; a returned [`Response`] is already committed to the client.

use crate::api::models::{Backend, ChatRequest, UpstreamRequest};
use crate::api::streaming::{relay_full_body, LineReader, PrimedRelay};
use crate::core::config::AppConfig;
use crate::core::error::AttemptError;
use crate::core::middleware::{BackendName, ModelName};
use axum::response::Response;
use std::time::Duration;
use tokio::time::Instant;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Shared HTTP client for all backends.
///
/// The overall deadline is applied per request, since streaming responses must
/// be allowed to outlive it.
pub fn create_http_client(config: &AppConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.timeout)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
}

/// Build a backend request with bearer auth and a JSON body.
pub fn build_upstream_request(
    http_client: &reqwest::Client,
    url: &str,
    payload: &UpstreamRequest<'_>,
    api_key: &str,
) -> reqwest::RequestBuilder {
    http_client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", api_key))
        .json(payload)
}

fn truncate_message(message: &str) -> String {
    let mut chars = message.chars();
    let truncated: String = chars.by_ref().take(MAX_ERROR_MESSAGE_LEN).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Attach the serving backend and model for the request log.
pub fn attach_response_extensions(response: &mut Response, backend: &str, model: &str) {
    response
        .extensions_mut()
        .insert(BackendName(backend.to_string()));
    response.extensions_mut().insert(ModelName(model.to_string()));
}

/// Send `request` to `backend` with `model` substituted and relay the answer.
///
/// Non-streaming requests are bounded by `timeout` end to end. Streaming
/// requests share one deadline for the response headers, an error body and
/// the first event; the event stream after that may run for as long as the
/// backend keeps it open.
pub async fn dispatch(
    http_client: &reqwest::Client,
    backend: &Backend,
    model: &str,
    request: &ChatRequest,
    timeout: Duration,
) -> Result<Response, AttemptError> {
    let url = backend.chat_completions_url();
    let payload = request.upstream_payload(model);
    let streaming = request.is_streaming();
    let builder = build_upstream_request(http_client, &url, &payload, &backend.api_key);
    let deadline = Instant::now() + timeout;

    let sent = if streaming {
        match tokio::time::timeout_at(deadline, builder.send()).await {
            Ok(sent) => sent,
            Err(_) => return Err(AttemptError::HeaderTimeout(timeout)),
        }
    } else {
        builder.timeout(timeout).send().await
    };

    let upstream = sent.map_err(|e| {
        tracing::debug!(
            backend = %backend.name,
            url = %url,
            error = %e,
            "Upstream request could not be sent"
        );
        AttemptError::transport(e)
    })?;

    let status = upstream.status();
    if status.as_u16() >= 400 {
        // The status alone decides the attempt; a stalled body is dropped.
        let raw = match tokio::time::timeout_at(deadline, upstream.text()).await {
            Ok(text) => text.unwrap_or_default(),
            Err(_) => String::new(),
        };
        let body = truncate_message(&raw);
        tracing::debug!(
            backend = %backend.name,
            status = status.as_u16(),
            body = %body,
            "Upstream returned error status"
        );
        return Err(AttemptError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let mut response = if streaming {
        let reader = LineReader::new(upstream.bytes_stream());
        match tokio::time::timeout_at(deadline, PrimedRelay::prime(reader)).await {
            Ok(primed) => primed?.into_response(&backend.name),
            Err(_) => return Err(AttemptError::HeaderTimeout(timeout)),
        }
    } else {
        relay_full_body(upstream.bytes_stream(), &backend.name)
    };

    attach_response_extensions(&mut response, &backend.name, model);
    Ok(response)
}
