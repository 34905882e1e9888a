//! HTTP request handlers for the balancer API.
//!
//! Chat completions go through the retry orchestrator; the model listing and
//! health endpoints read the static backend registry.

use crate::api::models::{ChatRequest, HealthResponse, ModelInfo, ModelList};
use crate::api::upstream::{create_http_client, dispatch};
use crate::core::config::AppConfig;
use crate::core::logging::get_request_id;
use crate::core::middleware::request_id_middleware;
use crate::core::{AppError, Result};
use crate::services::{BackendSelector, RetryOrchestrator};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: RetryOrchestrator,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: AppConfig) -> reqwest::Result<Self> {
        let selector = BackendSelector::new(&config);
        Self::with_selector(config, selector)
    }

    /// Build state around an existing selector, e.g. one with a seeded random source.
    pub fn with_selector(config: AppConfig, selector: BackendSelector) -> reqwest::Result<Self> {
        let http_client = create_http_client(&config)?;
        let orchestrator = RetryOrchestrator::new(selector, config.retry);
        Ok(Self {
            config,
            orchestrator,
            http_client,
        })
    }
}

/// Handle chat completion requests.
///
/// The body is parsed here rather than through `Json` so that any malformed
/// payload maps to a 400 with the balancer's error shape.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response> {
    let request = ChatRequest::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;

    if state.orchestrator.selector().is_empty() {
        return Err(AppError::NoBackends);
    }

    let start = Instant::now();
    tracing::info!(
        request_id = %get_request_id(),
        model = %request.model,
        auto_model = request.wants_auto_model(),
        stream = request.is_streaming(),
        "Chat completion request"
    );

    let request = &request;
    let http_client = &state.http_client;
    let timeout = state.config.timeout;

    let routed = state
        .orchestrator
        .execute(&request.model, move |decision, _| async move {
            dispatch(
                http_client,
                &decision.backend,
                &decision.model,
                request,
                timeout,
            )
            .await
        })
        .await
        .map_err(|e| {
            tracing::error!(
                request_id = %get_request_id(),
                model = %request.model,
                error = %e,
                "Chat completion failed"
            );
            AppError::from(e)
        })?;

    tracing::info!(
        request_id = %get_request_id(),
        backend = %routed.decision.backend.name,
        model = %routed.decision.model,
        attempts = routed.attempts,
        header_ms = start.elapsed().as_millis() as u64,
        "Response committed"
    );

    Ok(routed.value)
}

/// OPTIONS on the chat route for routers mounted without [`cors_layer`].
///
/// Under [`build_router`] the CORS layer answers every OPTIONS request and
/// this handler is not reached.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// List the models served by any backend, each attributed to the first
/// backend that lists it.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let data = state
        .orchestrator
        .selector()
        .all_models()
        .into_iter()
        .map(|(id, owned_by)| ModelInfo {
            id,
            object: "model".to_string(),
            owned_by,
        })
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Basic health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let selector = state.orchestrator.selector();
    Json(HealthResponse {
        status: "ok".to_string(),
        backends: selector.len(),
        mode: selector.mode().to_string(),
    })
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// The API routes without any middleware.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(chat_completions).options(preflight),
        )
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
}

/// Assemble the public router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api_routes()
        .layer(cors_layer())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
