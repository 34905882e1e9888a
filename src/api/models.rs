//! API request and response models.
//!
//! This module defines the backend descriptor used by the selector, the chat
//! request envelope, and the payloads of the listing endpoints.

use crate::core::config::BackendConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Backend information for internal use. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// Always >= 1
    pub weight: u32,
    pub default_model: String,
    pub models: Vec<String>,
}

impl Backend {
    /// Model sent upstream when this backend is picked without an exact match.
    ///
    /// Empty when the backend has neither a default model nor a model list.
    pub fn fallback_model(&self) -> &str {
        if !self.default_model.is_empty() {
            return &self.default_model;
        }
        self.models.first().map(String::as_str).unwrap_or("")
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Full chat-completions URL for this backend.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl From<BackendConfig> for Backend {
    fn from(config: BackendConfig) -> Self {
        Self {
            name: config.name,
            base_url: config.url,
            api_key: config.api_key,
            weight: normalize_weight(config.weight),
            default_model: config.default_model,
            models: config.models,
        }
    }
}

/// Weights <= 0 count as 1.
pub fn normalize_weight(weight: i64) -> u32 {
    weight.clamp(1, u32::MAX as i64) as u32
}

/// Incoming chat completion request.
///
/// Only `model` and `stream` are interpreted; every other field is carried
/// through to the upstream untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Requested model; empty when absent or null
    #[serde(default, deserialize_with = "deserialize_model")]
    pub model: String,

    /// Streaming flag as sent by the client
    #[serde(default)]
    pub stream: Option<bool>,

    /// All other client-supplied fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn deserialize_model<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// An empty or `"auto"` model name defers the choice to the balancer.
pub fn is_auto_model(model: &str) -> bool {
    model.is_empty() || model == "auto"
}

impl ChatRequest {
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Whether the client leaves the model choice to the rotation policy.
    pub fn wants_auto_model(&self) -> bool {
        is_auto_model(&self.model)
    }

    /// Outbound body: the client's fields with `model` replaced.
    pub fn upstream_payload<'a>(&'a self, model: &'a str) -> UpstreamRequest<'a> {
        UpstreamRequest {
            model,
            stream: self.stream,
            extra: &self.extra,
        }
    }
}

/// Outbound view of a [`ChatRequest`] with the resolved model.
#[derive(Debug, Serialize)]
pub struct UpstreamRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Model information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

/// List of available models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub backends: usize,
    pub mode: String,
}
