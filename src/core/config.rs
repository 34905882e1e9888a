//! Configuration management for the balancer.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion and overrides.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::time::Duration;
use thiserror::Error;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream call timeout
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_timeout",
        serialize_with = "serialize_timeout"
    )]
    pub timeout: Duration,

    /// Maximum number of attempts per client request
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Backend selection policy for rotation and retries
    #[serde(default)]
    pub mode: SelectionMode,

    /// Ordered backend registry
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Configuration for a single upstream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name (exclusion key and log label)
    pub name: String,

    /// Base URL; `/chat/completions` is appended
    pub url: String,

    /// Bearer token sent upstream
    #[serde(default)]
    pub api_key: String,

    /// Selection weight; values <= 0 count as 1
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// Model substituted when the requested one is unmatched or "auto"
    #[serde(default)]
    pub default_model: String,

    /// Models this backend serves, used for exact-match routing
    #[serde(default)]
    pub models: Vec<String>,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Rotation policy used when the client does not name a model and on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    RoundRobin,
    #[default]
    WeightedRandom,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::WeightedRandom => "weighted-random",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SelectionMode {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Self::RoundRobin,
            "" | "random" | "weighted" | "weighted-random" | "weighted_random" => {
                Self::WeightedRandom
            }
            other => {
                tracing::warn!(mode = %other, "Unknown selection mode, using weighted-random");
                Self::WeightedRandom
            }
        }
    }
}

impl Serialize for SelectionMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SelectionMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(SelectionMode::from).unwrap_or_default())
    }
}

/// Validation failures that prevent the server from starting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no backends configured")]
    NoBackends,

    #[error("backend #{index} is invalid: {reason}")]
    InvalidBackend { index: usize, reason: String },

    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_retry() -> u32 {
    3
}

fn default_weight() -> i64 {
    1
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_balancer::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.apply_defaults();
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path))?;

        Ok(config)
    }

    /// Parse configuration text after expanding `${VAR}` references.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(timeout_str) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                self.timeout = Duration::from_secs(timeout);
            }
        }

        if let Ok(retry_str) = std::env::var("RETRY") {
            if let Ok(retry) = retry_str.parse::<u32>() {
                self.retry = retry;
            }
        }

        if let Ok(mode) = std::env::var("BALANCE_MODE") {
            self.mode = SelectionMode::from(mode.as_str());
        }
    }

    /// Zero values mean "unset" and fall back to the defaults.
    fn apply_defaults(&mut self) {
        if self.server.port == 0 {
            self.server.port = default_port();
        }
        if self.timeout.is_zero() {
            self.timeout = default_timeout();
        }
        if self.retry == 0 {
            self.retry = default_retry();
        }
    }

    /// Check the backend registry invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        let mut seen = HashSet::new();
        for (index, backend) in self.backends.iter().enumerate() {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::InvalidBackend {
                    index,
                    reason: "name is empty".to_string(),
                });
            }
            if backend.url.trim().is_empty() {
                return Err(ConfigError::InvalidBackend {
                    index,
                    reason: format!("backend '{}' has no url", backend.name),
                });
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(backend.name.clone()));
            }
        }

        Ok(())
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    let re = Regex::new(r#"\$\{([^}:]+)(?::-?([^}]*))?\}"#).expect("valid env var pattern");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
    })
    .to_string()
}

/// Parse a timeout given as bare seconds or with a `ms`/`s`/`m`/`h` suffix.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(value)),
        "ms" => Some(Duration::from_millis(value)),
        "m" => Some(Duration::from_secs(value.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(value.checked_mul(3600)?)),
        _ => None,
    }
}

fn deserialize_timeout<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimeout {
        Seconds(u64),
        Text(String),
    }

    match RawTimeout::deserialize(deserializer)? {
        RawTimeout::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawTimeout::Text(text) => parse_duration(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid timeout: {}", text))),
    }
}

fn serialize_timeout<S: Serializer>(
    timeout: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}ms", timeout.as_millis()))
}
