//! Retry orchestration across backends.
//!
//! Each client request gets up to `max_attempts` sequential attempts. The first
//! is routed from the requested model; every later one asks the selector for a
//! backend not yet tried in this request and switches to that backend's
//! fallback model. Once all backends have been tried the previous choice is
//! repeated as is.

use crate::core::error::{AppError, AttemptError};
use crate::core::logging::BACKEND_CONTEXT;
use crate::services::selector::{BackendSelector, RoutingDecision};
use std::collections::HashSet;
use std::future::Future;
use thiserror::Error;

/// Terminal failure of a retried request.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("no backends configured")]
    NoBackends,

    #[error("all {attempts} attempts failed, last error: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: AttemptError,
    },
}

impl From<RetryError> for AppError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::NoBackends => AppError::NoBackends,
            RetryError::Exhausted {
                attempts,
                last_error,
            } => AppError::AllBackendsFailed {
                attempts,
                last_error: last_error.to_string(),
            },
        }
    }
}

/// Successful outcome along with the routing that produced it.
#[derive(Debug)]
pub struct Routed<T> {
    pub value: T,
    pub decision: RoutingDecision,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RetryOrchestrator {
    selector: BackendSelector,
    max_attempts: u32,
}

impl RetryOrchestrator {
    pub fn new(selector: BackendSelector, max_attempts: u32) -> Self {
        Self {
            selector,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` against successive backends until one succeeds or the
    /// attempt budget is spent.
    ///
    /// `attempt` receives the routing decision and the 1-based attempt index.
    /// A decision with an empty model fails without calling `attempt`.
    pub async fn execute<T, F, Fut>(
        &self,
        requested_model: &str,
        mut attempt: F,
    ) -> Result<Routed<T>, RetryError>
    where
        F: FnMut(RoutingDecision, u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut decision = self
            .selector
            .route(requested_model)
            .ok_or(RetryError::NoBackends)?;
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempt_no: u32 = 1;

        loop {
            tried.insert(decision.backend.name.clone());

            tracing::info!(
                attempt = attempt_no,
                max_attempts = self.max_attempts,
                requested_model = %requested_model,
                backend = %decision.backend.name,
                model = %decision.model,
                "Dispatching attempt"
            );

            let result = if decision.model.is_empty() {
                Err(AttemptError::NoUsableModel {
                    backend: decision.backend.name.clone(),
                })
            } else {
                BACKEND_CONTEXT
                    .scope(
                        decision.backend.name.clone(),
                        attempt(decision.clone(), attempt_no),
                    )
                    .await
            };

            let error = match result {
                Ok(value) => {
                    return Ok(Routed {
                        value,
                        decision,
                        attempts: attempt_no,
                    })
                }
                Err(error) => error,
            };

            tracing::warn!(
                attempt = attempt_no,
                backend = %decision.backend.name,
                model = %decision.model,
                category = %error.category(),
                error = %error,
                "Backend attempt failed"
            );

            if attempt_no >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt_no,
                    last_error: error,
                });
            }

            attempt_no += 1;
            match self.selector.select_next(&tried) {
                Some(next) => decision = next,
                None => {
                    tracing::warn!(
                        attempt = attempt_no,
                        backend = %decision.backend.name,
                        model = %decision.model,
                        tried = tried.len(),
                        "Every backend already tried, repeating previous backend"
                    );
                }
            }
        }
    }
}
