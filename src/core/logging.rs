//! Logging utilities with request and backend context support.
//!
//! Task-local values let log lines deep inside the dispatch path carry the
//! request id and the backend currently being tried without threading them
//! through every call.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the backend the current attempt targets.
    pub static BACKEND_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current backend name from context, if set.
pub fn get_backend_context() -> String {
    BACKEND_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
