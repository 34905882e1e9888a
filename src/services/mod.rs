//! Business logic services for the balancer.
//!
//! Backend selection and the retry loop built on top of it.

pub mod retry;
pub mod selector;

// Re-export commonly used types
pub use retry::{RetryError, RetryOrchestrator, Routed};
pub use selector::{BackendSelector, RandomSource, RoutingDecision, SeededRandom, ThreadRandom};
