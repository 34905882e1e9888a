//! Backend selection.
//!
//! Implements model-aware routing, round-robin rotation and weighted random
//! selection over the immutable backend registry. The only mutable state is
//! the rotation counter in [`SelectionState`].

use crate::api::models::{is_auto_model, Backend};
use crate::core::config::{AppConfig, SelectionMode};
use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Source of uniform random integers for weighted draws.
///
/// Implementations must be safe to call from many requests at once.
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `[0, bound)`. `bound` is always positive.
    fn below(&self, bound: u64) -> u64;
}

/// Uses the calling thread's generator, so no state is shared.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, bound: u64) -> u64 {
        thread_rng().gen_range(0..bound)
    }
}

/// Deterministic generator behind a mutex, for reproducible selection.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, bound: u64) -> u64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..bound)
    }
}

/// Process-wide round-robin position.
#[derive(Debug, Default)]
pub struct SelectionState {
    counter: AtomicUsize,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-and-increment the rotation counter, reduced modulo `len`.
    ///
    /// `len` must be non-zero.
    pub fn take_next_index(&self, len: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// A chosen backend together with the model to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub backend: Backend,
    /// Empty when the backend has no usable model
    pub model: String,
}

impl RoutingDecision {
    fn with_fallback_model(backend: &Backend) -> Self {
        Self {
            backend: backend.clone(),
            model: backend.fallback_model().to_string(),
        }
    }
}

/// Service for selecting backends.
///
/// Cloning is cheap; clones share the registry, the rotation counter and
/// the random source.
#[derive(Clone)]
pub struct BackendSelector {
    backends: Arc<Vec<Backend>>,
    mode: SelectionMode,
    state: Arc<SelectionState>,
    random: Arc<dyn RandomSource>,
}

impl BackendSelector {
    /// Create a selector from configuration using per-thread randomness.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_balancer::core::config::AppConfig;
    /// use llm_balancer::services::BackendSelector;
    ///
    /// let config = AppConfig::from_yaml(
    ///     "backends:\n  - name: a\n    url: http://localhost:8000\n    models: [m1]\n",
    /// )
    /// .unwrap();
    /// let selector = BackendSelector::new(&config);
    /// let decision = selector.select_for_model("m1").unwrap();
    /// assert_eq!(decision.backend.name, "a");
    /// ```
    pub fn new(config: &AppConfig) -> Self {
        Self::with_random(config, Arc::new(ThreadRandom))
    }

    /// Create a selector with an injected random source.
    pub fn with_random(config: &AppConfig, random: Arc<dyn RandomSource>) -> Self {
        let backends = config.backends.iter().cloned().map(Backend::from).collect();
        Self::from_backends(backends, config.mode, random)
    }

    pub fn from_backends(
        backends: Vec<Backend>,
        mode: SelectionMode,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            backends: Arc::new(backends),
            mode,
            state: Arc::new(SelectionState::new()),
            random,
        }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// First-attempt routing for a client request.
    ///
    /// An empty or `"auto"` model goes through rotation; anything else through
    /// model-aware selection. Returns `None` only when the registry is empty.
    pub fn route(&self, requested_model: &str) -> Option<RoutingDecision> {
        if is_auto_model(requested_model) {
            self.select_next(&HashSet::new())
        } else {
            self.select_for_model(requested_model)
        }
    }

    /// Model-aware selection.
    ///
    /// The first backend in registry order that lists `requested_model` wins and
    /// receives that exact name. Otherwise a weighted random backend is chosen
    /// and its fallback model substituted.
    pub fn select_for_model(&self, requested_model: &str) -> Option<RoutingDecision> {
        if let Some(backend) = self.backends.iter().find(|b| b.serves(requested_model)) {
            return Some(RoutingDecision {
                backend: backend.clone(),
                model: requested_model.to_string(),
            });
        }

        let all: Vec<usize> = (0..self.backends.len()).collect();
        let index = self.weighted_pick(&all)?;
        let decision = RoutingDecision::with_fallback_model(&self.backends[index]);

        tracing::info!(
            requested_model = %requested_model,
            backend = %decision.backend.name,
            model = %decision.model,
            "Requested model not served by any backend, substituting"
        );

        Some(decision)
    }

    /// Rotation selection skipping backends named in `excluding`.
    ///
    /// Returns `None` when every backend is excluded or the registry is empty.
    pub fn select_next(&self, excluding: &HashSet<String>) -> Option<RoutingDecision> {
        let index = match self.mode {
            SelectionMode::RoundRobin => self.next_round_robin(excluding),
            SelectionMode::WeightedRandom => {
                let candidates: Vec<usize> = self
                    .backends
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| !excluding.contains(&b.name))
                    .map(|(i, _)| i)
                    .collect();
                self.weighted_pick(&candidates)
            }
        }?;

        Some(RoutingDecision::with_fallback_model(&self.backends[index]))
    }

    /// Take the next rotation slot, then scan forward at most one full pass.
    fn next_round_robin(&self, excluding: &HashSet<String>) -> Option<usize> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let start = self.state.take_next_index(len);
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| !excluding.contains(&self.backends[i].name))
    }

    /// Weighted draw over `candidates` (indices into the registry).
    ///
    /// Draws `r` in `[0, total)` and walks the candidates in order, subtracting
    /// each weight until `r` falls inside one.
    fn weighted_pick(&self, candidates: &[usize]) -> Option<usize> {
        let total: u64 = candidates
            .iter()
            .map(|&i| u64::from(self.backends[i].weight.max(1)))
            .sum();
        if total == 0 {
            return None;
        }

        let mut remaining = self.random.below(total);
        for &index in candidates {
            let weight = u64::from(self.backends[index].weight.max(1));
            if remaining < weight {
                return Some(index);
            }
            remaining -= weight;
        }

        candidates.last().copied()
    }

    /// All listed models, deduplicated by id in registry order, with the
    /// name of the first backend that lists each.
    pub fn all_models(&self) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        let mut models = Vec::new();
        for backend in self.backends.iter() {
            for model in &backend.models {
                if seen.insert(model.as_str()) {
                    models.push((model.clone(), backend.name.clone()));
                }
            }
        }
        models
    }

    /// Log the registry at startup.
    pub fn log_backends(&self) {
        let total: u64 = self.backends.iter().map(|b| u64::from(b.weight)).sum();
        for (i, backend) in self.backends.iter().enumerate() {
            let probability = if total > 0 {
                backend.weight as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            tracing::info!(
                index = i + 1,
                name = %backend.name,
                url = %backend.base_url,
                weight = backend.weight,
                probability = %format!("{:.1}%", probability),
                default_model = %backend.default_model,
                models = ?backend.models,
                "Backend loaded"
            );
        }
    }
}
