//! Circuit breaker guarding the ingest queue
//!
//! When enqueueing keeps failing the breaker opens and accepted events are
//! processed inline instead, until a half-open trial call succeeds again.
//!
//! # States
//!
//! - **Closed**: enqueue normally
//! - **Open**: skip the queue
//! - **HalfOpen**: let a limited number of trial calls through

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Successful trial calls in half-open state before closing
    pub success_threshold: u32,
    /// Time spent open before probing
    pub open_timeout: Duration,
    /// Trial calls allowed concurrently while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub rejected: AtomicU64,
    pub times_opened: AtomicU64,
}

impl CircuitBreakerStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "timesOpened": self.times_opened.load(Ordering::Relaxed),
        })
    }
}

struct InternalState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_requests: u32,
}

impl Default for InternalState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_open_requests: 0,
        }
    }
}

/// Error from a call made through the breaker
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit open")]
    CircuitOpen,
    #[error(transparent)]
    ServiceError(E),
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(InternalState::default()),
            stats: CircuitBreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        let mut state = self.state.write().await;
        self.maybe_half_open(&mut state);
        state.state
    }

    /// Check if the circuit lets a call through, reserving a trial slot when half-open
    pub async fn is_allowed(&self) -> bool {
        let mut state = self.state.write().await;
        self.maybe_half_open(&mut state);

        let allowed = match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.half_open_requests < self.config.half_open_max_requests {
                    state.half_open_requests += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    pub async fn record_success(&self) {
        self.stats.successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                state.half_open_requests = state.half_open_requests.saturating_sub(1);
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Circuit breaker closed");
                    *state = InternalState::default();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.open(&mut state);
                }
            }
            CircuitState::HalfOpen => self.open(&mut state),
            CircuitState::Open => {}
        }
    }

    /// Run `f` if the circuit allows it, recording the outcome
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.is_allowed().await {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match f.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitBreakerError::ServiceError(e))
            }
        }
    }

    pub fn stats(&self) -> &CircuitBreakerStats {
        &self.stats
    }

    fn open(&self, state: &mut InternalState) {
        tracing::warn!(
            circuit = %self.name,
            failures = state.failure_count,
            "Circuit breaker opened"
        );
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
        state.half_open_requests = 0;
        self.stats.times_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn maybe_half_open(&self, state: &mut InternalState) {
        if state.state == CircuitState::Open
            && state
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.open_timeout)
        {
            tracing::info!(circuit = %self.name, "Circuit breaker half-open");
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            state.half_open_requests = 0;
        }
    }
}
