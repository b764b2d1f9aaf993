//! Infrastructure layer for the ingestion core
//!
//! Contains trait definitions and implementations for:
//! - Event, dead-letter and audit storage (PostgreSQL, in-memory)
//! - The ingest job queue
//! - Nonce and lease stores
//! - The booking domain the processor writes to
//! - Retry policy and the queue circuit breaker
//! - Graceful shutdown

mod circuit_breaker;
mod error;
mod graceful_shutdown;
pub mod memory;
pub mod postgres;
mod retry;
mod traits;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats, CircuitState,
};
pub use error::*;
pub use graceful_shutdown::{
    shutdown_signal, spawn_until_shutdown, ShutdownCoordinator, ShutdownSignal,
};
pub use retry::{is_retryable_db_error, is_transient, Retry, RetryPolicy};
pub use traits::*;
