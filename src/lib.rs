//! Booking Ingest Library
//!
//! Reliable ingestion core for booking lifecycle events: signed intake,
//! idempotent dedup, a retrying processor, dead-letter recovery with replay,
//! read-only reconciliation and release-gating metrics.
//!
//! ## Modules
//!
//! - [`domain`] - Events, dead-letter state machine, audit records, bookings
//! - [`infra`] - Storage traits with Postgres and in-memory implementations
//! - [`auth`] - Bearer authentication and HMAC request signatures
//! - [`ingest`] - Payload validation, idempotency, cutover routing
//! - [`processor`] - Event processor and worker pool
//! - [`dead_letter`] - Operator transitions and replay
//! - [`metrics`] - Counters, windowed aggregates and SLO evaluation
//! - [`reconcile`] - Read-only reconciliation and its scheduler
//! - [`api`] - REST routes
//! - [`telemetry`] - Logging and OpenTelemetry integration

pub mod api;
pub mod auth;
pub mod config;
pub mod dead_letter;
pub mod domain;
pub mod infra;
pub mod ingest;
pub mod metrics;
pub mod migrations;
pub mod processor;
pub mod reconcile;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    BookingEventPayload, BookingEventType, DeadLetterEntry, DeadLetterStatus, IngestEvent,
    ProcessStatus,
};

pub use infra::{IngestError, Result};
