//! Error types for the ingestion infrastructure

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{DeadLetterStatus, ProcessStatus};

/// Errors that can occur in the ingestion core
#[derive(Error, Debug)]
pub enum IngestError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Dead-letter entry not found
    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(String),

    /// Compare-and-swap on an event status lost
    #[error("event {event_id} status conflict: expected {expected}, found {actual}")]
    EventStatusConflict {
        event_id: Uuid,
        expected: ProcessStatus,
        actual: ProcessStatus,
    },

    /// Compare-and-swap on a dead-letter status lost
    #[error("dead-letter {key} status conflict: expected {expected}, found {actual}")]
    DeadLetterStatusConflict {
        key: String,
        expected: DeadLetterStatus,
        actual: DeadLetterStatus,
    },

    /// Transition not allowed by the dead-letter state machine
    #[error("invalid dead-letter transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: DeadLetterStatus,
        to: DeadLetterStatus,
    },

    /// Replay requested for an entry that is not READY
    #[error("dead-letter {key} is {status}, replay requires READY")]
    ReplayNotReady { key: String, status: DeadLetterStatus },

    /// Force-fail against an entry that already replayed successfully
    #[error("dead-letter {0} already succeeded")]
    DeadLetterResolved(String),

    /// Payload failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// Queue backend unavailable
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Rate limit exceeded
    #[error("rate limit exceeded")]
    RateLimited,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether the error is a lost compare-and-swap rather than a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::EventStatusConflict { .. } | Self::DeadLetterStatusConflict { .. }
        )
    }
}

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;
