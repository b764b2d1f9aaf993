//! Utility functions for REST API handlers.

use uuid::Uuid;

use crate::api::error::{validation_error, ApiError};
use crate::domain::DeadLetterStatus;

/// Parse an event id path segment.
pub fn parse_event_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| validation_error("eventId", format!("invalid event id: {raw}")))
}

/// Parse a dead-letter status, case-insensitively.
pub fn parse_dead_letter_status(field: &str, raw: &str) -> Result<DeadLetterStatus, ApiError> {
    raw.parse::<DeadLetterStatus>().map_err(|_| {
        let allowed: Vec<String> = DeadLetterStatus::ALL.iter().map(|s| s.to_string()).collect();
        validation_error(field, format!("unknown status {raw:?}"))
            .with_details(serde_json::json!({ "field": field, "allowed": allowed }))
    })
}
