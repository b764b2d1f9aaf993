//! Idempotency key reservation
//!
//! A key maps to exactly one event. The store does a cheap lookup first and
//! falls back on the repository's atomic insert, so a losing concurrent
//! writer ends up reading the winner's event.

use std::sync::Arc;

use crate::domain::IngestEvent;
use crate::infra::{EventRepository, IngestError, Result};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Outcome of [`IdempotencyStore::reserve`]
#[derive(Debug, Clone)]
pub struct Reservation {
    pub event: IngestEvent,
    /// False when the key had already been used
    pub created: bool,
}

pub struct IdempotencyStore {
    events: Arc<dyn EventRepository>,
}

impl IdempotencyStore {
    pub fn new(events: Arc<dyn EventRepository>) -> Self {
        Self { events }
    }

    pub fn validate_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(IngestError::Validation(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(IngestError::Validation(format!(
                "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Create the event for `key` with `construct`, or return the event the
    /// key already maps to. `construct` only runs for unseen keys.
    pub async fn reserve<F>(&self, key: &str, construct: F) -> Result<Reservation>
    where
        F: FnOnce() -> IngestEvent,
    {
        Self::validate_key(key)?;

        if let Some(existing) = self.events.find_by_idempotency_key(key).await? {
            return Ok(Reservation {
                event: existing,
                created: false,
            });
        }

        let event = construct();
        if event.idempotency_key != key {
            return Err(IngestError::Internal(
                "constructed event carries a different idempotency key".to_string(),
            ));
        }

        let (event, created) = self.events.insert_if_absent(event).await?;
        if !created {
            tracing::debug!(
                idempotency_key = %key,
                event_id = %event.event_id,
                "Lost idempotency race, returning existing event"
            );
        }
        Ok(Reservation { event, created })
    }
}
