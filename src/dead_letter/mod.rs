//! Dead-letter operations
//!
//! Listing, lookup and operator-driven status changes for dead-letter
//! entries. Only the transitions the state machine assigns to operators are
//! accepted here; replay has its own coordinator in [`replay`].

pub mod replay;

pub use replay::{ReplayConfig, ReplayCoordinator, ReplayReceipt};

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::domain::{
    AuditEventBuilder, AuditEventType, DeadLetterEntry, DeadLetterStatus, DeadLetterUpdate,
    TransitionTrigger,
};
use crate::infra::{AuditLog, DeadLetterRepository, DeadLetterStats, IngestError, Result};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

pub struct DeadLetterService {
    dead_letters: Arc<dyn DeadLetterRepository>,
    audit: Arc<dyn AuditLog>,
}

impl DeadLetterService {
    pub fn new(dead_letters: Arc<dyn DeadLetterRepository>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            dead_letters,
            audit,
        }
    }

    pub async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<DeadLetterEntry>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.dead_letters.list(status, limit).await
    }

    pub async fn get(&self, key: &str) -> Result<DeadLetterEntry> {
        self.dead_letters
            .find_by_key(key)
            .await?
            .ok_or_else(|| IngestError::DeadLetterNotFound(key.to_string()))
    }

    pub async fn stats(&self) -> Result<DeadLetterStats> {
        self.dead_letters.stats().await
    }

    /// Move an entry to `to` on behalf of an operator.
    ///
    /// With `expected` set the caller asserts the current status; a mismatch
    /// is a conflict rather than a fresh read.
    #[instrument(skip(self))]
    pub async fn operator_transition(
        &self,
        key: &str,
        to: DeadLetterStatus,
        expected: Option<DeadLetterStatus>,
        actor: &str,
    ) -> Result<DeadLetterEntry> {
        let current = self.get(key).await?;
        let from = match expected {
            Some(expected) => expected,
            // Already at the target: another operator moved it first.
            None if current.status == to => to.operator_source().unwrap_or(to),
            None => current.status,
        };

        if !from.can_transition(to, TransitionTrigger::Operator) {
            return Err(IngestError::InvalidTransition {
                key: key.to_string(),
                from,
                to,
            });
        }
        if current.status != from {
            return Err(IngestError::DeadLetterStatusConflict {
                key: key.to_string(),
                expected: from,
                actual: current.status,
            });
        }

        let updated = self
            .dead_letters
            .transition(key, from, to, DeadLetterUpdate::default())
            .await?;

        let audit = AuditEventBuilder::new(AuditEventType::DeadLetterStatusUpdated, actor)
            .subject(key)
            .detail("eventId", updated.event_id)
            .detail("from", from)
            .detail("to", to)
            .build();
        if let Err(e) = self.audit.append(audit).await {
            warn!(dead_letter_key = %key, error = %e, "Failed to append audit event");
        }

        info!(dead_letter_key = %key, %from, %to, %actor, "Dead-letter status updated");
        Ok(updated)
    }
}
