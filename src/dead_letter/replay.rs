//! Replay of dead-lettered events
//!
//! The coordinator claims a `READY` entry (`READY -> REPLAYING`), records
//! who asked for it, then either hands a `REPLAY` job to the queue or runs
//! the replay on a spawned task bounded by a timeout. A replay that outlives
//! the timeout keeps running and is reported as in flight.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AuditEventBuilder, AuditEventType, DeadLetterStatus, DeadLetterUpdate,
};
use crate::infra::{AuditLog, DeadLetterRepository, IngestError, JobKind, Result};
use crate::ingest::JobDispatcher;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::processor::{EventProcessor, ReplayOutcome};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Hand replays to the queue instead of running them on the request
    pub queued: bool,
    /// How long a request waits on an inline replay
    pub timeout: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            queued: false,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Response body of `POST {ingestPath}/{eventId}/replay`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReceipt {
    pub queued: bool,
    pub processed_inline: bool,
    pub already_succeeded: bool,
    pub in_flight: bool,
    pub dead_letter_key: String,
    /// Entry status when the response was produced
    pub status: Option<DeadLetterStatus>,
}

pub struct ReplayCoordinator {
    dead_letters: Arc<dyn DeadLetterRepository>,
    audit: Arc<dyn AuditLog>,
    processor: Arc<EventProcessor>,
    dispatcher: Arc<JobDispatcher>,
    metrics: Arc<MetricsRegistry>,
    config: ReplayConfig,
}

impl ReplayCoordinator {
    pub fn new(
        dead_letters: Arc<dyn DeadLetterRepository>,
        audit: Arc<dyn AuditLog>,
        processor: Arc<EventProcessor>,
        dispatcher: Arc<JobDispatcher>,
        metrics: Arc<MetricsRegistry>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            dead_letters,
            audit,
            processor,
            dispatcher,
            metrics,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn replay(&self, event_id: Uuid, actor: &str) -> Result<ReplayReceipt> {
        let entry = self
            .dead_letters
            .find_by_event_id(event_id)
            .await?
            .ok_or_else(|| IngestError::DeadLetterNotFound(event_id.to_string()))?;
        let key = entry.dead_letter_key.clone();

        if entry.status == DeadLetterStatus::Succeeded {
            info!(%event_id, dead_letter_key = %key, "Replay requested for resolved entry");
            return Ok(ReplayReceipt {
                already_succeeded: true,
                dead_letter_key: key,
                status: Some(DeadLetterStatus::Succeeded),
                ..ReplayReceipt::default()
            });
        }
        if entry.status != DeadLetterStatus::Ready {
            return Err(IngestError::ReplayNotReady {
                key,
                status: entry.status,
            });
        }

        self.dead_letters
            .transition(
                &key,
                DeadLetterStatus::Ready,
                DeadLetterStatus::Replaying,
                DeadLetterUpdate::default(),
            )
            .await?;

        let audit = AuditEventBuilder::new(AuditEventType::ReplayRequested, actor)
            .subject(&key)
            .detail("eventId", event_id)
            .detail("attempts", entry.attempts)
            .build();
        if let Err(e) = self.audit.append(audit).await {
            warn!(dead_letter_key = %key, error = %e, "Failed to append audit event");
        }
        self.metrics
            .inc_counter(metric_names::REPLAYS_REQUESTED)
            .await;

        if self.config.queued && self.dispatcher.dispatch(event_id, JobKind::Replay).await {
            info!(%event_id, dead_letter_key = %key, %actor, "Replay queued");
            return Ok(ReplayReceipt {
                queued: true,
                dead_letter_key: key,
                status: Some(DeadLetterStatus::Replaying),
                ..ReplayReceipt::default()
            });
        }

        let processor = self.processor.clone();
        let requested_by = actor.to_string();
        let handle =
            tokio::spawn(async move { processor.execute_replay(event_id, &requested_by).await });

        match tokio::time::timeout(self.config.timeout, handle).await {
            Ok(Ok(Ok(outcome))) => {
                let status = match outcome {
                    ReplayOutcome::Succeeded => DeadLetterStatus::Succeeded,
                    ReplayOutcome::Failed { ref error } => {
                        info!(%event_id, %error, "Inline replay failed");
                        DeadLetterStatus::Failed
                    }
                };
                Ok(ReplayReceipt {
                    processed_inline: true,
                    dead_letter_key: key,
                    status: Some(status),
                    ..ReplayReceipt::default()
                })
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_error)) => Err(IngestError::Internal(format!(
                "replay task failed: {join_error}"
            ))),
            Err(_) => {
                warn!(
                    %event_id,
                    dead_letter_key = %key,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Replay still running after timeout"
                );
                Ok(ReplayReceipt {
                    processed_inline: true,
                    in_flight: true,
                    dead_letter_key: key,
                    status: Some(DeadLetterStatus::Replaying),
                    ..ReplayReceipt::default()
                })
            }
        }
    }
}
