//! Ingest service
//!
//! Accepts validated booking events, deduplicates them by idempotency key,
//! and routes them to the queue or to inline processing. Also hosts the
//! operator force-fail and the event lookup used by the API.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::cutover::CutoverStrategy;
use super::dispatch::JobDispatcher;
use super::idempotency::IdempotencyStore;
use super::schema::{PayloadError, PayloadValidator, SchemaValidationMode};
use crate::domain::{
    AuditEventBuilder, AuditEventType, BookingEventPayload, DeadLetterEntry, DeadLetterReason,
    DeadLetterStatus, EventTransition, IngestEvent, ProcessStatus,
};
use crate::infra::{
    AuditLog, DeadLetterRepository, EventRepository, IngestError, JobKind, Result,
};
use crate::metrics::{metric_names, timed, MetricsRegistry};
use crate::processor::EventProcessor;

/// Response body of an accepted submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub event_id: Uuid,
    pub idempotent_replay: bool,
    pub queued: bool,
    pub processed_inline: bool,
    pub process_status: ProcessStatus,
}

/// Operator request to dead-letter an event immediately
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceFailRequest {
    pub reason_code: String,
    #[serde(default)]
    pub reason_detail: Option<String>,
    #[serde(default)]
    pub poison_message: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceFailReceipt {
    pub dead_letter_key: String,
}

/// An event together with its dead-letter entry, if any
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    #[serde(flatten)]
    pub event: IngestEvent,
    pub dead_letter: Option<DeadLetterEntry>,
}

pub struct IngestService {
    idempotency: IdempotencyStore,
    validator: PayloadValidator,
    events: Arc<dyn EventRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    audit: Arc<dyn AuditLog>,
    processor: Arc<EventProcessor>,
    dispatcher: Arc<JobDispatcher>,
    cutover: CutoverStrategy,
    metrics: Arc<MetricsRegistry>,
}

impl IngestService {
    pub fn new(
        events: Arc<dyn EventRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        audit: Arc<dyn AuditLog>,
        processor: Arc<EventProcessor>,
        dispatcher: Arc<JobDispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> std::result::Result<Self, PayloadError> {
        Ok(Self {
            idempotency: IdempotencyStore::new(events.clone()),
            validator: PayloadValidator::new(SchemaValidationMode::default())?,
            events,
            dead_letters,
            audit,
            processor,
            dispatcher,
            cutover: CutoverStrategy::default(),
            metrics,
        })
    }

    pub fn with_validator(mut self, validator: PayloadValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_cutover(mut self, cutover: CutoverStrategy) -> Self {
        self.cutover = cutover;
        self
    }

    pub fn validator(&self) -> &PayloadValidator {
        &self.validator
    }

    pub fn cutover(&self) -> &CutoverStrategy {
        &self.cutover
    }

    /// Parse a raw request body and accept it
    pub async fn accept_raw(
        &self,
        actor: &str,
        idempotency_key: &str,
        body: &[u8],
    ) -> std::result::Result<IngestReceipt, AcceptError> {
        let payload = match self.validator.parse(body) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.inc_counter(metric_names::EVENTS_REJECTED).await;
                return Err(AcceptError::Payload(e));
            }
        };
        Ok(self.accept(actor, idempotency_key, payload).await?)
    }

    /// Accept a validated payload under `idempotency_key`.
    ///
    /// A known key returns the existing event without re-running anything.
    #[instrument(skip(self, payload), fields(booking_ref = %payload.external_booking_ref))]
    pub async fn accept(
        &self,
        actor: &str,
        idempotency_key: &str,
        payload: BookingEventPayload,
    ) -> Result<IngestReceipt> {
        timed(&self.metrics, metric_names::INGEST_LATENCY, async {
            self.metrics.inc_counter(metric_names::EVENTS_RECEIVED).await;

            let reservation = self
                .idempotency
                .reserve(idempotency_key, || {
                    IngestEvent::new(idempotency_key, payload)
                })
                .await?;
            let event = reservation.event;

            if !reservation.created {
                self.metrics.inc_counter(metric_names::EVENTS_DUPLICATE).await;
                info!(event_id = %event.event_id, "Duplicate submission, returning existing event");
                return Ok(IngestReceipt {
                    event_id: event.event_id,
                    idempotent_replay: true,
                    queued: false,
                    processed_inline: false,
                    process_status: event.process_status,
                });
            }

            self.append_audit(
                AuditEventBuilder::new(AuditEventType::EventReceived, actor)
                    .subject(event.event_id)
                    .detail("idempotencyKey", &event.idempotency_key)
                    .detail("eventType", event.payload.event_type)
                    .detail("externalBookingRef", &event.payload.external_booking_ref),
            )
            .await;

            if self.cutover.should_route_to_core(actor)
                && self.dispatcher.dispatch(event.event_id, JobKind::Process).await
            {
                self.metrics.inc_counter(metric_names::EVENTS_QUEUED).await;
                info!(event_id = %event.event_id, %actor, "Event accepted and queued");
                return Ok(IngestReceipt {
                    event_id: event.event_id,
                    idempotent_replay: false,
                    queued: true,
                    processed_inline: false,
                    process_status: event.process_status,
                });
            }

            self.metrics.inc_counter(metric_names::EVENTS_INLINE).await;
            // Detached, so a caller that stops waiting leaves no orphaned claim.
            let run = self
                .processor
                .clone()
                .spawn_inline(event.event_id)
                .await
                .unwrap_or_else(|e| {
                    Err(IngestError::Internal(format!(
                        "inline processing task failed: {e}"
                    )))
                });
            let process_status = match run {
                Ok(outcome) => outcome.status(),
                Err(e) => {
                    // Accepted regardless; the stall sweeper picks it up later.
                    warn!(event_id = %event.event_id, error = %e, "Inline processing failed");
                    self.events
                        .find_by_id(event.event_id)
                        .await?
                        .map(|e| e.process_status)
                        .unwrap_or(event.process_status)
                }
            };
            info!(event_id = %event.event_id, %actor, status = %process_status, "Event processed inline");

            Ok(IngestReceipt {
                event_id: event.event_id,
                idempotent_replay: false,
                queued: false,
                processed_inline: true,
                process_status,
            })
        })
        .await
    }

    pub async fn get_event(&self, event_id: Uuid) -> Result<EventView> {
        let event = self
            .events
            .find_by_id(event_id)
            .await?
            .ok_or(IngestError::EventNotFound(event_id))?;
        let dead_letter = self.dead_letters.find_by_event_id(event_id).await?;
        Ok(EventView { event, dead_letter })
    }

    /// Dead-letter an event immediately, bypassing retry.
    ///
    /// Re-failing an unresolved entry rewrites its reason. Entries that are
    /// replaying or already succeeded are left alone.
    #[instrument(skip(self, request), fields(reason_code = %request.reason_code))]
    pub async fn force_fail(
        &self,
        event_id: Uuid,
        actor: &str,
        request: ForceFailRequest,
    ) -> Result<ForceFailReceipt> {
        if request.reason_code.trim().is_empty() {
            return Err(IngestError::Validation("reasonCode must not be empty".to_string()));
        }

        let event = self
            .events
            .find_by_id(event_id)
            .await?
            .ok_or(IngestError::EventNotFound(event_id))?;

        let existing = self.dead_letters.find_by_event_id(event_id).await?;
        if let Some(entry) = &existing {
            match entry.status {
                DeadLetterStatus::Succeeded => {
                    return Err(IngestError::DeadLetterResolved(entry.dead_letter_key.clone()))
                }
                DeadLetterStatus::Replaying => {
                    return Err(IngestError::DeadLetterStatusConflict {
                        key: entry.dead_letter_key.clone(),
                        expected: DeadLetterStatus::Open,
                        actual: DeadLetterStatus::Replaying,
                    })
                }
                _ => {}
            }
        }

        if event.process_status != ProcessStatus::DeadLetter {
            let error = request
                .reason_detail
                .clone()
                .unwrap_or_else(|| request.reason_code.clone());
            self.events
                .transition(
                    event_id,
                    event.process_status,
                    EventTransition::DeadLetter {
                        error,
                        at: Utc::now(),
                    },
                )
                .await?;
        }

        let reason = DeadLetterReason {
            reason_code: request.reason_code.clone(),
            reason_detail: request.reason_detail.clone(),
            poison_message: request.poison_message,
        };
        let entry = match existing {
            Some(entry) => {
                self.dead_letters
                    .update_reason(&entry.dead_letter_key, entry.status, reason)
                    .await?
            }
            None => {
                let (entry, created) = self
                    .dead_letters
                    .insert_if_absent(DeadLetterEntry::open(
                        event_id,
                        &request.reason_code,
                        request.reason_detail.clone(),
                        request.poison_message,
                    ))
                    .await?;
                if created {
                    entry
                } else {
                    self.dead_letters
                        .update_reason(&entry.dead_letter_key, entry.status, reason)
                        .await?
                }
            }
        };

        self.metrics
            .inc_counter(metric_names::EVENTS_FORCE_FAILED)
            .await;
        self.append_audit(
            AuditEventBuilder::new(AuditEventType::EventMarkedFailed, actor)
                .subject(event_id)
                .detail("deadLetterKey", &entry.dead_letter_key)
                .detail("reasonCode", &entry.reason_code)
                .detail("reasonDetail", &entry.reason_detail)
                .detail("poisonMessage", entry.poison_message)
                .detail("forced", true),
        )
        .await;
        info!(%event_id, dead_letter_key = %entry.dead_letter_key, %actor, "Event force-failed");

        Ok(ForceFailReceipt {
            dead_letter_key: entry.dead_letter_key,
        })
    }

    async fn append_audit(&self, builder: AuditEventBuilder) {
        let event = builder.build();
        let event_type = event.event_type.clone();
        if let Err(e) = self.audit.append(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to append audit event");
        }
    }
}

/// Failure of [`IngestService::accept_raw`]
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}
