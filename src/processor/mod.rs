//! Event processor
//!
//! Applies accepted events to the booking domain and classifies failures:
//!
//! - `DomainError::Unavailable` with attempts left: `FAILED`, retried after
//!   the policy backoff
//! - `DomainError::Unavailable` on the last attempt: `DEAD_LETTER` with
//!   `RETRY_EXHAUSTED`
//! - `DomainError::Rejected`: `DEAD_LETTER` with the domain's code
//! - `DomainError::Poison` or an unknown payload version: `DEAD_LETTER`
//!   with `POISON_MESSAGE`
//!
//! Every run starts with a compare-and-swap into `PROCESSING`; a run that
//! loses the swap does nothing.

pub mod sweeper;
pub mod worker;

pub use sweeper::{StallSweeper, SweepReport, SweeperConfig};
pub use worker::{WorkerPool, WorkerPoolConfig};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AuditEventBuilder, AuditEventType, DeadLetterEntry, DeadLetterStatus, DeadLetterUpdate,
    DomainError, EventTransition, IngestEvent, ProcessStatus, PAYLOAD_VERSION_V1,
    REASON_FATAL_PROCESSING_ERROR, REASON_POISON_MESSAGE, REASON_RETRY_EXHAUSTED,
    SYSTEM_PROCESSOR_ACTOR,
};
use crate::infra::{
    AuditLog, BookingDomain, DeadLetterRepository, EventRepository, IngestError, Result, Retry,
    RetryPolicy,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// Result of one processing run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessOutcome {
    Done,
    RetryScheduled {
        attempt: u32,
        #[serde(rename = "delayMs", serialize_with = "serialize_millis")]
        delay: Duration,
    },
    DeadLettered {
        #[serde(rename = "deadLetterKey")]
        dead_letter_key: String,
        #[serde(rename = "reasonCode")]
        reason_code: String,
    },
    /// Another run owns the event, or it is not in a claimable status
    Skipped { status: ProcessStatus },
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ProcessOutcome {
    /// Event status right after the run
    pub fn status(&self) -> ProcessStatus {
        match self {
            Self::Done => ProcessStatus::Done,
            Self::RetryScheduled { .. } => ProcessStatus::Failed,
            Self::DeadLettered { .. } => ProcessStatus::DeadLetter,
            Self::Skipped { status } => *status,
        }
    }
}

/// Result of re-running a dead-lettered event
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Succeeded,
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub retry: RetryPolicy,
    /// A `PROCESSING` event untouched for this long is assumed orphaned by a
    /// crashed run and may be claimed again.
    pub stale_processing_after: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stale_processing_after: Duration::from_secs(300),
        }
    }
}

struct Failure {
    reason_code: String,
    detail: String,
    poison: bool,
}

pub struct EventProcessor {
    events: Arc<dyn EventRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    audit: Arc<dyn AuditLog>,
    domain: Arc<dyn BookingDomain>,
    metrics: Arc<MetricsRegistry>,
    config: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(
        events: Arc<dyn EventRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        audit: Arc<dyn AuditLog>,
        domain: Arc<dyn BookingDomain>,
        metrics: Arc<MetricsRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            events,
            dead_letters,
            audit,
            domain,
            metrics,
            config,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Whether a claim or replay last touched at `updated_at` has outlived
    /// the stale window.
    pub fn is_stale(&self, updated_at: DateTime<Utc>) -> bool {
        updated_at + self.stale_window() < Utc::now()
    }

    /// Time left until the `PROCESSING` claim on `event_id` goes stale.
    /// `None` when the event is not claimed.
    pub async fn claim_expires_in(&self, event_id: Uuid) -> Result<Option<Duration>> {
        let event = self
            .events
            .find_by_id(event_id)
            .await?
            .ok_or(IngestError::EventNotFound(event_id))?;
        if event.process_status != ProcessStatus::Processing {
            return Ok(None);
        }
        let remaining = event.updated_at + self.stale_window() - Utc::now();
        Ok(Some(remaining.to_std().unwrap_or(Duration::ZERO)))
    }

    fn stale_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.stale_processing_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5))
    }

    /// Run one processing attempt for `event_id`.
    #[instrument(skip(self), fields(attempt = tracing::field::Empty))]
    pub async fn process_once(&self, event_id: Uuid) -> Result<ProcessOutcome> {
        let event = self
            .events
            .find_by_id(event_id)
            .await?
            .ok_or(IngestError::EventNotFound(event_id))?;

        let observed = event.process_status;
        if !self.is_claimable(&event) {
            debug!(%event_id, status = %observed, "Event not claimable, skipping");
            return Ok(ProcessOutcome::Skipped { status: observed });
        }

        let claimed = match self
            .events
            .transition(event_id, observed, EventTransition::Claim { at: Utc::now() })
            .await
        {
            Ok(event) => event,
            Err(IngestError::EventStatusConflict { actual, .. }) => {
                debug!(%event_id, status = %actual, "Lost claim race, skipping");
                return Ok(ProcessOutcome::Skipped { status: actual });
            }
            Err(e) => return Err(e),
        };
        tracing::Span::current().record("attempt", claimed.attempts);

        if claimed.payload.payload_version != PAYLOAD_VERSION_V1 {
            let failure = Failure {
                reason_code: REASON_POISON_MESSAGE.to_string(),
                detail: format!(
                    "unsupported payload version {}",
                    claimed.payload.payload_version
                ),
                poison: true,
            };
            return self.dead_letter(&claimed, failure).await;
        }

        match self.domain.apply(&claimed).await {
            Ok(outcome) => {
                let done = self
                    .events
                    .transition(
                        event_id,
                        ProcessStatus::Processing,
                        EventTransition::Complete { at: Utc::now() },
                    )
                    .await?;
                self.record_done(&done, &format!("{outcome:?}")).await;
                Ok(ProcessOutcome::Done)
            }
            Err(DomainError::Unavailable(message))
                if self.config.retry.has_attempts_remaining(claimed.attempts) =>
            {
                self.schedule_retry(&claimed, message).await
            }
            Err(error) => {
                let failure = classify(error);
                self.dead_letter(&claimed, failure).await
            }
        }
    }

    /// Process `event_id` on the caller's task, sleeping through retries.
    pub async fn process_inline(&self, event_id: Uuid) -> Result<ProcessOutcome> {
        loop {
            match self.process_once(event_id).await? {
                ProcessOutcome::RetryScheduled { delay, .. } => tokio::time::sleep(delay).await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// [`process_inline`](Self::process_inline) on a task of its own.
    ///
    /// The run keeps going when the caller stops waiting, so a claimed event
    /// is never abandoned in `PROCESSING` by a dropped request.
    pub fn spawn_inline(self: Arc<Self>, event_id: Uuid) -> JoinHandle<Result<ProcessOutcome>> {
        tokio::spawn(async move { self.process_inline(event_id).await })
    }

    /// Re-run a dead-lettered event whose entry is `REPLAYING`.
    ///
    /// Success completes the event and moves the entry to `SUCCEEDED`; any
    /// failure returns the event to `DEAD_LETTER` and the entry to `FAILED`.
    /// A run cut short by a store error still settles the entry through
    /// [`settle_replay`](Self::settle_replay) before reporting.
    #[instrument(skip(self))]
    pub async fn execute_replay(&self, event_id: Uuid, requested_by: &str) -> Result<ReplayOutcome> {
        let entry = self
            .dead_letters
            .find_by_event_id(event_id)
            .await?
            .ok_or_else(|| IngestError::DeadLetterNotFound(event_id.to_string()))?;
        if entry.status != DeadLetterStatus::Replaying {
            return Err(IngestError::ReplayNotReady {
                key: entry.dead_letter_key,
                status: entry.status,
            });
        }
        let key = entry.dead_letter_key;

        match self.run_replay(event_id, &key, requested_by).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let error = e.to_string();
                match self.settle_replay(event_id, requested_by, &error).await {
                    Ok(outcome) => {
                        warn!(%event_id, dead_letter_key = %key, %error, "Replay interrupted, entry settled");
                        Ok(outcome)
                    }
                    Err(settle_error) => {
                        warn!(
                            %event_id,
                            dead_letter_key = %key,
                            error = %settle_error,
                            "Could not settle interrupted replay"
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    /// Resolve a `REPLAYING` entry whose run ended without doing so.
    ///
    /// An event that reached `DONE` resolves the entry as `SUCCEEDED`.
    /// Otherwise a claim left behind is released to `DEAD_LETTER` and the
    /// entry moves to `FAILED` with `error`, ready for another operator
    /// decision. Fails with `ReplayNotReady` when the entry is no longer
    /// `REPLAYING`.
    #[instrument(skip(self))]
    pub async fn settle_replay(
        &self,
        event_id: Uuid,
        requested_by: &str,
        error: &str,
    ) -> Result<ReplayOutcome> {
        let entry = self
            .dead_letters
            .find_by_event_id(event_id)
            .await?
            .ok_or_else(|| IngestError::DeadLetterNotFound(event_id.to_string()))?;
        if entry.status != DeadLetterStatus::Replaying {
            return Err(IngestError::ReplayNotReady {
                key: entry.dead_letter_key,
                status: entry.status,
            });
        }
        let key = entry.dead_letter_key;
        let event = self
            .events
            .find_by_id(event_id)
            .await?
            .ok_or(IngestError::EventNotFound(event_id))?;

        if event.process_status == ProcessStatus::Done {
            self.dead_letters
                .transition(
                    &key,
                    DeadLetterStatus::Replaying,
                    DeadLetterStatus::Succeeded,
                    DeadLetterUpdate::default(),
                )
                .await?;
            self.append_audit(
                AuditEventBuilder::new(AuditEventType::ReplaySucceeded, SYSTEM_PROCESSOR_ACTOR)
                    .subject(&key)
                    .detail("eventId", event_id)
                    .detail("requestedBy", requested_by)
                    .detail("settled", true),
            )
            .await;
            self.metrics.inc_counter(metric_names::REPLAYS_SUCCEEDED).await;
            info!(%event_id, dead_letter_key = %key, "Replay settled as succeeded");
            return Ok(ReplayOutcome::Succeeded);
        }

        let claimed = event.process_status == ProcessStatus::Processing;
        self.finish_failed_replay(&key, event_id, requested_by, error, claimed)
            .await?;
        Ok(ReplayOutcome::Failed {
            error: error.to_string(),
        })
    }

    async fn run_replay(
        &self,
        event_id: Uuid,
        key: &str,
        requested_by: &str,
    ) -> Result<ReplayOutcome> {
        let claimed = match self
            .events
            .transition(
                event_id,
                ProcessStatus::DeadLetter,
                EventTransition::Claim { at: Utc::now() },
            )
            .await
        {
            Ok(event) => event,
            Err(IngestError::EventStatusConflict { actual, .. }) => {
                let error = format!("event was {actual} when replay started");
                return self.settle_replay(event_id, requested_by, &error).await;
            }
            Err(e) => return Err(e),
        };

        let retry = Retry::new(self.config.retry.clone());
        let domain = self.domain.clone();
        let (result, tries) = retry
            .run_with_predicate(
                || {
                    let domain = domain.clone();
                    let event = claimed.clone();
                    async move { domain.apply(&event).await }
                },
                DomainError::is_retryable,
            )
            .await;

        match result {
            Ok(_) => {
                let done = self
                    .events
                    .transition(
                        event_id,
                        ProcessStatus::Processing,
                        EventTransition::Complete { at: Utc::now() },
                    )
                    .await?;
                self.dead_letters
                    .transition(
                        key,
                        DeadLetterStatus::Replaying,
                        DeadLetterStatus::Succeeded,
                        DeadLetterUpdate::default(),
                    )
                    .await?;

                self.append_audit(
                    AuditEventBuilder::new(AuditEventType::ReplaySucceeded, SYSTEM_PROCESSOR_ACTOR)
                        .subject(key)
                        .detail("eventId", event_id)
                        .detail("requestedBy", requested_by)
                        .detail("domainAttempts", tries),
                )
                .await;
                self.record_done(&done, "Replayed").await;
                self.metrics.inc_counter(metric_names::REPLAYS_SUCCEEDED).await;
                info!(%event_id, dead_letter_key = %key, "Replay succeeded");
                Ok(ReplayOutcome::Succeeded)
            }
            Err(error) => {
                let error = error.to_string();
                self.finish_failed_replay(key, event_id, requested_by, &error, true)
                    .await?;
                Ok(ReplayOutcome::Failed { error })
            }
        }
    }

    fn is_claimable(&self, event: &IngestEvent) -> bool {
        match event.process_status {
            ProcessStatus::Processing => self.is_stale(event.updated_at),
            status => status.is_claimable(),
        }
    }

    async fn schedule_retry(&self, event: &IngestEvent, error: String) -> Result<ProcessOutcome> {
        let delay = self.config.retry.delay_after_attempt(event.attempts);
        let now = Utc::now();
        let next_attempt_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        self.events
            .transition(
                event.event_id,
                ProcessStatus::Processing,
                EventTransition::ScheduleRetry {
                    error: error.clone(),
                    next_attempt_at,
                    at: now,
                },
            )
            .await?;

        self.append_audit(
            AuditEventBuilder::new(AuditEventType::EventRetryScheduled, SYSTEM_PROCESSOR_ACTOR)
                .subject(event.event_id)
                .detail("attempt", event.attempts)
                .detail("maxAttempts", self.config.retry.max_attempts)
                .detail("delayMs", delay.as_millis() as u64)
                .detail("error", &error),
        )
        .await;
        self.metrics.inc_counter(metric_names::EVENTS_RETRIED).await;

        warn!(
            event_id = %event.event_id,
            attempt = event.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Processing failed, retry scheduled"
        );
        Ok(ProcessOutcome::RetryScheduled {
            attempt: event.attempts,
            delay,
        })
    }

    async fn dead_letter(&self, event: &IngestEvent, failure: Failure) -> Result<ProcessOutcome> {
        self.events
            .transition(
                event.event_id,
                ProcessStatus::Processing,
                EventTransition::DeadLetter {
                    error: failure.detail.clone(),
                    at: Utc::now(),
                },
            )
            .await?;

        let entry = DeadLetterEntry::open(
            event.event_id,
            &failure.reason_code,
            Some(failure.detail.clone()),
            failure.poison,
        );
        let (entry, created) = self.dead_letters.insert_if_absent(entry).await?;
        if !created {
            debug!(
                dead_letter_key = %entry.dead_letter_key,
                status = %entry.status,
                "Dead-letter entry already existed"
            );
        }

        self.append_audit(
            AuditEventBuilder::new(AuditEventType::EventMarkedFailed, SYSTEM_PROCESSOR_ACTOR)
                .subject(event.event_id)
                .detail("deadLetterKey", &entry.dead_letter_key)
                .detail("reasonCode", &failure.reason_code)
                .detail("reasonDetail", &failure.detail)
                .detail("poisonMessage", failure.poison)
                .detail("attempts", event.attempts),
        )
        .await;
        self.metrics
            .inc_counter(metric_names::EVENTS_DEAD_LETTERED)
            .await;

        warn!(
            event_id = %event.event_id,
            dead_letter_key = %entry.dead_letter_key,
            reason_code = %failure.reason_code,
            attempts = event.attempts,
            "Event dead-lettered"
        );
        Ok(ProcessOutcome::DeadLettered {
            dead_letter_key: entry.dead_letter_key,
            reason_code: failure.reason_code,
        })
    }

    async fn finish_failed_replay(
        &self,
        key: &str,
        event_id: Uuid,
        requested_by: &str,
        error: &str,
        event_claimed: bool,
    ) -> Result<()> {
        if event_claimed {
            self.events
                .transition(
                    event_id,
                    ProcessStatus::Processing,
                    EventTransition::DeadLetter {
                        error: error.to_string(),
                        at: Utc::now(),
                    },
                )
                .await?;
        }

        self.dead_letters
            .transition(
                key,
                DeadLetterStatus::Replaying,
                DeadLetterStatus::Failed,
                DeadLetterUpdate {
                    increment_attempts: true,
                    reason_detail: Some(error.to_string()),
                },
            )
            .await?;

        self.append_audit(
            AuditEventBuilder::new(AuditEventType::ReplayFailed, SYSTEM_PROCESSOR_ACTOR)
                .subject(key)
                .detail("eventId", event_id)
                .detail("requestedBy", requested_by)
                .detail("error", error),
        )
        .await;
        self.metrics.inc_counter(metric_names::REPLAYS_FAILED).await;
        warn!(%event_id, dead_letter_key = %key, %error, "Replay failed");
        Ok(())
    }

    async fn record_done(&self, event: &IngestEvent, outcome: &str) {
        self.append_audit(
            AuditEventBuilder::new(AuditEventType::EventProcessed, SYSTEM_PROCESSOR_ACTOR)
                .subject(event.event_id)
                .detail("externalBookingRef", event.external_booking_ref())
                .detail("attempts", event.attempts)
                .detail("outcome", outcome)
                .detail("processingLatencyMs", event.processing_latency_ms),
        )
        .await;

        self.metrics.inc_counter(metric_names::EVENTS_PROCESSED).await;
        if let Some(latency_ms) = event.processing_latency_ms {
            self.metrics
                .observe_histogram(
                    metric_names::PROCESSING_LATENCY,
                    latency_ms as f64 / 1000.0,
                )
                .await;
        }
        debug!(event_id = %event.event_id, attempts = event.attempts, "Event processed");
    }

    /// Audit failures are logged, never surfaced: the status change they
    /// describe has already been committed.
    async fn append_audit(&self, builder: AuditEventBuilder) {
        let event = builder.build();
        let event_type = event.event_type.clone();
        if let Err(e) = self.audit.append(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to append audit event");
        }
    }
}

fn classify(error: DomainError) -> Failure {
    match error {
        DomainError::Unavailable(message) => Failure {
            reason_code: REASON_RETRY_EXHAUSTED.to_string(),
            detail: message,
            poison: false,
        },
        DomainError::Rejected { code, message } => Failure {
            reason_code: if code.trim().is_empty() {
                REASON_FATAL_PROCESSING_ERROR.to_string()
            } else {
                code
            },
            detail: message,
            poison: false,
        },
        DomainError::Poison(message) => Failure {
            reason_code: REASON_POISON_MESSAGE.to_string(),
            detail: message,
            poison: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{fixtures, AuditQuery, BookingEventType, CODE_BOOKING_CANCELLED};
    use crate::infra::memory::{
        InMemoryAuditLog, InMemoryBookingDomain, InMemoryDeadLetterStore, InMemoryEventStore,
    };
    use crate::infra::{EventStatusCounts, MockBookingDomain};
    use async_trait::async_trait;

    /// Event store whose `Complete` transitions fail, as when the database
    /// drops out between applying an event and recording it.
    struct FailingCompletion(Arc<InMemoryEventStore>);

    #[async_trait]
    impl EventRepository for FailingCompletion {
        async fn insert_if_absent(&self, event: IngestEvent) -> Result<(IngestEvent, bool)> {
            self.0.insert_if_absent(event).await
        }

        async fn find_by_id(&self, event_id: Uuid) -> Result<Option<IngestEvent>> {
            self.0.find_by_id(event_id).await
        }

        async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IngestEvent>> {
            self.0.find_by_idempotency_key(key).await
        }

        async fn transition(
            &self,
            event_id: Uuid,
            expected: ProcessStatus,
            transition: EventTransition,
        ) -> Result<IngestEvent> {
            if matches!(transition, EventTransition::Complete { .. }) {
                return Err(IngestError::Timeout("event store".into()));
            }
            self.0.transition(event_id, expected, transition).await
        }

        async fn status_counts_since(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> Result<EventStatusCounts> {
            self.0.status_counts_since(since).await
        }

        async fn latencies_since(&self, since: chrono::DateTime<Utc>) -> Result<Vec<i64>> {
            self.0.latencies_since(since).await
        }

        async fn list_by_status(
            &self,
            status: ProcessStatus,
            limit: usize,
        ) -> Result<Vec<IngestEvent>> {
            self.0.list_by_status(status, limit).await
        }

        async fn ping(&self) -> Result<()> {
            self.0.ping().await
        }
    }

    struct Harness {
        events: Arc<InMemoryEventStore>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        audit: Arc<InMemoryAuditLog>,
        domain: Arc<InMemoryBookingDomain>,
        processor: EventProcessor,
    }

    fn harness() -> Harness {
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let domain = Arc::new(InMemoryBookingDomain::new());
        let processor = EventProcessor::new(
            events.clone(),
            dead_letters.clone(),
            audit.clone(),
            domain.clone(),
            Arc::new(MetricsRegistry::new()),
            ProcessorConfig {
                retry: RetryPolicy::fast(),
                ..ProcessorConfig::default()
            },
        );
        Harness {
            events,
            dead_letters,
            audit,
            domain,
            processor,
        }
    }

    async fn accept(h: &Harness, booking_ref: &str, event_type: BookingEventType) -> Uuid {
        let event = IngestEvent::new(
            format!("key-{booking_ref}-{event_type}"),
            fixtures::payload(booking_ref, event_type),
        );
        let (event, _) = h.events.insert_if_absent(event).await.unwrap();
        event.event_id
    }

    async fn accept_into(events: &InMemoryEventStore, booking_ref: &str) -> Uuid {
        let event = IngestEvent::new(
            format!("key-{booking_ref}"),
            fixtures::payload(booking_ref, BookingEventType::Created),
        );
        let (event, _) = events.insert_if_absent(event).await.unwrap();
        event.event_id
    }

    async fn audit_types(h: &Harness) -> Vec<String> {
        h.audit
            .query(&AuditQuery {
                limit: 100,
                ..AuditQuery::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_success_marks_done_with_latency() {
        let h = harness();
        let id = accept(&h, "B-1", BookingEventType::Created).await;

        let outcome = h.processor.process_once(id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Done);

        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Done);
        assert_eq!(event.attempts, 1);
        assert!(event.processing_latency_ms.is_some());
        assert_eq!(h.domain.applied_count().await, 1);
        assert!(audit_types(&h).await.contains(&"INGEST_EVENT_PROCESSED".to_string()));
    }

    #[tokio::test]
    async fn test_done_event_is_skipped() {
        let h = harness();
        let id = accept(&h, "B-1", BookingEventType::Created).await;
        h.processor.process_once(id).await.unwrap();

        let outcome = h.processor.process_once(id).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Skipped {
                status: ProcessStatus::Done
            }
        );
        assert_eq!(h.domain.applied_count().await, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let h = harness();
        let id = accept(&h, "B-2", BookingEventType::Created).await;
        h.domain
            .inject_failure(DomainError::Unavailable("db down".into()))
            .await;

        let outcome = h.processor.process_once(id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::RetryScheduled { attempt: 1, .. }));

        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Failed);
        assert_eq!(event.last_error.as_deref(), Some("db down"));
        assert!(event.next_attempt_at.is_some());

        assert_eq!(h.processor.process_once(id).await.unwrap(), ProcessOutcome::Done);
    }

    #[tokio::test]
    async fn test_inline_retries_until_exhausted() {
        let h = harness();
        let id = accept(&h, "B-3", BookingEventType::Created).await;
        for _ in 0..3 {
            h.domain
                .inject_failure(DomainError::Unavailable("still down".into()))
                .await;
        }

        let outcome = h.processor.process_inline(id).await.unwrap();
        match outcome {
            ProcessOutcome::DeadLettered { reason_code, .. } => {
                assert_eq!(reason_code, REASON_RETRY_EXHAUSTED)
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::DeadLetter);
        assert_eq!(event.attempts, 3);

        let entry = h.dead_letters.find_by_event_id(id).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Open);
        assert!(!entry.poison_message);

        let types = audit_types(&h).await;
        assert_eq!(
            types.iter().filter(|t| *t == "INGEST_EVENT_RETRY_SCHEDULED").count(),
            2
        );
        assert!(types.contains(&"INGEST_EVENT_MARKED_FAILED".to_string()));
    }

    #[tokio::test]
    async fn test_inline_recovers_after_transient_failure() {
        let h = harness();
        let id = accept(&h, "B-4", BookingEventType::Created).await;
        h.domain
            .inject_failure(DomainError::Unavailable("blip".into()))
            .await;

        assert_eq!(h.processor.process_inline(id).await.unwrap(), ProcessOutcome::Done);
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.attempts, 2);
    }

    #[tokio::test]
    async fn test_rejection_dead_letters_immediately() {
        let h = harness();
        let cancel = accept(&h, "B-5", BookingEventType::Cancelled).await;
        h.processor.process_once(cancel).await.unwrap();

        let mut update = fixtures::payload("B-5", BookingEventType::Updated);
        update.event_time = Utc::now() + chrono::Duration::minutes(1);
        let (event, _) = h
            .events
            .insert_if_absent(IngestEvent::new("late-update", update))
            .await
            .unwrap();

        let outcome = h.processor.process_inline(event.event_id).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::DeadLettered {
                dead_letter_key: crate::domain::dead_letter_key_for(event.event_id),
                reason_code: CODE_BOOKING_CANCELLED.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_poison_and_unknown_version() {
        let h = harness();
        let id = accept(&h, "B-6", BookingEventType::Created).await;
        h.domain
            .inject_failure(DomainError::Poison("garbled".into()))
            .await;
        h.processor.process_once(id).await.unwrap();
        let entry = h.dead_letters.find_by_event_id(id).await.unwrap().unwrap();
        assert_eq!(entry.reason_code, REASON_POISON_MESSAGE);
        assert!(entry.poison_message);

        let mut payload = fixtures::payload("B-7", BookingEventType::Created);
        payload.payload_version = "v0".into();
        let (event, _) = h
            .events
            .insert_if_absent(IngestEvent::new("old", payload))
            .await
            .unwrap();
        let outcome = h.processor.process_once(event.event_id).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::DeadLettered { ref reason_code, .. } if reason_code == REASON_POISON_MESSAGE
        ));
    }

    #[tokio::test]
    async fn test_empty_rejection_code_is_fatal() {
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let mut domain = MockBookingDomain::new();
        domain.expect_apply().returning(|_| {
            Err(DomainError::Rejected {
                code: String::new(),
                message: "nope".into(),
            })
        });
        let processor = EventProcessor::new(
            events.clone(),
            dead_letters.clone(),
            Arc::new(InMemoryAuditLog::new()),
            Arc::new(domain),
            Arc::new(MetricsRegistry::new()),
            ProcessorConfig::default(),
        );

        let (event, _) = events
            .insert_if_absent(IngestEvent::new(
                "k",
                fixtures::payload("B-8", BookingEventType::Created),
            ))
            .await
            .unwrap();
        let outcome = processor.process_once(event.event_id).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::DeadLettered { ref reason_code, .. } if reason_code == REASON_FATAL_PROCESSING_ERROR
        ));
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimed() {
        let h = harness();
        let fresh = accept(&h, "B-11", BookingEventType::Created).await;
        let stale = accept(&h, "B-12", BookingEventType::Created).await;
        h.events
            .transition(fresh, ProcessStatus::Pending, EventTransition::Claim { at: Utc::now() })
            .await
            .unwrap();
        h.events
            .transition(
                stale,
                ProcessStatus::Pending,
                EventTransition::Claim {
                    at: Utc::now() - chrono::Duration::hours(1),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            h.processor.process_once(fresh).await.unwrap(),
            ProcessOutcome::Skipped {
                status: ProcessStatus::Processing
            }
        );
        let wait = h.processor.claim_expires_in(fresh).await.unwrap().unwrap();
        assert!(wait > Duration::from_secs(290) && wait <= Duration::from_secs(300));

        assert_eq!(h.processor.claim_expires_in(stale).await.unwrap(), Some(Duration::ZERO));
        assert_eq!(h.processor.process_once(stale).await.unwrap(), ProcessOutcome::Done);
        assert_eq!(h.processor.claim_expires_in(stale).await.unwrap(), None);
        let event = h.events.find_by_id(stale).await.unwrap().unwrap();
        assert_eq!(event.attempts, 2);
    }

    #[tokio::test]
    async fn test_spawned_inline_run_outlives_caller() {
        let h = harness();
        let processor = Arc::new(h.processor);
        let id = accept_into(&h.events, "B-13").await;
        h.domain
            .inject_failure(DomainError::Unavailable("blip".into()))
            .await;

        let handle = processor.clone().spawn_inline(id);
        drop(handle);

        let mut done = false;
        for _ in 0..100 {
            let event = h.events.find_by_id(id).await.unwrap().unwrap();
            if event.process_status == ProcessStatus::Done {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done, "detached run should finish");
    }

    #[tokio::test]
    async fn test_replay_store_error_settles_entry() {
        let store = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let domain = Arc::new(InMemoryBookingDomain::new());
        let processor = EventProcessor::new(
            Arc::new(FailingCompletion(store.clone())),
            dead_letters.clone(),
            audit.clone(),
            domain.clone(),
            Arc::new(MetricsRegistry::new()),
            ProcessorConfig {
                retry: RetryPolicy::fast(),
                ..ProcessorConfig::default()
            },
        );

        let id = accept_into(&store, "B-14").await;
        domain
            .inject_failure(DomainError::Poison("bad".into()))
            .await;
        processor.process_once(id).await.unwrap();
        let key = crate::domain::dead_letter_key_for(id);
        for (from, to) in [
            (DeadLetterStatus::Open, DeadLetterStatus::Ready),
            (DeadLetterStatus::Ready, DeadLetterStatus::Replaying),
        ] {
            dead_letters
                .transition(&key, from, to, DeadLetterUpdate::default())
                .await
                .unwrap();
        }

        let outcome = processor.execute_replay(id, "ops").await.unwrap();
        assert!(
            matches!(outcome, ReplayOutcome::Failed { ref error } if error.contains("timed out")),
            "{outcome:?}"
        );

        let entry = dead_letters.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Failed);
        assert_eq!(entry.attempts, 1);
        let event = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::DeadLetter);
        let failed = audit
            .all_events()
            .await
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::ReplayFailed)
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_settle_replay_of_completed_event() {
        let h = harness();
        let id = accept(&h, "B-15", BookingEventType::Created).await;
        h.domain
            .inject_failure(DomainError::Poison("bad".into()))
            .await;
        h.processor.process_once(id).await.unwrap();
        let key = crate::domain::dead_letter_key_for(id);
        for (from, to) in [
            (DeadLetterStatus::Open, DeadLetterStatus::Ready),
            (DeadLetterStatus::Ready, DeadLetterStatus::Replaying),
        ] {
            h.dead_letters
                .transition(&key, from, to, DeadLetterUpdate::default())
                .await
                .unwrap();
        }
        // the run completed the event, then died before touching the entry
        h.events
            .transition(id, ProcessStatus::DeadLetter, EventTransition::Claim { at: Utc::now() })
            .await
            .unwrap();
        h.events
            .transition(id, ProcessStatus::Processing, EventTransition::Complete { at: Utc::now() })
            .await
            .unwrap();

        let outcome = h.processor.settle_replay(id, "ops", "abandoned").await.unwrap();
        assert_eq!(outcome, ReplayOutcome::Succeeded);
        let entry = h.dead_letters.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Succeeded);

        let again = h.processor.settle_replay(id, "ops", "abandoned").await;
        assert!(matches!(again, Err(IngestError::ReplayNotReady { .. })));
    }

    #[tokio::test]
    async fn test_replay_requires_replaying_entry() {
        let h = harness();
        let id = accept(&h, "B-9", BookingEventType::Created).await;
        h.domain
            .inject_failure(DomainError::Poison("bad".into()))
            .await;
        h.processor.process_once(id).await.unwrap();

        let result = h.processor.execute_replay(id, "ops").await;
        assert!(matches!(
            result,
            Err(IngestError::ReplayNotReady {
                status: DeadLetterStatus::Open,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_replay_success_and_failure() {
        let h = harness();
        let id = accept(&h, "B-10", BookingEventType::Created).await;
        h.domain
            .inject_failure(DomainError::Poison("bad".into()))
            .await;
        h.processor.process_once(id).await.unwrap();
        let key = crate::domain::dead_letter_key_for(id);

        for (from, to) in [
            (DeadLetterStatus::Open, DeadLetterStatus::Ready),
            (DeadLetterStatus::Ready, DeadLetterStatus::Replaying),
        ] {
            h.dead_letters
                .transition(&key, from, to, DeadLetterUpdate::default())
                .await
                .unwrap();
        }
        h.domain
            .inject_failure(DomainError::Rejected {
                code: "STILL_BAD".into(),
                message: "still bad".into(),
            })
            .await;

        let outcome = h.processor.execute_replay(id, "ops").await.unwrap();
        assert!(matches!(outcome, ReplayOutcome::Failed { .. }));
        let entry = h.dead_letters.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Failed);
        assert_eq!(entry.attempts, 1);
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::DeadLetter);

        for (from, to) in [
            (DeadLetterStatus::Failed, DeadLetterStatus::Ready),
            (DeadLetterStatus::Ready, DeadLetterStatus::Replaying),
        ] {
            h.dead_letters
                .transition(&key, from, to, DeadLetterUpdate::default())
                .await
                .unwrap();
        }
        let outcome = h.processor.execute_replay(id, "ops").await.unwrap();
        assert_eq!(outcome, ReplayOutcome::Succeeded);

        let entry = h.dead_letters.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Succeeded);
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Done);

        let types = audit_types(&h).await;
        assert!(types.contains(&"INGEST_REPLAY_FAILED".to_string()));
        assert!(types.contains(&"INGEST_REPLAY_SUCCEEDED".to_string()));
    }
}
