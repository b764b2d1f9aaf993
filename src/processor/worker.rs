//! Queue worker pool
//!
//! `concurrency` tasks lease jobs from the [`JobQueue`] and hand them to the
//! [`EventProcessor`]. Work lost outside the queue is picked up by the
//! [`StallSweeper`](super::StallSweeper).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{EventProcessor, ProcessOutcome, ReplayOutcome};
use crate::domain::{ProcessStatus, SYSTEM_PROCESSOR_ACTOR};
use crate::infra::{
    is_transient, IngestError, Job, JobKind, JobQueue, Result, ShutdownCoordinator, ShutdownSignal,
};

/// Slack added when waiting out another run's claim
const CLAIM_RECHECK_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Lease length for a dequeued job
    pub visibility_timeout: Duration,
    /// Deliveries after which a job erroring on infrastructure is failed
    pub max_deliveries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(60),
            max_deliveries: 10,
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<EventProcessor>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<EventProcessor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Spawn the workers, registering them for shutdown
    pub async fn start(self: Arc<Self>, shutdown: &ShutdownCoordinator) {
        for n in 0..self.config.concurrency.max(1) {
            let worker_id = format!("worker-{n}");
            let pool = self.clone();
            let signal = shutdown.signal();
            let handle = tokio::spawn(async move { pool.run_worker(worker_id, signal).await });
            shutdown.track(format!("ingest-worker-{n}"), handle).await;
        }

        info!(
            concurrency = self.config.concurrency.max(1),
            "Ingest worker pool started"
        );
    }

    async fn run_worker(&self, worker_id: String, signal: ShutdownSignal) {
        debug!(worker = %worker_id, "Worker started");
        while !signal.is_shutdown() {
            match self.run_once(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(worker = %worker_id, error = %e, "Worker poll failed"),
            }
            tokio::select! {
                _ = signal.wait() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker = %worker_id, "Worker stopped");
    }

    /// Lease and handle one job. Returns false when nothing was due.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool> {
        let Some(job) = self
            .queue
            .dequeue(worker_id, self.config.visibility_timeout)
            .await?
        else {
            return Ok(false);
        };

        debug!(
            worker = %worker_id,
            job_id = %job.id,
            event_id = %job.event_id,
            kind = job.kind.as_str(),
            deliveries = job.deliveries,
            "Job leased"
        );
        self.handle(job).await?;
        Ok(true)
    }

    async fn handle(&self, job: Job) -> Result<()> {
        let result = match job.kind {
            JobKind::Process => self
                .processor
                .process_once(job.event_id)
                .await
                .map(Some),
            JobKind::Replay => self
                .processor
                .execute_replay(job.event_id, SYSTEM_PROCESSOR_ACTOR)
                .await
                .map(|outcome| {
                    if let ReplayOutcome::Failed { error } = outcome {
                        debug!(event_id = %job.event_id, %error, "Queued replay failed");
                    }
                    None
                }),
        };

        match result {
            Ok(Some(ProcessOutcome::RetryScheduled { delay, .. })) => {
                self.queue.nack(job.id, delay).await
            }
            Ok(Some(ProcessOutcome::Skipped {
                status: ProcessStatus::Processing,
            })) => {
                // Another run holds the claim; look again once it could be stale.
                let wait = self
                    .processor
                    .claim_expires_in(job.event_id)
                    .await?
                    .unwrap_or(Duration::ZERO);
                debug!(
                    job_id = %job.id,
                    event_id = %job.event_id,
                    wait_ms = wait.as_millis() as u64,
                    "Event claimed elsewhere, job deferred"
                );
                self.queue.nack(job.id, wait + CLAIM_RECHECK_MARGIN).await
            }
            Ok(_) => self.queue.ack(job.id).await,
            Err(
                e @ (IngestError::EventNotFound(_)
                | IngestError::DeadLetterNotFound(_)
                | IngestError::ReplayNotReady { .. }),
            ) => {
                warn!(job_id = %job.id, error = %e, "Dropping job");
                self.queue.fail(job.id, &e.to_string()).await
            }
            Err(e) if is_transient(&e) && job.deliveries < self.config.max_deliveries => {
                let delay = self
                    .processor
                    .retry_policy()
                    .delay_after_attempt(job.deliveries);
                warn!(job_id = %job.id, error = %e, delay_ms = delay.as_millis() as u64, "Job hit a transient error");
                self.queue.nack(job.id, delay).await
            }
            Err(e) => {
                error!(job_id = %job.id, event_id = %job.event_id, error = %e, "Job failed");
                if job.kind == JobKind::Replay {
                    self.settle_failed_replay(&job, &e).await;
                }
                self.queue.fail(job.id, &e.to_string()).await
            }
        }
    }

    /// A failed replay job must not leave its entry `REPLAYING`.
    async fn settle_failed_replay(&self, job: &Job, error: &IngestError) {
        match self
            .processor
            .settle_replay(job.event_id, SYSTEM_PROCESSOR_ACTOR, &error.to_string())
            .await
        {
            Ok(outcome) => info!(
                job_id = %job.id,
                event_id = %job.event_id,
                ?outcome,
                "Settled replay of failed job"
            ),
            Err(IngestError::ReplayNotReady { status, .. }) => {
                debug!(event_id = %job.event_id, %status, "Replay already settled")
            }
            Err(e) => warn!(
                job_id = %job.id,
                event_id = %job.event_id,
                error = %e,
                "Could not settle replay of failed job"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        fixtures, BookingEventType, DeadLetterEntry, DeadLetterReason, DeadLetterStatus,
        DeadLetterUpdate, DomainError, EventTransition, IngestEvent,
    };
    use crate::infra::memory::{
        InMemoryAuditLog, InMemoryBookingDomain, InMemoryDeadLetterStore, InMemoryEventStore,
        InMemoryJobQueue,
    };
    use crate::infra::{DeadLetterRepository, DeadLetterStats, EventRepository, RetryPolicy};
    use crate::metrics::MetricsRegistry;
    use crate::processor::ProcessorConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Dead-letter store whose lookups by event id fail a set number of times
    struct FlakyDeadLetters {
        inner: Arc<InMemoryDeadLetterStore>,
        lookup_failures: AtomicU32,
    }

    #[async_trait]
    impl DeadLetterRepository for FlakyDeadLetters {
        async fn insert_if_absent(&self, entry: DeadLetterEntry) -> Result<(DeadLetterEntry, bool)> {
            self.inner.insert_if_absent(entry).await
        }

        async fn find_by_key(&self, key: &str) -> Result<Option<DeadLetterEntry>> {
            self.inner.find_by_key(key).await
        }

        async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>> {
            let failing = self
                .lookup_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(IngestError::Timeout("dead-letter store".into()));
            }
            self.inner.find_by_event_id(event_id).await
        }

        async fn transition(
            &self,
            key: &str,
            expected: DeadLetterStatus,
            to: DeadLetterStatus,
            update: DeadLetterUpdate,
        ) -> Result<DeadLetterEntry> {
            self.inner.transition(key, expected, to, update).await
        }

        async fn update_reason(
            &self,
            key: &str,
            expected: DeadLetterStatus,
            reason: DeadLetterReason,
        ) -> Result<DeadLetterEntry> {
            self.inner.update_reason(key, expected, reason).await
        }

        async fn list(
            &self,
            status: Option<DeadLetterStatus>,
            limit: usize,
        ) -> Result<Vec<DeadLetterEntry>> {
            self.inner.list(status, limit).await
        }

        async fn stats(&self) -> Result<DeadLetterStats> {
            self.inner.stats().await
        }

        async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64> {
            self.inner.count_created_since(since).await
        }
    }

    struct Harness {
        events: Arc<InMemoryEventStore>,
        dead_letters: Arc<FlakyDeadLetters>,
        queue: Arc<InMemoryJobQueue>,
        domain: Arc<InMemoryBookingDomain>,
        processor: Arc<EventProcessor>,
        pool: Arc<WorkerPool>,
    }

    fn harness(config: WorkerPoolConfig) -> Harness {
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(FlakyDeadLetters {
            inner: Arc::new(InMemoryDeadLetterStore::new()),
            lookup_failures: AtomicU32::new(0),
        });
        let queue = Arc::new(InMemoryJobQueue::new());
        let domain = Arc::new(InMemoryBookingDomain::new());
        let processor = Arc::new(EventProcessor::new(
            events.clone(),
            dead_letters.clone(),
            Arc::new(InMemoryAuditLog::new()),
            domain.clone(),
            Arc::new(MetricsRegistry::new()),
            ProcessorConfig {
                retry: RetryPolicy::fast().with_initial_delay(Duration::ZERO),
                ..ProcessorConfig::default()
            },
        ));
        let pool = Arc::new(WorkerPool::new(queue.clone(), processor.clone(), config));
        Harness {
            events,
            dead_letters,
            queue,
            domain,
            processor,
            pool,
        }
    }

    async fn accept(h: &Harness, reference: &str) -> Uuid {
        let (event, _) = h
            .events
            .insert_if_absent(IngestEvent::new(
                reference,
                fixtures::payload(reference, BookingEventType::Created),
            ))
            .await
            .unwrap();
        event.event_id
    }

    #[tokio::test]
    async fn test_job_is_processed_and_acked() {
        let h = harness(WorkerPoolConfig::default());
        let id = accept(&h, "W-1").await;
        h.queue
            .enqueue(id, JobKind::Process, Duration::ZERO)
            .await
            .unwrap();

        assert!(h.pool.run_once("w").await.unwrap());
        assert!(!h.pool.run_once("w").await.unwrap());

        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Done);
        let counts = h.queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_retry_is_nacked_back_to_queue() {
        let h = harness(WorkerPoolConfig::default());
        let id = accept(&h, "W-2").await;
        h.domain
            .inject_failure(DomainError::Unavailable("down".into()))
            .await;
        h.queue
            .enqueue(id, JobKind::Process, Duration::ZERO)
            .await
            .unwrap();

        assert!(h.pool.run_once("w").await.unwrap());
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Failed);

        // zero backoff, so the redelivery is due immediately
        assert!(h.pool.run_once("w").await.unwrap());
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Done);
    }

    #[tokio::test]
    async fn test_missing_event_fails_job() {
        let h = harness(WorkerPoolConfig::default());
        h.queue
            .enqueue(Uuid::new_v4(), JobKind::Process, Duration::ZERO)
            .await
            .unwrap();

        assert!(h.pool.run_once("w").await.unwrap());
        assert_eq!(h.queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_job_for_claimed_event_is_deferred_not_acked() {
        let h = harness(WorkerPoolConfig::default());
        let id = accept(&h, "W-5").await;
        h.events
            .transition(id, ProcessStatus::Pending, EventTransition::Claim { at: Utc::now() })
            .await
            .unwrap();
        h.queue
            .enqueue(id, JobKind::Process, Duration::ZERO)
            .await
            .unwrap();

        assert!(h.pool.run_once("w").await.unwrap());

        let counts = h.queue.counts().await.unwrap();
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.delayed, 1);
        assert!(!h.pool.run_once("w").await.unwrap());
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::Processing);
        assert_eq!(h.domain.applied_count().await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_replay_job_settles_entry() {
        let h = harness(WorkerPoolConfig {
            max_deliveries: 1,
            ..WorkerPoolConfig::default()
        });
        let id = accept(&h, "W-6").await;
        h.domain
            .inject_failure(DomainError::Poison("garbled".into()))
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
        h.dead_letters.lookup_failures.store(1, Ordering::SeqCst);
        h.queue
            .enqueue(id, JobKind::Replay, Duration::ZERO)
            .await
            .unwrap();

        assert!(h.pool.run_once("w").await.unwrap());

        assert_eq!(h.queue.counts().await.unwrap().failed, 1);
        let entry = h.dead_letters.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Failed);
        assert!(entry
            .reason_detail
            .as_deref()
            .is_some_and(|detail| detail.contains("timed out")));
        let event = h.events.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.process_status, ProcessStatus::DeadLetter);
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let h = harness(WorkerPoolConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
            ..WorkerPoolConfig::default()
        });
        let id = accept(&h, "W-4").await;
        h.queue
            .enqueue(id, JobKind::Process, Duration::ZERO)
            .await
            .unwrap();

        let shutdown = ShutdownCoordinator::new();
        h.pool.clone().start(&shutdown).await;

        let mut done = false;
        for _ in 0..100 {
            let event = h.events.find_by_id(id).await.unwrap().unwrap();
            if event.process_status == ProcessStatus::Done {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(done);

        tokio::time::timeout(
            Duration::from_secs(2),
            shutdown.graceful_shutdown(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    }
}
