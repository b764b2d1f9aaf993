//! In-memory job queue with visibility leases

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::infra::{IngestError, Job, JobKind, JobQueue, QueueCounts, Result};

#[derive(Debug, Clone)]
struct QueuedJob {
    job: Job,
    available_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
}

impl QueuedJob {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }

    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        !self.is_active(now) && self.available_at <= now
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, QueuedJob>,
    completed: u64,
    failed: u64,
    paused: bool,
}

/// Job queue held in process memory.
///
/// Finished jobs are dropped and only counted. A lease that expires without
/// an ack makes the job visible again.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn take_leased(state: &mut QueueState, job_id: Uuid) -> Result<QueuedJob> {
    state
        .jobs
        .remove(&job_id)
        .ok_or_else(|| IngestError::Internal(format!("job {job_id} is not queued")))
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, event_id: Uuid, kind: JobKind, delay: Duration) -> Result<Uuid> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            event_id,
            kind,
            deliveries: 0,
            enqueued_at: now,
        };
        let id = job.id;
        self.state.lock().await.jobs.insert(
            id,
            QueuedJob {
                job,
                available_at: now + to_chrono(delay),
                leased_until: None,
            },
        );
        Ok(id)
    }

    async fn dequeue(&self, _worker_id: &str, visibility: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.paused {
            return Ok(None);
        }

        let next = state
            .jobs
            .values_mut()
            .filter(|q| q.is_visible(now))
            .min_by_key(|q| q.available_at);

        Ok(next.map(|queued| {
            queued.leased_until = Some(now + to_chrono(visibility));
            queued.job.deliveries += 1;
            queued.job.clone()
        }))
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        take_leased(&mut state, job_id)?;
        state.completed += 1;
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let queued = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| IngestError::Internal(format!("job {job_id} is not queued")))?;
        queued.leased_until = None;
        queued.available_at = Utc::now() + to_chrono(delay);
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let queued = take_leased(&mut state, job_id)?;
        state.failed += 1;
        tracing::warn!(job_id = %job_id, event_id = %queued.job.event_id, error, "Job failed");
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut counts = QueueCounts {
            completed: state.completed,
            failed: state.failed,
            ..Default::default()
        };
        for queued in state.jobs.values() {
            if queued.is_active(now) {
                counts.active += 1;
            } else if queued.available_at > now {
                counts.delayed += 1;
            } else if state.paused {
                counts.paused += 1;
            } else {
                counts.waiting += 1;
            }
        }
        Ok(counts)
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        self.state.lock().await.paused = paused;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
