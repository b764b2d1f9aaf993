//! Trait definitions for the ingestion core's storage and capability seams

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    ApplyOutcome, AuditEvent, AuditQuery, BookingRecord, DeadLetterEntry, DeadLetterReason,
    DeadLetterStatus, DeadLetterUpdate, DomainError, EventTransition, IngestEvent, ProcessStatus,
};

use super::Result;

/// Durable store of ingest events and their idempotency records.
///
/// Invariant: an idempotency key maps to exactly one event id, forever.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert `event` together with its idempotency record unless the key is
    /// already taken. Returns the stored event and whether it was created.
    async fn insert_if_absent(&self, event: IngestEvent) -> Result<(IngestEvent, bool)>;

    async fn find_by_id(&self, event_id: Uuid) -> Result<Option<IngestEvent>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IngestEvent>>;

    /// Apply `transition` if the event is currently in `expected`.
    ///
    /// Fails with `EventStatusConflict` when another writer moved it first.
    async fn transition(
        &self,
        event_id: Uuid,
        expected: ProcessStatus,
        transition: EventTransition,
    ) -> Result<IngestEvent>;

    /// Status counts over events received at or after `since`.
    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<EventStatusCounts>;

    /// Latencies of events whose first terminal status fell at or after `since`.
    async fn latencies_since(&self, since: DateTime<Utc>) -> Result<Vec<i64>>;

    /// Events in `status`, oldest first.
    async fn list_by_status(&self, status: ProcessStatus, limit: usize)
        -> Result<Vec<IngestEvent>>;

    async fn ping(&self) -> Result<()>;
}

/// Per-status event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl EventStatusCounts {
    pub fn add(&mut self, status: ProcessStatus) {
        match status {
            ProcessStatus::Pending => self.pending += 1,
            ProcessStatus::Processing => self.processing += 1,
            ProcessStatus::Done => self.done += 1,
            ProcessStatus::Failed => self.failed += 1,
            ProcessStatus::DeadLetter => self.dead_letter += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.done + self.failed + self.dead_letter
    }
}

/// Store of dead-letter entries; one per dead-lettered event.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Insert `entry` unless one already exists for its key.
    async fn insert_if_absent(&self, entry: DeadLetterEntry) -> Result<(DeadLetterEntry, bool)>;

    async fn find_by_key(&self, key: &str) -> Result<Option<DeadLetterEntry>>;

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>>;

    /// Move the entry to `to` if it is currently in `expected`.
    ///
    /// State-machine legality is checked by the caller; this is the CAS.
    async fn transition(
        &self,
        key: &str,
        expected: DeadLetterStatus,
        to: DeadLetterStatus,
        update: DeadLetterUpdate,
    ) -> Result<DeadLetterEntry>;

    /// Rewrite the reason of an entry that is still in `expected`.
    async fn update_reason(
        &self,
        key: &str,
        expected: DeadLetterStatus,
        reason: DeadLetterReason,
    ) -> Result<DeadLetterEntry>;

    /// Entries, newest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>>;

    async fn stats(&self) -> Result<DeadLetterStats>;

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64>;
}

/// Statistics about the dead-letter store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub oldest_open: Option<DateTime<Utc>>,
}

/// Append-only audit log
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;

    /// Matching events, newest first, at most `query.limit`.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    async fn count(&self) -> Result<u64>;
}

/// Seen-nonce set backing replay protection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Record `nonce` until `expires_at`. Returns false if it was already
    /// recorded and has not expired.
    async fn check_and_record(&self, nonce: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Drop expired nonces; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Named single-writer leases for periodic jobs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire or renew `name` for `holder`. Returns false if another holder
    /// owns an unexpired lease.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

/// The authoritative booking domain the processor applies events to.
///
/// Application is idempotent per event id.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BookingDomain: Send + Sync {
    async fn apply(&self, event: &IngestEvent) -> std::result::Result<ApplyOutcome, DomainError>;

    async fn find(
        &self,
        external_booking_ref: &str,
    ) -> std::result::Result<Option<BookingRecord>, DomainError>;

    async fn is_applied(&self, event_id: Uuid) -> std::result::Result<bool, DomainError>;
}

/// Kind of work a queued job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Process,
    Replay,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "PROCESS",
            Self::Replay => "REPLAY",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PROCESS" => Ok(Self::Process),
            "REPLAY" => Ok(Self::Replay),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A job leased to one worker
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub event_id: Uuid,
    pub kind: JobKind,
    /// Deliveries so far, including this one.
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue depth by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

/// Work queue feeding the event processor.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job that becomes visible after `delay`.
    async fn enqueue(&self, event_id: Uuid, kind: JobKind, delay: Duration) -> Result<Uuid>;

    /// Lease the next visible job to `worker_id` for `visibility`.
    ///
    /// Returns `None` when nothing is due or the queue is paused.
    async fn dequeue(&self, worker_id: &str, visibility: Duration) -> Result<Option<Job>>;

    /// Mark a leased job completed.
    async fn ack(&self, job_id: Uuid) -> Result<()>;

    /// Return a leased job to the queue, visible again after `delay`.
    async fn nack(&self, job_id: Uuid, delay: Duration) -> Result<()>;

    /// Mark a leased job permanently failed.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    async fn counts(&self) -> Result<QueueCounts>;

    async fn set_paused(&self, paused: bool) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
