//! Stall sweeper
//!
//! Periodically re-drives work that no live run owns any more:
//!
//! - `PENDING` events older than `stall_after`, and `FAILED` events whose
//!   retry is overdue by as much, e.g. when a process died between
//!   accepting an event and enqueueing it
//! - `PROCESSING` events whose claim outlived the processor's stale window
//! - `REPLAYING` dead-letter entries untouched for the same window, which
//!   are settled through [`EventProcessor::settle_replay`]
//!
//! Events go back through the [`JobDispatcher`]. Without a queue, or with
//! its breaker open, they are processed on a spawned task instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::EventProcessor;
use crate::domain::{DeadLetterStatus, ProcessStatus, SYSTEM_PROCESSOR_ACTOR};
use crate::infra::{
    DeadLetterRepository, EventRepository, IngestError, JobKind, Result, ShutdownCoordinator,
    ShutdownSignal,
};
use crate::ingest::JobDispatcher;

const ABANDONED_REPLAY: &str = "replay abandoned before completion";

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// PENDING or overdue FAILED events older than this are re-driven
    pub stall_after: Duration,
    /// Rows examined per status on each pass
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stall_after: Duration::from_secs(120),
            batch_size: 100,
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub redriven: usize,
    pub replays_settled: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.redriven == 0 && self.replays_settled == 0
    }
}

pub struct StallSweeper {
    events: Arc<dyn EventRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    processor: Arc<EventProcessor>,
    dispatcher: Arc<JobDispatcher>,
    config: SweeperConfig,
}

impl StallSweeper {
    pub fn new(
        events: Arc<dyn EventRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        processor: Arc<EventProcessor>,
        dispatcher: Arc<JobDispatcher>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            events,
            dead_letters,
            processor,
            dispatcher,
            config,
        }
    }

    /// Spawn the sweep loop, registering it for shutdown
    pub async fn start(self: Arc<Self>, shutdown: &ShutdownCoordinator) {
        let sweeper = self.clone();
        let signal = shutdown.signal();
        let handle = tokio::spawn(async move { sweeper.run(signal).await });
        shutdown.track("stall-sweeper", handle).await;
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Stall sweeper started"
        );
    }

    async fn run(&self, signal: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            match self.sweep().await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => info!(
                    redriven = report.redriven,
                    replays_settled = report.replays_settled,
                    "Swept stalled work"
                ),
                Err(e) => warn!(error = %e, "Stall sweep failed"),
            }
        }
    }

    /// One pass over stalled events and abandoned replays.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let replays_settled = self.settle_abandoned_replays().await?;

        let stall_after = chrono::Duration::from_std(self.config.stall_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let cutoff = Utc::now() - stall_after;
        let limit = self.config.batch_size.max(1);
        let mut stalled = Vec::new();

        for event in self.events.list_by_status(ProcessStatus::Pending, limit).await? {
            if event.updated_at < cutoff {
                stalled.push(event.event_id);
            }
        }
        for event in self.events.list_by_status(ProcessStatus::Failed, limit).await? {
            if event.next_attempt_at.map_or(true, |at| at < cutoff) {
                stalled.push(event.event_id);
            }
        }
        for event in self
            .events
            .list_by_status(ProcessStatus::Processing, limit)
            .await?
        {
            if !self.processor.is_stale(event.updated_at) {
                continue;
            }
            // Replay claims are released by settling the entry.
            if self.replay_in_progress(event.event_id).await? {
                continue;
            }
            stalled.push(event.event_id);
        }

        let redriven = stalled.len();
        for event_id in stalled {
            self.redrive(event_id).await;
        }

        Ok(SweepReport {
            redriven,
            replays_settled,
        })
    }

    async fn settle_abandoned_replays(&self) -> Result<usize> {
        let entries = self
            .dead_letters
            .list(Some(DeadLetterStatus::Replaying), self.config.batch_size.max(1))
            .await?;

        let mut settled = 0;
        for entry in entries {
            if !self.processor.is_stale(entry.updated_at) {
                continue;
            }
            match self
                .processor
                .settle_replay(entry.event_id, SYSTEM_PROCESSOR_ACTOR, ABANDONED_REPLAY)
                .await
            {
                Ok(outcome) => {
                    info!(
                        dead_letter_key = %entry.dead_letter_key,
                        ?outcome,
                        "Settled abandoned replay"
                    );
                    settled += 1;
                }
                Err(e) if e.is_conflict() || matches!(e, IngestError::ReplayNotReady { .. }) => {
                    debug!(dead_letter_key = %entry.dead_letter_key, error = %e, "Replay settled elsewhere");
                }
                Err(e) => {
                    warn!(dead_letter_key = %entry.dead_letter_key, error = %e, "Could not settle replay")
                }
            }
        }
        Ok(settled)
    }

    async fn replay_in_progress(&self, event_id: Uuid) -> Result<bool> {
        Ok(self
            .dead_letters
            .find_by_event_id(event_id)
            .await?
            .is_some_and(|entry| entry.status == DeadLetterStatus::Replaying))
    }

    async fn redrive(&self, event_id: Uuid) {
        if self.dispatcher.dispatch(event_id, JobKind::Process).await {
            debug!(%event_id, "Stalled event re-enqueued");
            return;
        }
        match self.processor.clone().spawn_inline(event_id).await {
            Ok(Ok(outcome)) => {
                debug!(%event_id, status = %outcome.status(), "Stalled event processed inline")
            }
            Ok(Err(e)) => warn!(%event_id, error = %e, "Stalled event processing failed"),
            Err(e) => error!(%event_id, error = %e, "Stalled event task failed"),
        }
    }
}
