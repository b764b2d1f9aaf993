//! Windowed queue and processing metrics
//!
//! Point-in-time reads over the event store, dead-letter store and queue.
//! Nothing here takes locks the write path holds for longer than a read.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::slo::{SloEvaluation, SloPolicy};
use crate::infra::{
    CircuitState, DeadLetterRepository, DeadLetterStats, EventRepository, IngestError,
    QueueCounts, Result,
};
use crate::ingest::JobDispatcher;

pub const DEFAULT_WINDOW_MINUTES: i64 = 60;
/// One week
pub const MAX_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// Queue depth plus health of the queue path
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    #[serde(flatten)]
    pub counts: QueueCounts,
    /// False when every event is processed inline
    pub enabled: bool,
    pub connected: bool,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub dead_letter: DeadLetterStats,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTotals {
    pub received: u64,
    pub done: u64,
    /// FAILED plus DEAD_LETTER
    pub failed: u64,
    pub processing: u64,
    pub pending: u64,
    /// DONE plus DEAD_LETTER
    pub terminal: u64,
}

/// Nearest-rank latency percentiles in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub sample_count: usize,
    pub median: Option<i64>,
    pub p95: Option<i64>,
    pub max: Option<i64>,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<i64>) -> Self {
        samples.sort_unstable();
        Self {
            sample_count: samples.len(),
            median: nearest_rank(&samples, 50.0),
            p95: nearest_rank(&samples, 95.0),
            max: samples.last().copied(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub window_minutes: i64,
    pub since: DateTime<Utc>,
    pub totals: ProcessingTotals,
    pub dead_lettered: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub latency: LatencySummary,
}

/// Nearest-rank percentile of an ascending slice
pub fn nearest_rank(sorted: &[i64], percentile: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

pub struct MetricsAggregator {
    events: Arc<dyn EventRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    dispatcher: Arc<JobDispatcher>,
}

impl MetricsAggregator {
    pub fn new(
        events: Arc<dyn EventRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Self {
        Self {
            events,
            dead_letters,
            dispatcher,
        }
    }

    pub fn validate_window(window_minutes: Option<i64>) -> Result<i64> {
        let window = window_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES);
        if !(1..=MAX_WINDOW_MINUTES).contains(&window) {
            return Err(IngestError::Validation(format!(
                "windowMinutes must be between 1 and {MAX_WINDOW_MINUTES}"
            )));
        }
        Ok(window)
    }

    pub async fn queue_metrics(&self) -> Result<QueueMetrics> {
        let circuit_state = self.dispatcher.circuit_state().await;
        let dead_letter = self.dead_letters.stats().await?;

        let (enabled, connected, counts) = match self.dispatcher.queue() {
            Some(queue) => {
                let connected = queue.ping().await.is_ok();
                let counts = if connected {
                    queue.counts().await.unwrap_or_default()
                } else {
                    QueueCounts::default()
                };
                (true, connected, counts)
            }
            None => (false, false, QueueCounts::default()),
        };
        let healthy = !enabled || (connected && circuit_state != CircuitState::Open);

        Ok(QueueMetrics {
            counts,
            enabled,
            connected,
            healthy,
            circuit_state,
            dead_letter,
            captured_at: Utc::now(),
        })
    }

    pub async fn processing_metrics(&self, window_minutes: Option<i64>) -> Result<ProcessingMetrics> {
        let window = Self::validate_window(window_minutes)?;
        let since = Utc::now() - Duration::minutes(window);

        let counts = self.events.status_counts_since(since).await?;
        let latencies = self.events.latencies_since(since).await?;

        let terminal = counts.done + counts.dead_letter;
        let rate = |n: u64| {
            if terminal == 0 {
                0.0
            } else {
                n as f64 / terminal as f64
            }
        };

        Ok(ProcessingMetrics {
            window_minutes: window,
            since,
            totals: ProcessingTotals {
                received: counts.total(),
                done: counts.done,
                failed: counts.failed + counts.dead_letter,
                processing: counts.processing,
                pending: counts.pending,
                terminal,
            },
            dead_lettered: counts.dead_letter,
            success_rate: rate(counts.done),
            failure_rate: rate(counts.dead_letter),
            latency: LatencySummary::from_samples(latencies),
        })
    }

    /// Evaluate `policy` over the window, counting dead-letter entries created in it
    pub async fn evaluate_slo(
        &self,
        policy: &SloPolicy,
        window_minutes: Option<i64>,
    ) -> Result<SloEvaluation> {
        let metrics = self.processing_metrics(window_minutes).await?;
        let dlq_created = self
            .dead_letters
            .count_created_since(metrics.since)
            .await?;
        Ok(policy.evaluate(&metrics, dlq_created))
    }
}
