//! Metrics for the ingestion core
//!
//! Two layers:
//! - [`MetricsRegistry`]: process-local counters, gauges and latency
//!   histograms, exported as Prometheus text.
//! - [`aggregator`] and [`slo`]: windowed views computed from the event
//!   store and queue, used for release gating.

pub mod aggregator;
pub mod slo;

pub use aggregator::{
    nearest_rank, LatencySummary, MetricsAggregator, ProcessingMetrics, ProcessingTotals,
    QueueMetrics,
};
pub use slo::{SloCheck, SloEvaluation, SloPolicy};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

const PROMETHEUS_PREFIX: &str = "booking_ingest";

/// Process-local metrics registry
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().await.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }

        let mut counters = self.counters.write().await;
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().await.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }

        let mut gauges = self.gauges.write().await;
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .store(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .await
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .await
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a latency observation in seconds
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        if let Some(histogram) = self.histograms.read().await.get(name) {
            histogram.observe(value);
            return;
        }

        let mut histograms = self.histograms.write().await;
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(value);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let counters: BTreeMap<String, u64> = self
            .counters
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauges: BTreeMap<String, u64> = self
            .gauges
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let histograms: BTreeMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        serde_json::json!({
            "uptimeSeconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Export metrics in Prometheus text format
    pub async fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "# HELP {p}_uptime_seconds Time since service start\n# TYPE {p}_uptime_seconds gauge\n{p}_uptime_seconds {}\n",
            self.uptime_seconds(),
            p = PROMETHEUS_PREFIX
        ));

        for (name, counter) in self.counters.read().await.iter() {
            let name = prometheus_name(name);
            output.push_str(&format!(
                "# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        for (name, gauge) in self.gauges.read().await.iter() {
            let name = prometheus_name(name);
            output.push_str(&format!(
                "# TYPE {name} gauge\n{name} {}\n",
                gauge.load(Ordering::Relaxed)
            ));
        }

        for (name, histogram) in self.histograms.read().await.iter() {
            output.push_str(&histogram.to_prometheus(&prometheus_name(name)));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let value = value.max(0.0);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bucket| value <= *bucket) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": counts,
            "sum": self.sum_seconds(),
            "count": self.count(),
        })
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = format!("# TYPE {name} histogram\n");

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!("{name}_bucket{{le=\"{bucket}\"}} {cumulative}\n"));
        }

        output.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        output.push_str(&format!("{name}_sum {}\n", self.sum_seconds()));
        output.push_str(&format!("{name}_count {}\n", self.count()));
        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Latency buckets in seconds
        Self::new(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ])
    }
}

/// Metric names recorded by the services
pub mod metric_names {
    pub const EVENTS_RECEIVED: &str = "booking_ingest.events.received";
    pub const EVENTS_DUPLICATE: &str = "booking_ingest.events.duplicate";
    pub const EVENTS_REJECTED: &str = "booking_ingest.events.rejected";
    pub const EVENTS_QUEUED: &str = "booking_ingest.events.queued";
    pub const EVENTS_INLINE: &str = "booking_ingest.events.inline";
    pub const EVENTS_PROCESSED: &str = "booking_ingest.events.processed";
    pub const EVENTS_RETRIED: &str = "booking_ingest.events.retried";
    pub const EVENTS_DEAD_LETTERED: &str = "booking_ingest.events.dead_lettered";
    pub const EVENTS_FORCE_FAILED: &str = "booking_ingest.events.force_failed";

    pub const SIGNATURE_FAILURES: &str = "booking_ingest.signature.failures";

    pub const REPLAYS_REQUESTED: &str = "booking_ingest.replays.requested";
    pub const REPLAYS_SUCCEEDED: &str = "booking_ingest.replays.succeeded";
    pub const REPLAYS_FAILED: &str = "booking_ingest.replays.failed";

    pub const RECONCILIATION_RUNS: &str = "booking_ingest.reconciliation.runs";
    pub const RECONCILIATION_MISMATCHES: &str = "booking_ingest.reconciliation.mismatches";

    pub const ENQUEUE_FAILURES: &str = "booking_ingest.queue.enqueue_failures";
    pub const QUEUE_WAITING: &str = "booking_ingest.queue.waiting";
    pub const QUEUE_ACTIVE: &str = "booking_ingest.queue.active";
    pub const QUEUE_DELAYED: &str = "booking_ingest.queue.delayed";
    pub const DEAD_LETTER_TOTAL: &str = "booking_ingest.dead_letter.total";

    pub const PROCESSING_LATENCY: &str = "booking_ingest.processing.latency_seconds";
    pub const INGEST_LATENCY: &str = "booking_ingest.ingest.latency_seconds";
}

/// Time an async operation into a histogram
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    metrics
        .observe_histogram(metric_name, start.elapsed().as_secs_f64())
        .await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::EVENTS_RECEIVED).await;
        registry.inc_counter(metric_names::EVENTS_RECEIVED).await;
        registry.add_counter(metric_names::EVENTS_RECEIVED, 5).await;

        assert_eq!(registry.get_counter(metric_names::EVENTS_RECEIVED).await, 7);
        assert_eq!(registry.get_counter("missing").await, 0);
    }

    #[tokio::test]
    async fn test_gauge() {
        let registry = MetricsRegistry::new();

        registry.set_gauge("queue.waiting", 100).await;
        registry.set_gauge("queue.waiting", 50).await;
        assert_eq!(registry.get_gauge("queue.waiting").await, 50);
    }

    #[tokio::test]
    async fn test_histogram_buckets() {
        let registry = MetricsRegistry::new();

        let value = timed(&registry, metric_names::INGEST_LATENCY, async { 3 }).await;
        assert_eq!(value, 3);
        registry
            .observe_histogram(metric_names::INGEST_LATENCY, 0.2)
            .await;
        registry
            .observe_histogram(metric_names::INGEST_LATENCY, 120.0)
            .await;

        let json = registry.to_json().await;
        let latency = &json["histograms"][metric_names::INGEST_LATENCY];
        assert_eq!(latency["count"], 3);
    }

    #[tokio::test]
    async fn test_prometheus_format() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::EVENTS_PROCESSED).await;
        registry.set_gauge("booking_ingest.queue.waiting", 42).await;
        registry
            .observe_histogram(metric_names::PROCESSING_LATENCY, 0.02)
            .await;

        let text = registry.to_prometheus().await;
        assert!(text.contains("booking_ingest_events_processed 1"));
        assert!(text.contains("booking_ingest_queue_waiting 42"));
        assert!(text.contains("booking_ingest_processing_latency_seconds_bucket{le=\"0.025\"} 1"));
        assert!(text.contains("booking_ingest_processing_latency_seconds_count 1"));
    }
}
