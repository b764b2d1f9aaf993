//! Release-gating SLO evaluation over processing metrics

use serde::{Deserialize, Serialize};

use super::aggregator::ProcessingMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SloPolicy {
    /// Below this many received events the evaluation is skipped
    pub min_received: u64,
    pub min_success_rate: f64,
    pub max_median_ms: i64,
    pub max_p95_ms: i64,
    pub max_dlq_growth_per_hour: f64,
}

impl Default for SloPolicy {
    fn default() -> Self {
        Self {
            min_received: 20,
            min_success_rate: 0.99,
            max_median_ms: 2_000,
            max_p95_ms: 10_000,
            max_dlq_growth_per_hour: 5.0,
        }
    }
}

/// One threshold comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SloCheck {
    pub name: &'static str,
    pub actual: Option<f64>,
    pub threshold: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SloEvaluation {
    pub window_minutes: i64,
    pub received: u64,
    /// True when there was too little traffic to judge
    pub skipped: bool,
    pub passed: bool,
    pub dlq_created: u64,
    pub dlq_growth_per_hour: f64,
    pub checks: Vec<SloCheck>,
    pub policy: SloPolicy,
}

impl SloPolicy {
    pub fn evaluate(&self, metrics: &ProcessingMetrics, dlq_created: u64) -> SloEvaluation {
        let hours = metrics.window_minutes as f64 / 60.0;
        let dlq_growth_per_hour = if hours > 0.0 {
            dlq_created as f64 / hours
        } else {
            dlq_created as f64
        };

        let received = metrics.totals.received;
        let skipped = received < self.min_received;

        // Latency checks pass vacuously without samples.
        let ceiling = |name, actual: Option<i64>, max: i64| SloCheck {
            name,
            actual: actual.map(|v| v as f64),
            threshold: max as f64,
            passed: actual.map_or(true, |v| v <= max),
        };

        let checks = vec![
            SloCheck {
                name: "successRate",
                actual: Some(metrics.success_rate),
                threshold: self.min_success_rate,
                passed: metrics.totals.terminal == 0
                    || metrics.success_rate >= self.min_success_rate,
            },
            ceiling("medianMs", metrics.latency.median, self.max_median_ms),
            ceiling("p95Ms", metrics.latency.p95, self.max_p95_ms),
            SloCheck {
                name: "dlqGrowthPerHour",
                actual: Some(dlq_growth_per_hour),
                threshold: self.max_dlq_growth_per_hour,
                passed: dlq_growth_per_hour <= self.max_dlq_growth_per_hour,
            },
        ];

        let passed = skipped || checks.iter().all(|c| c.passed);

        SloEvaluation {
            window_minutes: metrics.window_minutes,
            received,
            skipped,
            passed,
            dlq_created,
            dlq_growth_per_hour,
            checks,
            policy: self.clone(),
        }
    }
}
