//! Guarded hand-off of jobs to the ingest queue
//!
//! Enqueue calls are retried in place on transient errors and run through
//! the queue circuit breaker. A `false` from [`JobDispatcher::dispatch`]
//! tells the caller to fall back to inline processing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::infra::{
    is_transient, CircuitBreaker, CircuitBreakerError, CircuitState, JobKind, JobQueue, Retry,
    RetryPolicy,
};
use crate::metrics::{metric_names, MetricsRegistry};

pub struct JobDispatcher {
    queue: Option<Arc<dyn JobQueue>>,
    breaker: Arc<CircuitBreaker>,
    retry: Retry,
    metrics: Arc<MetricsRegistry>,
}

impl JobDispatcher {
    /// `queue` is `None` when the queue is disabled and everything runs inline.
    pub fn new(
        queue: Option<Arc<dyn JobQueue>>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            queue,
            breaker,
            retry: Retry::new(RetryPolicy::fast()),
            metrics,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Retry::new(policy);
        self
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.queue.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    /// Enqueue a job for `event_id`. Returns false when the caller should
    /// run the work inline instead.
    pub async fn dispatch(&self, event_id: Uuid, kind: JobKind) -> bool {
        let Some(queue) = self.queue.as_ref() else {
            return false;
        };

        let attempt = async {
            let (result, attempts) = self
                .retry
                .run_with_predicate(
                    || queue.enqueue(event_id, kind, Duration::ZERO),
                    is_transient,
                )
                .await;
            if attempts > 1 {
                debug!(%event_id, attempts, "Enqueue needed retries");
            }
            result
        };

        match self.breaker.call(attempt).await {
            Ok(job_id) => {
                debug!(%event_id, %job_id, kind = kind.as_str(), "Job enqueued");
                true
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                debug!(%event_id, "Queue circuit open, running inline");
                false
            }
            Err(CircuitBreakerError::ServiceError(e)) => {
                self.metrics.inc_counter(metric_names::ENQUEUE_FAILURES).await;
                warn!(%event_id, error = %e, "Enqueue failed, running inline");
                false
            }
        }
    }
}
