//! In-memory booking domain

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{next_booking_state, ApplyOutcome, BookingRecord, DomainError, IngestEvent};
use crate::infra::BookingDomain;

#[derive(Default)]
struct BookingState {
    records: HashMap<String, BookingRecord>,
    applied: HashSet<Uuid>,
    injected: VecDeque<DomainError>,
}

/// Booking records held in process memory.
///
/// Failures queued with [`InMemoryBookingDomain::inject_failure`] are returned
/// by the next `apply` calls, one per call, before any state is touched.
#[derive(Clone, Default)]
pub struct InMemoryBookingDomain {
    state: Arc<Mutex<BookingState>>,
}

impl InMemoryBookingDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inject_failure(&self, error: DomainError) {
        self.state.lock().await.injected.push_back(error);
    }

    pub async fn records(&self) -> Vec<BookingRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    /// Overwrite a record directly, bypassing event application.
    pub async fn put_record(&self, record: BookingRecord) {
        self.state
            .lock()
            .await
            .records
            .insert(record.external_booking_ref.clone(), record);
    }

    pub async fn applied_count(&self) -> usize {
        self.state.lock().await.applied.len()
    }
}

#[async_trait]
impl BookingDomain for InMemoryBookingDomain {
    async fn apply(&self, event: &IngestEvent) -> Result<ApplyOutcome, DomainError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.injected.pop_front() {
            return Err(error);
        }
        if state.applied.contains(&event.event_id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let current = state.records.get(event.external_booking_ref());
        let outcome = match next_booking_state(current, event)? {
            Some(record) => {
                state
                    .records
                    .insert(record.external_booking_ref.clone(), record);
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::Stale,
        };
        state.applied.insert(event.event_id);
        Ok(outcome)
    }

    async fn find(&self, external_booking_ref: &str) -> Result<Option<BookingRecord>, DomainError> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .get(external_booking_ref)
            .cloned())
    }

    async fn is_applied(&self, event_id: Uuid) -> Result<bool, DomainError> {
        Ok(self.state.lock().await.applied.contains(&event_id))
    }
}
