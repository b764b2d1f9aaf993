//! In-memory event repository

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{EventTransition, IngestEvent, ProcessStatus};
use crate::infra::{EventRepository, EventStatusCounts, IngestError, Result};

#[derive(Default)]
struct Tables {
    events: HashMap<Uuid, IngestEvent>,
    by_key: HashMap<String, Uuid>,
}

/// Event repository held in process memory.
///
/// Both maps sit behind one lock so key reservation and event creation are a
/// single critical section.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventRepository for InMemoryEventStore {
    async fn insert_if_absent(&self, event: IngestEvent) -> Result<(IngestEvent, bool)> {
        let mut tables = self.tables.write().await;

        if let Some(existing_id) = tables.by_key.get(&event.idempotency_key) {
            let existing = tables.events.get(existing_id).cloned().ok_or_else(|| {
                IngestError::Internal(format!(
                    "idempotency key {} points at missing event {}",
                    event.idempotency_key, existing_id
                ))
            })?;
            return Ok((existing, false));
        }

        tables
            .by_key
            .insert(event.idempotency_key.clone(), event.event_id);
        tables.events.insert(event.event_id, event.clone());
        Ok((event, true))
    }

    async fn find_by_id(&self, event_id: Uuid) -> Result<Option<IngestEvent>> {
        Ok(self.tables.read().await.events.get(&event_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IngestEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_key
            .get(key)
            .and_then(|id| tables.events.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        event_id: Uuid,
        expected: ProcessStatus,
        transition: EventTransition,
    ) -> Result<IngestEvent> {
        let mut tables = self.tables.write().await;
        let event = tables
            .events
            .get_mut(&event_id)
            .ok_or(IngestError::EventNotFound(event_id))?;

        if event.process_status != expected {
            return Err(IngestError::EventStatusConflict {
                event_id,
                expected,
                actual: event.process_status,
            });
        }

        event.apply(&transition);
        Ok(event.clone())
    }

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<EventStatusCounts> {
        let tables = self.tables.read().await;
        let mut counts = EventStatusCounts::default();
        for event in tables.events.values().filter(|e| e.received_at >= since) {
            counts.add(event.process_status);
        }
        Ok(counts)
    }

    async fn latencies_since(&self, since: DateTime<Utc>) -> Result<Vec<i64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .values()
            .filter(|e| e.processed_at.is_some_and(|at| at >= since))
            .filter_map(|e| e.processing_latency_ms)
            .collect())
    }

    async fn list_by_status(
        &self,
        status: ProcessStatus,
        limit: usize,
    ) -> Result<Vec<IngestEvent>> {
        let tables = self.tables.read().await;
        let mut events: Vec<IngestEvent> = tables
            .events
            .values()
            .filter(|e| e.process_status == status)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        events.truncate(limit);
        Ok(events)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::payload;
    use crate::domain::BookingEventType;

    fn new_event(key: &str) -> IngestEvent {
        IngestEvent::new(key, payload("B-1", BookingEventType::Created))
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_first_event() {
        let store = InMemoryEventStore::new();
        let (first, created) = store.insert_if_absent(new_event("k")).await.unwrap();
        assert!(created);

        let (second, created) = store.insert_if_absent(new_event("k")).await.unwrap();
        assert!(!created);
        assert_eq!(first.event_id, second.event_id);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_create_one_event() {
        let store = InMemoryEventStore::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_if_absent(new_event("same")).await })
            })
            .collect();

        let mut ids = Vec::new();
        let mut created = 0;
        for handle in handles {
            let (event, was_created) = handle.await.unwrap().unwrap();
            ids.push(event.event_id);
            created += usize::from(was_created);
        }

        assert_eq!(created, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = InMemoryEventStore::new();
        let (event, _) = store.insert_if_absent(new_event("k")).await.unwrap();

        let err = store
            .transition(
                event.event_id,
                ProcessStatus::Failed,
                EventTransition::Claim { at: Utc::now() },
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let claimed = store
            .transition(
                event.event_id,
                ProcessStatus::Pending,
                EventTransition::Claim { at: Utc::now() },
            )
            .await
            .unwrap();
        assert_eq!(claimed.process_status, ProcessStatus::Processing);
    }

    #[tokio::test]
    async fn test_transition_unknown_event() {
        let store = InMemoryEventStore::new();
        let err = store
            .transition(
                Uuid::new_v4(),
                ProcessStatus::Pending,
                EventTransition::Claim { at: Utc::now() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EventNotFound(_)));
    }
}
