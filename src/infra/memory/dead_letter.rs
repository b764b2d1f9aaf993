//! In-memory dead-letter repository

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{DeadLetterEntry, DeadLetterReason, DeadLetterStatus, DeadLetterUpdate};
use crate::infra::{DeadLetterRepository, DeadLetterStats, IngestError, Result};

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<RwLock<HashMap<String, DeadLetterEntry>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_expected(entry: &DeadLetterEntry, expected: DeadLetterStatus) -> Result<()> {
    if entry.status != expected {
        return Err(IngestError::DeadLetterStatusConflict {
            key: entry.dead_letter_key.clone(),
            expected,
            actual: entry.status,
        });
    }
    Ok(())
}

#[async_trait]
impl DeadLetterRepository for InMemoryDeadLetterStore {
    async fn insert_if_absent(&self, entry: DeadLetterEntry) -> Result<(DeadLetterEntry, bool)> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&entry.dead_letter_key) {
            return Ok((existing.clone(), false));
        }
        entries.insert(entry.dead_letter_key.clone(), entry.clone());
        Ok((entry, true))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn transition(
        &self,
        key: &str,
        expected: DeadLetterStatus,
        to: DeadLetterStatus,
        update: DeadLetterUpdate,
    ) -> Result<DeadLetterEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| IngestError::DeadLetterNotFound(key.to_string()))?;
        check_expected(entry, expected)?;

        entry.status = to;
        if update.increment_attempts {
            entry.attempts += 1;
        }
        if update.reason_detail.is_some() {
            entry.reason_detail = update.reason_detail;
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn update_reason(
        &self,
        key: &str,
        expected: DeadLetterStatus,
        reason: DeadLetterReason,
    ) -> Result<DeadLetterEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| IngestError::DeadLetterNotFound(key.to_string()))?;
        check_expected(entry, expected)?;

        entry.reason_code = reason.reason_code;
        entry.reason_detail = reason.reason_detail;
        entry.poison_message = reason.poison_message;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        let mut matching: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn stats(&self) -> Result<DeadLetterStats> {
        let entries = self.entries.read().await;
        let mut stats = DeadLetterStats {
            total: entries.len() as u64,
            ..Default::default()
        };
        for status in DeadLetterStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for entry in entries.values() {
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_default() += 1;
            if entry.status == DeadLetterStatus::Open
                && stats.oldest_open.map_or(true, |t| entry.created_at < t)
            {
                stats.oldest_open = Some(entry.created_at);
            }
        }
        Ok(stats)
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.created_at >= since)
            .count() as u64)
    }
}
