//! In-memory nonce and lease stores

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::infra::{LeaseStore, NonceStore, Result};

/// Seen-nonce set with per-nonce expiry.
#[derive(Clone, Default)]
pub struct InMemoryNonceStore {
    seen: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn check_and_record(&self, nonce: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let now = Utc::now();
        let mut seen = self.seen.lock().await;
        match seen.get(nonce) {
            Some(existing) if *existing > now => Ok(false),
            _ => {
                seen.insert(nonce.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        Ok((before - seen.len()) as u64)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Lease table for a single process.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get(name) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|l| l.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nonce_rejected_until_expiry() {
        let store = InMemoryNonceStore::new();
        let expires = Utc::now() + chrono::Duration::minutes(5);

        assert!(store.check_and_record("n-1", expires).await.unwrap());
        assert!(!store.check_and_record("n-1", expires).await.unwrap());
        assert!(store.check_and_record("n-2", expires).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_nonce_purged_and_reusable() {
        let store = InMemoryNonceStore::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        assert!(store.check_and_record("n-1", past).await.unwrap());

        assert!(store.check_and_record("n-1", Utc::now() + chrono::Duration::minutes(1)).await.unwrap());
        assert_eq!(store.purge_expired(Utc::now() + chrono::Duration::minutes(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lease_single_holder() {
        let leases = InMemoryLeaseStore::new();
        let ttl = Duration::from_secs(60);

        assert!(leases.try_acquire("reconcile", "a", ttl).await.unwrap());
        assert!(!leases.try_acquire("reconcile", "b", ttl).await.unwrap());
        assert!(leases.try_acquire("reconcile", "a", ttl).await.unwrap());

        leases.release("reconcile", "a").await.unwrap();
        assert!(leases.try_acquire("reconcile", "b", ttl).await.unwrap());
    }
}
