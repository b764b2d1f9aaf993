//! In-memory implementations of the storage and queue traits
//!
//! Used for local development (`STORAGE_BACKEND=memory`) and tests.

mod audit;
mod booking;
mod dead_letter;
mod event_store;
mod nonce;
mod queue;

pub use audit::InMemoryAuditLog;
pub use booking::InMemoryBookingDomain;
pub use dead_letter::InMemoryDeadLetterStore;
pub use event_store::InMemoryEventStore;
pub use nonce::{InMemoryLeaseStore, InMemoryNonceStore};
pub use queue::InMemoryJobQueue;
