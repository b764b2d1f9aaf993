//! PostgreSQL implementations for production storage
//!
//! Provides the event, dead-letter, audit, queue, nonce, lease and booking
//! stores used when `STORAGE_BACKEND=postgres`.

mod audit;
mod booking;
mod dead_letter;
mod event_store;
mod nonce;
mod queue;

pub use audit::*;
pub use booking::*;
pub use dead_letter::*;
pub use event_store::*;
pub use nonce::*;
pub use queue::*;
