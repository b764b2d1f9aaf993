//! Domain models for booking ingestion
//!
//! Ingest events, dead-letter entries, audit records and the authoritative
//! booking records the processor writes.

mod audit;
mod booking;
mod dead_letter;
mod event;

pub use audit::*;
pub use booking::*;
pub use dead_letter::*;
pub use event::*;

#[cfg(test)]
pub(crate) use event::fixtures;
