//! Ingest path: payload validation, idempotency, routing and acceptance

pub mod cutover;
pub mod dispatch;
pub mod idempotency;
pub mod schema;
mod service;

pub use cutover::CutoverStrategy;
pub use dispatch::JobDispatcher;
pub use idempotency::{IdempotencyStore, Reservation, MAX_IDEMPOTENCY_KEY_LEN};
pub use schema::{
    booking_event_schema_v1, FieldError, PayloadError, PayloadValidator, SchemaValidationMode,
};
pub use service::{
    AcceptError, EventView, ForceFailReceipt, ForceFailRequest, IngestReceipt, IngestService,
};
