//! Booking lifecycle events as accepted by the ingest endpoint
//!
//! An [`IngestEvent`] is the durable record of one accepted submission. The
//! caller-supplied payload is kept verbatim in [`BookingEventPayload`]; the
//! remaining fields are processing bookkeeping owned by the processor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only payload version this service understands.
pub const PAYLOAD_VERSION_V1: &str = "v1";

/// Lifecycle transition reported by the storefront.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingEventType {
    Created,
    Updated,
    Cancelled,
}

impl BookingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BookingEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "UPDATED" => Ok(Self::Updated),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown booking event type: {other}")),
        }
    }
}

/// Processing status of an ingest event.
///
/// `Failed` means the last attempt failed with a retryable error and another
/// attempt is scheduled. `Done` and `DeadLetter` are terminal for automatic
/// processing; only replay moves an event out of `DeadLetter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    Processing,
    Done,
    Failed,
    DeadLetter,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 5] = [
        ProcessStatus::Pending,
        ProcessStatus::Processing,
        ProcessStatus::Done,
        ProcessStatus::Failed,
        ProcessStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::DeadLetter)
    }

    /// Statuses from which a processor run may claim the event.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "DEAD_LETTER" => Ok(Self::DeadLetter),
            other => Err(format!("unknown process status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    pub tour_date: NaiveDate,
    #[serde(default)]
    pub tour_time: Option<String>,
    pub adult: u32,
    #[serde(default)]
    pub child: u32,
    pub currency: String,
    pub total_price: f64,
    #[serde(default)]
    pub pickup_location: Option<String>,
    #[serde(default)]
    pub meeting_point: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Provider payload carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPayload {
    #[serde(default)]
    pub provider_payload: serde_json::Value,
}

/// The validated request body of `POST {ingestPath}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingEventPayload {
    pub payload_version: String,
    pub event_type: BookingEventType,
    pub event_time: DateTime<Utc>,
    pub source: String,
    pub external_booking_ref: String,
    pub customer: Customer,
    pub booking: BookingDetails,
    #[serde(default)]
    pub raw: RawPayload,
}

/// Durable record of an accepted booking event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEvent {
    pub event_id: Uuid,
    pub idempotency_key: String,
    #[serde(flatten)]
    pub payload: BookingEventPayload,
    pub received_at: DateTime<Utc>,
    pub process_status: ProcessStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_latency_ms: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl IngestEvent {
    /// A freshly accepted event in `PENDING`.
    pub fn new(idempotency_key: impl Into<String>, payload: BookingEventPayload) -> Self {
        let now = Utc::now();
        Self {
            event_id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            payload,
            received_at: now,
            process_status: ProcessStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            processed_at: None,
            processing_latency_ms: None,
            updated_at: now,
        }
    }

    pub fn external_booking_ref(&self) -> &str {
        &self.payload.external_booking_ref
    }

    /// Apply a status transition in place.
    ///
    /// Callers are responsible for the compare-and-swap on the current status;
    /// this only mutates the bookkeeping fields. Latency is recorded on the
    /// first terminal status and never overwritten.
    pub fn apply(&mut self, transition: &EventTransition) {
        let at = transition.at();
        self.process_status = transition.target();
        self.updated_at = at;

        match transition {
            EventTransition::Claim { .. } => {
                self.attempts += 1;
                self.next_attempt_at = None;
            }
            EventTransition::Complete { .. } => {
                self.last_error = None;
                self.next_attempt_at = None;
            }
            EventTransition::ScheduleRetry {
                error,
                next_attempt_at,
                ..
            } => {
                self.last_error = Some(error.clone());
                self.next_attempt_at = Some(*next_attempt_at);
            }
            EventTransition::DeadLetter { error, .. } => {
                self.last_error = Some(error.clone());
                self.next_attempt_at = None;
            }
        }

        if self.process_status.is_terminal() && self.processed_at.is_none() {
            self.processed_at = Some(at);
            self.processing_latency_ms = Some((at - self.received_at).num_milliseconds().max(0));
        }
    }
}

/// A processing status change, applied after a compare-and-swap on the
/// status the caller observed.
#[derive(Debug, Clone, PartialEq)]
pub enum EventTransition {
    /// PENDING, FAILED or DEAD_LETTER (replay) to PROCESSING.
    Claim { at: DateTime<Utc> },
    /// PROCESSING to DONE.
    Complete { at: DateTime<Utc> },
    /// PROCESSING to FAILED with a retry scheduled.
    ScheduleRetry {
        error: String,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// Any non-terminal status (or DONE, when force-failed) to DEAD_LETTER.
    DeadLetter { error: String, at: DateTime<Utc> },
}

impl EventTransition {
    pub fn target(&self) -> ProcessStatus {
        match self {
            Self::Claim { .. } => ProcessStatus::Processing,
            Self::Complete { .. } => ProcessStatus::Done,
            Self::ScheduleRetry { .. } => ProcessStatus::Failed,
            Self::DeadLetter { .. } => ProcessStatus::DeadLetter,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Claim { at }
            | Self::Complete { at }
            | Self::ScheduleRetry { at, .. }
            | Self::DeadLetter { at, .. } => *at,
        }
    }
}
