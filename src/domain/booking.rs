//! Authoritative booking records and the rules for applying events to them

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::event::{BookingEventType, Customer, IngestEvent};

/// Rejection code when an update arrives for a cancelled booking.
pub const CODE_BOOKING_CANCELLED: &str = "BOOKING_CANCELLED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Status a booking should have once `event_type` is its latest event.
    pub fn expected_for(event_type: BookingEventType) -> Self {
        match event_type {
            BookingEventType::Cancelled => Self::Cancelled,
            BookingEventType::Created | BookingEventType::Updated => Self::Active,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// The back-office view of one booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub external_booking_ref: String,
    pub status: BookingStatus,
    pub customer: Customer,
    pub tour_date: NaiveDate,
    pub tour_time: Option<String>,
    pub adult: u32,
    pub child: u32,
    pub currency: String,
    pub total_price: f64,
    pub pickup_location: Option<String>,
    pub meeting_point: Option<String>,
    pub note: Option<String>,
    pub last_event_id: Uuid,
    pub last_event_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookingRecord {
    fn from_event(event: &IngestEvent, status: BookingStatus) -> Self {
        let p = &event.payload;
        Self {
            external_booking_ref: p.external_booking_ref.clone(),
            status,
            customer: p.customer.clone(),
            tour_date: p.booking.tour_date,
            tour_time: p.booking.tour_time.clone(),
            adult: p.booking.adult,
            child: p.booking.child,
            currency: p.booking.currency.clone(),
            total_price: p.booking.total_price,
            pickup_location: p.booking.pickup_location.clone(),
            meeting_point: p.booking.meeting_point.clone(),
            note: p.booking.note.clone(),
            last_event_id: event.event_id,
            last_event_time: p.event_time,
            updated_at: Utc::now(),
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyOutcome {
    Applied,
    /// The event id was applied before; nothing changed.
    AlreadyApplied,
    /// A newer event already won; recorded as applied without changing state.
    Stale,
}

/// Failures reported by the booking domain.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainError {
    /// Downstream is temporarily unavailable; retryable.
    #[error("booking domain unavailable: {0}")]
    Unavailable(String),

    /// The event is well-formed but the domain refuses it; not retryable.
    #[error("booking rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The event cannot be interpreted at all.
    #[error("poison message: {0}")]
    Poison(String),
}

impl DomainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Compute the record that results from applying `event` on top of `current`.
///
/// Returns `Ok(None)` when the event loses last-writer-wins ordering by
/// `eventTime`. Updates and cancellations for an unknown booking create it.
pub fn next_booking_state(
    current: Option<&BookingRecord>,
    event: &IngestEvent,
) -> Result<Option<BookingRecord>, DomainError> {
    let event_type = event.payload.event_type;
    let target = BookingStatus::expected_for(event_type);

    let Some(current) = current else {
        return Ok(Some(BookingRecord::from_event(event, target)));
    };

    if event.payload.event_time < current.last_event_time {
        return Ok(None);
    }

    if current.status == BookingStatus::Cancelled && event_type != BookingEventType::Cancelled {
        return Err(DomainError::Rejected {
            code: CODE_BOOKING_CANCELLED.to_string(),
            message: format!(
                "booking {} is cancelled; {} not accepted",
                current.external_booking_ref, event_type
            ),
        });
    }

    Ok(Some(BookingRecord::from_event(event, target)))
}
