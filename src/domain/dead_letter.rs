//! Dead-letter entries and their operator-gated recovery state machine
//!
//! ```text
//! OPEN      --operator--> READY
//! READY     --replay----> REPLAYING
//! REPLAYING --processor-> SUCCEEDED | FAILED
//! FAILED    --operator--> READY
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reason code for domain retries that ran out of attempts.
pub const REASON_RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";
/// Reason code for payloads the processor could not interpret at all.
pub const REASON_POISON_MESSAGE: &str = "POISON_MESSAGE";
/// Reason code when a fatal domain error carries no code of its own.
pub const REASON_FATAL_PROCESSING_ERROR: &str = "FATAL_PROCESSING_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Open,
    Ready,
    Replaying,
    Succeeded,
    Failed,
}

/// Who is driving a dead-letter transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    /// An operator through the status endpoint.
    Operator,
    /// The replay coordinator claiming the entry.
    Replay,
    /// The processor reporting the outcome of a replay.
    Processor,
}

impl DeadLetterStatus {
    pub const ALL: [DeadLetterStatus; 5] = [
        DeadLetterStatus::Open,
        DeadLetterStatus::Ready,
        DeadLetterStatus::Replaying,
        DeadLetterStatus::Succeeded,
        DeadLetterStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Ready => "READY",
            Self::Replaying => "REPLAYING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// The trigger allowed to move an entry from `self` to `to`, if any.
    pub fn transition_trigger(&self, to: DeadLetterStatus) -> Option<TransitionTrigger> {
        use DeadLetterStatus::*;
        match (self, to) {
            (Open, Ready) | (Failed, Ready) => Some(TransitionTrigger::Operator),
            (Ready, Replaying) => Some(TransitionTrigger::Replay),
            (Replaying, Succeeded) | (Replaying, Failed) => Some(TransitionTrigger::Processor),
            _ => None,
        }
    }

    pub fn can_transition(&self, to: DeadLetterStatus, trigger: TransitionTrigger) -> bool {
        self.transition_trigger(to) == Some(trigger)
    }

    /// First status an operator may move an entry to `self` from.
    pub fn operator_source(&self) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|from| from.can_transition(*self, TransitionTrigger::Operator))
    }

    /// Entries force-fail may still rewrite the reason of.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Open | Self::Ready | Self::Failed)
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "READY" => Ok(Self::Ready),
            "REPLAYING" => Ok(Self::Replaying),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown dead-letter status: {other}")),
        }
    }
}

/// Deterministic key for the dead-letter entry of an event.
pub fn dead_letter_key_for(event_id: Uuid) -> String {
    format!("dlq_{}", event_id.simple())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub dead_letter_key: String,
    pub event_id: Uuid,
    pub status: DeadLetterStatus,
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub poison_message: bool,
    /// Failed replays so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn open(
        event_id: Uuid,
        reason_code: impl Into<String>,
        reason_detail: Option<String>,
        poison_message: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            dead_letter_key: dead_letter_key_for(event_id),
            event_id,
            status: DeadLetterStatus::Open,
            reason_code: reason_code.into(),
            reason_detail,
            poison_message,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields a status change writes alongside the new status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadLetterUpdate {
    pub increment_attempts: bool,
    pub reason_detail: Option<String>,
}

/// Reason rewrite applied by a repeated force-fail.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterReason {
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub poison_message: bool,
}
