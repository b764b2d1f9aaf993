//! Audit events for every ingestion state transition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actor used for transitions the processor drives on its own.
pub const SYSTEM_PROCESSOR_ACTOR: &str = "system:processor";
/// Actor used for scheduled reconciliation runs.
pub const SYSTEM_SCHEDULER_ACTOR: &str = "system:scheduler";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditEventType {
    EventReceived,
    EventProcessed,
    EventRetryScheduled,
    EventMarkedFailed,
    DeadLetterStatusUpdated,
    ReplayRequested,
    ReplaySucceeded,
    ReplayFailed,
    ReconciliationCompleted,
    Custom(String),
}

impl AuditEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EventReceived => "INGEST_EVENT_RECEIVED",
            Self::EventProcessed => "INGEST_EVENT_PROCESSED",
            Self::EventRetryScheduled => "INGEST_EVENT_RETRY_SCHEDULED",
            Self::EventMarkedFailed => "INGEST_EVENT_MARKED_FAILED",
            Self::DeadLetterStatusUpdated => "INGEST_DEAD_LETTER_STATUS_UPDATED",
            Self::ReplayRequested => "INGEST_REPLAY_REQUESTED",
            Self::ReplaySucceeded => "INGEST_REPLAY_SUCCEEDED",
            Self::ReplayFailed => "INGEST_REPLAY_FAILED",
            Self::ReconciliationCompleted => "RECONCILIATION_COMPLETED",
            Self::Custom(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "INGEST_EVENT_RECEIVED" => Self::EventReceived,
            "INGEST_EVENT_PROCESSED" => Self::EventProcessed,
            "INGEST_EVENT_RETRY_SCHEDULED" => Self::EventRetryScheduled,
            "INGEST_EVENT_MARKED_FAILED" => Self::EventMarkedFailed,
            "INGEST_DEAD_LETTER_STATUS_UPDATED" => Self::DeadLetterStatusUpdated,
            "INGEST_REPLAY_REQUESTED" => Self::ReplayRequested,
            "INGEST_REPLAY_SUCCEEDED" => Self::ReplaySucceeded,
            "INGEST_REPLAY_FAILED" => Self::ReplayFailed,
            "RECONCILIATION_COMPLETED" => Self::ReconciliationCompleted,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuditEventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuditEventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    /// Event id, dead-letter key or run id the record is about.
    pub subject_id: Option<String>,
    pub detail: serde_json::Value,
}

/// Builder for audit events
pub struct AuditEventBuilder {
    event_type: AuditEventType,
    actor: String,
    subject_id: Option<String>,
    detail: serde_json::Map<String, serde_json::Value>,
}

impl AuditEventBuilder {
    pub fn new(event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            event_type,
            actor: actor.into(),
            subject_id: None,
            detail: serde_json::Map::new(),
        }
    }

    pub fn subject(mut self, subject_id: impl ToString) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }

    /// Add one detail field; later calls with the same key win.
    pub fn detail(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.detail.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            actor: self.actor,
            occurred_at: Utc::now(),
            subject_id: self.subject_id,
            detail: serde_json::Value::Object(self.detail),
        }
    }
}

/// Filters for audit queries
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub subject_id: Option<String>,
    pub limit: usize,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.actor.as_ref().map_or(true, |a| &event.actor == a)
            && self
                .event_type
                .as_ref()
                .map_or(true, |t| &event.event_type == t)
            && self
                .subject_id
                .as_ref()
                .map_or(true, |s| event.subject_id.as_ref() == Some(s))
    }
}
