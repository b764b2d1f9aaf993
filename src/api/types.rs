//! Query-string shapes for REST handlers.

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransitionQuery {
    /// Status the caller believes the entry is in
    pub expected: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    pub window_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEventsQuery {
    pub limit: Option<usize>,
    pub actor: Option<String>,
    pub event_type: Option<String>,
    pub subject_id: Option<String>,
}
