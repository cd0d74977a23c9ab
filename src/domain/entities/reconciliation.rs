use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "reconciliation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Abandoned => "abandoned",
        }
    }
}

/// A webhook event whose reconciliation failed after it was acknowledged.
///
/// The provider is always answered 200, so redelivery cannot be relied on;
/// instead the raw event is persisted here and re-driven by the background
/// worker until it succeeds or the attempt cap is reached.
#[derive(Debug, Clone)]
pub struct ReconciliationAttempt {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub status: AttemptStatus,
    pub attempt_count: i32,
    pub next_attempt_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}
