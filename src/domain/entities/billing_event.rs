use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// A single asynchronous notification from the billing provider.
///
/// Only the envelope is typed; `data.object` stays a raw JSON value because
/// its shape depends on the event type (checkout session, subscription, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation time, epoch seconds.
    pub created: Option<i64>,
    pub data: BillingEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingEventData {
    pub object: JsonValue,
}

impl BillingEvent {
    pub fn object(&self) -> &JsonValue {
        &self.data.object
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.created.and_then(timestamp_to_naive)
    }
}

/// Convert a Unix timestamp to NaiveDateTime
pub fn timestamp_to_naive(secs: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}
