use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Map a provider-side subscription status onto the local one.
    ///
    /// Returns `None` for provider statuses with no local counterpart
    /// (`past_due`, `trialing`, ...) — the local status is left unchanged.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "canceled" => Some(SubscriptionStatus::Cancelled),
            "unpaid" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }
}

/// One billing event's monetary effect. Immutable once appended to a
/// subscription's transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub amount: f64,
    pub date: NaiveDateTime,
    pub external_id: String,
    pub status: TransactionStatus,
}

/// Local record of a paid plan's lifecycle, linked one-to-one with an
/// account. Created when a checkout event is first reconciled, mutated on
/// every later lifecycle event for the same provider subscription, never
/// physically deleted.
///
/// `last_event_at` is the creation timestamp of the newest provider event
/// applied to this record; older deliveries are skipped instead of
/// overwriting newer state. `version` is the compare-and-swap guard.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    pub billing_subscription_id: String,
    pub plan: String,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub status: SubscriptionStatus,
    pub price: f64,
    pub payment_method: String,
    pub transactions: Vec<Transaction>,
    pub last_event_at: Option<NaiveDateTime>,
    pub version: i32,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}
