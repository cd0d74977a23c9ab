use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing state of an account, driven by provider webhook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountPaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl AccountPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountPaymentStatus::Pending => "pending",
            AccountPaymentStatus::Completed => "completed",
            AccountPaymentStatus::Failed => "failed",
        }
    }
}

impl Default for AccountPaymentStatus {
    fn default() -> Self {
        AccountPaymentStatus::Pending
    }
}

impl std::fmt::Display for AccountPaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Platform account of an architect with billing access.
///
/// Accounts are created at registration time by another service; this one
/// only mutates the billing-related fields. `billing_customer_id` is the
/// join key between inbound provider events and the account, set once at
/// the first successful checkout. `version` guards concurrent webhook
/// deliveries: every write is compare-and-swap on it.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub billing_customer_id: Option<String>,
    pub has_access: bool,
    pub payment_status: AccountPaymentStatus,
    pub subscription_id: Option<Uuid>,
    pub version: i32,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}
