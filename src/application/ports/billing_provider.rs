use async_trait::async_trait;
use serde::Deserialize;

use crate::app_error::AppResult;

/// Outbound read interface to the billing provider.
///
/// The webhook reconciler needs one call: fetch full subscription detail by
/// provider-side ID (checkout events carry only the ID). Kept behind a
/// trait so tests can substitute an in-memory fake.
#[async_trait]
pub trait BillingProviderPort: Send + Sync {
    async fn get_subscription(&self, subscription_id: &str) -> AppResult<ProviderSubscription>;
}

/// Subscription detail as the provider reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    /// Billing-period boundaries, epoch seconds.
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub items: ProviderSubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSubscriptionItems {
    pub data: Vec<ProviderSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscriptionItem {
    pub price: ProviderPrice,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    /// Minor currency units (cents).
    pub unit_amount: Option<i64>,
}

impl ProviderSubscription {
    /// Unit amount of the first subscription item, in minor currency units.
    pub fn unit_amount(&self) -> i64 {
        self.items
            .data
            .first()
            .and_then(|item| item.price.unit_amount)
            .unwrap_or(0)
    }
}
