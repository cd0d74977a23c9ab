//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible
//! defaults. Use the closure parameter to override specific fields as needed.

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::{
    application::ports::billing_provider::{
        ProviderPrice, ProviderSubscription, ProviderSubscriptionItem, ProviderSubscriptionItems,
    },
    domain::entities::{
        account::{Account, AccountPaymentStatus},
        subscription::{Subscription, SubscriptionStatus, Transaction, TransactionStatus},
    },
};

/// Create a test account with sensible defaults.
pub fn create_test_account(overrides: impl FnOnce(&mut Account)) -> Account {
    let mut account = Account {
        id: Uuid::new_v4(),
        email: "architect@example.com".to_string(),
        billing_customer_id: None,
        has_access: false,
        payment_status: AccountPaymentStatus::Pending,
        subscription_id: None,
        version: 1,
        created_at: Some(test_datetime()),
        updated_at: Some(test_datetime()),
    };
    overrides(&mut account);
    account
}

/// Create a test subscription with sensible defaults.
pub fn create_test_subscription(
    account_id: Uuid,
    overrides: impl FnOnce(&mut Subscription),
) -> Subscription {
    let now = test_datetime();

    let mut subscription = Subscription {
        id: Uuid::new_v4(),
        account_id,
        billing_subscription_id: format!("sub_test{}", Uuid::new_v4().simple()),
        plan: "Premium".to_string(),
        start_date: now,
        end_date: test_datetime_offset_days(30),
        status: SubscriptionStatus::Active,
        price: 19.99,
        payment_method: "card".to_string(),
        transactions: vec![Transaction {
            amount: 19.99,
            date: now,
            external_id: "evt_seed".to_string(),
            status: TransactionStatus::Success,
        }],
        last_event_at: None,
        version: 1,
        created_at: Some(now),
        updated_at: Some(now),
    };
    overrides(&mut subscription);
    subscription
}

/// Create a provider-side subscription as the billing API would return it.
pub fn create_provider_subscription(
    overrides: impl FnOnce(&mut ProviderSubscription),
) -> ProviderSubscription {
    let mut subscription = ProviderSubscription {
        id: "sub_123".to_string(),
        customer: "cus_123".to_string(),
        status: "active".to_string(),
        current_period_start: 1_735_689_600, // 2025-01-01T00:00:00Z
        current_period_end: 1_738_368_000,   // 2025-02-01T00:00:00Z
        items: ProviderSubscriptionItems {
            data: vec![ProviderSubscriptionItem {
                price: ProviderPrice {
                    id: "price_test123".to_string(),
                    unit_amount: Some(1999),
                },
            }],
        },
    };
    overrides(&mut subscription);
    subscription
}

pub fn test_datetime() -> NaiveDateTime {
    chrono::DateTime::from_timestamp(1_735_689_600, 0)
        .unwrap()
        .naive_utc()
}

pub fn test_datetime_offset_days(days: i64) -> NaiveDateTime {
    test_datetime() + chrono::Duration::days(days)
}
