//! In-memory mock implementations for billing-related repository traits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::ports::billing_provider::{BillingProviderPort, ProviderSubscription},
    application::use_cases::billing_events::{
        AccountBillingUpdate, AccountRepo, BillingEventUseCases, CreateSubscriptionInput,
        ProcessedEventRepo, ReconciliationAttemptRepo, SubscriptionRepo, SubscriptionUpdate,
    },
    domain::entities::{
        account::Account,
        reconciliation::{AttemptStatus, ReconciliationAttempt},
        subscription::Subscription,
    },
};

// ============================================================================
// InMemoryAccountRepo
// ============================================================================

#[derive(Default)]
pub struct InMemoryAccountRepo {
    pub accounts: Mutex<HashMap<Uuid, Account>>,
}

impl InMemoryAccountRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        self.accounts.lock().unwrap().insert(account.id, account);
    }

    /// Fetch by ID, panicking when absent. Test assertions only.
    pub fn get(&self, id: Uuid) -> Account {
        self.accounts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("account not present in mock")
    }
}

#[async_trait]
impl AccountRepo for InMemoryAccountRepo {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Account>> {
        Ok(self.accounts.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_billing_customer_id(
        &self,
        billing_customer_id: &str,
    ) -> AppResult<Option<Account>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .values()
            .find(|a| a.billing_customer_id.as_deref() == Some(billing_customer_id))
            .cloned())
    }

    async fn update_billing(
        &self,
        id: Uuid,
        update: &AccountBillingUpdate,
        expected_version: i32,
    ) -> AppResult<Account> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.get_mut(&id).ok_or(AppError::NotFound)?;

        if account.version != expected_version {
            return Err(AppError::Conflict);
        }

        if let Some(v) = &update.billing_customer_id {
            account.billing_customer_id = Some(v.clone());
        }
        if let Some(v) = update.has_access {
            account.has_access = v;
        }
        if let Some(v) = update.payment_status {
            account.payment_status = v;
        }
        if let Some(v) = update.subscription_id {
            account.subscription_id = Some(v);
        }
        account.version += 1;
        account.updated_at = Some(chrono::Utc::now().naive_utc());

        Ok(account.clone())
    }
}

// ============================================================================
// InMemorySubscriptionRepo
// ============================================================================

#[derive(Default)]
pub struct InMemorySubscriptionRepo {
    pub subscriptions: Mutex<HashMap<Uuid, Subscription>>,
}

impl InMemorySubscriptionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id, subscription);
    }

    /// Fetch by ID, panicking when absent. Test assertions only.
    pub fn get(&self, id: Uuid) -> Subscription {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("subscription not present in mock")
    }

    pub fn count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl SubscriptionRepo for InMemorySubscriptionRepo {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(self.subscriptions.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_billing_subscription_id(
        &self,
        billing_subscription_id: &str,
    ) -> AppResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.billing_subscription_id == billing_subscription_id)
            .cloned())
    }

    async fn create(&self, input: &CreateSubscriptionInput) -> AppResult<Subscription> {
        let now = chrono::Utc::now().naive_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            billing_subscription_id: input.billing_subscription_id.clone(),
            plan: input.plan.clone(),
            start_date: input.start_date,
            end_date: input.end_date,
            status: input.status,
            price: input.price,
            payment_method: input.payment_method.clone(),
            transactions: vec![input.seed_transaction.clone()],
            last_event_at: input.last_event_at,
            version: 1,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn update(
        &self,
        id: Uuid,
        update: &SubscriptionUpdate,
        expected_version: i32,
    ) -> AppResult<Subscription> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions.get_mut(&id).ok_or(AppError::NotFound)?;

        if subscription.version != expected_version {
            return Err(AppError::Conflict);
        }

        if let Some(v) = update.status {
            subscription.status = v;
        }
        if let Some(v) = &update.plan {
            subscription.plan = v.clone();
        }
        if let Some(v) = update.start_date {
            subscription.start_date = v;
        }
        if let Some(v) = update.end_date {
            subscription.end_date = v;
        }
        if let Some(v) = update.price {
            subscription.price = v;
        }
        if let Some(v) = &update.payment_method {
            subscription.payment_method = v.clone();
        }
        if let Some(tx) = &update.push_transaction {
            subscription.transactions.push(tx.clone());
        }
        if let Some(v) = update.last_event_at {
            subscription.last_event_at = Some(v);
        }
        subscription.version += 1;
        subscription.updated_at = Some(chrono::Utc::now().naive_utc());

        Ok(subscription.clone())
    }
}

// ============================================================================
// InMemoryProcessedEventRepo
// ============================================================================

#[derive(Default)]
pub struct InMemoryProcessedEventRepo {
    pub events: Mutex<HashMap<String, String>>,
}

impl InMemoryProcessedEventRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessedEventRepo for InMemoryProcessedEventRepo {
    async fn exists(&self, event_id: &str) -> AppResult<bool> {
        Ok(self.events.lock().unwrap().contains_key(event_id))
    }

    async fn record(&self, event_id: &str, event_type: &str) -> AppResult<()> {
        self.events
            .lock()
            .unwrap()
            .insert(event_id.to_string(), event_type.to_string());
        Ok(())
    }
}

// ============================================================================
// InMemoryReconciliationAttemptRepo
// ============================================================================

const CLAIM_LEASE_SECS: i64 = 300;

#[derive(Default)]
pub struct InMemoryReconciliationAttemptRepo {
    pub attempts: Mutex<HashMap<Uuid, ReconciliationAttempt>>,
}

impl InMemoryReconciliationAttemptRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// The one stored attempt. Panics unless exactly one exists.
    pub fn single(&self) -> ReconciliationAttempt {
        let attempts = self.attempts.lock().unwrap();
        assert_eq!(attempts.len(), 1, "expected exactly one attempt in mock");
        attempts.values().next().cloned().unwrap()
    }

    /// Pull every pending attempt's retry time into the past so the next
    /// `claim_due` picks it up, without sleeping through real backoff.
    pub fn make_all_due(&self) {
        let due = chrono::Utc::now().naive_utc() - chrono::Duration::seconds(1);
        for attempt in self.attempts.lock().unwrap().values_mut() {
            if attempt.status == AttemptStatus::Pending {
                attempt.next_attempt_at = Some(due);
            }
        }
    }
}

#[async_trait]
impl ReconciliationAttemptRepo for InMemoryReconciliationAttemptRepo {
    async fn create(
        &self,
        event_id: &str,
        event_type: &str,
        payload: JsonValue,
        last_error: &str,
        next_attempt_at: NaiveDateTime,
    ) -> AppResult<ReconciliationAttempt> {
        let now = chrono::Utc::now().naive_utc();
        let attempt = ReconciliationAttempt {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            status: AttemptStatus::Pending,
            attempt_count: 0,
            next_attempt_at: Some(next_attempt_at),
            last_error: Some(last_error.to_string()),
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.attempts
            .lock()
            .unwrap()
            .insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn claim_due(&self, limit: i64) -> AppResult<Vec<ReconciliationAttempt>> {
        let now = chrono::Utc::now().naive_utc();
        let lease = now + chrono::Duration::seconds(CLAIM_LEASE_SECS);
        let mut attempts = self.attempts.lock().unwrap();

        let mut claimed = Vec::new();
        for attempt in attempts.values_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            let due = attempt.status == AttemptStatus::Pending
                && attempt.next_attempt_at.is_some_and(|t| t <= now);
            if due {
                attempt.next_attempt_at = Some(lease);
                claimed.push(attempt.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, id: Uuid) -> AppResult<()> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.get_mut(&id).ok_or(AppError::NotFound)?;
        attempt.status = AttemptStatus::Succeeded;
        attempt.next_attempt_at = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_attempt_at: NaiveDateTime,
        error: &str,
    ) -> AppResult<()> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.get_mut(&id).ok_or(AppError::NotFound)?;
        attempt.attempt_count = attempt_count;
        attempt.next_attempt_at = Some(next_attempt_at);
        attempt.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_abandoned(&self, id: Uuid, error: &str) -> AppResult<()> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.get_mut(&id).ok_or(AppError::NotFound)?;
        attempt.status = AttemptStatus::Abandoned;
        attempt.next_attempt_at = None;
        attempt.last_error = Some(error.to_string());
        Ok(())
    }
}

// ============================================================================
// FakeBillingProvider
// ============================================================================

#[derive(Default)]
pub struct FakeBillingProvider {
    pub subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    unavailable: AtomicBool,
}

impl FakeBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: ProviderSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    /// Simulate a provider outage: every call fails with a retryable error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingProviderPort for FakeBillingProvider {
    async fn get_subscription(&self, subscription_id: &str) -> AppResult<ProviderSubscription> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Provider("provider unavailable".into()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| AppError::Provider(format!("no such subscription: {}", subscription_id)))
    }
}

// ============================================================================
// TestBillingMocks
// ============================================================================

/// Bundle of all in-memory collaborators plus helpers to wire them into a
/// use-case instance. Keeps handles around so tests can assert on state
/// after driving the HTTP layer or the worker.
pub struct TestBillingMocks {
    pub accounts: Arc<InMemoryAccountRepo>,
    pub subscriptions: Arc<InMemorySubscriptionRepo>,
    pub processed: Arc<InMemoryProcessedEventRepo>,
    pub attempts: Arc<InMemoryReconciliationAttemptRepo>,
    pub provider: Arc<FakeBillingProvider>,
}

impl TestBillingMocks {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(InMemoryAccountRepo::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepo::new()),
            processed: Arc::new(InMemoryProcessedEventRepo::new()),
            attempts: Arc::new(InMemoryReconciliationAttemptRepo::new()),
            provider: Arc::new(FakeBillingProvider::new()),
        }
    }

    pub fn with_account(self, account: Account) -> Self {
        self.accounts.insert(account);
        self
    }

    pub fn with_subscription(self, subscription: Subscription) -> Self {
        self.subscriptions.insert(subscription);
        self
    }

    pub fn use_cases(&self) -> BillingEventUseCases {
        BillingEventUseCases::new(
            self.accounts.clone(),
            self.subscriptions.clone(),
            self.processed.clone(),
            self.attempts.clone(),
            self.provider.clone(),
        )
    }
}

impl Default for TestBillingMocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_account;

    #[tokio::test]
    async fn account_update_is_compare_and_swap() {
        let repo = InMemoryAccountRepo::new();
        let account = create_test_account(|_| {});
        let id = account.id;
        repo.insert(account);

        let update = AccountBillingUpdate {
            has_access: Some(true),
            ..Default::default()
        };

        let updated = repo.update_billing(id, &update, 1).await.unwrap();
        assert_eq!(updated.version, 2);

        // Stale expected version loses.
        assert!(matches!(
            repo.update_billing(id, &update, 1).await,
            Err(AppError::Conflict)
        ));
    }
}
