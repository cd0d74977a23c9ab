use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::application::ports::billing_provider::BillingProviderPort;
use crate::domain::entities::account::{Account, AccountPaymentStatus};
use crate::domain::entities::billing_event::{BillingEvent, timestamp_to_naive};
use crate::domain::entities::reconciliation::ReconciliationAttempt;
use crate::domain::entities::subscription::{
    Subscription, SubscriptionStatus, Transaction, TransactionStatus,
};

// ============================================================================
// Constants
// ============================================================================

pub const MAX_RECONCILE_ATTEMPTS: i32 = 5;
pub const DEFAULT_PLAN: &str = "Premium";

const MAX_VERSION_RETRIES: u32 = 3;

// ============================================================================
// Repository Traits
// ============================================================================

#[async_trait]
pub trait AccountRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Account>>;

    async fn get_by_billing_customer_id(
        &self,
        billing_customer_id: &str,
    ) -> AppResult<Option<Account>>;

    /// Compare-and-swap update: fails with `AppError::Conflict` when the
    /// stored version no longer matches `expected_version`.
    async fn update_billing(
        &self,
        id: Uuid,
        update: &AccountBillingUpdate,
        expected_version: i32,
    ) -> AppResult<Account>;
}

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>>;

    async fn get_by_billing_subscription_id(
        &self,
        billing_subscription_id: &str,
    ) -> AppResult<Option<Subscription>>;

    async fn create(&self, input: &CreateSubscriptionInput) -> AppResult<Subscription>;

    /// Compare-and-swap update, same contract as
    /// [`AccountRepo::update_billing`].
    async fn update(
        &self,
        id: Uuid,
        update: &SubscriptionUpdate,
        expected_version: i32,
    ) -> AppResult<Subscription>;
}

#[async_trait]
pub trait ProcessedEventRepo: Send + Sync {
    async fn exists(&self, event_id: &str) -> AppResult<bool>;

    async fn record(&self, event_id: &str, event_type: &str) -> AppResult<()>;
}

#[async_trait]
pub trait ReconciliationAttemptRepo: Send + Sync {
    async fn create(
        &self,
        event_id: &str,
        event_type: &str,
        payload: JsonValue,
        last_error: &str,
        next_attempt_at: NaiveDateTime,
    ) -> AppResult<ReconciliationAttempt>;

    /// Claim pending attempts due for a retry. Claimed attempts have their
    /// `next_attempt_at` pushed forward so a concurrent claim within the
    /// same window does not pick them up again.
    async fn claim_due(&self, limit: i64) -> AppResult<Vec<ReconciliationAttempt>>;

    async fn mark_succeeded(&self, id: Uuid) -> AppResult<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_attempt_at: NaiveDateTime,
        error: &str,
    ) -> AppResult<()>;

    async fn mark_abandoned(&self, id: Uuid, error: &str) -> AppResult<()>;
}

// ============================================================================
// Update Types
// ============================================================================

/// Partial update of an account's billing fields. `None` leaves the field
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct AccountBillingUpdate {
    pub billing_customer_id: Option<String>,
    pub has_access: Option<bool>,
    pub payment_status: Option<AccountPaymentStatus>,
    pub subscription_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionInput {
    pub account_id: Uuid,
    pub billing_subscription_id: String,
    pub plan: String,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub status: SubscriptionStatus,
    pub price: f64,
    pub payment_method: String,
    pub seed_transaction: Transaction,
    pub last_event_at: Option<NaiveDateTime>,
}

/// Partial update of a subscription. `None` leaves the field unchanged;
/// `push_transaction` appends to the transaction log.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<String>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub price: Option<f64>,
    pub payment_method: Option<String>,
    pub push_transaction: Option<Transaction>,
    pub last_event_at: Option<NaiveDateTime>,
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct BillingEventUseCases {
    account_repo: Arc<dyn AccountRepo>,
    subscription_repo: Arc<dyn SubscriptionRepo>,
    processed_repo: Arc<dyn ProcessedEventRepo>,
    attempt_repo: Arc<dyn ReconciliationAttemptRepo>,
    provider: Arc<dyn BillingProviderPort>,
}

impl BillingEventUseCases {
    pub fn new(
        account_repo: Arc<dyn AccountRepo>,
        subscription_repo: Arc<dyn SubscriptionRepo>,
        processed_repo: Arc<dyn ProcessedEventRepo>,
        attempt_repo: Arc<dyn ReconciliationAttemptRepo>,
        provider: Arc<dyn BillingProviderPort>,
    ) -> Self {
        Self {
            account_repo,
            subscription_repo,
            processed_repo,
            attempt_repo,
            provider,
        }
    }

    // ========================================================================
    // Event Processing
    // ========================================================================

    /// Apply one verified provider event to the local records.
    ///
    /// Events already recorded as processed are skipped (the provider may
    /// redeliver, and the retry worker re-runs stored payloads).
    pub async fn process_event(&self, event: &BillingEvent) -> AppResult<()> {
        if self.processed_repo.exists(&event.id).await? {
            debug!(event_id = %event.id, "event already processed, skipping");
            return Ok(());
        }

        self.apply_event(event).await?;

        if is_mutating_event(&event.event_type) {
            self.processed_repo
                .record(&event.id, &event.event_type)
                .await?;
        }

        Ok(())
    }

    async fn apply_event(&self, event: &BillingEvent) -> AppResult<()> {
        match event.event_type.as_str() {
            "checkout.session.completed" => {
                if event.object()["mode"].as_str() == Some("subscription") {
                    self.handle_checkout_completed(event).await
                } else {
                    debug!(
                        event_id = %event.id,
                        "checkout.session.completed without subscription mode, ignoring"
                    );
                    Ok(())
                }
            }
            "customer.subscription.updated" => self.handle_subscription_updated(event).await,
            "customer.subscription.deleted" => self.handle_subscription_deleted(event).await,
            "payment_intent.succeeded" | "payment_method.attached" => {
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "acknowledged without state change"
                );
                Ok(())
            }
            other => {
                debug!(event_type = other, "unhandled webhook event type");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    async fn handle_checkout_completed(&self, event: &BillingEvent) -> AppResult<()> {
        let session = event.object();
        let customer_id = session["customer"].as_str().unwrap_or("");

        let (Some(billing_sub_id), Some(reference)) = (
            session["subscription"].as_str(),
            session["client_reference_id"].as_str(),
        ) else {
            debug!(
                event_id = %event.id,
                "checkout completed without subscription or client_reference_id"
            );
            return Ok(());
        };

        let account_id = match Uuid::parse_str(reference) {
            Ok(id) => id,
            Err(_) => {
                debug!(
                    event_id = %event.id,
                    reference,
                    "client_reference_id is not a valid account id"
                );
                return Ok(());
            }
        };

        let Some(account) = self.account_repo.get_by_id(account_id).await? else {
            warn!(
                event_id = %event.id,
                account_id = %account_id,
                "account not found for checkout, skipping"
            );
            return Ok(());
        };

        // Second external call: the session carries only the subscription ID.
        let provider_sub = self.provider.get_subscription(billing_sub_id).await?;

        let start_date = timestamp_to_naive(provider_sub.current_period_start)
            .ok_or_else(|| AppError::InvalidInput("invalid current_period_start".into()))?;
        let end_date = timestamp_to_naive(provider_sub.current_period_end)
            .ok_or_else(|| AppError::InvalidInput("invalid current_period_end".into()))?;

        let plan = session["metadata"]["plan"]
            .as_str()
            .unwrap_or(DEFAULT_PLAN)
            .to_string();
        let payment_method = session["payment_method_types"][0]
            .as_str()
            .unwrap_or("card")
            .to_string();
        // Provider amounts are minor currency units.
        let price = provider_sub.unit_amount() as f64 / 100.0;
        let event_date = event
            .created_at()
            .unwrap_or_else(|| Utc::now().naive_utc());

        let subscription = match self
            .subscription_repo
            .get_by_billing_subscription_id(billing_sub_id)
            .await?
        {
            // Re-driven checkout (retry worker or duplicate delivery):
            // refresh the existing record instead of duplicating it.
            Some(existing) => {
                self.update_subscription_with_retry(
                    existing.id,
                    &SubscriptionUpdate {
                        status: Some(SubscriptionStatus::Active),
                        plan: Some(plan),
                        start_date: Some(start_date),
                        end_date: Some(end_date),
                        price: Some(price),
                        payment_method: Some(payment_method),
                        last_event_at: Some(event_date),
                        ..Default::default()
                    },
                )
                .await?
            }
            None => {
                self.subscription_repo
                    .create(&CreateSubscriptionInput {
                        account_id: account.id,
                        billing_subscription_id: billing_sub_id.to_string(),
                        plan,
                        start_date,
                        end_date,
                        status: SubscriptionStatus::Active,
                        price,
                        payment_method,
                        seed_transaction: Transaction {
                            amount: price,
                            date: event_date,
                            external_id: event.id.clone(),
                            status: TransactionStatus::Success,
                        },
                        last_event_at: Some(event_date),
                    })
                    .await?
            }
        };

        self.update_account_with_retry(
            account.id,
            &AccountBillingUpdate {
                billing_customer_id: Some(customer_id.to_string()),
                has_access: Some(true),
                payment_status: Some(AccountPaymentStatus::Completed),
                subscription_id: Some(subscription.id),
            },
        )
        .await?;

        info!(
            event_id = %event.id,
            account_id = %account.id,
            subscription_id = %subscription.id,
            "checkout reconciled"
        );
        Ok(())
    }

    async fn handle_subscription_updated(&self, event: &BillingEvent) -> AppResult<()> {
        let Some((subscription, _)) = self.linked_subscription_for(event).await? else {
            return Ok(());
        };

        let event_date = event.created_at();
        if is_stale(event_date, subscription.last_event_at) {
            debug!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "stale subscription update, skipping"
            );
            return Ok(());
        }

        let object = event.object();
        let status = object["status"]
            .as_str()
            .and_then(SubscriptionStatus::from_provider);
        let end_date = object["current_period_end"]
            .as_i64()
            .and_then(timestamp_to_naive);

        self.update_subscription_with_retry(
            subscription.id,
            &SubscriptionUpdate {
                status,
                end_date,
                last_event_at: event_date,
                ..Default::default()
            },
        )
        .await?;

        info!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            provider_status = object["status"].as_str().unwrap_or(""),
            "subscription update reconciled"
        );
        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &BillingEvent) -> AppResult<()> {
        let Some((subscription, _)) = self.linked_subscription_for(event).await? else {
            return Ok(());
        };

        // Deletion is terminal: applied unconditionally, no date adjustment.
        let event_date = event
            .created_at()
            .filter(|d| subscription.last_event_at.is_none_or(|last| *d > last));

        self.update_subscription_with_retry(
            subscription.id,
            &SubscriptionUpdate {
                status: Some(SubscriptionStatus::Cancelled),
                last_event_at: event_date,
                ..Default::default()
            },
        )
        .await?;

        info!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            "subscription cancellation reconciled"
        );
        Ok(())
    }

    /// Shared lookup path for lifecycle events: provider object → account by
    /// billing-customer ID → linked subscription. Missing records are
    /// expected (customers outside this system) and resolve to `None`.
    async fn linked_subscription_for(
        &self,
        event: &BillingEvent,
    ) -> AppResult<Option<(Subscription, Account)>> {
        let Some(customer_id) = event.object()["customer"].as_str() else {
            debug!(event_id = %event.id, "event without customer id, ignoring");
            return Ok(None);
        };

        let Some(account) = self
            .account_repo
            .get_by_billing_customer_id(customer_id)
            .await?
        else {
            warn!(
                event_id = %event.id,
                customer_id,
                "no account for billing customer, skipping"
            );
            return Ok(None);
        };

        let Some(subscription_id) = account.subscription_id else {
            debug!(
                event_id = %event.id,
                account_id = %account.id,
                "account has no linked subscription, skipping"
            );
            return Ok(None);
        };

        let Some(subscription) = self.subscription_repo.get_by_id(subscription_id).await? else {
            debug!(
                event_id = %event.id,
                subscription_id = %subscription_id,
                "linked subscription missing, skipping"
            );
            return Ok(None);
        };

        Ok(Some((subscription, account)))
    }

    // ========================================================================
    // Optimistic-Concurrency Retry
    // ========================================================================

    async fn update_account_with_retry(
        &self,
        id: Uuid,
        update: &AccountBillingUpdate,
    ) -> AppResult<Account> {
        for _ in 0..MAX_VERSION_RETRIES {
            let current = self
                .account_repo
                .get_by_id(id)
                .await?
                .ok_or(AppError::NotFound)?;
            match self
                .account_repo
                .update_billing(id, update, current.version)
                .await
            {
                Err(AppError::Conflict) => continue,
                other => return other,
            }
        }
        Err(AppError::Conflict)
    }

    async fn update_subscription_with_retry(
        &self,
        id: Uuid,
        update: &SubscriptionUpdate,
    ) -> AppResult<Subscription> {
        for _ in 0..MAX_VERSION_RETRIES {
            let current = self
                .subscription_repo
                .get_by_id(id)
                .await?
                .ok_or(AppError::NotFound)?;
            match self
                .subscription_repo
                .update(id, update, current.version)
                .await
            {
                Err(AppError::Conflict) => continue,
                other => return other,
            }
        }
        Err(AppError::Conflict)
    }

    // ========================================================================
    // Reconciliation Attempts (called by the webhook route and the worker)
    // ========================================================================

    pub async fn enqueue_retry(
        &self,
        event: &BillingEvent,
        payload: JsonValue,
        error: &AppError,
    ) -> AppResult<ReconciliationAttempt> {
        let next_attempt =
            Utc::now().naive_utc() + chrono::Duration::seconds(retry_backoff_delay(0));
        self.attempt_repo
            .create(
                &event.id,
                &event.event_type,
                payload,
                &error.to_string(),
                next_attempt,
            )
            .await
    }

    pub async fn claim_due_attempts(
        &self,
        batch_size: i64,
    ) -> AppResult<Vec<ReconciliationAttempt>> {
        self.attempt_repo.claim_due(batch_size).await
    }

    pub async fn complete_attempt(&self, id: Uuid) -> AppResult<()> {
        self.attempt_repo.mark_succeeded(id).await
    }

    /// Record a failed retry, abandoning the attempt once the cap is hit.
    /// Abandoned events are only visible through error-level logs.
    pub async fn fail_attempt(
        &self,
        attempt: &ReconciliationAttempt,
        error: &AppError,
    ) -> AppResult<()> {
        let attempt_count = attempt.attempt_count + 1;
        if attempt_count >= MAX_RECONCILE_ATTEMPTS {
            error!(
                event_id = %attempt.event_id,
                event_type = %attempt.event_type,
                error = %error,
                "reconciliation attempts exhausted, abandoning event"
            );
            self.attempt_repo
                .mark_abandoned(attempt.id, &error.to_string())
                .await
        } else {
            let next_attempt = Utc::now().naive_utc()
                + chrono::Duration::seconds(retry_backoff_delay(attempt_count));
            self.attempt_repo
                .mark_failed(attempt.id, attempt_count, next_attempt, &error.to_string())
                .await
        }
    }

    pub async fn abandon_attempt(&self, id: Uuid, error: &AppError) -> AppResult<()> {
        self.attempt_repo.mark_abandoned(id, &error.to_string()).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn is_mutating_event(event_type: &str) -> bool {
    matches!(
        event_type,
        "checkout.session.completed"
            | "customer.subscription.updated"
            | "customer.subscription.deleted"
    )
}

fn is_stale(event_date: Option<NaiveDateTime>, last_applied: Option<NaiveDateTime>) -> bool {
    match (event_date, last_applied) {
        (Some(event), Some(last)) => event <= last,
        _ => false,
    }
}

/// Determines whether a reconciliation error is worth retrying.
///
/// Retryable errors are queued for the background worker; non-retryable
/// ones (missing records, malformed payloads) are logged and dropped — a
/// retry cannot create a record that does not exist.
pub fn is_retryable_error(error: &AppError) -> bool {
    match error {
        AppError::Database(_) => true,
        AppError::Provider(_) => true,
        AppError::Internal(_) => true,
        AppError::Conflict => true,

        AppError::NotFound => false,
        AppError::InvalidInput(_) => false,
        AppError::SignatureInvalid => false,
    }
}

pub fn retry_backoff_delay(attempt_count: i32) -> i64 {
    let base_delay: i64 = 60;
    let max_delay: i64 = 3600;
    let exponential = base_delay.saturating_mul(4i64.saturating_pow(attempt_count as u32));
    let capped = exponential.min(max_delay);
    let jitter = (rand::random::<u64>() % 30) as i64;
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_increases_exponentially() {
        let d1 = retry_backoff_delay(0);
        let d2 = retry_backoff_delay(1);
        let d3 = retry_backoff_delay(2);

        assert!(d1 >= 60 && d1 < 90);
        assert!(d2 >= 240 && d2 < 270);
        assert!(d3 >= 960 && d3 < 990);
    }

    #[test]
    fn backoff_delay_is_capped() {
        let d = retry_backoff_delay(10);
        assert!(d <= 3630);
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_error(&AppError::Database("lost".into())));
        assert!(is_retryable_error(&AppError::Provider("timeout".into())));
        assert!(is_retryable_error(&AppError::Internal("oops".into())));
        assert!(is_retryable_error(&AppError::Conflict));

        assert!(!is_retryable_error(&AppError::NotFound));
        assert!(!is_retryable_error(&AppError::InvalidInput("bad".into())));
        assert!(!is_retryable_error(&AppError::SignatureInvalid));
    }

    #[test]
    fn mutating_event_types() {
        assert!(is_mutating_event("checkout.session.completed"));
        assert!(is_mutating_event("customer.subscription.updated"));
        assert!(is_mutating_event("customer.subscription.deleted"));

        assert!(!is_mutating_event("payment_intent.succeeded"));
        assert!(!is_mutating_event("payment_method.attached"));
        assert!(!is_mutating_event("invoice.paid"));
    }

    #[tokio::test]
    async fn checkout_redrive_updates_existing_subscription() {
        use crate::test_utils::{
            TestBillingMocks, create_provider_subscription, create_test_account,
        };

        let account = create_test_account(|_| {});
        let account_id = account.id;
        let mocks = TestBillingMocks::new().with_account(account);
        mocks.provider.insert(create_provider_subscription(|_| {}));
        let uc = mocks.use_cases();

        let event_payload = |event_id: &str| {
            serde_json::json!({
                "id": event_id,
                "type": "checkout.session.completed",
                "created": 1_735_693_200,
                "data": { "object": {
                    "mode": "subscription",
                    "customer": "cus_123",
                    "subscription": "sub_123",
                    "client_reference_id": account_id.to_string(),
                }}
            })
        };

        let first: BillingEvent = serde_json::from_value(event_payload("evt_1")).unwrap();
        uc.process_event(&first).await.unwrap();

        // A redelivered checkout under a fresh event ID refreshes the record
        // instead of duplicating it or re-seeding the transaction log.
        let second: BillingEvent = serde_json::from_value(event_payload("evt_2")).unwrap();
        uc.process_event(&second).await.unwrap();

        let account = mocks.accounts.get(account_id);
        let subscription = mocks.subscriptions.get(account.subscription_id.unwrap());
        assert_eq!(mocks.subscriptions.count(), 1);
        assert_eq!(subscription.transactions.len(), 1);
        assert_eq!(subscription.status, SubscriptionStatus::Active);
    }

    #[test]
    fn staleness_guard() {
        let older = timestamp_to_naive(1_700_000_000);
        let newer = timestamp_to_naive(1_700_000_100);

        assert!(is_stale(older, newer));
        assert!(is_stale(older, older));
        assert!(!is_stale(newer, older));
        // No timestamps to compare: apply the event.
        assert!(!is_stale(None, newer));
        assert!(!is_stale(older, None));
    }
}
