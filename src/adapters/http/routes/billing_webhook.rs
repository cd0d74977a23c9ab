//! Billing provider webhook endpoint.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use secrecy::ExposeSecret;
use tracing::{debug, error, warn};

use crate::adapters::http::app_state::AppState;
use crate::app_error::{AppError, AppResult};
use crate::application::use_cases::billing_events::is_retryable_error;
use crate::domain::entities::billing_event::BillingEvent;
use crate::infra::stripe_client::StripeClient;

/// POST /api/billing/webhook
///
/// Always acknowledges 200 with an empty body so the provider does not
/// redeliver; the only exception is a signature failure (400). Failed
/// reconciliations are queued for the background worker instead of being
/// surfaced to the provider.
async fn handle_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<impl IntoResponse> {
    match app_state.config.billing_webhook_secret.as_ref() {
        Some(secret) => {
            let signature = headers
                .get("stripe-signature")
                .and_then(|v| v.to_str().ok())
                .ok_or(AppError::SignatureInvalid)?;
            StripeClient::verify_webhook_signature(&body, signature, secret.expose_secret())?;
        }
        None => {
            debug!("no webhook secret configured, accepting payload unverified");
        }
    }

    let payload: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "webhook body is not valid JSON, acknowledging without processing");
            return Ok(StatusCode::OK);
        }
    };

    let event: BillingEvent = match serde_json::from_value(payload.clone()) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "webhook payload is not an event envelope, acknowledging");
            return Ok(StatusCode::OK);
        }
    };

    match app_state.billing_use_cases.process_event(&event).await {
        Ok(()) => {}
        Err(e) if is_retryable_error(&e) => {
            error!(
                error = %e,
                event_type = %event.event_type,
                event_id = %event.id,
                "webhook reconciliation failed, queueing retry"
            );
            if let Err(queue_err) = app_state
                .billing_use_cases
                .enqueue_retry(&event, payload, &e)
                .await
            {
                error!(
                    error = %queue_err,
                    event_id = %event.id,
                    "failed to queue reconciliation attempt"
                );
            }
        }
        Err(e) => {
            warn!(
                error = %e,
                event_type = %event.event_type,
                event_id = %event.id,
                "webhook reconciliation failed (non-retryable), skipping"
            );
        }
    }

    Ok(StatusCode::OK)
}

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/webhook", post(handle_webhook))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;
    use uuid::Uuid;

    use crate::domain::entities::account::AccountPaymentStatus;
    use crate::domain::entities::billing_event::timestamp_to_naive;
    use crate::domain::entities::subscription::{SubscriptionStatus, TransactionStatus};
    use crate::test_utils::{
        TestAppStateBuilder, create_provider_subscription, create_test_account,
        create_test_subscription,
    };

    const PERIOD_START: i64 = 1_735_689_600; // 2025-01-01T00:00:00Z
    const PERIOD_END: i64 = 1_738_368_000; // 2025-02-01T00:00:00Z
    const EVENT_CREATED: i64 = 1_735_693_200;

    fn build_test_router(app_state: AppState) -> Router<()> {
        router().with_state(app_state)
    }

    fn sign(body: &str, secret: &str) -> String {
        let timestamp = chrono::Utc::now().timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    fn checkout_event(account_id: Uuid) -> serde_json::Value {
        json!({
            "id": "evt_checkout_1",
            "type": "checkout.session.completed",
            "created": EVENT_CREATED,
            "data": { "object": {
                "mode": "subscription",
                "customer": "cus_123",
                "subscription": "sub_123",
                "client_reference_id": account_id.to_string(),
                "payment_method_types": ["card"],
            }}
        })
    }

    fn subscription_event(event_type: &str, status: &str, created: i64) -> serde_json::Value {
        json!({
            "id": format!("evt_{}_{}", status, created),
            "type": event_type,
            "created": created,
            "data": { "object": {
                "id": "sub_123",
                "customer": "cus_123",
                "status": status,
            }}
        })
    }

    // =========================================================================
    // Signature verification
    // =========================================================================

    #[tokio::test]
    async fn missing_signature_returns_400_without_processing() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_webhook_secret("whsec_test")
            .with_account(account)
            .build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(checkout_event(account_id).to_string())
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(!mocks.accounts.get(account_id).has_access);
        assert_eq!(mocks.subscriptions.count(), 0);
        assert_eq!(mocks.attempts.count(), 0);
    }

    #[tokio::test]
    async fn invalid_signature_returns_400_without_processing() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_webhook_secret("whsec_test")
            .with_account(account)
            .build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let body = checkout_event(account_id).to_string();
        let response = server
            .post("/webhook")
            .add_header("stripe-signature", sign(&body, "whsec_wrong"))
            .text(body)
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(mocks.subscriptions.count(), 0);
    }

    #[tokio::test]
    async fn valid_signature_is_processed() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_webhook_secret("whsec_test")
            .with_account(account)
            .with_provider_subscription(create_provider_subscription(|_| {}))
            .build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let body = checkout_event(account_id).to_string();
        let response = server
            .post("/webhook")
            .add_header("stripe-signature", sign(&body, "whsec_test"))
            .text(body)
            .await;

        response.assert_status_ok();
        assert!(mocks.accounts.get(account_id).has_access);
    }

    #[tokio::test]
    async fn no_secret_trusts_payload() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_account(account)
            .with_provider_subscription(create_provider_subscription(|_| {}))
            .build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(checkout_event(account_id).to_string())
            .await;

        response.assert_status_ok();
        assert!(mocks.accounts.get(account_id).has_access);
    }

    // =========================================================================
    // checkout.session.completed
    // =========================================================================

    #[tokio::test]
    async fn checkout_creates_subscription_and_links_account() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_account(account)
            .with_provider_subscription(create_provider_subscription(|s| {
                s.current_period_start = PERIOD_START;
                s.current_period_end = PERIOD_END;
                s.items.data[0].price.unit_amount = Some(1999);
            }))
            .build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(checkout_event(account_id).to_string())
            .await;

        response.assert_status_ok();
        response.assert_text("");

        let account = mocks.accounts.get(account_id);
        assert!(account.has_access);
        assert_eq!(account.payment_status, AccountPaymentStatus::Completed);
        assert_eq!(account.billing_customer_id.as_deref(), Some("cus_123"));

        let subscription = mocks.subscriptions.get(account.subscription_id.unwrap());
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.price, 19.99);
        assert_eq!(subscription.plan, "Premium");
        assert_eq!(
            subscription.start_date,
            timestamp_to_naive(PERIOD_START).unwrap()
        );
        assert_eq!(subscription.end_date, timestamp_to_naive(PERIOD_END).unwrap());
        assert_eq!(subscription.transactions.len(), 1);
        assert_eq!(
            subscription.transactions[0].status,
            TransactionStatus::Success
        );
        assert_eq!(subscription.transactions[0].external_id, "evt_checkout_1");
        assert_eq!(subscription.transactions[0].amount, 19.99);
    }

    #[tokio::test]
    async fn checkout_plan_label_from_metadata() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_account(account)
            .with_provider_subscription(create_provider_subscription(|_| {}))
            .build_with_mocks();

        let mut event = checkout_event(account_id);
        event["data"]["object"]["metadata"] = json!({"plan": "Studio"});

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        server.post("/webhook").text(event.to_string()).await;

        let account = mocks.accounts.get(account_id);
        let subscription = mocks.subscriptions.get(account.subscription_id.unwrap());
        assert_eq!(subscription.plan, "Studio");
    }

    #[tokio::test]
    async fn checkout_unknown_account_is_acknowledged_noop() {
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_provider_subscription(create_provider_subscription(|_| {}))
            .build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(checkout_event(Uuid::new_v4()).to_string())
            .await;

        response.assert_status_ok();
        assert_eq!(mocks.subscriptions.count(), 0);
        assert_eq!(mocks.attempts.count(), 0);
    }

    #[tokio::test]
    async fn checkout_without_subscription_mode_is_ignored() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_account(account)
            .build_with_mocks();

        let mut event = checkout_event(account_id);
        event["data"]["object"]["mode"] = json!("payment");

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server.post("/webhook").text(event.to_string()).await;

        response.assert_status_ok();
        assert_eq!(mocks.subscriptions.count(), 0);
        assert!(!mocks.accounts.get(account_id).has_access);
    }

    #[tokio::test]
    async fn checkout_provider_failure_queues_retry() {
        let account = create_test_account(|_| {});
        let account_id = account.id;
        let (app_state, mocks) = TestAppStateBuilder::new()
            .with_account(account)
            .build_with_mocks();
        mocks.provider.set_unavailable(true);

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(checkout_event(account_id).to_string())
            .await;

        // Still acknowledged; the retry worker owns the failure now.
        response.assert_status_ok();
        assert_eq!(mocks.subscriptions.count(), 0);
        assert_eq!(mocks.attempts.count(), 1);
        assert_eq!(mocks.attempts.single().event_id, "evt_checkout_1");
    }

    // =========================================================================
    // customer.subscription.updated / deleted
    // =========================================================================

    fn linked_account_state() -> (TestAppStateBuilder, Uuid, Uuid) {
        let mut account = create_test_account(|a| {
            a.billing_customer_id = Some("cus_123".to_string());
        });
        let subscription = create_test_subscription(account.id, |s| {
            s.billing_subscription_id = "sub_123".to_string();
        });
        account.subscription_id = Some(subscription.id);
        let account_id = account.id;
        let subscription_id = subscription.id;

        let builder = TestAppStateBuilder::new()
            .with_account(account)
            .with_subscription(subscription);
        (builder, account_id, subscription_id)
    }

    #[tokio::test]
    async fn update_canceled_sets_cancelled_and_keeps_end_date() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();
        let end_before = mocks.subscriptions.get(subscription_id).end_date;

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.updated", "canceled", EVENT_CREATED)
                    .to_string(),
            )
            .await;

        response.assert_status_ok();
        let subscription = mocks.subscriptions.get(subscription_id);
        assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
        assert_eq!(subscription.end_date, end_before);
    }

    #[tokio::test]
    async fn update_unpaid_sets_expired() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.updated", "unpaid", EVENT_CREATED)
                    .to_string(),
            )
            .await;

        assert_eq!(
            mocks.subscriptions.get(subscription_id).status,
            SubscriptionStatus::Expired
        );
    }

    #[tokio::test]
    async fn update_unknown_provider_status_leaves_status_unchanged() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.updated", "past_due", EVENT_CREATED)
                    .to_string(),
            )
            .await;

        assert_eq!(
            mocks.subscriptions.get(subscription_id).status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn update_overwrites_end_date_when_period_end_present() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();

        let mut event =
            subscription_event("customer.subscription.updated", "active", EVENT_CREATED);
        event["data"]["object"]["current_period_end"] = json!(PERIOD_END);

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        server.post("/webhook").text(event.to_string()).await;

        assert_eq!(
            mocks.subscriptions.get(subscription_id).end_date,
            timestamp_to_naive(PERIOD_END).unwrap()
        );
    }

    #[tokio::test]
    async fn update_for_unknown_customer_is_acknowledged_noop() {
        let (app_state, mocks) = TestAppStateBuilder::new().build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.updated", "canceled", EVENT_CREATED)
                    .to_string(),
            )
            .await;

        response.assert_status_ok();
        assert_eq!(mocks.attempts.count(), 0);
    }

    #[tokio::test]
    async fn stale_update_is_skipped() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        // Apply a newer event first, then deliver an older one out of order.
        server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.updated", "active", EVENT_CREATED + 100)
                    .to_string(),
            )
            .await;
        server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.updated", "canceled", EVENT_CREATED)
                    .to_string(),
            )
            .await;

        assert_eq!(
            mocks.subscriptions.get(subscription_id).status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn replayed_update_is_idempotent() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let event =
            subscription_event("customer.subscription.updated", "canceled", EVENT_CREATED);
        server.post("/webhook").text(event.to_string()).await;
        let after_first = mocks.subscriptions.get(subscription_id);

        server.post("/webhook").text(event.to_string()).await;
        let after_second = mocks.subscriptions.get(subscription_id);

        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.end_date, after_second.end_date);
        assert_eq!(after_first.version, after_second.version);
    }

    #[tokio::test]
    async fn delete_cancels_unconditionally() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(
                subscription_event("customer.subscription.deleted", "canceled", EVENT_CREATED)
                    .to_string(),
            )
            .await;

        response.assert_status_ok();
        let subscription = mocks.subscriptions.get(subscription_id);
        assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
    }

    // =========================================================================
    // Log-only and unrecognized events
    // =========================================================================

    #[tokio::test]
    async fn payment_intent_succeeded_is_log_only() {
        let (builder, account_id, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(
                json!({
                    "id": "evt_pi_1",
                    "type": "payment_intent.succeeded",
                    "created": EVENT_CREATED,
                    "data": { "object": { "customer": "cus_123" } }
                })
                .to_string(),
            )
            .await;

        response.assert_status_ok();
        assert_eq!(
            mocks.subscriptions.get(subscription_id).status,
            SubscriptionStatus::Active
        );
        assert!(!mocks.accounts.get(account_id).has_access);
    }

    #[tokio::test]
    async fn unrecognized_event_type_returns_200_without_mutation() {
        let (builder, _, subscription_id) = linked_account_state();
        let (app_state, mocks) = builder.build_with_mocks();
        let before = mocks.subscriptions.get(subscription_id);

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server
            .post("/webhook")
            .text(
                json!({
                    "id": "evt_misc_1",
                    "type": "invoice.finalized",
                    "created": EVENT_CREATED,
                    "data": { "object": { "customer": "cus_123" } }
                })
                .to_string(),
            )
            .await;

        response.assert_status_ok();
        let after = mocks.subscriptions.get(subscription_id);
        assert_eq!(before.status, after.status);
        assert_eq!(before.version, after.version);
        assert_eq!(mocks.attempts.count(), 0);
    }

    #[tokio::test]
    async fn non_json_body_is_acknowledged() {
        let (app_state, mocks) = TestAppStateBuilder::new().build_with_mocks();

        let server = TestServer::new(build_test_router(app_state)).unwrap();
        let response = server.post("/webhook").text("not json").await;

        response.assert_status_ok();
        assert_eq!(mocks.attempts.count(), 0);
    }
}
