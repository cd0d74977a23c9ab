//! Test app state builder for HTTP-level integration testing.
//!
//! This module provides `TestAppStateBuilder` which creates a minimal
//! `AppState` backed by in-memory mocks for testing the webhook endpoint.

use std::sync::Arc;

use axum::http::HeaderValue;
use secrecy::SecretString;

use crate::{
    adapters::http::app_state::AppState,
    application::ports::billing_provider::ProviderSubscription,
    domain::entities::{account::Account, subscription::Subscription},
    infra::config::AppConfig,
    test_utils::TestBillingMocks,
};

/// Builder for creating `AppState` with in-memory mocks for testing.
///
/// # Example
///
/// ```ignore
/// let account = create_test_account(|a| a.email = "anna@example.com".to_string());
///
/// let (app_state, mocks) = TestAppStateBuilder::new()
///     .with_account(account)
///     .with_provider_subscription(create_provider_subscription(|_| {}))
///     .build_with_mocks();
/// ```
pub struct TestAppStateBuilder {
    mocks: TestBillingMocks,
    webhook_secret: Option<String>,
}

impl TestAppStateBuilder {
    /// Create a new builder. Signature verification is off by default, the
    /// way a local-dev deployment without a webhook secret runs.
    pub fn new() -> Self {
        Self {
            mocks: TestBillingMocks::new(),
            webhook_secret: None,
        }
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.mocks = self.mocks.with_account(account);
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.mocks = self.mocks.with_subscription(subscription);
        self
    }

    pub fn with_provider_subscription(self, subscription: ProviderSubscription) -> Self {
        self.mocks.provider.insert(subscription);
        self
    }

    /// Configure a webhook secret, enabling signature verification.
    pub fn with_webhook_secret(mut self, secret: &str) -> Self {
        self.webhook_secret = Some(secret.to_string());
        self
    }

    /// Build the AppState with all configured mocks.
    pub fn build(self) -> AppState {
        self.build_with_mocks().0
    }

    /// Build the AppState, returning the mock handles for test assertions.
    pub fn build_with_mocks(self) -> (AppState, TestBillingMocks) {
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:3001".parse().unwrap(),
            database_url: String::new(),
            cors_origin: HeaderValue::from_static("http://localhost:3000"),
            billing_secret_key: SecretString::new("sk_test".into()),
            billing_webhook_secret: self
                .webhook_secret
                .map(|s| SecretString::new(s.into())),
        });

        let billing_use_cases = Arc::new(self.mocks.use_cases());

        (
            AppState {
                config,
                billing_use_cases,
            },
            self.mocks,
        )
    }
}

impl Default for TestAppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
