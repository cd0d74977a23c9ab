use std::fs::File;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::http::app_state::AppState,
    application::use_cases::billing_events::{
        AccountRepo, BillingEventUseCases, ProcessedEventRepo, ReconciliationAttemptRepo,
        SubscriptionRepo,
    },
    infra::{config::AppConfig, postgres_persistence, stripe_client::StripeClient},
};

pub async fn init_app_state() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env();

    let postgres_arc = Arc::new(postgres_persistence(&config.database_url).await?);

    let account_repo = postgres_arc.clone() as Arc<dyn AccountRepo>;
    let subscription_repo = postgres_arc.clone() as Arc<dyn SubscriptionRepo>;
    let processed_repo = postgres_arc.clone() as Arc<dyn ProcessedEventRepo>;
    let attempt_repo = postgres_arc.clone() as Arc<dyn ReconciliationAttemptRepo>;

    let provider = Arc::new(StripeClient::new(
        config.billing_secret_key.expose_secret().to_string(),
    ));

    let billing_use_cases = BillingEventUseCases::new(
        account_repo,
        subscription_repo,
        processed_repo,
        attempt_repo,
        provider,
    );

    Ok(AppState {
        config: Arc::new(config),
        billing_use_cases: Arc::new(billing_use_cases),
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "visiona_billing=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .pretty();

    // File (structured JSON logs)
    let file = File::create("app.log").expect("cannot create log file");
    let json_layer = fmt::layer()
        .json()
        .with_writer(file)
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
