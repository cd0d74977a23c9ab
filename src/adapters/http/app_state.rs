use std::sync::Arc;

use crate::{
    application::use_cases::billing_events::BillingEventUseCases, infra::config::AppConfig,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub billing_use_cases: Arc<BillingEventUseCases>,
}
