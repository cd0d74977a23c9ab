use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use crate::application::use_cases::billing_events::{BillingEventUseCases, is_retryable_error};
use crate::domain::entities::billing_event::BillingEvent;
use crate::domain::entities::reconciliation::ReconciliationAttempt;

const POLL_INTERVAL_SECS: u64 = 30;
const BATCH_SIZE: i64 = 25;

/// Background loop re-driving acknowledged-but-unreconciled webhook events.
///
/// The webhook endpoint always answers 200, so the provider never redelivers
/// on our behalf; this worker is the only retry path.
pub async fn run_reconciliation_loop(billing_uc: Arc<BillingEventUseCases>) {
    let mut ticker = interval(Duration::from_secs(POLL_INTERVAL_SECS));

    info!(
        "Reconciliation worker started (polling every {}s, batch {})",
        POLL_INTERVAL_SECS, BATCH_SIZE
    );

    loop {
        ticker.tick().await;
        process_due_attempts(&billing_uc).await;
    }
}

pub async fn process_due_attempts(billing_uc: &BillingEventUseCases) {
    let attempts = match billing_uc.claim_due_attempts(BATCH_SIZE).await {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "Failed to claim due reconciliation attempts");
            return;
        }
    };

    if attempts.is_empty() {
        return;
    }

    info!(count = attempts.len(), "Retrying reconciliation attempts");

    for attempt in attempts {
        retry_one(billing_uc, &attempt).await;
    }
}

async fn retry_one(billing_uc: &BillingEventUseCases, attempt: &ReconciliationAttempt) {
    let event: BillingEvent = match serde_json::from_value(attempt.payload.clone()) {
        Ok(e) => e,
        Err(e) => {
            error!(
                attempt_id = %attempt.id,
                event_id = %attempt.event_id,
                error = %e,
                "Stored payload no longer parses, abandoning attempt"
            );
            let _ = billing_uc
                .abandon_attempt(
                    attempt.id,
                    &crate::app_error::AppError::InvalidInput(format!(
                        "stored payload unparsable: {}",
                        e
                    )),
                )
                .await;
            return;
        }
    };

    match billing_uc.process_event(&event).await {
        Ok(()) => {
            if let Err(e) = billing_uc.complete_attempt(attempt.id).await {
                error!(
                    attempt_id = %attempt.id,
                    error = %e,
                    "Failed to record reconciliation success"
                );
            }
        }
        Err(e) if is_retryable_error(&e) => {
            if let Err(record_err) = billing_uc.fail_attempt(attempt, &e).await {
                error!(
                    attempt_id = %attempt.id,
                    error = %record_err,
                    "Failed to record reconciliation failure"
                );
            }
        }
        Err(e) => {
            error!(
                attempt_id = %attempt.id,
                event_id = %attempt.event_id,
                error = %e,
                "Non-retryable reconciliation failure, abandoning attempt"
            );
            let _ = billing_uc.abandon_attempt(attempt.id, &e).await;
        }
    }
}
