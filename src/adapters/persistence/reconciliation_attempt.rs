use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::billing_events::ReconciliationAttemptRepo,
    domain::entities::reconciliation::ReconciliationAttempt,
};

/// Claimed attempts are invisible to other claimers for this long; a worker
/// that dies mid-retry releases them implicitly when the lease lapses.
const CLAIM_LEASE_SECS: i64 = 300;

fn row_to_attempt(row: &sqlx::postgres::PgRow) -> ReconciliationAttempt {
    ReconciliationAttempt {
        id: row.get("id"),
        event_id: row.get("event_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        status: row.get("status"),
        attempt_count: row.get("attempt_count"),
        next_attempt_at: row.get("next_attempt_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_COLS: &str = r#"
    id, event_id, event_type, payload, status, attempt_count,
    next_attempt_at, last_error, created_at, updated_at
"#;

#[async_trait]
impl ReconciliationAttemptRepo for PostgresPersistence {
    async fn create(
        &self,
        event_id: &str,
        event_type: &str,
        payload: JsonValue,
        last_error: &str,
        next_attempt_at: NaiveDateTime,
    ) -> AppResult<ReconciliationAttempt> {
        let id = Uuid::new_v4();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO reconciliation_attempts
                (id, event_id, event_type, payload, status, attempt_count,
                 next_attempt_at, last_error)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6)
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(next_attempt_at)
        .bind(last_error)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row_to_attempt(&row))
    }

    async fn claim_due(&self, limit: i64) -> AppResult<Vec<ReconciliationAttempt>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE reconciliation_attempts SET
                next_attempt_at = CURRENT_TIMESTAMP + make_interval(secs => {lease}),
                updated_at = CURRENT_TIMESTAMP
            WHERE id IN (
                SELECT id FROM reconciliation_attempts
                WHERE status = 'pending' AND next_attempt_at <= CURRENT_TIMESTAMP
                ORDER BY next_attempt_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {cols}
            "#,
            lease = CLAIM_LEASE_SECS,
            cols = SELECT_COLS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_attempt).collect())
    }

    async fn mark_succeeded(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE reconciliation_attempts SET
                status = 'succeeded',
                next_attempt_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_attempt_at: NaiveDateTime,
        error: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE reconciliation_attempts SET
                attempt_count = $2,
                next_attempt_at = $3,
                last_error = $4,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn mark_abandoned(&self, id: Uuid, error: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE reconciliation_attempts SET
                status = 'abandoned',
                next_attempt_at = NULL,
                last_error = $2,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }
}
