use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::billing_events::{AccountBillingUpdate, AccountRepo},
    domain::entities::account::Account,
};

fn row_to_account(row: &sqlx::postgres::PgRow) -> Account {
    Account {
        id: row.get("id"),
        email: row.get("email"),
        billing_customer_id: row.get("billing_customer_id"),
        has_access: row.get("has_access"),
        payment_status: row.get("payment_status"),
        subscription_id: row.get("subscription_id"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_COLS: &str = r#"
    id, email, billing_customer_id, has_access, payment_status,
    subscription_id, version, created_at, updated_at
"#;

#[async_trait]
impl AccountRepo for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            SELECT_COLS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_account))
    }

    async fn get_by_billing_customer_id(
        &self,
        billing_customer_id: &str,
    ) -> AppResult<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE billing_customer_id = $1",
            SELECT_COLS
        ))
        .bind(billing_customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_account))
    }

    async fn update_billing(
        &self,
        id: Uuid,
        update: &AccountBillingUpdate,
        expected_version: i32,
    ) -> AppResult<Account> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE accounts SET
                billing_customer_id = COALESCE($2, billing_customer_id),
                has_access = COALESCE($3, has_access),
                payment_status = COALESCE($4, payment_status),
                subscription_id = COALESCE($5, subscription_id),
                version = version + 1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND version = $6
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(&update.billing_customer_id)
        .bind(update.has_access)
        .bind(update.payment_status)
        .bind(update.subscription_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        match row {
            Some(row) => Ok(row_to_account(&row)),
            // No row matched: either the account vanished or the version
            // moved under us.
            None => {
                if self.get_by_id(id).await?.is_some() {
                    Err(AppError::Conflict)
                } else {
                    Err(AppError::NotFound)
                }
            }
        }
    }
}
