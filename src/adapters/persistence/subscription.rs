use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::{PostgresPersistence, parse_json_with_fallback},
    app_error::{AppError, AppResult},
    application::use_cases::billing_events::{
        CreateSubscriptionInput, SubscriptionRepo, SubscriptionUpdate,
    },
    domain::entities::subscription::{Subscription, Transaction},
};

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Subscription {
    let id: Uuid = row.get("id");
    let transactions_json: JsonValue = row.get("transactions");
    let transactions: Vec<Transaction> = parse_json_with_fallback(
        &transactions_json,
        "transactions",
        "subscription",
        &id.to_string(),
    );

    Subscription {
        id,
        account_id: row.get("account_id"),
        billing_subscription_id: row.get("billing_subscription_id"),
        plan: row.get("plan"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        status: row.get("status"),
        price: row.get("price"),
        payment_method: row.get("payment_method"),
        transactions,
        last_event_at: row.get("last_event_at"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_COLS: &str = r#"
    id, account_id, billing_subscription_id, plan, start_date, end_date,
    status, price, payment_method, transactions, last_event_at, version,
    created_at, updated_at
"#;

#[async_trait]
impl SubscriptionRepo for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SELECT_COLS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn get_by_billing_subscription_id(
        &self,
        billing_subscription_id: &str,
    ) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE billing_subscription_id = $1",
            SELECT_COLS
        ))
        .bind(billing_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn create(&self, input: &CreateSubscriptionInput) -> AppResult<Subscription> {
        let id = Uuid::new_v4();
        let transactions = serde_json::to_value(vec![&input.seed_transaction])
            .map_err(|e| AppError::Internal(format!("failed to serialize transaction: {}", e)))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions
                (id, account_id, billing_subscription_id, plan, start_date, end_date,
                 status, price, payment_method, transactions, last_event_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1)
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(input.account_id)
        .bind(&input.billing_subscription_id)
        .bind(&input.plan)
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(input.status)
        .bind(input.price)
        .bind(&input.payment_method)
        .bind(transactions)
        .bind(input.last_event_at)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row_to_subscription(&row))
    }

    async fn update(
        &self,
        id: Uuid,
        update: &SubscriptionUpdate,
        expected_version: i32,
    ) -> AppResult<Subscription> {
        let pushed: Option<JsonValue> = update
            .push_transaction
            .as_ref()
            .map(|tx| serde_json::to_value(vec![tx]))
            .transpose()
            .map_err(|e| AppError::Internal(format!("failed to serialize transaction: {}", e)))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions SET
                status = COALESCE($2, status),
                plan = COALESCE($3, plan),
                start_date = COALESCE($4, start_date),
                end_date = COALESCE($5, end_date),
                price = COALESCE($6, price),
                payment_method = COALESCE($7, payment_method),
                transactions = transactions || COALESCE($8, '[]'::jsonb),
                last_event_at = COALESCE($9, last_event_at),
                version = version + 1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND version = $10
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(update.status)
        .bind(&update.plan)
        .bind(update.start_date)
        .bind(update.end_date)
        .bind(update.price)
        .bind(&update.payment_method)
        .bind(pushed)
        .bind(update.last_event_at)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        match row {
            Some(row) => Ok(row_to_subscription(&row)),
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
