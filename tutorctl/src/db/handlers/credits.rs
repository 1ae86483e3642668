//! Database repository for credit balances and the credit ledger.

use crate::db::{
    errors::Result,
    models::credits::{CreditTransactionCreateDBRequest, CreditTransactionDBResponse},
};
use crate::types::{abbrev_uuid, ApplicationId, UserId};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

const TRANSACTION_COLUMNS: &str =
    "id, user_id, operation, amount, balance_after, reason, booking_id, template_application_id, performed_by, created_at";

pub struct Credits<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Credits<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Lock the balance row for the rest of the transaction, creating it at zero first if needed
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn lock_balance(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO credit_balances (user_id, balance, updated_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(at)
        .execute(&mut *self.db)
        .await?;

        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM credit_balances WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn store_balance(&mut self, user_id: UserId, balance: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE credit_balances SET balance = $2, updated_at = $3 WHERE user_id = $1")
            .bind(user_id)
            .bind(balance)
            .bind(at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Get current balance for a user without taking a lock
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn get_balance(&mut self, user_id: UserId) -> Result<Option<i64>> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM credit_balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(balance)
    }

    /// Append a ledger entry
    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), operation = ?request.operation, amount = request.amount), err)]
    pub async fn create_transaction(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let sql = format!(
            r#"
            INSERT INTO credit_transactions
                (user_id, operation, amount, balance_after, reason, booking_id, template_application_id, performed_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        let transaction = sqlx::query_as::<_, CreditTransactionDBResponse>(&sql)
            .bind(request.user_id)
            .bind(request.operation)
            .bind(request.amount)
            .bind(request.balance_after)
            .bind(&request.reason)
            .bind(request.booking_id)
            .bind(request.template_application_id)
            .bind(request.performed_by)
            .bind(request.created_at)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(transaction)
    }

    /// List transactions for a specific user with pagination
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn list_user_transactions(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            LIMIT $3
            "#
        );
        let transactions = sqlx::query_as::<_, CreditTransactionDBResponse>(&sql)
            .bind(user_id)
            .bind(skip)
            .bind(limit)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(transactions)
    }

    /// Every deduction and refund that references a template application
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&application_id)), err)]
    pub async fn list_application_transactions(&mut self, application_id: ApplicationId) -> Result<Vec<CreditTransactionDBResponse>> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE template_application_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        );
        let transactions = sqlx::query_as::<_, CreditTransactionDBResponse>(&sql)
            .bind(application_id)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(transactions)
    }
}
