//! Credit ledger.
//!
//! Every user has one integer balance and an append-only log of the movements that produced
//! it. [`CreditLedger`] operates inside a unit of work opened by one of the engines: it locks
//! the balance row before reading it, checks the movement, then writes the new balance and one
//! log row. [`LedgerService`] wraps the operations that stand on their own (grants, reads).

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::db::models::credits::{CreditOperation, CreditReason, CreditTransactionCreateDBRequest, CreditTransactionDBResponse};
use crate::errors::{Error, Result};
use crate::scheduler::{load_user, EngineContext};
use crate::store::{Store, StoreTx};
use crate::types::{abbrev_uuid, Actor, ApplicationId, IsolationLevel, UserId};

/// Balance operations bound to an open unit of work.
pub(crate) struct CreditLedger<'t, T: StoreTx> {
    tx: &'t mut T,
    now: DateTime<Utc>,
    performed_by: Option<UserId>,
}

impl<'t, T: StoreTx> CreditLedger<'t, T> {
    pub(crate) fn new(tx: &'t mut T, now: DateTime<Utc>, performed_by: Option<UserId>) -> Self {
        Self { tx, now, performed_by }
    }

    /// Take `amount` from the user, failing with `InsufficientCredits` if the balance is short.
    pub(crate) async fn deduct(&mut self, user_id: UserId, amount: i64, reason: CreditReason) -> Result<CreditTransactionDBResponse> {
        self.apply(CreditOperation::Deduct, user_id, amount, reason).await
    }

    pub(crate) async fn refund(&mut self, user_id: UserId, amount: i64, reason: CreditReason) -> Result<CreditTransactionDBResponse> {
        self.apply(CreditOperation::Refund, user_id, amount, reason).await
    }

    pub(crate) async fn grant(&mut self, user_id: UserId, amount: i64, reason: CreditReason) -> Result<CreditTransactionDBResponse> {
        self.apply(CreditOperation::Grant, user_id, amount, reason).await
    }

    async fn apply(
        &mut self,
        operation: CreditOperation,
        user_id: UserId,
        amount: i64,
        reason: CreditReason,
    ) -> Result<CreditTransactionDBResponse> {
        if amount <= 0 {
            return Err(Error::invalid("amount", format!("must be positive, got {amount}")));
        }

        let balance = self.tx.lock_balance(user_id, self.now).await?;
        let balance_after = match operation {
            CreditOperation::Deduct => {
                if balance < amount {
                    return Err(Error::InsufficientCredits {
                        user_id,
                        required: amount,
                        available: balance,
                    });
                }
                balance - amount
            }
            CreditOperation::Refund | CreditOperation::Grant => balance
                .checked_add(amount)
                .ok_or_else(|| Error::invalid("amount", "balance would overflow"))?,
        };

        self.tx.store_balance(user_id, balance_after, self.now).await?;
        let transaction = self
            .tx
            .insert_credit_transaction(&CreditTransactionCreateDBRequest {
                user_id,
                operation,
                amount,
                balance_after,
                reason: reason.describe(),
                booking_id: reason.booking_id(),
                template_application_id: reason.application_id(),
                performed_by: self.performed_by,
                created_at: self.now,
            })
            .await?;

        debug!(
            user_id = %abbrev_uuid(&user_id),
            ?operation,
            amount,
            balance_after,
            "Ledger entry appended"
        );
        Ok(transaction)
    }
}

/// Ledger operations that run in their own unit of work.
#[derive(Clone, Debug)]
pub struct LedgerService<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> LedgerService<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Top up a user's balance. Admins only.
    #[instrument(skip(self, note), fields(actor = %abbrev_uuid(&actor.user_id), user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn grant_credits(&self, actor: Actor, user_id: UserId, amount: i64, note: &str) -> Result<CreditTransactionDBResponse> {
        if !actor.is_admin {
            return Err(Error::Unauthorized {
                user_id: actor.user_id,
                action: "grant credits",
            });
        }
        let ctx = &self.ctx;
        ctx.with_deadline("grant_credits", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            load_user(&mut tx, user_id).await?;

            let transaction = CreditLedger::new(&mut tx, ctx.now(), Some(actor.user_id))
                .grant(user_id, amount, CreditReason::Grant { note: note.to_string() })
                .await?;
            tx.commit().await?;

            crate::metrics::record_credits("grant", amount);
            info!(user_id = %abbrev_uuid(&user_id), amount, balance = transaction.balance_after, "Credits granted");
            Ok(transaction)
        })
        .await
    }

    /// Current balance; zero for users that never held credits.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn get_balance(&self, user_id: UserId) -> Result<i64> {
        let ctx = &self.ctx;
        ctx.with_deadline("get_balance", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let balance = tx.get_balance(user_id).await?.unwrap_or(0);
            tx.rollback().await?;
            Ok(balance)
        })
        .await
    }

    /// Ledger rows for a user, newest first.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn list_transactions(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        if skip < 0 || limit < 0 {
            return Err(Error::invalid("limit", "skip and limit must not be negative"));
        }
        let ctx = &self.ctx;
        ctx.with_deadline("list_transactions", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let transactions = tx.list_credit_transactions(user_id, skip, limit).await?;
            tx.rollback().await?;
            Ok(transactions)
        })
        .await
    }

    /// Every ledger row written on behalf of one template application, its rollback included.
    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&application_id)), err)]
    pub async fn list_application_transactions(&self, application_id: ApplicationId) -> Result<Vec<CreditTransactionDBResponse>> {
        let ctx = &self.ctx;
        ctx.with_deadline("list_application_transactions", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let transactions = tx.credit_transactions_for_application(application_id).await?;
            tx.rollback().await?;
            Ok(transactions)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;
    use crate::types::Role;

    #[tokio::test]
    async fn test_grant_then_deduct_then_refund() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let student = env.student_with_credits(5).await;

        let ctx = env.scheduler.context();
        let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let mut ledger = CreditLedger::new(&mut tx, env.now(), Some(admin));
        let deducted = ledger.deduct(student, 3, CreditReason::Grant { note: "test".into() }).await.unwrap();
        assert_eq!(deducted.balance_after, 2);
        let refunded = ledger.refund(student, 1, CreditReason::Grant { note: "test".into() }).await.unwrap();
        assert_eq!(refunded.balance_after, 3);
        tx.commit().await.unwrap();

        assert_eq!(env.balance(student).await, 3);
        let history = env.scheduler.ledger().list_transactions(student, 0, 10).await.unwrap();
        let operations: Vec<_> = history.iter().map(|t| t.operation).collect();
        assert_eq!(operations, vec![CreditOperation::Refund, CreditOperation::Deduct, CreditOperation::Grant]);
        assert!(history[..2].iter().all(|t| t.performed_by == Some(admin)));
    }

    #[tokio::test]
    async fn test_deduct_refuses_overdraft() {
        let env = TestEnv::new();
        let student = env.student_with_credits(2).await;

        let ctx = env.scheduler.context();
        let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let err = CreditLedger::new(&mut tx, env.now(), None)
            .deduct(student, 3, CreditReason::Grant { note: "test".into() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCredits {
                required: 3,
                available: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let student = env.user(Role::Student).await;

        let err = env.scheduler.ledger().grant_credits(Actor::admin(admin), student, 0, "nothing").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_only_admins_grant() {
        let env = TestEnv::new();
        let student = env.user(Role::Student).await;

        let err = env
            .scheduler
            .ledger()
            .grant_credits(Actor::user(student), student, 10, "self-service")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
        assert_eq!(env.balance(student).await, 0);
    }

    #[tokio::test]
    async fn test_balance_of_unknown_user_is_zero() {
        let env = TestEnv::new();
        assert_eq!(env.balance(uuid::Uuid::new_v4()).await, 0);
    }
}
