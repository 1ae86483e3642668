//! Entry point that wires the engines to a store, a clock and the scheduling rules.
//!
//! ```ignore
//! let scheduler = Scheduler::new(PgStore::connect(&config).await?, Arc::new(SystemClock), config.scheduling.clone());
//! let booking = scheduler.bookings().create_booking(Actor::user(student), student, lesson).await?;
//! ```

use chrono::{DateTime, FixedOffset, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::booking::BookingEngine;
use crate::bulk_edit::BulkEditEngine;
use crate::clock::Clock;
use crate::config::SchedulingConfig;
use crate::db::models::users::{UserCreateDBRequest, UserDBResponse};
use crate::errors::{Error, Result};
use crate::ledger::LedgerService;
use crate::lessons::LessonService;
use crate::rollback::RollbackEngine;
use crate::store::{Store, StoreTx};
use crate::templates::TemplateEngine;
use crate::types::{abbrev_uuid, IsolationLevel, Role, UserId};

/// Everything an engine needs besides its own arguments.
#[derive(Clone, Debug)]
pub struct EngineContext<S: Store> {
    pub(crate) store: S,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: SchedulingConfig,
}

impl<S: Store> EngineContext<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, settings: SchedulingConfig) -> Self {
        Self { store, clock, settings }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn offset(&self) -> Result<FixedOffset> {
        self.settings.offset()
    }

    pub(crate) async fn begin(&self, isolation: IsolationLevel) -> Result<S::Tx> {
        Ok(self.store.begin(isolation).await?)
    }

    /// Run `operation` under the configured timeout. On expiry the future is dropped, which
    /// drops its open unit of work and with it every uncommitted change.
    pub(crate) async fn with_deadline<T>(&self, name: &'static str, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.settings.operation_timeout;
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation = name, ?timeout, "Operation exceeded its deadline");
                Err(Error::DeadlineExceeded { timeout })
            }
        }
    }
}

/// Load a user or fail with `UserNotFound`.
pub(crate) async fn load_user<T: StoreTx>(tx: &mut T, user_id: UserId) -> Result<UserDBResponse> {
    tx.get_user(user_id).await?.ok_or(Error::UserNotFound { user_id })
}

/// Load a user and require an exact role.
pub(crate) async fn require_role<T: StoreTx>(tx: &mut T, user_id: UserId, expected: Role) -> Result<UserDBResponse> {
    let user = load_user(tx, user_id).await?;
    if user.role != expected {
        return Err(Error::InvalidRole { user_id, expected });
    }
    Ok(user)
}

/// The acting user must be an admin or a methodologist.
pub(crate) async fn require_schedule_manager<T: StoreTx>(tx: &mut T, user_id: UserId, action: &'static str) -> Result<UserDBResponse> {
    let user = load_user(tx, user_id).await?;
    if !user.role.can_manage_schedule() {
        return Err(Error::Unauthorized { user_id, action });
    }
    Ok(user)
}

/// Facade over every engine sharing one context.
#[derive(Clone, Debug)]
pub struct Scheduler<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> Scheduler<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, settings: SchedulingConfig) -> Self {
        Self {
            ctx: EngineContext::new(store, clock, settings),
        }
    }

    pub fn context(&self) -> &EngineContext<S> {
        &self.ctx
    }

    pub fn ledger(&self) -> LedgerService<S> {
        LedgerService::new(self.ctx.clone())
    }

    pub fn bookings(&self) -> BookingEngine<S> {
        BookingEngine::new(self.ctx.clone())
    }

    pub fn lessons(&self) -> LessonService<S> {
        LessonService::new(self.ctx.clone())
    }

    pub fn templates(&self) -> TemplateEngine<S> {
        TemplateEngine::new(self.ctx.clone())
    }

    pub fn rollback(&self) -> RollbackEngine<S> {
        RollbackEngine::new(self.ctx.clone())
    }

    pub fn bulk_edit(&self) -> BulkEditEngine<S> {
        BulkEditEngine::new(self.ctx.clone())
    }

    /// Register an account. User management proper lives outside this crate; this exists
    /// for seeding and tooling.
    #[instrument(skip(self, request), fields(role = %request.role), err)]
    pub async fn create_user(&self, request: UserCreateDBRequest) -> Result<UserDBResponse> {
        if request.name.trim().is_empty() {
            return Err(Error::invalid("name", "must not be empty"));
        }
        let ctx = &self.ctx;
        ctx.with_deadline("create_user", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let user = tx.insert_user(&request, ctx.now()).await?;
            tx.commit().await?;
            info!(user_id = %abbrev_uuid(&user.id), role = %user.role, "User created");
            Ok(user)
        })
        .await
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn get_user(&self, user_id: UserId) -> Result<UserDBResponse> {
        let ctx = &self.ctx;
        ctx.with_deadline("get_user", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let user = load_user(&mut tx, user_id).await?;
            tx.rollback().await?;
            Ok(user)
        })
        .await
    }
}
