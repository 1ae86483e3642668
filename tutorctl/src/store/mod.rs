//! Transactional persistence seam used by every engine.
//!
//! A [`Store`] hands out units of work ([`StoreTx`]). Everything an engine reads or
//! writes during one operation goes through a single `StoreTx`, which is either
//! committed at the end or dropped. Dropping a `StoreTx` without committing discards
//! every change made through it.
//!
//! Two implementations exist:
//!
//! - [`postgres::PgStore`]: one SQL transaction per unit of work, with the requested
//!   isolation level; `lock_*` methods take `SELECT ... FOR UPDATE` row locks.
//! - [`in_memory::InMemoryStore`]: a single writer at a time over a snapshot of the
//!   whole state. Trivially serializable; used by tests and local tooling.
//!
//! Methods prefixed with `lock_` must be used whenever the caller is about to check a
//! value and then modify it (balances, lesson capacity, booking status).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::db::errors::Result;
use crate::db::models::{
    bookings::{BookingCreateDBRequest, BookingDBResponse, BookingFilter},
    credits::{CreditTransactionCreateDBRequest, CreditTransactionDBResponse},
    lessons::{LessonCreateDBRequest, LessonDBResponse, LessonFilter},
    modifications::{ModificationCreateDBRequest, ModificationDBResponse},
    templates::{
        ApplicationCreateDBRequest, ApplicationDBResponse, TemplateCreateDBRequest, TemplateDBResponse, TemplateEntryCreateDBRequest,
        TemplateEntryDBResponse,
    },
    users::{UserCreateDBRequest, UserDBResponse},
};
use crate::types::{ApplicationId, BookingId, IsolationLevel, LessonId, TemplateId, UserId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PgStore;

/// Source of units of work.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: StoreTx;

    /// Begin a unit of work at the given isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx>;
}

/// One unit of work. Not committed unless [`StoreTx::commit`] is called.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;

    // Users

    async fn insert_user(&mut self, request: &UserCreateDBRequest, created_at: DateTime<Utc>) -> Result<UserDBResponse>;

    async fn get_user(&mut self, id: UserId) -> Result<Option<UserDBResponse>>;

    // Credits

    /// Lock the user's balance row (creating it at zero if missing) and return the balance.
    async fn lock_balance(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<i64>;

    /// Overwrite a balance previously locked with [`StoreTx::lock_balance`].
    async fn store_balance(&mut self, user_id: UserId, balance: i64, at: DateTime<Utc>) -> Result<()>;

    /// Point read without locking. `None` when the user never held credits.
    async fn get_balance(&mut self, user_id: UserId) -> Result<Option<i64>>;

    async fn insert_credit_transaction(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse>;

    /// Newest first.
    async fn list_credit_transactions(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>>;

    async fn credit_transactions_for_application(&mut self, application_id: ApplicationId) -> Result<Vec<CreditTransactionDBResponse>>;

    // Lessons

    async fn insert_lesson(&mut self, request: &LessonCreateDBRequest) -> Result<LessonDBResponse>;

    /// Includes soft-deleted lessons; callers decide how to treat them.
    async fn get_lesson(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>>;

    async fn lock_lesson(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>>;

    /// Non-deleted lessons of a teacher starting at or after `from`, ordered by start time.
    async fn lock_teacher_lessons_from(&mut self, teacher_id: UserId, from: DateTime<Utc>) -> Result<Vec<LessonDBResponse>>;

    /// All lessons created by a template application, ordered by start time.
    async fn lock_application_lessons(&mut self, application_id: ApplicationId) -> Result<Vec<LessonDBResponse>>;

    async fn list_lessons(&mut self, filter: &LessonFilter) -> Result<Vec<LessonDBResponse>>;

    async fn set_current_students(&mut self, id: LessonId, current_students: i32) -> Result<()>;

    async fn set_lesson_teacher(&mut self, id: LessonId, teacher_id: UserId) -> Result<()>;

    async fn set_lesson_texts(&mut self, id: LessonId, homework_text: Option<&str>, report_text: Option<&str>) -> Result<()>;

    async fn soft_delete_lesson(&mut self, id: LessonId, at: DateTime<Utc>) -> Result<()>;

    // Bookings

    async fn insert_booking(&mut self, request: &BookingCreateDBRequest) -> Result<BookingDBResponse>;

    async fn get_booking(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>>;

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>>;

    async fn find_active_booking(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<Option<BookingDBResponse>>;

    async fn lock_active_bookings_for_lesson(&mut self, lesson_id: LessonId) -> Result<Vec<BookingDBResponse>>;

    /// A lesson (other than `exclude`) the student holds an active booking for whose time
    /// range overlaps `[start, end)`.
    async fn find_overlapping_booked_lesson(
        &mut self,
        student_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: LessonId,
    ) -> Result<Option<LessonId>>;

    async fn mark_booking_cancelled(&mut self, id: BookingId, at: DateTime<Utc>) -> Result<()>;

    async fn list_bookings(&mut self, filter: &BookingFilter) -> Result<Vec<BookingDBResponse>>;

    // Cancellation markers

    async fn has_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<bool>;

    async fn insert_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId, at: DateTime<Utc>) -> Result<()>;

    // Templates

    async fn insert_template(&mut self, request: &TemplateCreateDBRequest) -> Result<TemplateDBResponse>;

    async fn insert_template_entry(&mut self, request: &TemplateEntryCreateDBRequest) -> Result<TemplateEntryDBResponse>;

    async fn get_template(&mut self, id: TemplateId) -> Result<Option<TemplateDBResponse>>;

    /// Ordered by position, then ID.
    async fn template_entries(&mut self, template_id: TemplateId) -> Result<Vec<TemplateEntryDBResponse>>;

    // Template applications

    async fn lock_applied_application(&mut self, template_id: TemplateId, week_start: NaiveDate) -> Result<Option<ApplicationDBResponse>>;

    async fn insert_application(&mut self, request: &ApplicationCreateDBRequest) -> Result<ApplicationDBResponse>;

    async fn set_application_lesson_count(&mut self, id: ApplicationId, created_lessons_count: i32) -> Result<ApplicationDBResponse>;

    async fn mark_application_rolled_back(&mut self, id: ApplicationId, at: DateTime<Utc>) -> Result<ApplicationDBResponse>;

    /// Newest first.
    async fn list_applications(&mut self, template_id: TemplateId) -> Result<Vec<ApplicationDBResponse>>;

    // Bulk-edit audit

    async fn insert_modification(&mut self, request: &ModificationCreateDBRequest) -> Result<ModificationDBResponse>;
}
