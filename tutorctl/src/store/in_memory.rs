//! In-memory store.
//!
//! State lives behind one async mutex. Beginning a unit of work takes the lock and
//! copies the state; commit writes the copy back. Rollback or drop just releases the
//! lock, which discards every change. Units of work therefore run one at a time, which
//! is at least as strict as any isolation level the engines ask for.
//!
//! The unique and check constraints of the SQL schema that the engines rely on are
//! enforced here too, so both stores fail the same way.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::db::errors::{DbError, Result};
use crate::db::models::{
    bookings::{BookingCreateDBRequest, BookingDBResponse, BookingFilter, BookingStatus},
    credits::{CreditTransactionCreateDBRequest, CreditTransactionDBResponse},
    lessons::{LessonCreateDBRequest, LessonDBResponse, LessonFilter},
    modifications::{ModificationCreateDBRequest, ModificationDBResponse},
    templates::{
        ApplicationCreateDBRequest, ApplicationDBResponse, ApplicationStatus, TemplateCreateDBRequest, TemplateDBResponse,
        TemplateEntryCreateDBRequest, TemplateEntryDBResponse,
    },
    users::{UserCreateDBRequest, UserDBResponse},
};
use crate::types::{ApplicationId, BookingId, IsolationLevel, LessonId, TemplateId, UserId};

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<UserId, UserDBResponse>,
    balances: HashMap<UserId, i64>,
    /// Append order
    credit_transactions: Vec<CreditTransactionDBResponse>,
    lessons: HashMap<LessonId, LessonDBResponse>,
    bookings: HashMap<BookingId, BookingDBResponse>,
    cancellation_markers: HashSet<(UserId, LessonId)>,
    templates: HashMap<TemplateId, TemplateDBResponse>,
    template_entries: Vec<TemplateEntryDBResponse>,
    applications: HashMap<ApplicationId, ApplicationDBResponse>,
    modifications: Vec<ModificationDBResponse>,
}

fn unique_violation(constraint: &str, table: &str) -> DbError {
    DbError::UniqueViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("duplicate key value violates unique constraint \"{constraint}\""),
    }
}

fn check_violation(constraint: &str, table: &str) -> DbError {
    DbError::CheckViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("new row for relation \"{table}\" violates check constraint \"{constraint}\""),
    }
}

fn foreign_key_violation(constraint: &str, table: &str) -> DbError {
    DbError::ForeignKeyViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("insert or update on table \"{table}\" violates foreign key constraint \"{constraint}\""),
    }
}

fn page<T>(rows: Vec<T>, skip: i64, limit: i64) -> Vec<T> {
    rows.into_iter()
        .skip(skip.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self, _isolation: IsolationLevel) -> Result<InMemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx { guard, working })
    }
}

pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

impl InMemoryTx {
    fn lesson_mut(&mut self, id: LessonId) -> Result<&mut LessonDBResponse> {
        self.working.lessons.get_mut(&id).ok_or(DbError::NotFound)
    }

    fn booking_mut(&mut self, id: BookingId) -> Result<&mut BookingDBResponse> {
        self.working.bookings.get_mut(&id).ok_or(DbError::NotFound)
    }

    fn application_mut(&mut self, id: ApplicationId) -> Result<&mut ApplicationDBResponse> {
        self.working.applications.get_mut(&id).ok_or(DbError::NotFound)
    }

    fn require_user(&self, user_id: UserId, table: &str) -> Result<()> {
        if self.working.users.contains_key(&user_id) {
            Ok(())
        } else {
            Err(foreign_key_violation(&format!("{table}_user_fk"), table))
        }
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn commit(self) -> Result<()> {
        let InMemoryTx { mut guard, working } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }

    async fn insert_user(&mut self, request: &UserCreateDBRequest, created_at: DateTime<Utc>) -> Result<UserDBResponse> {
        let user = UserDBResponse {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            role: request.role,
            created_at,
        };
        self.working.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, id: UserId) -> Result<Option<UserDBResponse>> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn lock_balance(&mut self, user_id: UserId, _at: DateTime<Utc>) -> Result<i64> {
        self.require_user(user_id, "credit_balances")?;
        Ok(*self.working.balances.entry(user_id).or_insert(0))
    }

    async fn store_balance(&mut self, user_id: UserId, balance: i64, _at: DateTime<Utc>) -> Result<()> {
        if balance < 0 {
            return Err(check_violation("credit_balances_balance_check", "credit_balances"));
        }
        match self.working.balances.get_mut(&user_id) {
            Some(current) => {
                *current = balance;
                Ok(())
            }
            None => Err(DbError::NotFound),
        }
    }

    async fn get_balance(&mut self, user_id: UserId) -> Result<Option<i64>> {
        Ok(self.working.balances.get(&user_id).copied())
    }

    async fn insert_credit_transaction(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        if request.amount <= 0 {
            return Err(check_violation("credit_transactions_amount_check", "credit_transactions"));
        }
        if request.balance_after < 0 {
            return Err(check_violation("credit_transactions_balance_after_check", "credit_transactions"));
        }
        self.require_user(request.user_id, "credit_transactions")?;

        let transaction = CreditTransactionDBResponse {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            operation: request.operation,
            amount: request.amount,
            balance_after: request.balance_after,
            reason: request.reason.clone(),
            booking_id: request.booking_id,
            template_application_id: request.template_application_id,
            performed_by: request.performed_by,
            created_at: request.created_at,
        };
        self.working.credit_transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn list_credit_transactions(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        let rows = self
            .working
            .credit_transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        Ok(page(rows, skip, limit))
    }

    async fn credit_transactions_for_application(&mut self, application_id: ApplicationId) -> Result<Vec<CreditTransactionDBResponse>> {
        Ok(self
            .working
            .credit_transactions
            .iter()
            .filter(|t| t.template_application_id == Some(application_id))
            .cloned()
            .collect())
    }

    async fn insert_lesson(&mut self, request: &LessonCreateDBRequest) -> Result<LessonDBResponse> {
        if request.end_time <= request.start_time {
            return Err(check_violation("lessons_check", "lessons"));
        }
        if request.max_students < 1 {
            return Err(check_violation("lessons_max_students_check", "lessons"));
        }
        if !(1..=100).contains(&request.credits_cost) {
            return Err(check_violation("lessons_credits_cost_check", "lessons"));
        }
        self.require_user(request.teacher_id, "lessons")?;

        let lesson = LessonDBResponse {
            id: Uuid::new_v4(),
            teacher_id: request.teacher_id,
            start_time: request.start_time,
            end_time: request.end_time,
            max_students: request.max_students,
            current_students: 0,
            credits_cost: request.credits_cost,
            recurring_group_id: request.recurring_group_id,
            template_application_id: request.template_application_id,
            homework_text: None,
            report_text: None,
            created_at: request.created_at,
            deleted_at: None,
        };
        self.working.lessons.insert(lesson.id, lesson.clone());
        Ok(lesson)
    }

    async fn get_lesson(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>> {
        Ok(self.working.lessons.get(&id).cloned())
    }

    async fn lock_lesson(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>> {
        Ok(self.working.lessons.get(&id).cloned())
    }

    async fn lock_teacher_lessons_from(&mut self, teacher_id: UserId, from: DateTime<Utc>) -> Result<Vec<LessonDBResponse>> {
        let mut lessons: Vec<_> = self
            .working
            .lessons
            .values()
            .filter(|l| l.teacher_id == teacher_id && l.start_time >= from && !l.is_deleted())
            .cloned()
            .collect();
        lessons.sort_by_key(|l| (l.start_time, l.id));
        Ok(lessons)
    }

    async fn lock_application_lessons(&mut self, application_id: ApplicationId) -> Result<Vec<LessonDBResponse>> {
        let mut lessons: Vec<_> = self
            .working
            .lessons
            .values()
            .filter(|l| l.template_application_id == Some(application_id))
            .cloned()
            .collect();
        lessons.sort_by_key(|l| (l.start_time, l.id));
        Ok(lessons)
    }

    async fn list_lessons(&mut self, filter: &LessonFilter) -> Result<Vec<LessonDBResponse>> {
        let mut lessons: Vec<_> = self
            .working
            .lessons
            .values()
            .filter(|l| filter.teacher_id.is_none_or(|id| l.teacher_id == id))
            .filter(|l| filter.from.is_none_or(|from| l.start_time >= from))
            .filter(|l| filter.to.is_none_or(|to| l.start_time < to))
            .filter(|l| filter.include_deleted || !l.is_deleted())
            .cloned()
            .collect();
        lessons.sort_by_key(|l| (l.start_time, l.id));
        Ok(page(lessons, filter.skip, filter.limit))
    }

    async fn set_current_students(&mut self, id: LessonId, current_students: i32) -> Result<()> {
        if current_students < 0 {
            return Err(check_violation("lessons_current_students_check", "lessons"));
        }
        self.lesson_mut(id)?.current_students = current_students;
        Ok(())
    }

    async fn set_lesson_teacher(&mut self, id: LessonId, teacher_id: UserId) -> Result<()> {
        self.require_user(teacher_id, "lessons")?;
        self.lesson_mut(id)?.teacher_id = teacher_id;
        Ok(())
    }

    async fn set_lesson_texts(&mut self, id: LessonId, homework_text: Option<&str>, report_text: Option<&str>) -> Result<()> {
        let lesson = self.lesson_mut(id)?;
        lesson.homework_text = homework_text.map(str::to_string);
        lesson.report_text = report_text.map(str::to_string);
        Ok(())
    }

    async fn soft_delete_lesson(&mut self, id: LessonId, at: DateTime<Utc>) -> Result<()> {
        let lesson = self.lesson_mut(id)?;
        if lesson.deleted_at.is_none() {
            lesson.deleted_at = Some(at);
        }
        Ok(())
    }

    async fn insert_booking(&mut self, request: &BookingCreateDBRequest) -> Result<BookingDBResponse> {
        if self.working.bookings.contains_key(&request.id) {
            return Err(unique_violation("bookings_pkey", "bookings"));
        }
        let duplicate = self
            .working
            .bookings
            .values()
            .any(|b| b.student_id == request.student_id && b.lesson_id == request.lesson_id && b.is_active());
        if duplicate {
            return Err(unique_violation("bookings_one_active_per_student_lesson", "bookings"));
        }
        if !self.working.lessons.contains_key(&request.lesson_id) {
            return Err(foreign_key_violation("bookings_lesson_id_fkey", "bookings"));
        }
        self.require_user(request.student_id, "bookings")?;

        let booking = BookingDBResponse {
            id: request.id,
            student_id: request.student_id,
            lesson_id: request.lesson_id,
            status: BookingStatus::Active,
            credits_charged: request.credits_charged,
            template_application_id: request.template_application_id,
            booked_by: request.booked_by,
            booked_at: request.booked_at,
            cancelled_at: None,
        };
        self.working.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn get_booking(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>> {
        Ok(self.working.bookings.get(&id).cloned())
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>> {
        Ok(self.working.bookings.get(&id).cloned())
    }

    async fn find_active_booking(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<Option<BookingDBResponse>> {
        Ok(self
            .working
            .bookings
            .values()
            .find(|b| b.student_id == student_id && b.lesson_id == lesson_id && b.is_active())
            .cloned())
    }

    async fn lock_active_bookings_for_lesson(&mut self, lesson_id: LessonId) -> Result<Vec<BookingDBResponse>> {
        let mut bookings: Vec<_> = self
            .working
            .bookings
            .values()
            .filter(|b| b.lesson_id == lesson_id && b.is_active())
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.booked_at, b.id));
        Ok(bookings)
    }

    async fn find_overlapping_booked_lesson(
        &mut self,
        student_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: LessonId,
    ) -> Result<Option<LessonId>> {
        let lessons = &self.working.lessons;
        let mut overlapping: Vec<&LessonDBResponse> = self
            .working
            .bookings
            .values()
            .filter(|b| b.student_id == student_id && b.is_active() && b.lesson_id != exclude)
            .filter_map(|b| lessons.get(&b.lesson_id))
            .filter(|l| !l.is_deleted() && l.overlaps(start, end))
            .collect();
        overlapping.sort_by_key(|l| l.start_time);
        Ok(overlapping.first().map(|l| l.id))
    }

    async fn mark_booking_cancelled(&mut self, id: BookingId, at: DateTime<Utc>) -> Result<()> {
        let booking = self.booking_mut(id)?;
        booking.status = BookingStatus::Cancelled;
        booking.cancelled_at = Some(at);
        Ok(())
    }

    async fn list_bookings(&mut self, filter: &BookingFilter) -> Result<Vec<BookingDBResponse>> {
        let mut bookings: Vec<_> = self.working.bookings.values().filter(|b| filter.matches(b)).cloned().collect();
        bookings.sort_by(|a, b| b.booked_at.cmp(&a.booked_at).then(b.id.cmp(&a.id)));
        Ok(page(bookings, filter.skip, filter.limit))
    }

    async fn has_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<bool> {
        Ok(self.working.cancellation_markers.contains(&(student_id, lesson_id)))
    }

    async fn insert_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId, _at: DateTime<Utc>) -> Result<()> {
        self.working.cancellation_markers.insert((student_id, lesson_id));
        Ok(())
    }

    async fn insert_template(&mut self, request: &TemplateCreateDBRequest) -> Result<TemplateDBResponse> {
        let taken = self
            .working
            .templates
            .values()
            .any(|t| t.owner_id == request.owner_id && t.name == request.name);
        if taken {
            return Err(unique_violation("lesson_templates_owner_id_name_key", "lesson_templates"));
        }
        self.require_user(request.owner_id, "lesson_templates")?;

        let template = TemplateDBResponse {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            name: request.name.clone(),
            created_at: request.created_at,
        };
        self.working.templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn insert_template_entry(&mut self, request: &TemplateEntryCreateDBRequest) -> Result<TemplateEntryDBResponse> {
        if !self.working.templates.contains_key(&request.template_id) {
            return Err(foreign_key_violation("template_lessons_template_id_fkey", "template_lessons"));
        }
        let entry = TemplateEntryDBResponse {
            id: Uuid::new_v4(),
            template_id: request.template_id,
            position: request.position,
            day_of_week: request.day_of_week,
            start_time: request.start_time,
            end_time: request.end_time,
            teacher_id: request.teacher_id,
            max_students: request.max_students,
            credits_cost: request.credits_cost,
            student_ids: request.student_ids.clone(),
        };
        self.working.template_entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_template(&mut self, id: TemplateId) -> Result<Option<TemplateDBResponse>> {
        Ok(self.working.templates.get(&id).cloned())
    }

    async fn template_entries(&mut self, template_id: TemplateId) -> Result<Vec<TemplateEntryDBResponse>> {
        let mut entries: Vec<_> = self
            .working
            .template_entries
            .iter()
            .filter(|e| e.template_id == template_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.position, e.id));
        Ok(entries)
    }

    async fn lock_applied_application(&mut self, template_id: TemplateId, week_start: NaiveDate) -> Result<Option<ApplicationDBResponse>> {
        Ok(self
            .working
            .applications
            .values()
            .find(|a| a.template_id == template_id && a.week_start_date == week_start && a.status == ApplicationStatus::Applied)
            .cloned())
    }

    async fn insert_application(&mut self, request: &ApplicationCreateDBRequest) -> Result<ApplicationDBResponse> {
        let taken = self.working.applications.values().any(|a| {
            a.template_id == request.template_id && a.week_start_date == request.week_start_date && a.status == ApplicationStatus::Applied
        });
        if taken {
            return Err(unique_violation("template_applications_one_applied", "template_applications"));
        }

        let application = ApplicationDBResponse {
            id: Uuid::new_v4(),
            template_id: request.template_id,
            week_start_date: request.week_start_date,
            applied_by: request.applied_by,
            status: ApplicationStatus::Applied,
            created_lessons_count: 0,
            applied_at: request.applied_at,
            rolled_back_at: None,
        };
        self.working.applications.insert(application.id, application.clone());
        Ok(application)
    }

    async fn set_application_lesson_count(&mut self, id: ApplicationId, created_lessons_count: i32) -> Result<ApplicationDBResponse> {
        let application = self.application_mut(id)?;
        application.created_lessons_count = created_lessons_count;
        Ok(application.clone())
    }

    async fn mark_application_rolled_back(&mut self, id: ApplicationId, at: DateTime<Utc>) -> Result<ApplicationDBResponse> {
        let application = self.application_mut(id)?;
        application.status = ApplicationStatus::RolledBack;
        application.rolled_back_at = Some(at);
        Ok(application.clone())
    }

    async fn list_applications(&mut self, template_id: TemplateId) -> Result<Vec<ApplicationDBResponse>> {
        let mut applications: Vec<_> = self
            .working
            .applications
            .values()
            .filter(|a| a.template_id == template_id)
            .cloned()
            .collect();
        applications.sort_by(|a, b| b.applied_at.cmp(&a.applied_at).then(b.id.cmp(&a.id)));
        Ok(applications)
    }

    async fn insert_modification(&mut self, request: &ModificationCreateDBRequest) -> Result<ModificationDBResponse> {
        if !self.working.lessons.contains_key(&request.original_lesson_id) {
            return Err(foreign_key_violation("lesson_modifications_original_lesson_id_fkey", "lesson_modifications"));
        }
        let modification = ModificationDBResponse {
            id: Uuid::new_v4(),
            original_lesson_id: request.original_lesson_id,
            modification_type: request.modification_type,
            payload: request.payload.clone(),
            applied_by: request.applied_by,
            applied_at: request.applied_at,
            affected_lessons_count: request.affected_lessons_count,
        };
        self.working.modifications.push(modification.clone());
        Ok(modification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::Duration;

    async fn seed_user(store: &InMemoryStore, role: Role) -> UserId {
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let user = tx.insert_user(&UserCreateDBRequest::new("someone", role), Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        user.id
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, Role::Student).await;

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(tx.lock_balance(user, Utc::now()).await.unwrap(), 0);
        tx.store_balance(user, 7, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(tx.get_balance(user).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_drop_discards_changes() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, Role::Student).await;

        {
            let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
            tx.lock_balance(user, Utc::now()).await.unwrap();
            tx.store_balance(user, 5, Utc::now()).await.unwrap();
        }

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(tx.get_balance(user).await.unwrap(), None);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_balance_is_a_check_violation() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, Role::Student).await;

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.lock_balance(user, Utc::now()).await.unwrap();
        let err = tx.store_balance(user, -1, Utc::now()).await.unwrap_err();
        assert!(matches!(err, DbError::CheckViolation { .. }));
    }

    #[tokio::test]
    async fn test_one_active_booking_per_student_and_lesson() {
        let store = InMemoryStore::new();
        let teacher = seed_user(&store, Role::Teacher).await;
        let student = seed_user(&store, Role::Student).await;
        let now = Utc::now();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let lesson = tx
            .insert_lesson(&LessonCreateDBRequest {
                teacher_id: teacher,
                start_time: now + Duration::days(2),
                end_time: now + Duration::days(2) + Duration::hours(1),
                max_students: 2,
                credits_cost: 1,
                recurring_group_id: None,
                template_application_id: None,
                created_at: now,
            })
            .await
            .unwrap();
        let request = |id| BookingCreateDBRequest {
            id,
            student_id: student,
            lesson_id: lesson.id,
            credits_charged: 1,
            template_application_id: None,
            booked_by: None,
            booked_at: now,
        };

        let first = tx.insert_booking(&request(Uuid::new_v4())).await.unwrap();
        let err = tx.insert_booking(&request(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));

        tx.mark_booking_cancelled(first.id, now).await.unwrap();
        tx.insert_booking(&request(Uuid::new_v4())).await.unwrap();
    }

    #[tokio::test]
    async fn test_units_of_work_are_serialized() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, Role::Student).await;

        let tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), store.begin(IsolationLevel::ReadCommitted)).await;
        assert!(second.is_err(), "second unit of work must wait for the first");
        drop(tx);

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert!(tx.get_user(user).await.unwrap().is_some());
    }
}
