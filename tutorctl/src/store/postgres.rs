//! PostgreSQL store: one SQL transaction per unit of work.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use super::{Store, StoreTx};
use crate::config::Config;
use crate::db::errors::Result;
use crate::db::handlers::{Applications, Bookings, Credits, Lessons, Modifications, Templates, Users};
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

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Build the pool from configuration, running migrations first when enabled.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let settings = &config.database.pool;
        let mut options = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs));
        if settings.idle_timeout_secs > 0 {
            options = options.idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
        }
        if settings.max_lifetime_secs > 0 {
            options = options.max_lifetime(Duration::from_secs(settings.max_lifetime_secs));
        }

        let pool = options.connect(&config.database.url).await?;
        if config.run_migrations {
            crate::migrator().run(&pool).await?;
            info!("Database migrations applied");
        }

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self, isolation: IsolationLevel) -> Result<PgTx> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&sql).execute(&mut *tx).await?;
        debug!(isolation = isolation.as_sql(), "Transaction started");
        Ok(PgTx { tx })
    }
}

/// Open transaction. Dropping it without [`StoreTx::commit`] rolls it back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    async fn insert_user(&mut self, request: &UserCreateDBRequest, created_at: DateTime<Utc>) -> Result<UserDBResponse> {
        Users::new(&mut self.tx).create(request, created_at).await
    }

    async fn get_user(&mut self, id: UserId) -> Result<Option<UserDBResponse>> {
        Users::new(&mut self.tx).get_by_id(id).await
    }

    async fn lock_balance(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<i64> {
        Credits::new(&mut self.tx).lock_balance(user_id, at).await
    }

    async fn store_balance(&mut self, user_id: UserId, balance: i64, at: DateTime<Utc>) -> Result<()> {
        Credits::new(&mut self.tx).store_balance(user_id, balance, at).await
    }

    async fn get_balance(&mut self, user_id: UserId) -> Result<Option<i64>> {
        Credits::new(&mut self.tx).get_balance(user_id).await
    }

    async fn insert_credit_transaction(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        Credits::new(&mut self.tx).create_transaction(request).await
    }

    async fn list_credit_transactions(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        Credits::new(&mut self.tx).list_user_transactions(user_id, skip, limit).await
    }

    async fn credit_transactions_for_application(&mut self, application_id: ApplicationId) -> Result<Vec<CreditTransactionDBResponse>> {
        Credits::new(&mut self.tx).list_application_transactions(application_id).await
    }

    async fn insert_lesson(&mut self, request: &LessonCreateDBRequest) -> Result<LessonDBResponse> {
        Lessons::new(&mut self.tx).create(request).await
    }

    async fn get_lesson(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>> {
        Lessons::new(&mut self.tx).get_by_id(id).await
    }

    async fn lock_lesson(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>> {
        Lessons::new(&mut self.tx).lock(id).await
    }

    async fn lock_teacher_lessons_from(&mut self, teacher_id: UserId, from: DateTime<Utc>) -> Result<Vec<LessonDBResponse>> {
        Lessons::new(&mut self.tx).lock_teacher_lessons_from(teacher_id, from).await
    }

    async fn lock_application_lessons(&mut self, application_id: ApplicationId) -> Result<Vec<LessonDBResponse>> {
        Lessons::new(&mut self.tx).lock_by_application(application_id).await
    }

    async fn list_lessons(&mut self, filter: &LessonFilter) -> Result<Vec<LessonDBResponse>> {
        Lessons::new(&mut self.tx).list(filter).await
    }

    async fn set_current_students(&mut self, id: LessonId, current_students: i32) -> Result<()> {
        Lessons::new(&mut self.tx).set_current_students(id, current_students).await
    }

    async fn set_lesson_teacher(&mut self, id: LessonId, teacher_id: UserId) -> Result<()> {
        Lessons::new(&mut self.tx).set_teacher(id, teacher_id).await
    }

    async fn set_lesson_texts(&mut self, id: LessonId, homework_text: Option<&str>, report_text: Option<&str>) -> Result<()> {
        Lessons::new(&mut self.tx).set_texts(id, homework_text, report_text).await
    }

    async fn soft_delete_lesson(&mut self, id: LessonId, at: DateTime<Utc>) -> Result<()> {
        Lessons::new(&mut self.tx).soft_delete(id, at).await
    }

    async fn insert_booking(&mut self, request: &BookingCreateDBRequest) -> Result<BookingDBResponse> {
        Bookings::new(&mut self.tx).create(request).await
    }

    async fn get_booking(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>> {
        Bookings::new(&mut self.tx).get_by_id(id).await
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>> {
        Bookings::new(&mut self.tx).lock(id).await
    }

    async fn find_active_booking(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<Option<BookingDBResponse>> {
        Bookings::new(&mut self.tx).find_active(student_id, lesson_id).await
    }

    async fn lock_active_bookings_for_lesson(&mut self, lesson_id: LessonId) -> Result<Vec<BookingDBResponse>> {
        Bookings::new(&mut self.tx).lock_active_for_lesson(lesson_id).await
    }

    async fn find_overlapping_booked_lesson(
        &mut self,
        student_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: LessonId,
    ) -> Result<Option<LessonId>> {
        Bookings::new(&mut self.tx)
            .find_overlapping_lesson(student_id, start, end, exclude)
            .await
    }

    async fn mark_booking_cancelled(&mut self, id: BookingId, at: DateTime<Utc>) -> Result<()> {
        Bookings::new(&mut self.tx).mark_cancelled(id, at).await
    }

    async fn list_bookings(&mut self, filter: &BookingFilter) -> Result<Vec<BookingDBResponse>> {
        Bookings::new(&mut self.tx).list(filter).await
    }

    async fn has_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<bool> {
        Bookings::new(&mut self.tx).has_cancellation_marker(student_id, lesson_id).await
    }

    async fn insert_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId, at: DateTime<Utc>) -> Result<()> {
        Bookings::new(&mut self.tx)
            .insert_cancellation_marker(student_id, lesson_id, at)
            .await
    }

    async fn insert_template(&mut self, request: &TemplateCreateDBRequest) -> Result<TemplateDBResponse> {
        Templates::new(&mut self.tx).create(request).await
    }

    async fn insert_template_entry(&mut self, request: &TemplateEntryCreateDBRequest) -> Result<TemplateEntryDBResponse> {
        Templates::new(&mut self.tx).create_entry(request).await
    }

    async fn get_template(&mut self, id: TemplateId) -> Result<Option<TemplateDBResponse>> {
        Templates::new(&mut self.tx).get_by_id(id).await
    }

    async fn template_entries(&mut self, template_id: TemplateId) -> Result<Vec<TemplateEntryDBResponse>> {
        Templates::new(&mut self.tx).entries(template_id).await
    }

    async fn lock_applied_application(&mut self, template_id: TemplateId, week_start: NaiveDate) -> Result<Option<ApplicationDBResponse>> {
        Applications::new(&mut self.tx).lock_applied(template_id, week_start).await
    }

    async fn insert_application(&mut self, request: &ApplicationCreateDBRequest) -> Result<ApplicationDBResponse> {
        Applications::new(&mut self.tx).create(request).await
    }

    async fn set_application_lesson_count(&mut self, id: ApplicationId, created_lessons_count: i32) -> Result<ApplicationDBResponse> {
        Applications::new(&mut self.tx).set_lesson_count(id, created_lessons_count).await
    }

    async fn mark_application_rolled_back(&mut self, id: ApplicationId, at: DateTime<Utc>) -> Result<ApplicationDBResponse> {
        Applications::new(&mut self.tx).mark_rolled_back(id, at).await
    }

    async fn list_applications(&mut self, template_id: TemplateId) -> Result<Vec<ApplicationDBResponse>> {
        Applications::new(&mut self.tx).list_for_template(template_id).await
    }

    async fn insert_modification(&mut self, request: &ModificationCreateDBRequest) -> Result<ModificationDBResponse> {
        Modifications::new(&mut self.tx).create(request).await
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SchedulingConfig;
    use crate::errors::Error;
    use crate::lessons::LessonDraft;
    use crate::scheduler::Scheduler;
    use crate::templates::TemplateEntryDraft;
    use crate::test_utils::test_epoch;
    use crate::types::{Actor, Role};
    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};
    use std::sync::Arc;

    fn scheduler(pool: PgPool) -> Scheduler<PgStore> {
        Scheduler::new(PgStore::new(pool), Arc::new(ManualClock::new(test_epoch())), SchedulingConfig::default())
    }

    async fn user(scheduler: &Scheduler<PgStore>, role: Role) -> UserId {
        scheduler
            .create_user(UserCreateDBRequest::new(format!("{role} user"), role))
            .await
            .unwrap()
            .id
    }

    async fn student_with_credits(scheduler: &Scheduler<PgStore>, admin: UserId, credits: i64) -> UserId {
        let student = user(scheduler, Role::Student).await;
        scheduler
            .ledger()
            .grant_credits(Actor::admin(admin), student, credits, "test top-up")
            .await
            .unwrap();
        student
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_last_seat_goes_to_one_student(pool: PgPool) {
        let scheduler = scheduler(pool);
        let admin = user(&scheduler, Role::Admin).await;
        let teacher = user(&scheduler, Role::Teacher).await;
        let start = test_epoch() + ChronoDuration::days(3);
        let lesson = scheduler
            .lessons()
            .create_lesson(
                Actor::admin(admin),
                LessonDraft {
                    teacher_id: teacher,
                    start_time: start,
                    end_time: start + ChronoDuration::hours(1),
                    max_students: 1,
                    credits_cost: 2,
                    is_individual: true,
                },
            )
            .await
            .unwrap();

        let mut students = Vec::new();
        for _ in 0..4 {
            students.push(student_with_credits(&scheduler, admin, 5).await);
        }
        let lesson_id = lesson.id;
        let attempts = students.iter().map(|&student| {
            let bookings = scheduler.bookings();
            async move { bookings.create_booking(Actor::user(student), student, lesson_id).await }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(e, Error::LessonFull { .. })));
        assert_eq!(scheduler.lessons().get_lesson(lesson.id).await.unwrap().current_students, 1);

        let mut total = 0;
        for student in &students {
            total += scheduler.ledger().get_balance(*student).await.unwrap();
        }
        assert_eq!(total, 4 * 5 - 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancel_refunds_and_blocks_rebooking(pool: PgPool) {
        let scheduler = scheduler(pool);
        let admin = user(&scheduler, Role::Admin).await;
        let teacher = user(&scheduler, Role::Teacher).await;
        let student = student_with_credits(&scheduler, admin, 3).await;
        let start = test_epoch() + ChronoDuration::days(3);
        let lesson = scheduler
            .lessons()
            .create_lesson(
                Actor::admin(admin),
                LessonDraft {
                    teacher_id: teacher,
                    start_time: start,
                    end_time: start + ChronoDuration::hours(1),
                    max_students: 3,
                    credits_cost: 3,
                    is_individual: false,
                },
            )
            .await
            .unwrap();

        let booking = scheduler
            .bookings()
            .create_booking(Actor::user(student), student, lesson.id)
            .await
            .unwrap();
        assert_eq!(scheduler.ledger().get_balance(student).await.unwrap(), 0);

        let cancelled = scheduler.bookings().cancel_booking(Actor::user(student), booking.id).await.unwrap();
        assert_eq!(cancelled.refunded_credits, 3);
        let again = scheduler.bookings().cancel_booking(Actor::user(student), booking.id).await.unwrap();
        assert_eq!(again.refunded_credits, 0);
        assert_eq!(scheduler.ledger().get_balance(student).await.unwrap(), 3);

        let err = scheduler
            .bookings()
            .create_booking(Actor::admin(admin), student, lesson.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LessonPreviouslyCancelled { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_apply_and_rollback_week(pool: PgPool) {
        let scheduler = scheduler(pool);
        let admin = user(&scheduler, Role::Admin).await;
        let teacher = user(&scheduler, Role::Teacher).await;
        let student = student_with_credits(&scheduler, admin, 10).await;
        let classmate = student_with_credits(&scheduler, admin, 10).await;

        let entry = |day_of_week: i16, students: Vec<UserId>| TemplateEntryDraft {
            day_of_week,
            start_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            teacher_id: teacher,
            max_students: 2,
            credits_cost: 1,
            is_individual: false,
            student_ids: students,
        };
        let template = scheduler
            .templates()
            .create_template(
                admin,
                "Weekdays",
                vec![
                    entry(1, vec![student, classmate]),
                    entry(3, vec![student, classmate]),
                    entry(5, vec![classmate]),
                ],
            )
            .await
            .unwrap();
        let week = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let dry = scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week, true)
            .await
            .unwrap();
        let applied = scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week, false)
            .await
            .unwrap();
        assert_eq!(dry.stats, applied.stats);
        assert_eq!(applied.stats.created_lessons, 3);
        assert_eq!(scheduler.ledger().get_balance(student).await.unwrap(), 8);

        let err = scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateAlreadyApplied { .. }));

        let rolled_back = scheduler
            .rollback()
            .rollback_week_to_template(admin, week, template.template.id)
            .await
            .unwrap();
        assert_eq!(rolled_back.deleted_lessons, 3);
        assert_eq!(rolled_back.refunded_credits, 5);
        assert_eq!(scheduler.ledger().get_balance(student).await.unwrap(), 10);
        assert_eq!(scheduler.ledger().get_balance(classmate).await.unwrap(), 10);
        for lesson_id in &applied.lesson_ids {
            assert!(scheduler.lessons().get_lesson(*lesson_id).await.unwrap().is_deleted());
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_overlapping_bookings_of_one_student_race(pool: PgPool) {
        let scheduler = scheduler(pool);
        let admin = user(&scheduler, Role::Admin).await;
        for round in 0..20 {
            let student = student_with_credits(&scheduler, admin, 10).await;
            let start = test_epoch() + ChronoDuration::days(2) + ChronoDuration::hours(2 * round);
            let mut lesson_ids = Vec::new();
            for offset in [0, 30] {
                let teacher = user(&scheduler, Role::Teacher).await;
                let start = start + ChronoDuration::minutes(offset);
                let lesson = scheduler
                    .lessons()
                    .create_lesson(
                        Actor::admin(admin),
                        LessonDraft {
                            teacher_id: teacher,
                            start_time: start,
                            end_time: start + ChronoDuration::hours(1),
                            max_students: 4,
                            credits_cost: 1,
                            is_individual: false,
                        },
                    )
                    .await
                    .unwrap();
                lesson_ids.push(lesson.id);
            }

            let bookings = scheduler.bookings();
            let (first, second) = tokio::join!(
                bookings.create_booking(Actor::user(student), student, lesson_ids[0]),
                bookings.create_booking(Actor::user(student), student, lesson_ids[1]),
            );
            let results = [first, second];
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
            assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(e, Error::ScheduleConflict { .. })));
            assert_eq!(scheduler.ledger().get_balance(student).await.unwrap(), 9);
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_concurrent_apply_of_one_week(pool: PgPool) {
        let scheduler = scheduler(pool);
        let admin = user(&scheduler, Role::Admin).await;
        let teacher = user(&scheduler, Role::Teacher).await;
        let student = student_with_credits(&scheduler, admin, 10).await;
        let template = scheduler
            .templates()
            .create_template(
                admin,
                "Tuesday",
                vec![TemplateEntryDraft {
                    day_of_week: 2,
                    start_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                    teacher_id: teacher,
                    max_students: 2,
                    credits_cost: 1,
                    is_individual: false,
                    student_ids: vec![student],
                }],
            )
            .await
            .unwrap();
        let template_id = template.template.id;
        let week = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let attempts = (0..4).map(|_| {
            let templates = scheduler.templates();
            async move { templates.apply_template_to_week(admin, template_id, week, false).await }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, Error::TemplateAlreadyApplied { .. } | Error::SerializationConflict))
        );
        assert_eq!(scheduler.ledger().get_balance(student).await.unwrap(), 9);
        assert_eq!(scheduler.templates().list_applications(template_id).await.unwrap().len(), 1);
    }
}
