//! Weekly lesson templates and their application to concrete weeks.
//!
//! A template is an ordered list of rows, each describing one lesson by day of week and time
//! of day, plus the students to book onto it. Applying a template to a week creates every
//! lesson and booking in one serializable unit of work: either the whole week appears, or
//! nothing does. At most one applied instance may exist per template and week.
//!
//! A dry run performs exactly the same steps and then discards them, so its stats are the
//! ones a real application would report at that moment.

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

use crate::booking::{book_student, BookingRules};
use crate::calendar::{is_monday, occurrence};
use crate::db::errors::DbError;
use crate::db::models::{
    lessons::LessonCreateDBRequest,
    templates::{ApplicationCreateDBRequest, ApplicationDBResponse, TemplateCreateDBRequest, TemplateDBResponse, TemplateEntryCreateDBRequest, TemplateEntryDBResponse},
};
use crate::errors::{Error, Result};
use crate::lessons::validate_capacity;
use crate::scheduler::{require_role, require_schedule_manager, EngineContext};
use crate::store::{Store, StoreTx};
use crate::types::{abbrev_uuid, IsolationLevel, LessonId, Role, TemplateId, UserId};

/// One row of a template being authored.
#[derive(Debug, Clone)]
pub struct TemplateEntryDraft {
    /// 0 = Sunday ... 6 = Saturday
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: UserId,
    pub max_students: i32,
    pub credits_cost: i32,
    pub is_individual: bool,
    pub student_ids: Vec<UserId>,
}

impl TemplateEntryDraft {
    fn validate(&self) -> Result<()> {
        if !(0..=6).contains(&self.day_of_week) {
            return Err(Error::invalid("day_of_week", format!("{} is not in 0..=6", self.day_of_week)));
        }
        if self.end_time <= self.start_time {
            return Err(Error::invalid("end_time", "must be after start_time"));
        }
        validate_capacity(self.max_students, self.credits_cost, self.is_individual)?;
        if self.student_ids.len() > self.max_students as usize {
            return Err(Error::invalid(
                "student_ids",
                format!("{} students listed for {} seats", self.student_ids.len(), self.max_students),
            ));
        }
        let unique: HashSet<_> = self.student_ids.iter().collect();
        if unique.len() != self.student_ids.len() {
            return Err(Error::invalid("student_ids", "a student is listed twice"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TemplateWithEntries {
    pub template: TemplateDBResponse,
    /// In application order
    pub entries: Vec<TemplateEntryDBResponse>,
}

/// What an application created, or would create for a dry run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CreationStats {
    pub created_lessons: u32,
    pub created_bookings: u32,
    pub deducted_credits: i64,
}

#[derive(Debug, Clone)]
pub struct TemplateApplicationResult {
    /// For a dry run this row was discarded along with everything else
    pub application: ApplicationDBResponse,
    pub stats: CreationStats,
    pub lesson_ids: Vec<LessonId>,
    pub dry_run: bool,
}

#[derive(Clone, Debug)]
pub struct TemplateEngine<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> TemplateEngine<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Store a new template. Entry order is kept as given.
    #[instrument(skip(self, entries), fields(owner_id = %abbrev_uuid(&owner_id), entries = entries.len()), err)]
    pub async fn create_template(&self, owner_id: UserId, name: &str, entries: Vec<TemplateEntryDraft>) -> Result<TemplateWithEntries> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid("name", "must not be empty"));
        }
        if entries.is_empty() {
            return Err(Error::invalid("entries", "a template needs at least one lesson"));
        }
        for entry in &entries {
            entry.validate()?;
        }

        let ctx = &self.ctx;
        ctx.with_deadline("create_template", async {
            let now = ctx.now();
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            require_schedule_manager(&mut tx, owner_id, "create templates").await?;

            for entry in &entries {
                require_role(&mut tx, entry.teacher_id, Role::Teacher).await?;
                for student_id in &entry.student_ids {
                    require_role(&mut tx, *student_id, Role::Student).await?;
                }
            }

            let template = match tx
                .insert_template(&TemplateCreateDBRequest {
                    owner_id,
                    name: name.to_string(),
                    created_at: now,
                })
                .await
            {
                Ok(template) => template,
                Err(DbError::UniqueViolation { .. }) => {
                    return Err(Error::invalid("name", format!("a template named '{name}' already exists")));
                }
                Err(e) => return Err(e.into()),
            };

            let mut stored = Vec::with_capacity(entries.len());
            for (position, entry) in entries.iter().enumerate() {
                let row = tx
                    .insert_template_entry(&TemplateEntryCreateDBRequest {
                        template_id: template.id,
                        position: position as i32,
                        day_of_week: entry.day_of_week,
                        start_time: entry.start_time,
                        end_time: entry.end_time,
                        teacher_id: entry.teacher_id,
                        max_students: entry.max_students,
                        credits_cost: entry.credits_cost,
                        student_ids: entry.student_ids.clone(),
                    })
                    .await?;
                stored.push(row);
            }
            tx.commit().await?;

            info!(template_id = %abbrev_uuid(&template.id), "Template created");
            Ok(TemplateWithEntries { template, entries: stored })
        })
        .await
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&template_id)), err)]
    pub async fn get_template(&self, template_id: TemplateId) -> Result<TemplateWithEntries> {
        let ctx = &self.ctx;
        ctx.with_deadline("get_template", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let template = tx.get_template(template_id).await?.ok_or(Error::TemplateNotFound { template_id })?;
            let entries = tx.template_entries(template_id).await?;
            tx.rollback().await?;
            Ok(TemplateWithEntries { template, entries })
        })
        .await
    }

    /// Every application of a template, newest first, rolled back ones included.
    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&template_id)), err)]
    pub async fn list_applications(&self, template_id: TemplateId) -> Result<Vec<ApplicationDBResponse>> {
        let ctx = &self.ctx;
        ctx.with_deadline("list_applications", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            tx.get_template(template_id).await?.ok_or(Error::TemplateNotFound { template_id })?;
            let applications = tx.list_applications(template_id).await?;
            tx.rollback().await?;
            Ok(applications)
        })
        .await
    }

    /// Turn the template into lessons and bookings for the week starting on `week_start`
    /// (a Monday), charging every listed student for their lesson.
    ///
    /// The loser of two concurrent applications gets either `TemplateAlreadyApplied` or a
    /// retryable `SerializationConflict`.
    #[instrument(skip(self), fields(actor_id = %abbrev_uuid(&actor_id), template_id = %abbrev_uuid(&template_id), %week_start, dry_run), err)]
    pub async fn apply_template_to_week(
        &self,
        actor_id: UserId,
        template_id: TemplateId,
        week_start: NaiveDate,
        dry_run: bool,
    ) -> Result<TemplateApplicationResult> {
        if !is_monday(week_start) {
            return Err(Error::invalid("week_start_date", format!("{week_start} is not a Monday")));
        }

        let result = self
            .ctx
            .with_deadline("apply_template_to_week", self.apply(actor_id, template_id, week_start, dry_run))
            .await;

        match &result {
            Ok(outcome) if outcome.dry_run => crate::metrics::record_template_application("dry_run"),
            Ok(outcome) => {
                crate::metrics::record_template_application("applied");
                crate::metrics::record_credits("deduct", outcome.stats.deducted_credits);
                for _ in 0..outcome.stats.created_bookings {
                    crate::metrics::record_booking_created("template");
                }
            }
            Err(e) => {
                crate::metrics::record_template_application("failed");
                warn!(error = %e, "Template application failed");
            }
        }
        result
    }

    async fn apply(&self, actor_id: UserId, template_id: TemplateId, week_start: NaiveDate, dry_run: bool) -> Result<TemplateApplicationResult> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let offset = ctx.offset()?;
        let mut tx = ctx.begin(IsolationLevel::Serializable).await?;

        require_schedule_manager(&mut tx, actor_id, "apply templates").await?;
        tx.get_template(template_id).await?.ok_or(Error::TemplateNotFound { template_id })?;

        if tx.lock_applied_application(template_id, week_start).await?.is_some() {
            return Err(Error::TemplateAlreadyApplied { template_id, week_start });
        }
        let entries = tx.template_entries(template_id).await?;

        let application = match tx
            .insert_application(&ApplicationCreateDBRequest {
                template_id,
                week_start_date: week_start,
                applied_by: actor_id,
                applied_at: now,
            })
            .await
        {
            Ok(application) => application,
            Err(DbError::UniqueViolation { .. }) => return Err(Error::TemplateAlreadyApplied { template_id, week_start }),
            Err(e) => return Err(e.into()),
        };

        let rules = BookingRules {
            check_schedule_conflicts: false,
            application_id: Some(application.id),
            booked_by: Some(actor_id),
        };
        let mut stats = CreationStats::default();
        let mut lesson_ids = Vec::with_capacity(entries.len());

        for entry in &entries {
            require_role(&mut tx, entry.teacher_id, Role::Teacher).await?;
            let start_time = occurrence(week_start, entry.day_of_week, entry.start_time, offset)?;
            let end_time = occurrence(week_start, entry.day_of_week, entry.end_time, offset)?;

            let mut lesson = tx
                .insert_lesson(&LessonCreateDBRequest {
                    teacher_id: entry.teacher_id,
                    start_time,
                    end_time,
                    max_students: entry.max_students,
                    credits_cost: entry.credits_cost,
                    recurring_group_id: None,
                    template_application_id: Some(application.id),
                    created_at: now,
                })
                .await?;
            stats.created_lessons += 1;
            lesson_ids.push(lesson.id);

            for student_id in &entry.student_ids {
                require_role(&mut tx, *student_id, Role::Student).await?;
                let booking = book_student(&mut tx, now, *student_id, &mut lesson, rules).await?;
                stats.created_bookings += 1;
                stats.deducted_credits += booking.credits_charged;
            }
        }

        let application = tx.set_application_lesson_count(application.id, stats.created_lessons as i32).await?;

        if dry_run {
            tx.rollback().await?;
            debug!(?stats, "Dry run finished, changes discarded");
        } else {
            tx.commit().await?;
            info!(
                application_id = %abbrev_uuid(&application.id),
                created_lessons = stats.created_lessons,
                created_bookings = stats.created_bookings,
                deducted_credits = stats.deducted_credits,
                "Template applied"
            );
        }

        Ok(TemplateApplicationResult {
            application,
            stats,
            lesson_ids,
            dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::templates::ApplicationStatus;
    use crate::test_utils::TestEnv;
    use crate::types::Actor;
    use chrono::{Duration, TimeZone, Utc};

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn entry(day_of_week: i16, hour: u32, teacher_id: UserId, students: Vec<UserId>) -> TemplateEntryDraft {
        TemplateEntryDraft {
            day_of_week,
            start_time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
            teacher_id,
            max_students: 4,
            credits_cost: 1,
            is_individual: false,
            student_ids: students,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_template() {
        let env = TestEnv::new();
        let methodologist = env.user(Role::Methodologist).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.user(Role::Student).await;
        let templates = env.scheduler.templates();

        let created = templates
            .create_template(
                methodologist,
                "Autumn",
                vec![entry(3, 10, teacher, vec![student]), entry(1, 9, teacher, vec![])],
            )
            .await
            .unwrap();
        assert_eq!(created.entries.len(), 2);

        let fetched = templates.get_template(created.template.id).await.unwrap();
        assert_eq!(fetched.template.name, "Autumn");
        // Stored order, not day order
        assert_eq!(fetched.entries[0].day_of_week, 3);
        assert_eq!(fetched.entries[0].student_ids, vec![student]);
        assert_eq!(fetched.entries[1].day_of_week, 1);

        let err = templates.create_template(methodologist, "Autumn", vec![entry(2, 9, teacher, vec![])]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { field: "name", .. }));
    }

    #[tokio::test]
    async fn test_template_validation() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.user(Role::Student).await;
        let templates = env.scheduler.templates();

        let mut bad = entry(7, 9, teacher, vec![]);
        assert!(matches!(templates.create_template(admin, "t", vec![bad.clone()]).await, Err(Error::InvalidInput { .. })));

        bad = entry(1, 9, teacher, vec![student, student]);
        assert!(matches!(templates.create_template(admin, "t", vec![bad.clone()]).await, Err(Error::InvalidInput { .. })));

        bad = entry(1, 9, teacher, vec![student]);
        bad.is_individual = true;
        assert!(matches!(templates.create_template(admin, "t", vec![bad]).await, Err(Error::InvalidInput { .. })));

        let err = templates.create_template(admin, "t", vec![entry(1, 9, student, vec![])]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRole { expected: Role::Teacher, .. }));

        let err = templates.create_template(teacher, "t", vec![entry(1, 9, teacher, vec![])]).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_apply_creates_week() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let template = env
            .scheduler
            .templates()
            .create_template(admin, "Week", vec![entry(1, 9, teacher, vec![student]), entry(0, 18, teacher, vec![student])])
            .await
            .unwrap();

        let result = env
            .scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week(), false)
            .await
            .unwrap();

        assert_eq!(
            result.stats,
            CreationStats {
                created_lessons: 2,
                created_bookings: 2,
                deducted_credits: 2
            }
        );
        assert_eq!(result.application.status, ApplicationStatus::Applied);
        assert_eq!(result.application.created_lessons_count, 2);
        assert_eq!(env.balance(student).await, 8);

        let monday = env.get_lesson(result.lesson_ids[0]).await;
        assert_eq!(monday.start_time, Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
        assert_eq!(monday.current_students, 1);
        assert_eq!(monday.template_application_id, Some(result.application.id));
        let sunday = env.get_lesson(result.lesson_ids[1]).await;
        assert_eq!(sunday.start_time, Utc.with_ymd_and_hms(2026, 10, 25, 18, 0, 0).unwrap());

        let err = env
            .scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateAlreadyApplied { .. }));

        let history = env.scheduler.templates().list_applications(template.template.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let rich = env.student_with_credits(10).await;
        let poor = env.student_with_credits(1).await;
        let template = env
            .scheduler
            .templates()
            .create_template(
                admin,
                "Week",
                vec![entry(1, 9, teacher, vec![rich, poor]), entry(3, 9, teacher, vec![rich, poor])],
            )
            .await
            .unwrap();

        let err = env
            .scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits { user_id, .. } if user_id == poor));

        assert_eq!(env.balance(rich).await, 10);
        assert_eq!(env.balance(poor).await, 1);
        let lessons = env
            .scheduler
            .lessons()
            .list_lessons(crate::db::models::lessons::LessonFilter {
                teacher_id: Some(teacher),
                include_deleted: true,
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(lessons.is_empty());
        assert!(env.scheduler.templates().list_applications(template.template.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing_and_matches_real_run() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let template = env
            .scheduler
            .templates()
            .create_template(admin, "Week", vec![entry(2, 9, teacher, vec![student]), entry(4, 9, teacher, vec![])])
            .await
            .unwrap();
        let templates = env.scheduler.templates();

        let dry = templates.apply_template_to_week(admin, template.template.id, week(), true).await.unwrap();
        assert!(dry.dry_run);
        assert_eq!(env.balance(student).await, 10);
        assert!(templates.list_applications(template.template.id).await.unwrap().is_empty());
        for lesson_id in &dry.lesson_ids {
            let lookup = env.scheduler.lessons().get_lesson(*lesson_id).await;
            assert!(matches!(lookup, Err(Error::LessonNotFound { .. })));
        }

        let real = templates.apply_template_to_week(admin, template.template.id, week(), false).await.unwrap();
        assert_eq!(dry.stats, real.stats);
        assert_eq!(env.balance(student).await, 9);
    }

    #[tokio::test]
    async fn test_apply_preconditions() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let template = env
            .scheduler
            .templates()
            .create_template(admin, "Week", vec![entry(2, 9, teacher, vec![])])
            .await
            .unwrap();
        let templates = env.scheduler.templates();

        let tuesday = week() + Duration::days(1);
        let err = templates.apply_template_to_week(admin, template.template.id, tuesday, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));

        let err = templates.apply_template_to_week(admin, uuid::Uuid::new_v4(), week(), false).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound { .. }));

        let err = templates.apply_template_to_week(teacher, template.template.id, week(), false).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_template_bookings_skip_schedule_conflicts() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let other_teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;

        // Direct booking at the same time as the template lesson
        let monday_nine = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let existing = env.lesson(other_teacher, monday_nine, 4, 1).await;
        env.scheduler
            .bookings()
            .create_booking(Actor::user(student), student, existing.id)
            .await
            .unwrap();

        let template = env
            .scheduler
            .templates()
            .create_template(admin, "Week", vec![entry(1, 9, teacher, vec![student])])
            .await
            .unwrap();
        let result = env
            .scheduler
            .templates()
            .apply_template_to_week(admin, template.template.id, week(), false)
            .await
            .unwrap();
        assert_eq!(result.stats.created_bookings, 1);
    }

    #[tokio::test]
    async fn test_concurrent_applications_apply_once() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let template = env
            .scheduler
            .templates()
            .create_template(admin, "Week", vec![entry(2, 9, teacher, vec![student])])
            .await
            .unwrap();
        let template_id = template.template.id;

        let attempts = (0..4).map(|_| {
            let templates = env.scheduler.templates();
            async move { templates.apply_template_to_week(admin, template_id, week(), false).await }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            Error::TemplateAlreadyApplied { .. } | Error::SerializationConflict
        )));
        assert_eq!(env.balance(student).await, 9);
    }
}
