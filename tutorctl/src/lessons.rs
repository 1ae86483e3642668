//! Lesson management: creating single lessons and weekly series, soft deletion, homework and
//! report texts.
//!
//! Lessons are never removed from the database. Deleting one sets `deleted_at`, and only
//! lessons without active bookings or homework can be deleted this way.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::models::lessons::{LessonCreateDBRequest, LessonDBResponse, LessonFilter};
use crate::errors::{Error, Result};
use crate::scheduler::{load_user, require_role, EngineContext};
use crate::store::{Store, StoreTx};
use crate::types::{abbrev_uuid, Actor, IsolationLevel, LessonId, Role, UserId};

pub const MIN_CREDITS_COST: i32 = 1;
pub const MAX_CREDITS_COST: i32 = 100;
/// Longest series `create_recurring_series` accepts, in weeks.
pub const MAX_SERIES_WEEKS: u32 = 52;

/// Capacity and price rules shared by lessons and template rows.
pub(crate) fn validate_capacity(max_students: i32, credits_cost: i32, is_individual: bool) -> Result<()> {
    if max_students < 1 {
        return Err(Error::invalid("max_students", "must be at least 1"));
    }
    if is_individual && max_students != 1 {
        return Err(Error::invalid("max_students", "individual lessons take exactly one student"));
    }
    if !(MIN_CREDITS_COST..=MAX_CREDITS_COST).contains(&credits_cost) {
        return Err(Error::invalid(
            "credits_cost",
            format!("must be between {MIN_CREDITS_COST} and {MAX_CREDITS_COST}, got {credits_cost}"),
        ));
    }
    Ok(())
}

/// Input for a new lesson.
#[derive(Debug, Clone)]
pub struct LessonDraft {
    pub teacher_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_students: i32,
    pub credits_cost: i32,
    pub is_individual: bool,
}

impl LessonDraft {
    fn validate(&self) -> Result<()> {
        if self.end_time <= self.start_time {
            return Err(Error::invalid("end_time", "must be after start_time"));
        }
        validate_capacity(self.max_students, self.credits_cost, self.is_individual)
    }

    fn request(&self, offset: Duration, recurring_group_id: Option<Uuid>, now: DateTime<Utc>) -> LessonCreateDBRequest {
        LessonCreateDBRequest {
            teacher_id: self.teacher_id,
            start_time: self.start_time + offset,
            end_time: self.end_time + offset,
            max_students: self.max_students,
            credits_cost: self.credits_cost,
            recurring_group_id,
            template_application_id: None,
            created_at: now,
        }
    }
}

/// Admins and methodologists manage any lesson; teachers manage their own.
async fn authorize_lesson_change<T: StoreTx>(tx: &mut T, actor: Actor, teacher_id: UserId, action: &'static str) -> Result<()> {
    if actor.is_admin {
        return Ok(());
    }
    let user = load_user(tx, actor.user_id).await?;
    let allowed = user.role.can_manage_schedule() || (user.role.is_teacher() && user.id == teacher_id);
    if !allowed {
        return Err(Error::Unauthorized {
            user_id: actor.user_id,
            action,
        });
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct LessonService<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> LessonService<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, draft), fields(actor = %abbrev_uuid(&actor.user_id), teacher_id = %abbrev_uuid(&draft.teacher_id)), err)]
    pub async fn create_lesson(&self, actor: Actor, draft: LessonDraft) -> Result<LessonDBResponse> {
        let mut lessons = self.create_weekly(actor, draft, 1, None).await?;
        lessons.pop().ok_or_else(|| Error::Other(anyhow::anyhow!("lesson insert returned nothing")))
    }

    /// `weeks` copies of the draft, one week apart, sharing a fresh recurring group ID.
    #[instrument(skip(self, draft), fields(actor = %abbrev_uuid(&actor.user_id), teacher_id = %abbrev_uuid(&draft.teacher_id)), err)]
    pub async fn create_recurring_series(&self, actor: Actor, draft: LessonDraft, weeks: u32) -> Result<Vec<LessonDBResponse>> {
        if !(1..=MAX_SERIES_WEEKS).contains(&weeks) {
            return Err(Error::invalid("weeks", format!("must be between 1 and {MAX_SERIES_WEEKS}")));
        }
        self.create_weekly(actor, draft, weeks, Some(Uuid::new_v4())).await
    }

    async fn create_weekly(&self, actor: Actor, draft: LessonDraft, weeks: u32, group: Option<Uuid>) -> Result<Vec<LessonDBResponse>> {
        draft.validate()?;
        let ctx = &self.ctx;
        ctx.with_deadline("create_lesson", async {
            let now = ctx.now();
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            authorize_lesson_change(&mut tx, actor, draft.teacher_id, "create lessons for this teacher").await?;
            require_role(&mut tx, draft.teacher_id, Role::Teacher).await?;

            let mut lessons = Vec::with_capacity(weeks as usize);
            for week in 0..weeks {
                let request = draft.request(Duration::weeks(i64::from(week)), group, now);
                lessons.push(tx.insert_lesson(&request).await?);
            }
            tx.commit().await?;

            info!(count = lessons.len(), recurring = group.is_some(), "Lessons created");
            Ok(lessons)
        })
        .await
    }

    /// Soft-delete a lesson that nobody is booked on and that carries no homework.
    #[instrument(skip(self), fields(actor = %abbrev_uuid(&actor.user_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn delete_lesson(&self, actor: Actor, lesson_id: LessonId) -> Result<LessonDBResponse> {
        let ctx = &self.ctx;
        ctx.with_deadline("delete_lesson", async {
            let now = ctx.now();
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let lesson = match tx.lock_lesson(lesson_id).await? {
                Some(lesson) if !lesson.is_deleted() => lesson,
                _ => return Err(Error::LessonNotFound { lesson_id }),
            };
            authorize_lesson_change(&mut tx, actor, lesson.teacher_id, "delete this lesson").await?;

            let active = tx.lock_active_bookings_for_lesson(lesson_id).await?;
            if !active.is_empty() {
                return Err(Error::HasDependents {
                    entity: "lesson",
                    id: lesson_id.to_string(),
                    dependents: format!("{} active booking(s)", active.len()),
                });
            }
            if lesson.homework_text.as_deref().is_some_and(|text| !text.is_empty()) {
                return Err(Error::HasDependents {
                    entity: "lesson",
                    id: lesson_id.to_string(),
                    dependents: "homework".to_string(),
                });
            }

            tx.soft_delete_lesson(lesson_id, now).await?;
            let lesson = tx.get_lesson(lesson_id).await?.ok_or(Error::LessonNotFound { lesson_id })?;
            tx.commit().await?;

            info!("Lesson deleted");
            Ok(lesson)
        })
        .await
    }

    /// Soft-deleted lessons are returned too; check `deleted_at`.
    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn get_lesson(&self, lesson_id: LessonId) -> Result<LessonDBResponse> {
        let ctx = &self.ctx;
        ctx.with_deadline("get_lesson", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let lesson = tx.get_lesson(lesson_id).await?.ok_or(Error::LessonNotFound { lesson_id })?;
            tx.rollback().await?;
            Ok(lesson)
        })
        .await
    }

    #[instrument(skip(self, filter), err)]
    pub async fn list_lessons(&self, filter: LessonFilter) -> Result<Vec<LessonDBResponse>> {
        if filter.skip < 0 || filter.limit < 0 {
            return Err(Error::invalid("limit", "skip and limit must not be negative"));
        }
        let ctx = &self.ctx;
        ctx.with_deadline("list_lessons", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let lessons = tx.list_lessons(&filter).await?;
            tx.rollback().await?;
            Ok(lessons)
        })
        .await
    }

    #[instrument(skip(self, text), fields(actor = %abbrev_uuid(&actor.user_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn set_homework(&self, actor: Actor, lesson_id: LessonId, text: Option<String>) -> Result<LessonDBResponse> {
        self.update_texts(actor, lesson_id, TextField::Homework, text).await
    }

    #[instrument(skip(self, text), fields(actor = %abbrev_uuid(&actor.user_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn set_report(&self, actor: Actor, lesson_id: LessonId, text: Option<String>) -> Result<LessonDBResponse> {
        self.update_texts(actor, lesson_id, TextField::Report, text).await
    }

    async fn update_texts(&self, actor: Actor, lesson_id: LessonId, field: TextField, text: Option<String>) -> Result<LessonDBResponse> {
        let text = text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        let ctx = &self.ctx;
        ctx.with_deadline("update_lesson_texts", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let lesson = match tx.lock_lesson(lesson_id).await? {
                Some(lesson) if !lesson.is_deleted() => lesson,
                _ => return Err(Error::LessonNotFound { lesson_id }),
            };
            authorize_lesson_change(&mut tx, actor, lesson.teacher_id, "edit this lesson").await?;

            let (homework, report) = match field {
                TextField::Homework => (text.as_deref(), lesson.report_text.as_deref()),
                TextField::Report => (lesson.homework_text.as_deref(), text.as_deref()),
            };
            tx.set_lesson_texts(lesson_id, homework, report).await?;
            let lesson = tx.get_lesson(lesson_id).await?.ok_or(Error::LessonNotFound { lesson_id })?;
            tx.commit().await?;
            Ok(lesson)
        })
        .await
    }
}

#[derive(Debug, Clone, Copy)]
enum TextField {
    Homework,
    Report,
}
