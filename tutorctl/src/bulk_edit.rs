//! Apply one change to every upcoming lesson of a weekly pattern.
//!
//! The pattern of a lesson is its teacher, day of week and time of day, read in the configured
//! scheduling offset. Starting from a source lesson, the target set is every live lesson with
//! the same pattern that has not started yet, the source itself included when it is upcoming.
//! There is no link to a recurring group: unrelated lessons that happen to share the slot are
//! matched too.
//!
//! The whole target set is changed in one unit of work. If any lesson refuses the change the
//! others are left untouched.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::booking::{book_student, cancel_active_booking, BookingRules};
use crate::calendar::PatternKey;
use crate::db::models::{
    lessons::LessonDBResponse,
    modifications::{ModificationCreateDBRequest, ModificationDBResponse, ModificationType},
};
use crate::errors::{Error, Result};
use crate::scheduler::{require_role, require_schedule_manager, EngineContext};
use crate::store::{Store, StoreTx};
use crate::types::{abbrev_uuid, IsolationLevel, LessonId, Role, UserId};

/// The change to make. Serialized as the audit record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkModification {
    AddStudent { student_id: UserId },
    RemoveStudent { student_id: UserId },
    ChangeTeacher { teacher_id: UserId },
}

impl BulkModification {
    pub fn modification_type(&self) -> ModificationType {
        match self {
            BulkModification::AddStudent { .. } => ModificationType::AddStudent,
            BulkModification::RemoveStudent { .. } => ModificationType::RemoveStudent,
            BulkModification::ChangeTeacher { .. } => ModificationType::ChangeTeacher,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BulkModification::AddStudent { .. } => "add_student",
            BulkModification::RemoveStudent { .. } => "remove_student",
            BulkModification::ChangeTeacher { .. } => "change_teacher",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkEditResult {
    pub modification: ModificationDBResponse,
    /// Lessons actually changed, in start order
    pub affected_lesson_ids: Vec<LessonId>,
    pub deducted_credits: i64,
    pub refunded_credits: i64,
}

#[derive(Clone, Debug)]
pub struct BulkEditEngine<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> BulkEditEngine<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(actor_id = %abbrev_uuid(&actor_id), source_lesson_id = %abbrev_uuid(&source_lesson_id), modification = modification.label()), err)]
    pub async fn apply_to_all_subsequent(
        &self,
        actor_id: UserId,
        source_lesson_id: LessonId,
        modification: BulkModification,
    ) -> Result<BulkEditResult> {
        let ctx = &self.ctx;
        ctx.with_deadline("apply_to_all_subsequent", async {
            let now = ctx.now();
            let offset = ctx.offset()?;
            let window = ctx.settings.cancellation_window()?;
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            require_schedule_manager(&mut tx, actor_id, "bulk edit lessons").await?;

            let source = match tx.get_lesson(source_lesson_id).await? {
                Some(lesson) if !lesson.is_deleted() => lesson,
                _ => {
                    return Err(Error::LessonNotFound {
                        lesson_id: source_lesson_id,
                    });
                }
            };
            let pattern = PatternKey::of(&source, offset);
            let mut targets: Vec<LessonDBResponse> = tx
                .lock_teacher_lessons_from(pattern.teacher_id, now)
                .await?
                .into_iter()
                .filter(|lesson| pattern.matches(lesson, offset))
                .collect();
            if targets.is_empty() {
                return Err(Error::invalid("source_lesson_id", "no upcoming lessons share this lesson's slot"));
            }
            debug!(targets = targets.len(), "Pattern resolved");

            let mut affected = Vec::with_capacity(targets.len());
            let mut deducted_credits = 0;
            let mut refunded_credits = 0;

            match modification {
                BulkModification::AddStudent { student_id } => {
                    require_role(&mut tx, student_id, Role::Student).await?;
                    let rules = BookingRules {
                        check_schedule_conflicts: true,
                        application_id: None,
                        booked_by: Some(actor_id),
                    };
                    for lesson in targets.iter_mut() {
                        let booking = match book_student(&mut tx, now, student_id, lesson, rules).await {
                            Ok(booking) => booking,
                            Err(e) => {
                                warn!(lesson_id = %abbrev_uuid(&lesson.id), error = %e, "Bulk add refused, nothing changed");
                                return Err(e);
                            }
                        };
                        deducted_credits += booking.credits_charged;
                        affected.push(lesson.id);
                    }
                }
                BulkModification::RemoveStudent { student_id } => {
                    for lesson in targets.iter_mut() {
                        let Some(booking) = tx.find_active_booking(student_id, lesson.id).await? else {
                            continue;
                        };
                        refunded_credits +=
                            cancel_active_booking(&mut tx, now, &booking, lesson, window, Some(actor_id), false).await?;
                        affected.push(lesson.id);
                    }
                    if affected.is_empty() {
                        return Err(Error::BookingNotActive { booking_id: None });
                    }
                }
                BulkModification::ChangeTeacher { teacher_id } => {
                    require_role(&mut tx, teacher_id, Role::Teacher).await?;
                    for lesson in &targets {
                        tx.set_lesson_teacher(lesson.id, teacher_id).await?;
                        affected.push(lesson.id);
                    }
                }
            }

            let payload = serde_json::to_value(modification).map_err(|e| Error::Other(e.into()))?;
            let record = tx
                .insert_modification(&ModificationCreateDBRequest {
                    original_lesson_id: source.id,
                    modification_type: modification.modification_type(),
                    payload,
                    applied_by: actor_id,
                    applied_at: now,
                    affected_lessons_count: affected.len() as i32,
                })
                .await?;
            tx.commit().await?;

            crate::metrics::record_bulk_edit(modification.label());
            if let BulkModification::AddStudent { .. } = modification {
                for _ in &affected {
                    crate::metrics::record_booking_created("bulk_edit");
                }
            }
            if deducted_credits > 0 {
                crate::metrics::record_credits("deduct", deducted_credits);
            }
            if refunded_credits > 0 {
                crate::metrics::record_credits("refund", refunded_credits);
            }
            info!(
                modification_id = %abbrev_uuid(&record.id),
                affected_lessons = affected.len(),
                "Bulk edit applied"
            );
            Ok(BulkEditResult {
                modification: record,
                affected_lesson_ids: affected,
                deducted_credits,
                refunded_credits,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::bookings::{BookingFilter, BookingStatus};
    use crate::test_utils::TestEnv;
    use crate::types::Actor;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    /// Wednesday 2026-10-21 10:00 UTC
    fn first_slot() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 21, 10, 0, 0).unwrap()
    }

    async fn weekly_lessons(env: &TestEnv, teacher: UserId, weeks: i64, max_students: i32) -> Vec<LessonDBResponse> {
        let mut lessons = Vec::new();
        for week in 0..weeks {
            lessons.push(env.lesson(teacher, first_slot() + Duration::weeks(week), max_students, 1).await);
        }
        lessons
    }

    async fn fill(env: &TestEnv, lesson: &LessonDBResponse) {
        for _ in lesson.current_students..lesson.max_students {
            let student = env.student_with_credits(1).await;
            env.scheduler
                .bookings()
                .create_booking(Actor::user(student), student, lesson.id)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_student_to_every_matching_lesson() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let lessons = weekly_lessons(&env, teacher, 3, 4).await;
        // Same teacher and day, different time: not part of the pattern
        let other_time = env.lesson(teacher, first_slot() + Duration::hours(3), 4, 1).await;

        let result = env
            .scheduler
            .bulk_edit()
            .apply_to_all_subsequent(admin, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap();

        assert_eq!(result.affected_lesson_ids, lessons.iter().map(|l| l.id).collect::<Vec<_>>());
        assert_eq!(result.modification.affected_lessons_count, 3);
        assert_eq!(result.modification.modification_type, ModificationType::AddStudent);
        assert_eq!(result.modification.payload["type"], "add_student");
        assert_eq!(result.deducted_credits, 3);
        // Other tests bump the same global counter concurrently
        assert!(crate::metrics::bookings_created("bulk_edit") >= 3);
        assert_eq!(env.balance(student).await, 7);
        assert_eq!(env.get_lesson(other_time.id).await.current_students, 0);
    }

    #[tokio::test]
    async fn test_add_student_is_all_or_nothing() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let lessons = weekly_lessons(&env, teacher, 3, 2).await;
        fill(&env, &lessons[2]).await;

        let err = env
            .scheduler
            .bulk_edit()
            .apply_to_all_subsequent(admin, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LessonFull { lesson_id } if lesson_id == lessons[2].id));

        assert_eq!(env.balance(student).await, 10);
        for lesson in &lessons[..2] {
            assert_eq!(env.get_lesson(lesson.id).await.current_students, 0);
        }
        let bookings = env
            .scheduler
            .bookings()
            .list_bookings(BookingFilter::new(0, 10).student(student))
            .await
            .unwrap();
        assert!(bookings.is_empty());
    }

    #[tokio::test]
    async fn test_past_lessons_are_not_targets() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let lessons = weekly_lessons(&env, teacher, 3, 4).await;

        // Between the first and second occurrence
        env.clock.set(first_slot() + Duration::days(1));
        let result = env
            .scheduler
            .bulk_edit()
            .apply_to_all_subsequent(admin, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap();
        assert_eq!(result.affected_lesson_ids, vec![lessons[1].id, lessons[2].id]);
        assert_eq!(env.get_lesson(lessons[0].id).await.current_students, 0);
    }

    #[tokio::test]
    async fn test_remove_student_refunds_per_lesson() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let lessons = weekly_lessons(&env, teacher, 3, 4).await;
        let bulk = env.scheduler.bulk_edit();
        bulk.apply_to_all_subsequent(admin, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap();
        assert_eq!(env.balance(student).await, 7);

        // Inside the window for the first lesson only
        env.clock.set(first_slot() - Duration::hours(2));
        let result = bulk
            .apply_to_all_subsequent(admin, lessons[0].id, BulkModification::RemoveStudent { student_id: student })
            .await
            .unwrap();
        assert_eq!(result.affected_lesson_ids.len(), 3);
        assert_eq!(result.refunded_credits, 2);
        assert_eq!(env.balance(student).await, 9);

        let active = env
            .scheduler
            .bookings()
            .list_bookings(BookingFilter::new(0, 10).student(student).status(BookingStatus::Active))
            .await
            .unwrap();
        assert!(active.is_empty());
        for lesson in &lessons {
            assert_eq!(env.get_lesson(lesson.id).await.current_students, 0);
        }

        // Bulk removal leaves no marker, so the student can be added back
        bulk.apply_to_all_subsequent(admin, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap();

        let err = bulk
            .apply_to_all_subsequent(
                admin,
                lessons[0].id,
                BulkModification::RemoveStudent {
                    student_id: env.user(Role::Student).await,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BookingNotActive { .. }));
    }

    #[tokio::test]
    async fn test_change_teacher() {
        let env = TestEnv::new();
        let methodologist = env.user(Role::Methodologist).await;
        let teacher = env.user(Role::Teacher).await;
        let replacement = env.user(Role::Teacher).await;
        let student = env.user(Role::Student).await;
        let lessons = weekly_lessons(&env, teacher, 2, 4).await;
        let bulk = env.scheduler.bulk_edit();

        let err = bulk
            .apply_to_all_subsequent(methodologist, lessons[0].id, BulkModification::ChangeTeacher { teacher_id: student })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRole { .. }));

        let result = bulk
            .apply_to_all_subsequent(
                methodologist,
                lessons[0].id,
                BulkModification::ChangeTeacher { teacher_id: replacement },
            )
            .await
            .unwrap();
        assert_eq!(result.affected_lesson_ids.len(), 2);
        for lesson in &lessons {
            assert_eq!(env.get_lesson(lesson.id).await.teacher_id, replacement);
        }
    }

    #[tokio::test]
    async fn test_rejections() {
        let env = TestEnv::new();
        let admin = env.user(Role::Admin).await;
        let teacher = env.user(Role::Teacher).await;
        let student = env.student_with_credits(10).await;
        let lessons = weekly_lessons(&env, teacher, 1, 4).await;
        let bulk = env.scheduler.bulk_edit();

        let err = bulk
            .apply_to_all_subsequent(teacher, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));

        let err = bulk
            .apply_to_all_subsequent(admin, uuid::Uuid::new_v4(), BulkModification::AddStudent { student_id: student })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LessonNotFound { .. }));

        env.clock.set(first_slot() + Duration::hours(2));
        let err = bulk
            .apply_to_all_subsequent(admin, lessons[0].id, BulkModification::AddStudent { student_id: student })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }
}
