//! Database models for lessons.

use crate::types::{ApplicationId, LessonId, RecurringGroupId, UserId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Database request for creating a lesson
#[derive(Debug, Clone)]
pub struct LessonCreateDBRequest {
    pub teacher_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_students: i32,
    pub credits_cost: i32,
    pub recurring_group_id: Option<RecurringGroupId>,
    pub template_application_id: Option<ApplicationId>,
    pub created_at: DateTime<Utc>,
}

/// Database response for a lesson
#[derive(Debug, Clone, FromRow)]
pub struct LessonDBResponse {
    pub id: LessonId,
    pub teacher_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_students: i32,
    pub current_students: i32,
    pub credits_cost: i32,
    pub recurring_group_id: Option<RecurringGroupId>,
    pub template_application_id: Option<ApplicationId>,
    pub homework_text: Option<String>,
    pub report_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LessonDBResponse {
    pub fn is_individual(&self) -> bool {
        self.max_students == 1
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.current_students >= self.max_students
    }

    /// Half-open interval overlap: back-to-back lessons do not conflict.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }
}

/// Filter for listing lessons
#[derive(Debug, Clone, Default)]
pub struct LessonFilter {
    pub teacher_id: Option<UserId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub skip: i64,
    pub limit: i64,
}
