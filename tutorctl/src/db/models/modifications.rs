//! Database models for bulk-edit audit records.

use crate::types::{LessonId, ModificationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Modification type stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModificationType {
    AddStudent,
    RemoveStudent,
    ChangeTeacher,
}

#[derive(Debug, Clone)]
pub struct ModificationCreateDBRequest {
    pub original_lesson_id: LessonId,
    pub modification_type: ModificationType,
    pub payload: serde_json::Value,
    pub applied_by: UserId,
    pub applied_at: DateTime<Utc>,
    pub affected_lessons_count: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct ModificationDBResponse {
    pub id: ModificationId,
    pub original_lesson_id: LessonId,
    pub modification_type: ModificationType,
    pub payload: serde_json::Value,
    pub applied_by: UserId,
    pub applied_at: DateTime<Utc>,
    pub affected_lessons_count: i32,
}
