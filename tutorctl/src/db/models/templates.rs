//! Database models for lesson templates and their applications.

use crate::types::{ApplicationId, TemplateEntryId, TemplateId, UserId};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Database request for creating a template
#[derive(Debug, Clone)]
pub struct TemplateCreateDBRequest {
    pub owner_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Database response for a template
#[derive(Debug, Clone, FromRow)]
pub struct TemplateDBResponse {
    pub id: TemplateId,
    pub owner_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Database request for one template row
#[derive(Debug, Clone)]
pub struct TemplateEntryCreateDBRequest {
    pub template_id: TemplateId,
    pub position: i32,
    /// 0 = Sunday ... 6 = Saturday
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: UserId,
    pub max_students: i32,
    pub credits_cost: i32,
    pub student_ids: Vec<UserId>,
}

/// Database response for one template row
#[derive(Debug, Clone, FromRow)]
pub struct TemplateEntryDBResponse {
    pub id: TemplateEntryId,
    pub template_id: TemplateId,
    pub position: i32,
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: UserId,
    pub max_students: i32,
    pub credits_cost: i32,
    pub student_ids: Vec<UserId>,
}

/// Application status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Applied,
    RolledBack,
}

/// Database request for recording a template application
#[derive(Debug, Clone)]
pub struct ApplicationCreateDBRequest {
    pub template_id: TemplateId,
    pub week_start_date: NaiveDate,
    pub applied_by: UserId,
    pub applied_at: DateTime<Utc>,
}

/// Database response for a template application
#[derive(Debug, Clone, FromRow)]
pub struct ApplicationDBResponse {
    pub id: ApplicationId,
    pub template_id: TemplateId,
    pub week_start_date: NaiveDate,
    pub applied_by: UserId,
    pub status: ApplicationStatus,
    pub created_lessons_count: i32,
    pub applied_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}
