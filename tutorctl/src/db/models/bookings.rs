//! Database models for bookings.

use crate::types::{ApplicationId, BookingId, LessonId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Booking status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

/// Database request for creating a booking
///
/// The ID is assigned by the caller so the ledger entry paying for the booking can
/// reference it before the booking row exists.
#[derive(Debug, Clone)]
pub struct BookingCreateDBRequest {
    pub id: BookingId,
    pub student_id: UserId,
    pub lesson_id: LessonId,
    pub credits_charged: i64,
    pub template_application_id: Option<ApplicationId>,
    pub booked_by: Option<UserId>,
    pub booked_at: DateTime<Utc>,
}

/// Database response for a booking
#[derive(Debug, Clone, FromRow)]
pub struct BookingDBResponse {
    pub id: BookingId,
    pub student_id: UserId,
    pub lesson_id: LessonId,
    pub status: BookingStatus,
    /// Credits deducted when the booking was made; the exact amount any refund returns.
    pub credits_charged: i64,
    pub template_application_id: Option<ApplicationId>,
    pub booked_by: Option<UserId>,
    pub booked_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl BookingDBResponse {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// Filter for listing bookings
#[derive(Debug, Clone)]
pub struct BookingFilter {
    pub student_id: Option<UserId>,
    pub lesson_id: Option<LessonId>,
    pub status: Option<BookingStatus>,
    pub skip: i64,
    pub limit: i64,
}

impl BookingFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            student_id: None,
            lesson_id: None,
            status: None,
            skip,
            limit,
        }
    }

    pub fn student(mut self, student_id: UserId) -> Self {
        self.student_id = Some(student_id);
        self
    }

    pub fn lesson(mut self, lesson_id: LessonId) -> Self {
        self.lesson_id = Some(lesson_id);
        self
    }

    pub fn status(mut self, status: BookingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, booking: &BookingDBResponse) -> bool {
        self.student_id.is_none_or(|id| booking.student_id == id)
            && self.lesson_id.is_none_or(|id| booking.lesson_id == id)
            && self.status.is_none_or(|status| booking.status == status)
    }
}
