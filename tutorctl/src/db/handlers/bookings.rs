//! Database repository for bookings and cancellation markers.

use crate::db::{
    errors::Result,
    models::bookings::{BookingCreateDBRequest, BookingDBResponse, BookingFilter},
};
use crate::types::{abbrev_uuid, BookingId, LessonId, UserId};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

const BOOKING_COLUMNS: &str =
    "id, student_id, lesson_id, status, credits_charged, template_application_id, booked_by, booked_at, cancelled_at";

pub struct Bookings<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Bookings<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(student_id = %abbrev_uuid(&request.student_id), lesson_id = %abbrev_uuid(&request.lesson_id)), err)]
    pub async fn create(&mut self, request: &BookingCreateDBRequest) -> Result<BookingDBResponse> {
        let sql = format!(
            r#"
            INSERT INTO bookings (id, student_id, lesson_id, status, credits_charged, template_application_id, booked_by, booked_at)
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7)
            RETURNING {BOOKING_COLUMNS}
            "#
        );
        let booking = sqlx::query_as::<_, BookingDBResponse>(&sql)
            .bind(request.id)
            .bind(request.student_id)
            .bind(request.lesson_id)
            .bind(request.credits_charged)
            .bind(request.template_application_id)
            .bind(request.booked_by)
            .bind(request.booked_at)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(booking)
    }

    #[instrument(skip(self), fields(booking_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        let booking = sqlx::query_as::<_, BookingDBResponse>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(booking)
    }

    #[instrument(skip(self), fields(booking_id = %abbrev_uuid(&id)), err)]
    pub async fn lock(&mut self, id: BookingId) -> Result<Option<BookingDBResponse>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE");
        let booking = sqlx::query_as::<_, BookingDBResponse>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(booking)
    }

    #[instrument(skip(self), fields(student_id = %abbrev_uuid(&student_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn find_active(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<Option<BookingDBResponse>> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE student_id = $1 AND lesson_id = $2 AND status = 'active' FOR UPDATE"
        );
        let booking = sqlx::query_as::<_, BookingDBResponse>(&sql)
            .bind(student_id)
            .bind(lesson_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(booking)
    }

    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn lock_active_for_lesson(&mut self, lesson_id: LessonId) -> Result<Vec<BookingDBResponse>> {
        let sql = format!(
            r#"
            SELECT {BOOKING_COLUMNS}
            FROM bookings
            WHERE lesson_id = $1 AND status = 'active'
            ORDER BY booked_at ASC, id ASC
            FOR UPDATE
            "#
        );
        let bookings = sqlx::query_as::<_, BookingDBResponse>(&sql)
            .bind(lesson_id)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(bookings)
    }

    #[instrument(skip(self), fields(student_id = %abbrev_uuid(&student_id)), err)]
    pub async fn find_overlapping_lesson(
        &mut self,
        student_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: LessonId,
    ) -> Result<Option<LessonId>> {
        let lesson_id = sqlx::query_scalar::<_, LessonId>(
            r#"
            SELECT l.id
            FROM bookings b
            JOIN lessons l ON l.id = b.lesson_id
            WHERE b.student_id = $1
              AND b.status = 'active'
              AND l.deleted_at IS NULL
              AND l.id <> $4
              AND l.start_time < $3
              AND $2 < l.end_time
            ORDER BY l.start_time ASC
            LIMIT 1
            "#,
        )
        .bind(student_id)
        .bind(start)
        .bind(end)
        .bind(exclude)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(lesson_id)
    }

    #[instrument(skip(self), fields(booking_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_cancelled(&mut self, id: BookingId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE bookings SET status = 'cancelled', cancelled_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &BookingFilter) -> Result<Vec<BookingDBResponse>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE TRUE"));

        if let Some(student_id) = filter.student_id {
            query.push(" AND student_id = ").push_bind(student_id);
        }
        if let Some(lesson_id) = filter.lesson_id {
            query.push(" AND lesson_id = ").push_bind(lesson_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        query
            .push(" ORDER BY booked_at DESC, id DESC OFFSET ")
            .push_bind(filter.skip)
            .push(" LIMIT ")
            .push_bind(filter.limit);

        let bookings = query.build_query_as::<BookingDBResponse>().fetch_all(&mut *self.db).await?;
        Ok(bookings)
    }

    #[instrument(skip(self), fields(student_id = %abbrev_uuid(&student_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn has_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM cancelled_bookings WHERE student_id = $1 AND lesson_id = $2)",
        )
        .bind(student_id)
        .bind(lesson_id)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(exists)
    }

    #[instrument(skip(self), fields(student_id = %abbrev_uuid(&student_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn insert_cancellation_marker(&mut self, student_id: UserId, lesson_id: LessonId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cancelled_bookings (student_id, lesson_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, lesson_id) DO NOTHING
            "#,
        )
        .bind(student_id)
        .bind(lesson_id)
        .bind(at)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }
}
