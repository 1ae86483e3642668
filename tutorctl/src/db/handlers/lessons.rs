//! Database repository for lessons.

use crate::db::{
    errors::Result,
    models::lessons::{LessonCreateDBRequest, LessonDBResponse, LessonFilter},
};
use crate::types::{abbrev_uuid, ApplicationId, LessonId, UserId};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

const LESSON_COLUMNS: &str = "id, teacher_id, start_time, end_time, max_students, current_students, credits_cost, \
     recurring_group_id, template_application_id, homework_text, report_text, created_at, deleted_at";

pub struct Lessons<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Lessons<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(teacher_id = %abbrev_uuid(&request.teacher_id), start_time = %request.start_time), err)]
    pub async fn create(&mut self, request: &LessonCreateDBRequest) -> Result<LessonDBResponse> {
        let sql = format!(
            r#"
            INSERT INTO lessons
                (teacher_id, start_time, end_time, max_students, credits_cost, recurring_group_id, template_application_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {LESSON_COLUMNS}
            "#
        );
        let lesson = sqlx::query_as::<_, LessonDBResponse>(&sql)
            .bind(request.teacher_id)
            .bind(request.start_time)
            .bind(request.end_time)
            .bind(request.max_students)
            .bind(request.credits_cost)
            .bind(request.recurring_group_id)
            .bind(request.template_application_id)
            .bind(request.created_at)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(lesson)
    }

    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>> {
        let sql = format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE id = $1");
        let lesson = sqlx::query_as::<_, LessonDBResponse>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(lesson)
    }

    /// Same as `get_by_id`, holding a row lock until the transaction ends
    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&id)), err)]
    pub async fn lock(&mut self, id: LessonId) -> Result<Option<LessonDBResponse>> {
        let sql = format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE id = $1 FOR UPDATE");
        let lesson = sqlx::query_as::<_, LessonDBResponse>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(lesson)
    }

    #[instrument(skip(self), fields(teacher_id = %abbrev_uuid(&teacher_id)), err)]
    pub async fn lock_teacher_lessons_from(&mut self, teacher_id: UserId, from: DateTime<Utc>) -> Result<Vec<LessonDBResponse>> {
        let sql = format!(
            r#"
            SELECT {LESSON_COLUMNS}
            FROM lessons
            WHERE teacher_id = $1 AND start_time >= $2 AND deleted_at IS NULL
            ORDER BY start_time ASC, id ASC
            FOR UPDATE
            "#
        );
        let lessons = sqlx::query_as::<_, LessonDBResponse>(&sql)
            .bind(teacher_id)
            .bind(from)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(lessons)
    }

    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&application_id)), err)]
    pub async fn lock_by_application(&mut self, application_id: ApplicationId) -> Result<Vec<LessonDBResponse>> {
        let sql = format!(
            r#"
            SELECT {LESSON_COLUMNS}
            FROM lessons
            WHERE template_application_id = $1
            ORDER BY start_time ASC, id ASC
            FOR UPDATE
            "#
        );
        let lessons = sqlx::query_as::<_, LessonDBResponse>(&sql)
            .bind(application_id)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(lessons)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &LessonFilter) -> Result<Vec<LessonDBResponse>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE TRUE"));

        if let Some(teacher_id) = filter.teacher_id {
            query.push(" AND teacher_id = ").push_bind(teacher_id);
        }
        if let Some(from) = filter.from {
            query.push(" AND start_time >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            query.push(" AND start_time < ").push_bind(to);
        }
        if !filter.include_deleted {
            query.push(" AND deleted_at IS NULL");
        }
        query
            .push(" ORDER BY start_time ASC, id ASC OFFSET ")
            .push_bind(filter.skip)
            .push(" LIMIT ")
            .push_bind(filter.limit);

        let lessons = query.build_query_as::<LessonDBResponse>().fetch_all(&mut *self.db).await?;
        Ok(lessons)
    }

    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&id)), err)]
    pub async fn set_current_students(&mut self, id: LessonId, current_students: i32) -> Result<()> {
        sqlx::query("UPDATE lessons SET current_students = $2 WHERE id = $1")
            .bind(id)
            .bind(current_students)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&id), teacher_id = %abbrev_uuid(&teacher_id)), err)]
    pub async fn set_teacher(&mut self, id: LessonId, teacher_id: UserId) -> Result<()> {
        sqlx::query("UPDATE lessons SET teacher_id = $2 WHERE id = $1")
            .bind(id)
            .bind(teacher_id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, homework_text, report_text), fields(lesson_id = %abbrev_uuid(&id)), err)]
    pub async fn set_texts(&mut self, id: LessonId, homework_text: Option<&str>, report_text: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE lessons SET homework_text = $2, report_text = $3 WHERE id = $1")
            .bind(id)
            .bind(homework_text)
            .bind(report_text)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(lesson_id = %abbrev_uuid(&id)), err)]
    pub async fn soft_delete(&mut self, id: LessonId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE lessons SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .bind(at)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }
}
