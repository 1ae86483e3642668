//! Database repository for lesson templates, template rows and template applications.

use crate::db::{
    errors::Result,
    models::templates::{
        ApplicationCreateDBRequest, ApplicationDBResponse, TemplateCreateDBRequest, TemplateDBResponse, TemplateEntryCreateDBRequest,
        TemplateEntryDBResponse,
    },
};
use crate::types::{abbrev_uuid, ApplicationId, TemplateId};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgConnection;
use tracing::instrument;

const ENTRY_COLUMNS: &str =
    "id, template_id, position, day_of_week, start_time, end_time, teacher_id, max_students, credits_cost, student_ids";

const APPLICATION_COLUMNS: &str =
    "id, template_id, week_start_date, applied_by, status, created_lessons_count, applied_at, rolled_back_at";

pub struct Templates<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Templates<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(owner_id = %abbrev_uuid(&request.owner_id), name = %request.name), err)]
    pub async fn create(&mut self, request: &TemplateCreateDBRequest) -> Result<TemplateDBResponse> {
        let template = sqlx::query_as::<_, TemplateDBResponse>(
            r#"
            INSERT INTO lesson_templates (owner_id, name, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, owner_id, name, created_at
            "#,
        )
        .bind(request.owner_id)
        .bind(&request.name)
        .bind(request.created_at)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(template)
    }

    #[instrument(skip(self, request), fields(template_id = %abbrev_uuid(&request.template_id), position = request.position), err)]
    pub async fn create_entry(&mut self, request: &TemplateEntryCreateDBRequest) -> Result<TemplateEntryDBResponse> {
        let sql = format!(
            r#"
            INSERT INTO template_lessons
                (template_id, position, day_of_week, start_time, end_time, teacher_id, max_students, credits_cost, student_ids)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let entry = sqlx::query_as::<_, TemplateEntryDBResponse>(&sql)
            .bind(request.template_id)
            .bind(request.position)
            .bind(request.day_of_week)
            .bind(request.start_time)
            .bind(request.end_time)
            .bind(request.teacher_id)
            .bind(request.max_students)
            .bind(request.credits_cost)
            .bind(&request.student_ids)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(entry)
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: TemplateId) -> Result<Option<TemplateDBResponse>> {
        let template =
            sqlx::query_as::<_, TemplateDBResponse>("SELECT id, owner_id, name, created_at FROM lesson_templates WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(template)
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&template_id)), err)]
    pub async fn entries(&mut self, template_id: TemplateId) -> Result<Vec<TemplateEntryDBResponse>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM template_lessons WHERE template_id = $1 ORDER BY position ASC, id ASC");
        let entries = sqlx::query_as::<_, TemplateEntryDBResponse>(&sql)
            .bind(template_id)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(entries)
    }
}

pub struct Applications<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Applications<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&template_id), week_start = %week_start), err)]
    pub async fn lock_applied(&mut self, template_id: TemplateId, week_start: NaiveDate) -> Result<Option<ApplicationDBResponse>> {
        let sql = format!(
            r#"
            SELECT {APPLICATION_COLUMNS}
            FROM template_applications
            WHERE template_id = $1 AND week_start_date = $2 AND status = 'applied'
            FOR UPDATE
            "#
        );
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&sql)
            .bind(template_id)
            .bind(week_start)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(application)
    }

    #[instrument(skip(self, request), fields(template_id = %abbrev_uuid(&request.template_id), week_start = %request.week_start_date), err)]
    pub async fn create(&mut self, request: &ApplicationCreateDBRequest) -> Result<ApplicationDBResponse> {
        let sql = format!(
            r#"
            INSERT INTO template_applications (template_id, week_start_date, applied_by, status, created_lessons_count, applied_at)
            VALUES ($1, $2, $3, 'applied', 0, $4)
            RETURNING {APPLICATION_COLUMNS}
            "#
        );
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&sql)
            .bind(request.template_id)
            .bind(request.week_start_date)
            .bind(request.applied_by)
            .bind(request.applied_at)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(application)
    }

    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id)), err)]
    pub async fn set_lesson_count(&mut self, id: ApplicationId, created_lessons_count: i32) -> Result<ApplicationDBResponse> {
        let sql = format!("UPDATE template_applications SET created_lessons_count = $2 WHERE id = $1 RETURNING {APPLICATION_COLUMNS}");
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&sql)
            .bind(id)
            .bind(created_lessons_count)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(application)
    }

    #[instrument(skip(self), fields(application_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_rolled_back(&mut self, id: ApplicationId, at: DateTime<Utc>) -> Result<ApplicationDBResponse> {
        let sql = format!(
            r#"
            UPDATE template_applications
            SET status = 'rolled_back', rolled_back_at = $2
            WHERE id = $1
            RETURNING {APPLICATION_COLUMNS}
            "#
        );
        let application = sqlx::query_as::<_, ApplicationDBResponse>(&sql)
            .bind(id)
            .bind(at)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(application)
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&template_id)), err)]
    pub async fn list_for_template(&mut self, template_id: TemplateId) -> Result<Vec<ApplicationDBResponse>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM template_applications WHERE template_id = $1 ORDER BY applied_at DESC, id DESC"
        );
        let applications = sqlx::query_as::<_, ApplicationDBResponse>(&sql)
            .bind(template_id)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(applications)
    }
}
