//! Database repository for bulk-edit audit records.

use crate::db::{
    errors::Result,
    models::modifications::{ModificationCreateDBRequest, ModificationDBResponse},
};
use crate::types::abbrev_uuid;
use sqlx::PgConnection;
use tracing::instrument;

pub struct Modifications<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Modifications<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(lesson_id = %abbrev_uuid(&request.original_lesson_id), kind = ?request.modification_type), err)]
    pub async fn create(&mut self, request: &ModificationCreateDBRequest) -> Result<ModificationDBResponse> {
        let modification = sqlx::query_as::<_, ModificationDBResponse>(
            r#"
            INSERT INTO lesson_modifications
                (original_lesson_id, modification_type, payload, applied_by, applied_at, affected_lessons_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, original_lesson_id, modification_type, payload, applied_by, applied_at, affected_lessons_count
            "#,
        )
        .bind(request.original_lesson_id)
        .bind(request.modification_type)
        .bind(&request.payload)
        .bind(request.applied_by)
        .bind(request.applied_at)
        .bind(request.affected_lessons_count)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(modification)
    }
}
