use crate::db::errors::DbError;
use crate::types::{BookingId, LessonId, Role, TemplateId, UserId};
use chrono::NaiveDate;
use thiserror::Error as ThisError;

/// Every failure the scheduling core can report.
///
/// The set is closed: callers (the HTTP layer, the CLI) switch on the variant or on
/// [`Error::kind`], never on the rendered message.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed or out-of-range input
    #[error("Invalid {field}: {message}")]
    InvalidInput { field: &'static str, message: String },

    /// The user exists but does not hold the role the operation needs
    #[error("User {user_id} must be a {expected}")]
    InvalidRole { user_id: UserId, expected: Role },

    /// Non-admin callers cannot book a lesson that has already started
    #[error("Lesson {lesson_id} has already started")]
    LessonStarted { lesson_id: LessonId },

    #[error("User {user_id} not found")]
    UserNotFound { user_id: UserId },

    #[error("Lesson {lesson_id} not found")]
    LessonNotFound { lesson_id: LessonId },

    #[error("Booking {booking_id} not found")]
    BookingNotFound { booking_id: BookingId },

    #[error("Template {template_id} not found")]
    TemplateNotFound { template_id: TemplateId },

    /// No `applied` template application exists for this template and week
    #[error("Template {template_id} has no applied instance for the week of {week_start}")]
    NothingToRollback { template_id: TemplateId, week_start: NaiveDate },

    /// The caller is not allowed to act on this resource
    #[error("User {user_id} is not allowed to {action}")]
    Unauthorized { user_id: UserId, action: &'static str },

    #[error("Lesson {lesson_id} is full")]
    LessonFull { lesson_id: LessonId },

    #[error("Student {student_id} already has an active booking for lesson {lesson_id}")]
    DuplicateBooking { student_id: UserId, lesson_id: LessonId },

    #[error("Lesson {lesson_id} overlaps lesson {conflicting_lesson_id} already booked by the student")]
    ScheduleConflict {
        lesson_id: LessonId,
        conflicting_lesson_id: LessonId,
    },

    /// A student may never re-book a lesson they cancelled
    #[error("Student {student_id} previously cancelled lesson {lesson_id}")]
    LessonPreviouslyCancelled { student_id: UserId, lesson_id: LessonId },

    #[error("Template {template_id} is already applied to the week of {week_start}")]
    TemplateAlreadyApplied { template_id: TemplateId, week_start: NaiveDate },

    /// `booking_id` is `None` when no single booking is at fault (a bulk removal found nothing)
    #[error("Booking is not active{}", .booking_id.as_ref().map(|id| format!(": {id}")).unwrap_or_default())]
    BookingNotActive { booking_id: Option<BookingId> },

    /// Destructive operation refused because other rows still reference the entity
    #[error("{entity} {id} still has {dependents}")]
    HasDependents {
        entity: &'static str,
        id: String,
        dependents: String,
    },

    #[error("User {user_id} has {available} credits, {required} required")]
    InsufficientCredits { user_id: UserId, required: i64, available: i64 },

    /// Lost a serialization race against a concurrent transaction. Safe to retry.
    #[error("Concurrent modification, retry the operation")]
    SerializationConflict,

    /// The operation did not finish within its deadline; nothing was committed
    #[error("Operation timed out after {timeout:?}")]
    DeadlineExceeded { timeout: std::time::Duration },

    /// Database operation error
    #[error(transparent)]
    Database(DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Conflict,
    State,
    Resource,
    Concurrency,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput { .. } | Error::InvalidRole { .. } | Error::LessonStarted { .. } => ErrorKind::Validation,
            Error::UserNotFound { .. }
            | Error::LessonNotFound { .. }
            | Error::BookingNotFound { .. }
            | Error::TemplateNotFound { .. }
            | Error::NothingToRollback { .. } => ErrorKind::NotFound,
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::LessonFull { .. }
            | Error::DuplicateBooking { .. }
            | Error::ScheduleConflict { .. }
            | Error::LessonPreviouslyCancelled { .. }
            | Error::TemplateAlreadyApplied { .. } => ErrorKind::Conflict,
            Error::BookingNotActive { .. } | Error::HasDependents { .. } => ErrorKind::State,
            Error::InsufficientCredits { .. } => ErrorKind::Resource,
            Error::SerializationConflict | Error::DeadlineExceeded { .. } => ErrorKind::Concurrency,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => ErrorKind::NotFound,
                DbError::UniqueViolation { .. } => ErrorKind::Conflict,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => ErrorKind::Validation,
                DbError::SerializationFailure { .. } => ErrorKind::Concurrency,
                DbError::Other(_) => ErrorKind::Internal,
            },
            Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SerializationConflict)
    }

    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::SerializationFailure { message } => {
                tracing::warn!("Serialization failure surfaced as conflict: {}", message);
                crate::metrics::record_serialization_conflict();
                Error::SerializationConflict
            }
            other => Error::Database(other),
        }
    }
}

/// Type alias for core operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_serialization_failure_becomes_retryable_conflict() {
        let err: Error = DbError::SerializationFailure {
            message: "could not serialize access due to read/write dependencies".to_string(),
        }
        .into();
        assert!(matches!(err, Error::SerializationConflict));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Concurrency);
    }

    #[test]
    fn test_other_db_errors_are_wrapped() {
        let err: Error = DbError::NotFound.into();
        assert!(matches!(err, Error::Database(DbError::NotFound)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_booking_not_active_message() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            Error::BookingNotActive { booking_id: Some(id) }.to_string(),
            "Booking is not active: 550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(Error::BookingNotActive { booking_id: None }.to_string(), "Booking is not active");
    }

    #[test]
    fn test_kinds() {
        let id = Uuid::new_v4();
        assert_eq!(Error::LessonFull { lesson_id: id }.kind(), ErrorKind::Conflict);
        assert_eq!(
            Error::InsufficientCredits {
                user_id: id,
                required: 2,
                available: 1
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(Error::BookingNotActive { booking_id: None }.kind(), ErrorKind::State);
        assert_eq!(
            Error::NothingToRollback {
                template_id: id,
                week_start: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(Error::invalid("credits_cost", "must be between 1 and 100").kind(), ErrorKind::Validation);
    }
}
