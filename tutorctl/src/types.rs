//! Common type definitions shared by every engine.
//!
//! This module defines:
//! - Type aliases for entity IDs (UserId, LessonId, etc.)
//! - The [`Role`] enum used for role checks
//! - [`Actor`], the identity an operation runs as
//! - [`IsolationLevel`] for units of work
//!
//! # ID Types
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`UserId`]: student, teacher, methodologist or admin account
//! - [`LessonId`]: concrete lesson instance
//! - [`BookingId`]: lesson ↔ student binding
//! - [`TemplateId`] / [`TemplateEntryId`]: weekly lesson template and its rows
//! - [`ApplicationId`]: one instantiation of a template for one week
//! - [`ModificationId`]: bulk-edit audit record
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type LessonId = Uuid;
pub type BookingId = Uuid;
pub type TemplateId = Uuid;
pub type TemplateEntryId = Uuid;
pub type ApplicationId = Uuid;
pub type ModificationId = Uuid;
pub type CreditTransactionId = Uuid;
pub type RecurringGroupId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Role of a user account. Stored as TEXT in the database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Methodologist,
    Admin,
}

impl Role {
    pub fn is_student(self) -> bool {
        self == Role::Student
    }

    pub fn is_teacher(self) -> bool {
        self == Role::Teacher
    }

    pub fn is_methodologist(self) -> bool {
        self == Role::Methodologist
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    /// Roles allowed to apply templates, roll weeks back and bulk-edit lessons.
    pub fn can_manage_schedule(self) -> bool {
        self.is_admin() || self.is_methodologist()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Student => write!(f, "student"),
            Role::Teacher => write!(f, "teacher"),
            Role::Methodologist => write!(f, "methodologist"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Who is performing an operation.
///
/// `is_admin` comes from the caller's authentication layer and is trusted as given.
/// Operations that need a finer role check (methodologist, teacher) look the user up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self { user_id, is_admin: false }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self { user_id, is_admin: true }
    }
}

/// Isolation level requested when a unit of work begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Row locks (`SELECT ... FOR UPDATE`) provide the serialization.
    ReadCommitted,
    /// Required for template application: concurrent appliers must not both commit.
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev_uuid() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_uuid(&id), "550e8400");
    }

    #[test]
    fn test_schedule_management_roles() {
        assert!(Role::Admin.can_manage_schedule());
        assert!(Role::Methodologist.can_manage_schedule());
        assert!(!Role::Teacher.can_manage_schedule());
        assert!(!Role::Student.can_manage_schedule());
        assert!(Role::Admin.is_admin() && !Role::Methodologist.is_admin());
        assert!(Role::Methodologist.is_methodologist() && !Role::Teacher.is_methodologist());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Methodologist).unwrap(), "\"methodologist\"");
        let role: Role = serde_json::from_str("\"student\"").unwrap();
        assert!(role.is_student());
    }
}
