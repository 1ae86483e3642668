//! Database models for the credit ledger.

use crate::types::{ApplicationId, BookingId, CreditTransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ledger operation stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditOperation {
    Deduct,
    Refund,
    /// Administrative top-up
    Grant,
}

/// Why a ledger entry was written. Rendered into the `reason` column and mirrored
/// into the structured reference columns so refunds can be traced to their deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditReason {
    Booking { booking_id: BookingId },
    Cancellation { booking_id: BookingId },
    TemplateBooking { application_id: ApplicationId, booking_id: BookingId },
    TemplateRollback { application_id: ApplicationId, booking_id: BookingId },
    Grant { note: String },
}

impl CreditReason {
    pub fn booking_id(&self) -> Option<BookingId> {
        match self {
            CreditReason::Booking { booking_id }
            | CreditReason::Cancellation { booking_id }
            | CreditReason::TemplateBooking { booking_id, .. }
            | CreditReason::TemplateRollback { booking_id, .. } => Some(*booking_id),
            CreditReason::Grant { .. } => None,
        }
    }

    pub fn application_id(&self) -> Option<ApplicationId> {
        match self {
            CreditReason::TemplateBooking { application_id, .. } | CreditReason::TemplateRollback { application_id, .. } => {
                Some(*application_id)
            }
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CreditReason::Booking { booking_id } => format!("booking {booking_id}"),
            CreditReason::Cancellation { booking_id } => format!("cancellation of booking {booking_id}"),
            CreditReason::TemplateBooking {
                application_id,
                booking_id,
            } => format!("template application {application_id}, booking {booking_id}"),
            CreditReason::TemplateRollback {
                application_id,
                booking_id,
            } => format!("rollback of template application {application_id}, booking {booking_id}"),
            CreditReason::Grant { note } => format!("grant: {note}"),
        }
    }
}

/// Database request for appending a ledger entry
#[derive(Debug, Clone)]
pub struct CreditTransactionCreateDBRequest {
    pub user_id: UserId,
    pub operation: CreditOperation,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub booking_id: Option<BookingId>,
    pub template_application_id: Option<ApplicationId>,
    pub performed_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

/// Database response for a ledger entry
#[derive(Debug, Clone, FromRow)]
pub struct CreditTransactionDBResponse {
    pub id: CreditTransactionId,
    pub user_id: UserId,
    pub operation: CreditOperation,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub booking_id: Option<BookingId>,
    pub template_application_id: Option<ApplicationId>,
    pub performed_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}
