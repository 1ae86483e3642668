//! # tutorctl: scheduling and credit core for a tutoring marketplace
//!
//! `tutorctl` owns every state change that touches lessons, bookings and student credits.
//! Teachers run lessons with a fixed number of seats and a price in credits; students hold a
//! prepaid credit balance and book seats. Around that sit weekly templates that create a
//! whole week of lessons and bookings at once, rollback of such a week, and bulk edits that
//! change every upcoming lesson of a weekly slot.
//!
//! ## Architecture
//!
//! Callers go through [`Scheduler`], which hands out one engine per concern:
//!
//! - [`ledger`]: balances and the append-only credit log
//! - [`booking`]: booking and cancelling a single seat
//! - [`lessons`]: creating, listing and deleting lessons
//! - [`templates`]: authoring templates and applying them to a week, with dry runs
//! - [`rollback`]: undoing a template application
//! - [`bulk_edit`]: add a student, remove a student or change the teacher across a pattern
//!
//! Each operation runs inside exactly one unit of work from a [`store::Store`] and either
//! commits everything or nothing. [`store::PgStore`] maps a unit of work onto a PostgreSQL
//! transaction with row locks; [`store::InMemoryStore`] runs units of work one at a time and
//! backs the test suite. Time comes from an injected [`clock::Clock`].
//!
//! Failures are typed ([`errors::Error`]); callers match on the variant or on
//! [`errors::Error::kind`]. There is no HTTP layer here.
//!
//! ## Database Setup
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! tutorctl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod booking;
pub mod bulk_edit;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod ledger;
pub mod lessons;
pub mod metrics;
pub mod rollback;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod templates;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use errors::{Error, ErrorKind, Result};
pub use scheduler::Scheduler;
pub use types::{Actor, ApplicationId, BookingId, LessonId, Role, TemplateId, UserId};

/// Get the tutorctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
