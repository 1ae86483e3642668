//! Database record models matching table schemas.
//!
//! These structs correspond directly to table rows and derive `sqlx::FromRow`.
//! Request types (`*CreateDBRequest`) carry everything an insert needs, including
//! timestamps taken from the injected clock rather than `now()` in SQL, so the
//! in-memory and PostgreSQL stores agree on time.
//!
//! - [`users`]: accounts and roles
//! - [`credits`]: balances and the append-only ledger
//! - [`lessons`]: concrete lesson instances
//! - [`bookings`]: lesson ↔ student bindings
//! - [`templates`]: weekly templates, their rows, and applications
//! - [`modifications`]: bulk-edit audit records

pub mod bookings;
pub mod credits;
pub mod lessons;
pub mod modifications;
pub mod templates;
pub mod users;
