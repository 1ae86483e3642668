//! PostgreSQL repositories.
//!
//! Each repository borrows a connection (usually the connection of an open
//! transaction) for as long as it lives: `Lessons::new(&mut tx).lock(id)`.
//! Repositories never begin or commit transactions themselves.
//!
//! Methods named `lock*` issue `SELECT ... FOR UPDATE`.

pub mod bookings;
pub mod credits;
pub mod lessons;
pub mod modifications;
pub mod templates;
pub mod users;

pub use bookings::Bookings;
pub use credits::Credits;
pub use lessons::Lessons;
pub use modifications::Modifications;
pub use templates::{Applications, Templates};
pub use users::Users;
