//! Database repositories
//!
//! Repository pattern implementations for database access.
//! Each repository owns the SQL for one table.

pub mod computer;
pub mod reservation;
pub mod settings;

pub use computer::{ComputerRepository, SqlxComputerRepository};
pub use reservation::{ReservationRepository, ReservationTransition, SqlxReservationRepository};
pub use settings::{Setting, SettingsRepository, SqlxSettingsRepository};
