//! Data models
//!
//! Structures shared by the engine, the storage layer and the HTTP surface:
//! - Workstations and their occupancy state
//! - Reservations and their lifecycle
//! - Status events fanned out to map viewers

mod computer;
mod event;
mod reservation;

pub use computer::{Computer, ComputerStatus, ComputerSummary, RegisterComputerInput};
pub use event::{MapUpdate, StatusEvent};
pub use reservation::{
    Actor, ActorInput, CreateBookingInput, Reservation, ReservationStatus,
};
