//! Map viewer messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Computer, ComputerStatus};

/// One workstation state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub computer_id: String,
    pub status: ComputerStatus,
    pub reservation_id: Option<Uuid>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<&Computer> for StatusEvent {
    fn from(c: &Computer) -> Self {
        Self {
            computer_id: c.id.clone(),
            status: c.status,
            reservation_id: c.current_reservation,
            version: c.version,
            timestamp: Utc::now(),
        }
    }
}

/// What a subscriber receives, in order: a snapshot, then deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapUpdate {
    Snapshot { computers: Vec<Computer> },
    Status(StatusEvent),
}
