//! Workstation model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Occupancy state of a workstation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComputerStatus {
    #[default]
    Available,
    Reserved,
    InUse,
    Offline,
    Maintenance,
}

impl ComputerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::InUse => "in_use",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }

    /// Reserved and InUse are the states that require a backing reservation
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Reserved | Self::InUse)
    }
}

impl std::fmt::Display for ComputerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComputerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "reserved" => Ok(Self::Reserved),
            "in_use" => Ok(Self::InUse),
            "offline" => Ok(Self::Offline),
            "maintenance" => Ok(Self::Maintenance),
            _ => Err(anyhow::anyhow!("Invalid computer status: {}", s)),
        }
    }
}

/// A physical workstation on the hall map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computer {
    pub id: String,
    pub zone: String,
    pub x: i32,
    pub y: i32,
    pub status: ComputerStatus,
    pub current_reservation: Option<Uuid>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Bumped on every in-memory change; orders events per computer
    pub version: u64,
}

impl Computer {
    pub fn new(id: impl Into<String>, zone: impl Into<String>, x: i32, y: i32) -> Self {
        Self {
            id: id.into(),
            zone: zone.into(),
            x,
            y,
            status: ComputerStatus::Available,
            current_reservation: None,
            last_heartbeat: None,
            version: 0,
        }
    }
}

/// Compact listing row for `GET /computers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputerSummary {
    pub id: String,
    pub zone: String,
    pub x: i32,
    pub y: i32,
    pub status: ComputerStatus,
}

impl From<&Computer> for ComputerSummary {
    fn from(c: &Computer) -> Self {
        Self {
            id: c.id.clone(),
            zone: c.zone.clone(),
            x: c.x,
            y: c.y,
            status: c.status,
        }
    }
}

/// Input for registering a workstation
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterComputerInput {
    pub id: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}
