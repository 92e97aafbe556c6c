//! Reservation model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reservation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Completed)
    }

    /// Pending -> {Confirmed, Expired, Cancelled}; Confirmed -> {Completed, Cancelled}
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
        )
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(anyhow::anyhow!("Invalid reservation status: {}", s)),
        }
    }
}

/// A hold or session on one workstation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub computer_id: String,
    pub user_id: String,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// New pending hold whose deadline is fixed from the timeout in effect now
    pub fn pending(
        computer_id: impl Into<String>,
        user_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            computer_id: computer_id.into(),
            user_id: user_id.into(),
            status: ReservationStatus::Pending,
            created_at: now,
            expires_at: now + timeout,
            confirmed_at: None,
            closed_at: None,
        }
    }
}

/// Who is acting on a reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User(String),
    Admin,
}

impl Actor {
    pub fn may_act_on(&self, reservation: &Reservation) -> bool {
        match self {
            Self::Admin => true,
            Self::User(user_id) => *user_id == reservation.user_id,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Admin => f.write_str("admin"),
        }
    }
}

/// Body of `POST /bookings`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingInput {
    pub computer_id: String,
    pub user_id: String,
}

/// Body of the confirm and cancel endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ActorInput {
    pub user_id: String,
}
