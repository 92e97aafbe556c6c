//! Settings service
//!
//! Owns the single runtime tunable, the hold timeout. Every read goes to the
//! store so a change made by an administrator is seen by the next booking.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::repositories::{SettingsRepository, SqlxSettingsRepository};

/// Known setting keys
pub mod keys {
    pub const BOOKING_TIMEOUT_MINUTES: &str = "booking_timeout_minutes";
}

pub const MIN_BOOKING_TIMEOUT_MINUTES: i64 = 5;
pub const MAX_BOOKING_TIMEOUT_MINUTES: i64 = 180;
pub const DEFAULT_BOOKING_TIMEOUT_MINUTES: i64 = 15;

/// Settings service errors
#[derive(Debug, Error)]
pub enum SettingsServiceError {
    #[error("booking_timeout_minutes must be between 5 and 180, got {0}")]
    OutOfRange(i64),

    #[error("Failed to load settings: {0}")]
    LoadError(String),

    #[error("Failed to save settings: {0}")]
    SaveError(String),
}

/// Settings service for the booking timeout
pub struct SettingsService {
    repo: Arc<dyn SettingsRepository>,
    op_timeout: Duration,
}

impl SettingsService {
    /// Create a new settings service; each store call is bounded by `op_timeout`
    pub fn new(repo: Arc<dyn SettingsRepository>, op_timeout: Duration) -> Self {
        Self { repo, op_timeout }
    }

    /// Create from SQLx repository
    pub fn from_sqlx(repo: SqlxSettingsRepository, op_timeout: Duration) -> Self {
        Self::new(Arc::new(repo), op_timeout)
    }

    /// Current hold timeout in minutes
    pub async fn booking_timeout_minutes(&self) -> Result<i64, SettingsServiceError> {
        let setting = tokio::time::timeout(
            self.op_timeout,
            self.repo.get(keys::BOOKING_TIMEOUT_MINUTES),
        )
        .await
        .map_err(|_| SettingsServiceError::LoadError("operation timed out".to_string()))?
        .map_err(|e| SettingsServiceError::LoadError(format!("{:#}", e)))?;

        let Some(setting) = setting else {
            return Ok(DEFAULT_BOOKING_TIMEOUT_MINUTES);
        };
        match setting.value.trim().parse::<i64>() {
            Ok(v) if is_in_range(v) => Ok(v),
            _ => {
                tracing::warn!(
                    "Stored {} value {:?} is invalid, using default {}",
                    keys::BOOKING_TIMEOUT_MINUTES,
                    setting.value,
                    DEFAULT_BOOKING_TIMEOUT_MINUTES
                );
                Ok(DEFAULT_BOOKING_TIMEOUT_MINUTES)
            }
        }
    }

    /// Replace the hold timeout. Out-of-range values leave the stored one untouched.
    pub async fn set_booking_timeout_minutes(
        &self,
        minutes: i64,
    ) -> Result<i64, SettingsServiceError> {
        if !is_in_range(minutes) {
            return Err(SettingsServiceError::OutOfRange(minutes));
        }

        tokio::time::timeout(
            self.op_timeout,
            self.repo
                .set(keys::BOOKING_TIMEOUT_MINUTES, &minutes.to_string()),
        )
        .await
        .map_err(|_| SettingsServiceError::SaveError("operation timed out".to_string()))?
        .map_err(|e| SettingsServiceError::SaveError(format!("{:#}", e)))?;

        tracing::info!("Booking timeout set to {} minutes", minutes);
        Ok(minutes)
    }
}

fn is_in_range(minutes: i64) -> bool {
    (MIN_BOOKING_TIMEOUT_MINUTES..=MAX_BOOKING_TIMEOUT_MINUTES).contains(&minutes)
}
