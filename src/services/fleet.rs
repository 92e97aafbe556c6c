//! Fleet service
//!
//! Administrative workstation changes: registration, taking machines offline
//! or into maintenance, bringing them back, and node agent heartbeats.
//!
//! The registry is changed first so a concurrent claim sees the new state
//! immediately; if the durable write then fails, the change is rolled back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::config::FleetEntry;
use crate::db::repositories::ComputerRepository;
use crate::models::{Computer, ComputerStatus, RegisterComputerInput};
use crate::services::broadcaster::Broadcaster;
use crate::services::registry::{Change, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Computer not found: {0}")]
    NotFound(String),

    #[error("Computer {0} is held by a reservation")]
    Busy(String),

    #[error("Computer already registered: {0}")]
    Duplicate(String),

    #[error("Invalid computer: {0}")]
    Invalid(String),

    #[error("Storage unavailable: {0}")]
    Transient(String),
}

impl From<RegistryError> for FleetError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id),
            RegistryError::Held(id, _) | RegistryError::AlreadyClaimed(id) => Self::Busy(id),
            RegistryError::NotHolder(id, _) => Self::Busy(id),
            RegistryError::Duplicate(id) => Self::Duplicate(id),
        }
    }
}

pub struct FleetService {
    registry: Arc<Registry>,
    repo: Arc<dyn ComputerRepository>,
    broadcaster: Arc<Broadcaster>,
    op_timeout: Duration,
}

impl FleetService {
    pub fn new(
        registry: Arc<Registry>,
        repo: Arc<dyn ComputerRepository>,
        broadcaster: Arc<Broadcaster>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            repo,
            broadcaster,
            op_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, FleetError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!("{} failed: {:#}", what, e);
                Err(FleetError::Transient(format!("{}: {}", what, e)))
            }
            Err(_) => {
                tracing::warn!("{} timed out", what);
                Err(FleetError::Transient(format!("{}: operation timed out", what)))
            }
        }
    }

    /// Insert configured workstations that storage does not know yet.
    /// Rows that already exist keep their state. Runs before the registry
    /// is loaded.
    pub async fn seed(&self, entries: &[FleetEntry]) -> anyhow::Result<usize> {
        let mut added = 0;
        for entry in entries {
            let computer = Computer::new(&entry.id, &entry.zone, entry.x, entry.y);
            if self.repo.insert_if_absent(&computer).await? {
                tracing::info!("Seeded computer {} in zone {}", entry.id, entry.zone);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Register a new workstation at runtime
    pub async fn register(&self, input: RegisterComputerInput) -> Result<Computer, FleetError> {
        let id = input.id.trim();
        if id.is_empty() || id.len() > 64 {
            return Err(FleetError::Invalid(
                "id must be between 1 and 64 characters".to_string(),
            ));
        }
        if self.registry.get(id).is_some() {
            return Err(FleetError::Duplicate(id.to_string()));
        }

        // Unknown to the registry, so nobody can claim it while we write.
        let computer = Computer::new(id, input.zone, input.x, input.y);
        let inserted = self
            .bounded("register computer", self.repo.insert_if_absent(&computer))
            .await?;
        if !inserted {
            return Err(FleetError::Duplicate(id.to_string()));
        }

        let registered = self.registry.register(computer)?;
        self.broadcaster.publish_computer(&registered);
        tracing::info!("Registered computer {} in zone {}", registered.id, registered.zone);
        Ok(registered)
    }

    pub fn get(&self, id: &str) -> Result<Computer, FleetError> {
        self.registry
            .get(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Computer> {
        self.registry.list_all()
    }

    pub async fn mark_offline(&self, id: &str) -> Result<Computer, FleetError> {
        let change = self.registry.mark_offline(id)?;
        self.persist(change, ComputerStatus::Offline).await
    }

    pub async fn mark_maintenance(&self, id: &str) -> Result<Computer, FleetError> {
        let change = self.registry.mark_maintenance(id)?;
        self.persist(change, ComputerStatus::Maintenance).await
    }

    pub async fn mark_online(&self, id: &str) -> Result<Computer, FleetError> {
        let change = self.registry.mark_online(id)?;
        self.persist(change, ComputerStatus::Available).await
    }

    async fn persist(&self, change: Change, status: ComputerStatus) -> Result<Computer, FleetError> {
        if !change.changed() {
            return Ok(change.after);
        }

        let id = change.after.id.clone();
        let result = self
            .bounded("update computer status", self.repo.set_status(&id, status))
            .await;

        match result {
            Ok(true) => {
                self.broadcaster.publish_computer(&change.after);
                tracing::info!("Computer {} is now {}", id, status);
                Ok(change.after)
            }
            Ok(false) => {
                self.roll_back(&change);
                tracing::warn!("Computer {} is held in storage, status change refused", id);
                Err(FleetError::Busy(id))
            }
            Err(e) => {
                self.roll_back(&change);
                Err(e)
            }
        }
    }

    fn roll_back(&self, change: &Change) {
        if let Some(restored) = self.registry.restore(change) {
            self.broadcaster.publish_computer(&restored);
        }
    }

    /// Record a node agent heartbeat
    pub async fn heartbeat(&self, id: &str) -> Result<Computer, FleetError> {
        let now = Utc::now();
        let computer = self.registry.heartbeat(id, now)?;
        self.bounded("record heartbeat", self.repo.touch_heartbeat(id, now))
            .await?;
        tracing::debug!("Heartbeat from {}", id);
        Ok(computer)
    }
}
