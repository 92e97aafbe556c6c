//! Computer registry
//!
//! The in-memory authority on workstation occupancy. Each computer sits behind
//! its own mutex; the outer map lock is only held long enough to look the
//! entry up. No lock here is ever held across an await point.
//!
//! Every change bumps the computer's `version`, which the broadcaster uses to
//! order and de-duplicate events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Computer, ComputerStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Computer not found: {0}")]
    NotFound(String),

    #[error("Computer {0} is not available")]
    AlreadyClaimed(String),

    #[error("Computer {0} is held by reservation {1}")]
    Held(String, Uuid),

    #[error("Computer {0} is not held by reservation {1}")]
    NotHolder(String, Uuid),

    #[error("Computer already registered: {0}")]
    Duplicate(String),
}

/// Before/after pair of one administrative change
#[derive(Debug, Clone)]
pub struct Change {
    pub before: Computer,
    pub after: Computer,
}

impl Change {
    pub fn changed(&self) -> bool {
        self.before.version != self.after.version
    }
}

#[derive(Default)]
pub struct Registry {
    computers: RwLock<HashMap<String, Arc<Mutex<Computer>>>>,
}

fn lock(entry: &Mutex<Computer>) -> MutexGuard<'_, Computer> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table, e.g. with the rows loaded at startup
    pub fn load(&self, computers: Vec<Computer>) {
        let map = computers
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(Mutex::new(c))))
            .collect();
        *self.computers.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    /// Add a workstation that is not yet known
    pub fn register(&self, mut computer: Computer) -> Result<Computer, RegistryError> {
        let mut map = self.computers.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&computer.id) {
            return Err(RegistryError::Duplicate(computer.id));
        }
        computer.version += 1;
        map.insert(computer.id.clone(), Arc::new(Mutex::new(computer.clone())));
        Ok(computer)
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<Computer>>, RegistryError> {
        self.computers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Computer> {
        self.entry(id).ok().map(|e| lock(&e).clone())
    }

    /// Snapshot of every workstation ordered by id
    pub fn list_all(&self) -> Vec<Computer> {
        let entries: Vec<_> = self
            .computers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut computers: Vec<Computer> = entries.iter().map(|e| lock(e).clone()).collect();
        computers.sort_by(|a, b| a.id.cmp(&b.id));
        computers
    }

    pub fn len(&self) -> usize {
        self.computers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Available -> Reserved for `reservation_id`, as one step. Any other
    /// status fails and leaves the computer untouched.
    pub fn try_claim(&self, id: &str, reservation_id: Uuid) -> Result<Computer, RegistryError> {
        let entry = self.entry(id)?;
        let mut c = lock(&entry);
        if c.status != ComputerStatus::Available || c.current_reservation.is_some() {
            return Err(RegistryError::AlreadyClaimed(id.to_string()));
        }
        c.status = ComputerStatus::Reserved;
        c.current_reservation = Some(reservation_id);
        c.version += 1;
        Ok(c.clone())
    }

    /// Free the computer if `reservation_id` still holds it.
    /// Returns the new state, or `None` when there was nothing to release.
    pub fn release(&self, id: &str, reservation_id: Uuid) -> Result<Option<Computer>, RegistryError> {
        let entry = self.entry(id)?;
        let mut c = lock(&entry);
        if c.current_reservation != Some(reservation_id) {
            return Ok(None);
        }
        c.status = ComputerStatus::Available;
        c.current_reservation = None;
        c.version += 1;
        Ok(Some(c.clone()))
    }

    pub fn mark_in_use(&self, id: &str, reservation_id: Uuid) -> Result<Computer, RegistryError> {
        let entry = self.entry(id)?;
        let mut c = lock(&entry);
        if c.current_reservation != Some(reservation_id) {
            return Err(RegistryError::NotHolder(id.to_string(), reservation_id));
        }
        if c.status != ComputerStatus::InUse {
            c.status = ComputerStatus::InUse;
            c.version += 1;
        }
        Ok(c.clone())
    }

    pub fn mark_offline(&self, id: &str) -> Result<Change, RegistryError> {
        self.set_admin_status(id, ComputerStatus::Offline)
    }

    pub fn mark_maintenance(&self, id: &str) -> Result<Change, RegistryError> {
        self.set_admin_status(id, ComputerStatus::Maintenance)
    }

    pub fn mark_online(&self, id: &str) -> Result<Change, RegistryError> {
        self.set_admin_status(id, ComputerStatus::Available)
    }

    fn set_admin_status(&self, id: &str, status: ComputerStatus) -> Result<Change, RegistryError> {
        let entry = self.entry(id)?;
        let mut c = lock(&entry);
        if let Some(reservation_id) = c.current_reservation {
            return Err(RegistryError::Held(id.to_string(), reservation_id));
        }
        let before = c.clone();
        if c.status != status {
            c.status = status;
            c.version += 1;
        }
        Ok(Change {
            before,
            after: c.clone(),
        })
    }

    /// Record a node agent heartbeat. Not a status change, so no version bump.
    pub fn heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Computer, RegistryError> {
        let entry = self.entry(id)?;
        let mut c = lock(&entry);
        c.last_heartbeat = Some(at);
        Ok(c.clone())
    }

    /// Undo `change` if nothing else touched the computer since.
    /// The revert is itself a new version.
    pub fn restore(&self, change: &Change) -> Option<Computer> {
        let entry = self.entry(&change.after.id).ok()?;
        let mut c = lock(&entry);
        if c.version != change.after.version {
            return None;
        }
        c.status = change.before.status;
        c.current_reservation = change.before.current_reservation;
        c.version += 1;
        Some(c.clone())
    }
}
