//! Services layer
//!
//! The reservation engine proper:
//! - `settings`: the runtime-tunable hold timeout
//! - `registry`: in-memory workstation occupancy
//! - `ledger`: reservation lifecycle and orchestration
//! - `scheduler`: hold deadlines
//! - `broadcaster`: live map fan-out
//! - `fleet`: administrative workstation changes

pub mod broadcaster;
pub mod fleet;
pub mod ledger;
pub mod registry;
pub mod scheduler;
pub mod settings;

pub use broadcaster::{Broadcaster, Subscription};
pub use fleet::{FleetError, FleetService};
pub use ledger::{Ledger, LedgerError, ReconcileReport};
pub use registry::{Registry, RegistryError};
pub use scheduler::{CancelOutcome, Scheduler, TimerHandle};
pub use settings::{SettingsService, SettingsServiceError};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BookingConfig;
use crate::db::repositories::{
    SqlxComputerRepository, SqlxReservationRepository, SqlxSettingsRepository,
};
use crate::db::DynDatabasePool;

/// Every engine component, wired together over one database pool
pub struct Engine {
    pub settings: Arc<SettingsService>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub broadcaster: Arc<Broadcaster>,
    pub ledger: Arc<Ledger>,
    pub fleet: Arc<FleetService>,
    fired: Option<mpsc::UnboundedReceiver<TimerHandle>>,
}

impl Engine {
    pub fn new(pool: DynDatabasePool, config: &BookingConfig) -> Self {
        let computers = SqlxComputerRepository::boxed(pool.clone());
        let reservations = SqlxReservationRepository::boxed(pool.clone());

        let settings = Arc::new(SettingsService::new(
            SqlxSettingsRepository::boxed(pool),
            config.operation_timeout(),
        ));
        let registry = Arc::new(Registry::new());
        let (scheduler, fired) = Scheduler::new();
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), config.broadcast_buffer));
        let fleet = Arc::new(FleetService::new(
            registry.clone(),
            computers.clone(),
            broadcaster.clone(),
            config.operation_timeout(),
        ));
        let ledger = Arc::new(Ledger::new(
            settings.clone(),
            registry.clone(),
            computers,
            reservations,
            scheduler.clone(),
            broadcaster.clone(),
            config,
        ));

        Self {
            settings,
            registry,
            scheduler,
            broadcaster,
            ledger,
            fleet,
            fired: Some(fired),
        }
    }

    /// Start the scheduler driver and the expiry worker. Both stop when
    /// `shutdown` is cancelled. Calling this a second time starts nothing.
    pub fn spawn(&mut self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(fired) = self.fired.take() else {
            tracing::warn!("Engine tasks already running");
            return Vec::new();
        };
        vec![
            tokio::spawn(self.scheduler.clone().run(shutdown.clone())),
            tokio::spawn(
                self.ledger
                    .clone()
                    .run_expiry_worker(fired, shutdown.clone()),
            ),
        ]
    }
}
