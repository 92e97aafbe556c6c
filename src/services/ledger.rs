//! Reservation ledger
//!
//! Orchestrates every hold: claim in the registry, persist, arm the timer,
//! publish. Status changes are applied to the database first through a guarded
//! update (`WHERE status IN (...)`); the registry, the timer and the viewers
//! follow only once that commit has landed.
//!
//! Storage calls are bounded by the configured operation timeout. A call that
//! fails or times out surfaces as [`LedgerError::Transient`] with the
//! in-memory state unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BookingConfig;
use crate::db::repositories::{ComputerRepository, ReservationRepository, ReservationTransition};
use crate::models::{Actor, Computer, ComputerStatus, Reservation, ReservationStatus};
use crate::services::broadcaster::Broadcaster;
use crate::services::registry::{Registry, RegistryError};
use crate::services::scheduler::{Scheduler, TimerHandle};
use crate::services::settings::SettingsService;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Computer {0} is not available")]
    ResourceUnavailable(String),

    #[error("Reservation {id} is {status}, cannot {action}")]
    InvalidState {
        id: Uuid,
        status: ReservationStatus,
        action: &'static str,
    },

    #[error("Reservation {0} belongs to another user")]
    NotOwner(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Transient(String),

    #[error("Integrity check failed: {}", .0.join("; "))]
    Integrity(Vec<String>),
}

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Pending holds whose timers were armed again
    pub rearmed: usize,
    /// Pending holds already past their deadline, expired on the spot
    pub expired: usize,
    /// Confirmed sessions found running
    pub in_use: usize,
}

pub struct Ledger {
    settings: Arc<SettingsService>,
    registry: Arc<Registry>,
    computers: Arc<dyn ComputerRepository>,
    reservations: Arc<dyn ReservationRepository>,
    scheduler: Arc<Scheduler>,
    broadcaster: Arc<Broadcaster>,
    timers: Mutex<HashMap<Uuid, TimerHandle>>,
    op_timeout: Duration,
    expiry_retry: Duration,
    history_limit: i64,
}

impl Ledger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<SettingsService>,
        registry: Arc<Registry>,
        computers: Arc<dyn ComputerRepository>,
        reservations: Arc<dyn ReservationRepository>,
        scheduler: Arc<Scheduler>,
        broadcaster: Arc<Broadcaster>,
        config: &BookingConfig,
    ) -> Self {
        Self {
            settings,
            registry,
            computers,
            reservations,
            scheduler,
            broadcaster,
            timers: Mutex::new(HashMap::new()),
            op_timeout: config.operation_timeout(),
            expiry_retry: config.expiry_retry(),
            history_limit: config.history_limit,
        }
    }

    /// Run a storage call under the operation timeout
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!("{} failed: {:#}", what, e);
                Err(LedgerError::Transient(format!("{}: {}", what, e)))
            }
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", what, self.op_timeout);
                Err(LedgerError::Transient(format!("{}: operation timed out", what)))
            }
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<Uuid, TimerHandle>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, reservation: &Reservation) {
        let handle = self.scheduler.arm(reservation.id, reservation.expires_at);
        self.timers().insert(reservation.id, handle);
    }

    fn disarm(&self, reservation_id: Uuid) {
        let handle = self.timers().remove(&reservation_id);
        if let Some(handle) = handle {
            self.scheduler.cancel(&handle);
        }
    }

    /// Number of holds with a live timer
    pub fn armed_timers(&self) -> usize {
        self.scheduler.armed()
    }

    /// Place a pending hold on an available computer
    pub async fn create(&self, computer_id: &str, user_id: &str) -> Result<Reservation, LedgerError> {
        let minutes = self
            .settings
            .booking_timeout_minutes()
            .await
            .map_err(|e| LedgerError::Transient(e.to_string()))?;
        let reservation =
            Reservation::pending(computer_id, user_id, chrono::Duration::minutes(minutes));

        let claimed = match self.registry.try_claim(computer_id, reservation.id) {
            Ok(computer) => computer,
            Err(RegistryError::NotFound(_)) => {
                return Err(LedgerError::NotFound(format!("computer {}", computer_id)))
            }
            Err(_) => {
                tracing::debug!("Claim on {} lost by user {}", computer_id, user_id);
                return Err(LedgerError::ResourceUnavailable(computer_id.to_string()));
            }
        };

        let persisted = self
            .bounded(
                "persist reservation",
                self.reservations.insert_with_claim(&reservation),
            )
            .await;

        // Viewers may already have seen the claim, so the undo is published too.
        let undo_claim = || match self.registry.release(computer_id, reservation.id) {
            Ok(Some(released)) => self.broadcaster.publish_computer(&released),
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to undo claim on {}: {}", computer_id, e),
        };

        match persisted {
            Ok(true) => {}
            Ok(false) => {
                undo_claim();
                tracing::warn!(
                    "Computer {} was free in memory but held in storage",
                    computer_id
                );
                return Err(LedgerError::ResourceUnavailable(computer_id.to_string()));
            }
            Err(e) => {
                // The commit may still have landed; ask storage before giving up.
                let landed = self
                    .bounded("verify reservation", self.reservations.get(reservation.id))
                    .await;
                match landed {
                    Ok(Some(_)) => {
                        tracing::warn!(
                            "Reservation {} was stored despite the error: {}",
                            reservation.id,
                            e
                        );
                    }
                    Ok(None) => {
                        undo_claim();
                        return Err(e);
                    }
                    Err(_) => {
                        undo_claim();
                        // Still unknown: an armed timer expires the hold if it
                        // did land and is a no-op otherwise.
                        self.arm(&reservation);
                        return Err(e);
                    }
                }
            }
        }

        self.arm(&reservation);
        self.broadcaster.publish_computer(&claimed);

        tracing::info!(
            "Reservation {} created on {} for user {}, expires at {}",
            reservation.id,
            computer_id,
            user_id,
            reservation.expires_at
        );
        Ok(reservation)
    }

    pub async fn get(&self, reservation_id: Uuid) -> Result<Reservation, LedgerError> {
        self.find(reservation_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("reservation {}", reservation_id)))
    }

    /// Pending -> Confirmed, by the owning user only
    pub async fn confirm(&self, reservation_id: Uuid, user_id: &str) -> Result<Reservation, LedgerError> {
        let current = self.get(reservation_id).await?;
        if !Actor::User(user_id.to_string()).may_act_on(&current) {
            return Err(LedgerError::NotOwner(reservation_id));
        }
        self.transition(current, ReservationStatus::Confirmed, "confirm")
            .await
    }

    /// Pending/Confirmed -> Cancelled. Cancelling twice is a success.
    pub async fn cancel(&self, reservation_id: Uuid, actor: &Actor) -> Result<Reservation, LedgerError> {
        let current = self.get(reservation_id).await?;
        if !actor.may_act_on(&current) {
            return Err(LedgerError::NotOwner(reservation_id));
        }
        if current.status == ReservationStatus::Cancelled {
            return Ok(current);
        }
        tracing::debug!("Reservation {} cancel requested by {}", reservation_id, actor);
        let result = self
            .transition(current, ReservationStatus::Cancelled, "cancel")
            .await;
        match result {
            Err(LedgerError::InvalidState {
                status: ReservationStatus::Cancelled,
                ..
            }) => self.get(reservation_id).await,
            other => other,
        }
    }

    /// Confirmed -> Completed at session end
    pub async fn complete(&self, reservation_id: Uuid) -> Result<Reservation, LedgerError> {
        let current = self.get(reservation_id).await?;
        self.transition(current, ReservationStatus::Completed, "complete")
            .await
    }

    /// Pending -> Expired. Anything else is a silent no-op (`Ok(None)`).
    pub async fn expire(&self, reservation_id: Uuid) -> Result<Option<Reservation>, LedgerError> {
        let current = match self.find(reservation_id).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        if current.status != ReservationStatus::Pending {
            return Ok(None);
        }
        match self
            .transition(current, ReservationStatus::Expired, "expire")
            .await
        {
            Ok(r) => Ok(Some(r)),
            Err(LedgerError::InvalidState { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find(&self, reservation_id: Uuid) -> Result<Option<Reservation>, LedgerError> {
        self.bounded("load reservation", self.reservations.get(reservation_id))
            .await
    }

    /// Guarded transition from the observed status to `to`
    async fn transition(
        &self,
        current: Reservation,
        to: ReservationStatus,
        action: &'static str,
    ) -> Result<Reservation, LedgerError> {
        if !current.status.can_transition_to(to) {
            return Err(LedgerError::InvalidState {
                id: current.id,
                status: current.status,
                action,
            });
        }

        let change = ReservationTransition::new(&current, &[current.status], to);
        let applied = self
            .bounded("update reservation", self.reservations.transition(&change))
            .await?;

        if !applied {
            // Someone else moved it first; report what it is now.
            let fresh = self.get(current.id).await?;
            tracing::debug!(
                "Reservation {} changed underneath {} (now {})",
                fresh.id,
                action,
                fresh.status
            );
            self.sync_registry(&fresh);
            return Err(LedgerError::InvalidState {
                id: fresh.id,
                status: fresh.status,
                action,
            });
        }

        let mut updated = current;
        updated.status = to;
        if to == ReservationStatus::Confirmed {
            updated.confirmed_at = Some(change.at);
        }
        if to.is_terminal() {
            updated.closed_at = Some(change.at);
        }

        self.disarm(updated.id);
        self.sync_registry(&updated);

        tracing::info!(
            "Reservation {} on {} is now {}",
            updated.id,
            updated.computer_id,
            updated.status
        );
        Ok(updated)
    }

    /// Bring the registry in line with a committed reservation and publish
    fn sync_registry(&self, reservation: &Reservation) {
        let result = match reservation.status {
            ReservationStatus::Confirmed => self
                .registry
                .mark_in_use(&reservation.computer_id, reservation.id)
                .map(Some),
            status if status.is_terminal() => self
                .registry
                .release(&reservation.computer_id, reservation.id),
            _ => Ok(None),
        };
        match result {
            Ok(Some(computer)) => self.broadcaster.publish_computer(&computer),
            Ok(None) => {}
            Err(e) => tracing::error!(
                "Registry out of step with reservation {}: {}",
                reservation.id,
                e
            ),
        }
    }

    pub async fn history_for_computer(&self, computer_id: &str) -> Result<Vec<Reservation>, LedgerError> {
        if self.registry.get(computer_id).is_none() {
            return Err(LedgerError::NotFound(format!("computer {}", computer_id)));
        }
        self.bounded(
            "list reservations",
            self.reservations
                .list_by_computer(computer_id, self.history_limit),
        )
        .await
    }

    pub async fn history_for_user(&self, user_id: &str) -> Result<Vec<Reservation>, LedgerError> {
        self.bounded(
            "list reservations",
            self.reservations.list_by_user(user_id, self.history_limit),
        )
        .await
    }

    /// Load the registry from storage, verify it against the open
    /// reservations, then expire overdue holds and re-arm the rest.
    /// Any inconsistency aborts with [`LedgerError::Integrity`]; nothing is
    /// repaired automatically.
    pub async fn recover(&self) -> Result<ReconcileReport, LedgerError> {
        let computers = self.bounded("load computers", self.computers.list()).await?;
        let open = self
            .bounded(
                "load open reservations",
                self.reservations.list_by_status(&[
                    ReservationStatus::Pending,
                    ReservationStatus::Confirmed,
                ]),
            )
            .await?;

        let violations = check_integrity(&computers, &open);
        if !violations.is_empty() {
            for violation in &violations {
                tracing::error!("Integrity violation: {}", violation);
            }
            return Err(LedgerError::Integrity(violations));
        }

        self.registry.load(computers);

        let now = chrono::Utc::now();
        let mut report = ReconcileReport::default();
        for reservation in open {
            match reservation.status {
                ReservationStatus::Pending if reservation.expires_at <= now => {
                    if self.expire(reservation.id).await?.is_some() {
                        report.expired += 1;
                    }
                }
                ReservationStatus::Pending => {
                    self.arm(&reservation);
                    report.rearmed += 1;
                }
                _ => report.in_use += 1,
            }
        }

        tracing::info!(
            "Reconciled {} computers: {} holds re-armed, {} expired, {} sessions running",
            self.registry.len(),
            report.rearmed,
            report.expired,
            report.in_use
        );
        Ok(report)
    }

    /// Consume scheduler firings until shutdown. Each expiry runs on its own
    /// task; one that fails on storage is re-armed after the retry delay.
    pub async fn run_expiry_worker(
        self: Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<TimerHandle>,
        shutdown: CancellationToken,
    ) {
        tracing::info!("Expiry worker started");
        loop {
            let handle = tokio::select! {
                handle = fired.recv() => match handle {
                    Some(handle) => handle,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            {
                let mut timers = self.timers();
                if timers.get(&handle.reservation_id) == Some(&handle) {
                    timers.remove(&handle.reservation_id);
                }
            }

            let ledger = self.clone();
            tokio::spawn(async move {
                let reservation_id = handle.reservation_id;
                match ledger.expire(reservation_id).await {
                    Ok(Some(_)) | Ok(None) => {}
                    Err(LedgerError::Transient(e)) => {
                        tracing::warn!(
                            "Expiry of {} failed ({}), retrying in {:?}",
                            reservation_id,
                            e,
                            ledger.expiry_retry
                        );
                        let handle = ledger
                            .scheduler
                            .arm_after(reservation_id, ledger.expiry_retry);
                        ledger.timers().insert(reservation_id, handle);
                    }
                    Err(e) => tracing::error!("Expiry of {} failed: {}", reservation_id, e),
                }
            });
        }
        tracing::info!("Expiry worker stopped");
    }
}

/// Cross-check workstation rows against open reservations
pub fn check_integrity(computers: &[Computer], open: &[Reservation]) -> Vec<String> {
    let mut violations = Vec::new();
    let by_id: HashMap<Uuid, &Reservation> = open.iter().map(|r| (r.id, r)).collect();
    let computer_ids: HashMap<&str, &Computer> =
        computers.iter().map(|c| (c.id.as_str(), c)).collect();

    for c in computers {
        match (c.status, c.current_reservation) {
            (status, Some(rid)) if status.is_held() => match by_id.get(&rid) {
                None => violations.push(format!(
                    "computer {} is {} for reservation {} which is not open",
                    c.id, status, rid
                )),
                Some(r) => {
                    let expected = match r.status {
                        ReservationStatus::Pending => ComputerStatus::Reserved,
                        _ => ComputerStatus::InUse,
                    };
                    if r.computer_id != c.id {
                        violations.push(format!(
                            "computer {} points at reservation {} which belongs to {}",
                            c.id, rid, r.computer_id
                        ));
                    } else if status != expected {
                        violations.push(format!(
                            "computer {} is {} but reservation {} is {}",
                            c.id, status, rid, r.status
                        ));
                    }
                }
            },
            (status, None) if status.is_held() => violations.push(format!(
                "computer {} is {} without a reservation",
                c.id, status
            )),
            (status, Some(rid)) => violations.push(format!(
                "computer {} is {} but still references reservation {}",
                c.id, status, rid
            )),
            _ => {}
        }
    }

    for r in open {
        match computer_ids.get(r.computer_id.as_str()) {
            None => violations.push(format!(
                "reservation {} references unknown computer {}",
                r.id, r.computer_id
            )),
            Some(c) if c.current_reservation != Some(r.id) => violations.push(format!(
                "reservation {} is {} but computer {} does not reference it",
                r.id, r.status, r.computer_id
            )),
            _ => {}
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::{
        ReservationRepository, SqlxComputerRepository, SqlxReservationRepository,
        SqlxSettingsRepository,
    };
    use crate::models::MapUpdate;
    use async_trait::async_trait;
    use crate::services::testing::{eventually, running_engine, seeded_pool, start};
    use proptest::prelude::*;

    fn status_of(registry: &Registry, id: &str) -> ComputerStatus {
        registry.get(id).map(|c| c.status).unwrap_or(ComputerStatus::Offline)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_concurrent_creates_one_wins() {
        let h = running_engine(&["C1"]).await;
        let ledger = h.engine.ledger.clone();

        let a = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.create("C1", "u1").await }
        });
        let b = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.create("C1", "u2").await }
        });
        let results = vec![a.await.unwrap(), b.await.unwrap()];

        let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let lost = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::ResourceUnavailable(_))))
            .count();
        assert_eq!(won.len(), 1);
        assert_eq!(lost, 1);

        let c1 = h.engine.registry.get("C1").unwrap();
        assert_eq!(c1.status, ComputerStatus::Reserved);
        assert_eq!(c1.current_reservation, Some(won[0].id));
    }

    #[tokio::test]
    async fn test_create_unknown_computer() {
        let h = running_engine(&["C1"]).await;
        assert!(matches!(
            h.engine.ledger.create("C9", "u1").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_on_offline_computer_is_unavailable() {
        let h = running_engine(&["C1"]).await;
        h.engine.fleet.mark_offline("C1").await.unwrap();
        assert!(matches!(
            h.engine.ledger.create("C1", "u1").await,
            Err(LedgerError::ResourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_create_sets_deadline_and_arms_timer() {
        let h = running_engine(&["C1"]).await;
        let r = h.engine.ledger.create("C1", "u1").await.unwrap();

        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.expires_at - r.created_at, chrono::Duration::minutes(15));
        assert_eq!(h.engine.ledger.armed_timers(), 1);
        assert_eq!(h.engine.ledger.get(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn test_pending_hold_expires_and_frees_computer() {
        let h = running_engine(&["C2"]).await;
        h.engine.settings.set_booking_timeout_minutes(5).await.unwrap();
        let r = h.engine.ledger.create("C2", "u1").await.unwrap();
        assert_eq!(r.expires_at - r.created_at, chrono::Duration::minutes(5));

        // Bring the deadline forward instead of waiting five minutes.
        h.engine.scheduler.arm_after(r.id, std::time::Duration::from_millis(30));

        let registry = h.engine.registry.clone();
        assert!(eventually(|| status_of(&registry, "C2") == ComputerStatus::Available).await);
        let stored = h.engine.ledger.get(r.id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);
        assert!(stored.closed_at.is_some());
        assert_eq!(h.engine.ledger.armed_timers(), 0);
    }

    #[tokio::test]
    async fn test_hold_expires_at_its_stored_deadline() {
        let pool = seeded_pool(&["C2"]).await;
        let hold = Reservation::pending("C2", "u1", chrono::Duration::milliseconds(200));
        SqlxReservationRepository::new(pool.clone())
            .insert_with_claim(&hold)
            .await
            .unwrap();

        // Armed from expires_at by recovery, never moved by the test.
        let h = start(pool).await;
        assert_eq!(status_of(&h.engine.registry, "C2"), ComputerStatus::Reserved);
        assert_eq!(h.engine.ledger.armed_timers(), 1);

        let registry = h.engine.registry.clone();
        assert!(eventually(|| status_of(&registry, "C2") == ComputerStatus::Available).await);
        let stored = h.engine.ledger.get(hold.id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);
        assert!(stored.closed_at.is_some());
        assert_eq!(h.engine.ledger.armed_timers(), 0);
    }

    #[tokio::test]
    async fn test_confirm_prevents_expiry() {
        let h = running_engine(&["C3"]).await;
        let r = h.engine.ledger.create("C3", "u1").await.unwrap();

        let confirmed = h.engine.ledger.confirm(r.id, "u1").await.unwrap();
        assert_eq!(confirmed.status, ReservationStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
        assert_eq!(h.engine.ledger.armed_timers(), 0);

        // A timer that races the confirmation must not expire it.
        h.engine.scheduler.arm_after(r.id, std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(status_of(&h.engine.registry, "C3"), ComputerStatus::InUse);
        assert_eq!(
            h.engine.ledger.get(r.id).await.unwrap().status,
            ReservationStatus::Confirmed
        );

        let done = h.engine.ledger.complete(r.id).await.unwrap();
        assert_eq!(done.status, ReservationStatus::Completed);
        assert_eq!(status_of(&h.engine.registry, "C3"), ComputerStatus::Available);
    }

    #[tokio::test]
    async fn test_confirm_rules() {
        let h = running_engine(&["C1"]).await;
        let r = h.engine.ledger.create("C1", "u1").await.unwrap();

        assert!(matches!(
            h.engine.ledger.confirm(r.id, "u2").await,
            Err(LedgerError::NotOwner(_))
        ));
        h.engine.ledger.confirm(r.id, "u1").await.unwrap();
        assert!(matches!(
            h.engine.ledger.confirm(r.id, "u1").await,
            Err(LedgerError::InvalidState {
                status: ReservationStatus::Confirmed,
                ..
            })
        ));
        assert!(matches!(
            h.engine.ledger.confirm(uuid::Uuid::new_v4(), "u1").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let h = running_engine(&["C1"]).await;
        let r = h.engine.ledger.create("C1", "u1").await.unwrap();
        let user = Actor::User("u1".to_string());

        let first = h.engine.ledger.cancel(r.id, &user).await.unwrap();
        let second = h.engine.ledger.cancel(r.id, &user).await.unwrap();
        assert_eq!(first.status, ReservationStatus::Cancelled);
        assert_eq!(second, first);
        assert_eq!(status_of(&h.engine.registry, "C1"), ComputerStatus::Available);
        assert_eq!(h.engine.ledger.armed_timers(), 0);
    }

    #[tokio::test]
    async fn test_cancel_ownership() {
        let h = running_engine(&["C1"]).await;
        let r = h.engine.ledger.create("C1", "u1").await.unwrap();
        h.engine.ledger.confirm(r.id, "u1").await.unwrap();

        assert!(matches!(
            h.engine.ledger.cancel(r.id, &Actor::User("u2".into())).await,
            Err(LedgerError::NotOwner(_))
        ));
        let cancelled = h.engine.ledger.cancel(r.id, &Actor::Admin).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(status_of(&h.engine.registry, "C1"), ComputerStatus::Available);
    }

    #[tokio::test]
    async fn test_terminal_reservations_stay_terminal() {
        let h = running_engine(&["C1"]).await;
        let r = h.engine.ledger.create("C1", "u1").await.unwrap();

        assert!(matches!(
            h.engine.ledger.complete(r.id).await,
            Err(LedgerError::InvalidState { .. })
        ));
        h.engine.ledger.cancel(r.id, &Actor::Admin).await.unwrap();
        assert!(matches!(
            h.engine.ledger.confirm(r.id, "u1").await,
            Err(LedgerError::InvalidState { .. })
        ));
        assert!(h.engine.ledger.expire(r.id).await.unwrap().is_none());
        assert_eq!(
            h.engine.ledger.get(r.id).await.unwrap().status,
            ReservationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_timeout_change_keeps_existing_deadline() {
        let h = running_engine(&["C1", "C2"]).await;
        let before = h.engine.ledger.create("C1", "u1").await.unwrap();

        h.engine.settings.set_booking_timeout_minutes(60).await.unwrap();

        let stored = h.engine.ledger.get(before.id).await.unwrap();
        assert_eq!(stored.expires_at, before.expires_at);
        let after = h.engine.ledger.create("C2", "u1").await.unwrap();
        assert_eq!(after.expires_at - after.created_at, chrono::Duration::minutes(60));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let h = running_engine(&["C1"]).await;
        let mut sub = h.engine.broadcaster.subscribe();
        assert!(matches!(sub.next().await, Some(MapUpdate::Snapshot { .. })));

        let r = h.engine.ledger.create("C1", "u1").await.unwrap();
        h.engine.ledger.cancel(r.id, &Actor::Admin).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            match sub.next().await {
                Some(MapUpdate::Status(event)) => seen.push((event.status, event.reservation_id)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            seen,
            vec![
                (ComputerStatus::Reserved, Some(r.id)),
                (ComputerStatus::Available, None)
            ]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_state_unchanged() {
        let h = running_engine(&["C1"]).await;
        h.pool
            .execute("DROP TABLE reservations")
            .await
            .expect("Failed to drop table");

        assert!(matches!(
            h.engine.ledger.create("C1", "u1").await,
            Err(LedgerError::Transient(_))
        ));
        let c1 = h.engine.registry.get("C1").unwrap();
        assert_eq!(c1.status, ComputerStatus::Available);
        assert!(c1.current_reservation.is_none());
    }

    /// How the wrapped reservation store misbehaves on insert
    #[derive(Clone, Copy)]
    enum InsertFault {
        /// Fails after a delay, writing nothing
        SlowFailure(std::time::Duration),
        /// Commits, then reports an error anyway
        StoredButFailed,
    }

    struct FaultyReservations {
        inner: SqlxReservationRepository,
        fault: InsertFault,
    }

    #[async_trait]
    impl ReservationRepository for FaultyReservations {
        async fn insert_with_claim(&self, reservation: &Reservation) -> anyhow::Result<bool> {
            match self.fault {
                InsertFault::SlowFailure(delay) => {
                    tokio::time::sleep(delay).await;
                    Err(anyhow::anyhow!("disk full"))
                }
                InsertFault::StoredButFailed => {
                    self.inner.insert_with_claim(reservation).await?;
                    Err(anyhow::anyhow!("connection reset after commit"))
                }
            }
        }

        async fn transition(&self, transition: &ReservationTransition) -> anyhow::Result<bool> {
            self.inner.transition(transition).await
        }

        async fn get(&self, id: Uuid) -> anyhow::Result<Option<Reservation>> {
            self.inner.get(id).await
        }

        async fn list_by_status(
            &self,
            statuses: &[ReservationStatus],
        ) -> anyhow::Result<Vec<Reservation>> {
            self.inner.list_by_status(statuses).await
        }

        async fn list_by_computer(
            &self,
            computer_id: &str,
            limit: i64,
        ) -> anyhow::Result<Vec<Reservation>> {
            self.inner.list_by_computer(computer_id, limit).await
        }

        async fn list_by_user(&self, user_id: &str, limit: i64) -> anyhow::Result<Vec<Reservation>> {
            self.inner.list_by_user(user_id, limit).await
        }
    }

    /// Recovered ledger over "C1" whose reservation inserts misbehave
    async fn faulty_ledger(fault: InsertFault) -> (Arc<Ledger>, Arc<Registry>, Arc<Broadcaster>) {
        let pool = seeded_pool(&["C1"]).await;
        let config = BookingConfig::default();
        let registry = Arc::new(Registry::new());
        let (scheduler, _fired) = Scheduler::new();
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), 16));
        let settings = Arc::new(SettingsService::new(
            SqlxSettingsRepository::boxed(pool.clone()),
            config.operation_timeout(),
        ));
        let ledger = Arc::new(Ledger::new(
            settings,
            registry.clone(),
            SqlxComputerRepository::boxed(pool.clone()),
            Arc::new(FaultyReservations {
                inner: SqlxReservationRepository::new(pool),
                fault,
            }),
            scheduler,
            broadcaster.clone(),
            &config,
        ));
        ledger.recover().await.unwrap();
        (ledger, registry, broadcaster)
    }

    #[tokio::test]
    async fn test_undone_claim_reaches_viewers_who_saw_it() {
        let (ledger, registry, broadcaster) =
            faulty_ledger(InsertFault::SlowFailure(std::time::Duration::from_millis(200))).await;

        let pending = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.create("C1", "u1").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        // Subscribed while the claim is held in memory but not yet stored.
        let mut viewer = broadcaster.subscribe();
        match viewer.next().await {
            Some(MapUpdate::Snapshot { computers }) => {
                assert_eq!(computers[0].status, ComputerStatus::Reserved)
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        assert!(matches!(
            pending.await.unwrap(),
            Err(LedgerError::Transient(_))
        ));
        assert_eq!(status_of(&registry, "C1"), ComputerStatus::Available);

        let update = tokio::time::timeout(std::time::Duration::from_millis(500), viewer.next())
            .await
            .expect("viewer was not told about the undone claim");
        match update {
            Some(MapUpdate::Status(event)) => {
                assert_eq!(event.computer_id, "C1");
                assert_eq!(event.status, ComputerStatus::Available);
                assert!(event.reservation_id.is_none());
            }
            other => panic!("expected status event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_reported_as_failed_keeps_the_hold() {
        let (ledger, registry, _) = faulty_ledger(InsertFault::StoredButFailed).await;

        let r = ledger.create("C1", "u1").await.unwrap();

        let c1 = registry.get("C1").unwrap();
        assert_eq!(c1.status, ComputerStatus::Reserved);
        assert_eq!(c1.current_reservation, Some(r.id));
        assert_eq!(ledger.get(r.id).await.unwrap().status, ReservationStatus::Pending);
        assert_eq!(ledger.armed_timers(), 1);
    }

    #[tokio::test]
    async fn test_recover_expires_overdue_and_rearms_future() {
        let pool = seeded_pool(&["C1", "C2"]).await;
        let repo = SqlxReservationRepository::new(pool.clone());

        let mut overdue = Reservation::pending("C1", "u1", chrono::Duration::minutes(5));
        overdue.created_at -= chrono::Duration::minutes(10);
        overdue.expires_at -= chrono::Duration::minutes(10);
        repo.insert_with_claim(&overdue).await.unwrap();
        let future = Reservation::pending("C2", "u2", chrono::Duration::minutes(5));
        repo.insert_with_claim(&future).await.unwrap();

        let mut engine = crate::services::Engine::new(pool.clone(), &BookingConfig::default());
        let report = engine.ledger.recover().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                rearmed: 1,
                expired: 1,
                in_use: 0
            }
        );
        assert_eq!(status_of(&engine.registry, "C1"), ComputerStatus::Available);
        assert_eq!(status_of(&engine.registry, "C2"), ComputerStatus::Reserved);
        assert_eq!(
            repo.get(overdue.id).await.unwrap().unwrap().status,
            ReservationStatus::Expired
        );
        assert_eq!(engine.ledger.armed_timers(), 1);

        let shutdown = CancellationToken::new();
        assert_eq!(engine.spawn(&shutdown).len(), 2);
        assert!(engine.spawn(&shutdown).is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_recover_aborts_on_inconsistent_rows() {
        let pool = seeded_pool(&["C1"]).await;
        pool.execute("UPDATE computers SET status = 'reserved' WHERE id = 'C1'")
            .await
            .unwrap();

        let engine = crate::services::Engine::new(pool, &BookingConfig::default());
        match engine.ledger.recover().await {
            Err(LedgerError::Integrity(violations)) => assert_eq!(violations.len(), 1),
            other => panic!("expected integrity failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restart_keeps_confirmed_sessions() {
        let pool = seeded_pool(&["C1"]).await;
        let r = {
            let h = start(pool.clone()).await;
            let r = h.engine.ledger.create("C1", "u1").await.unwrap();
            h.engine.ledger.confirm(r.id, "u1").await.unwrap();
            r
        };

        let h = start(pool).await;
        assert_eq!(status_of(&h.engine.registry, "C1"), ComputerStatus::InUse);
        assert_eq!(h.engine.registry.get("C1").unwrap().current_reservation, Some(r.id));
        assert_eq!(h.engine.ledger.armed_timers(), 0);
    }

    #[test]
    fn test_check_integrity_cases() {
        let mut c1 = Computer::new("C1", "main", 0, 0);
        let r = Reservation::pending("C1", "u1", chrono::Duration::minutes(5));
        assert!(check_integrity(&[c1.clone()], &[]).is_empty());

        // Pending reservation without the computer pointing back.
        assert_eq!(check_integrity(&[c1.clone()], &[r.clone()]).len(), 1);

        c1.status = ComputerStatus::Reserved;
        c1.current_reservation = Some(r.id);
        assert!(check_integrity(&[c1.clone()], &[r.clone()]).is_empty());

        // Wrong held status for a pending reservation.
        c1.status = ComputerStatus::InUse;
        assert_eq!(check_integrity(&[c1.clone()], &[r.clone()]).len(), 1);

        // Reference left behind on a free computer.
        c1.status = ComputerStatus::Available;
        assert!(!check_integrity(&[c1.clone()], &[]).is_empty());

        // Reservation for a computer that does not exist.
        assert_eq!(check_integrity(&[], &[r]).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_at_most_one_open_reservation_per_computer(
            requests in prop::collection::vec((0usize..3, 0usize..4), 2..24)
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let ids = ["P0", "P1", "P2"];
                let h = running_engine(&ids).await;

                let tasks: Vec<_> = requests
                    .iter()
                    .map(|(computer, user)| {
                        let ledger = h.engine.ledger.clone();
                        let computer = ids[*computer].to_string();
                        let user = format!("u{}", user);
                        tokio::spawn(async move { ledger.create(&computer, &user).await })
                    })
                    .collect();

                let mut winners = HashMap::new();
                for task in tasks {
                    match task.await.unwrap() {
                        Ok(r) => {
                            prop_assert!(winners.insert(r.computer_id.clone(), r.id).is_none());
                        }
                        Err(e) => prop_assert!(matches!(e, LedgerError::ResourceUnavailable(_))),
                    }
                }

                let open = SqlxReservationRepository::new(h.pool.clone())
                    .list_by_status(&[ReservationStatus::Pending, ReservationStatus::Confirmed])
                    .await
                    .unwrap();
                prop_assert_eq!(open.len(), winners.len());
                for id in ids {
                    let c = h.engine.registry.get(id).unwrap();
                    prop_assert_eq!(c.current_reservation, winners.get(id).copied());
                }
                Ok(())
            });
            result?;
        }
    }
}
