//! Reservation repository
//!
//! Every write here touches the reservation row and the workstation row in one
//! transaction, and every status change is a conditional update on the current
//! status. Rows are never deleted; terminal reservations are the history.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{mysql::MySqlRow, sqlite::SqliteRow, MySqlPool, Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DatabaseDriver;
use crate::db::{mysql, sqlite, DynDatabasePool};
use crate::models::{ComputerStatus, Reservation, ReservationStatus};

/// A guarded status change plus its effect on the workstation row
#[derive(Debug, Clone)]
pub struct ReservationTransition {
    pub reservation_id: Uuid,
    pub computer_id: String,
    /// The update only applies while the row is in one of these states
    pub from: Vec<ReservationStatus>,
    pub to: ReservationStatus,
    pub at: DateTime<Utc>,
}

impl ReservationTransition {
    pub fn new(reservation: &Reservation, from: &[ReservationStatus], to: ReservationStatus) -> Self {
        Self {
            reservation_id: reservation.id,
            computer_id: reservation.computer_id.clone(),
            from: from.to_vec(),
            to,
            at: Utc::now(),
        }
    }

    fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        (self.to == ReservationStatus::Confirmed).then_some(self.at)
    }

    fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.to.is_terminal().then_some(self.at)
    }

    fn update_reservation_sql(&self) -> String {
        let placeholders = vec!["?"; self.from.len()].join(", ");
        format!(
            "UPDATE reservations SET status = ?, confirmed_at = COALESCE(?, confirmed_at), \
             closed_at = COALESCE(?, closed_at) WHERE id = ? AND status IN ({})",
            placeholders
        )
    }

    /// Confirmation moves the workstation to InUse; every other change frees it
    fn update_computer_sql(&self) -> &'static str {
        if self.to == ReservationStatus::Confirmed {
            "UPDATE computers SET status = ?, updated_at = ? \
             WHERE id = ? AND current_reservation = ?"
        } else {
            "UPDATE computers SET status = ?, current_reservation = NULL, updated_at = ? \
             WHERE id = ? AND current_reservation = ?"
        }
    }

    fn computer_status(&self) -> ComputerStatus {
        if self.to == ReservationStatus::Confirmed {
            ComputerStatus::InUse
        } else {
            ComputerStatus::Available
        }
    }
}

/// Repository trait for reservation rows
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Claim the workstation row and insert the pending reservation together.
    /// Returns false, writing nothing, when the row is not available.
    async fn insert_with_claim(&self, reservation: &Reservation) -> Result<bool>;

    /// Apply a guarded transition. Returns false, writing nothing, when the
    /// reservation is no longer in one of the expected states.
    async fn transition(&self, transition: &ReservationTransition) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<Reservation>>;

    /// Reservations in any of the given states, oldest first
    async fn list_by_status(&self, statuses: &[ReservationStatus]) -> Result<Vec<Reservation>>;

    /// Newest first
    async fn list_by_computer(&self, computer_id: &str, limit: i64) -> Result<Vec<Reservation>>;

    /// Newest first
    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Reservation>>;
}

/// SQLx-based reservation repository
pub struct SqlxReservationRepository {
    pool: DynDatabasePool,
}

impl SqlxReservationRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ReservationRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl ReservationRepository for SqlxReservationRepository {
    async fn insert_with_claim(&self, reservation: &Reservation) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                insert_with_claim_sqlite(sqlite(self.pool.as_ref())?, reservation).await
            }
            DatabaseDriver::Mysql => {
                insert_with_claim_mysql(mysql(self.pool.as_ref())?, reservation).await
            }
        }
    }

    async fn transition(&self, transition: &ReservationTransition) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                transition_sqlite(sqlite(self.pool.as_ref())?, transition).await
            }
            DatabaseDriver::Mysql => {
                transition_mysql(mysql(self.pool.as_ref())?, transition).await
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Reservation>> {
        let sql = format!("{} WHERE id = ?", SELECT_RESERVATION);
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let row = sqlx::query(&sql)
                    .bind(id.to_string())
                    .fetch_optional(sqlite(self.pool.as_ref())?)
                    .await
                    .context("Failed to get reservation")?;
                row.as_ref().map(row_to_reservation_sqlite).transpose()
            }
            DatabaseDriver::Mysql => {
                let row = sqlx::query(&sql)
                    .bind(id.to_string())
                    .fetch_optional(mysql(self.pool.as_ref())?)
                    .await
                    .context("Failed to get reservation")?;
                row.as_ref().map(row_to_reservation_mysql).transpose()
            }
        }
    }

    async fn list_by_status(&self, statuses: &[ReservationStatus]) -> Result<Vec<Reservation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "{} WHERE status IN ({}) ORDER BY created_at",
            SELECT_RESERVATION, placeholders
        );
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut query = sqlx::query(&sql);
                for status in statuses {
                    query = query.bind(status.as_str());
                }
                let rows = query
                    .fetch_all(sqlite(self.pool.as_ref())?)
                    .await
                    .context("Failed to list reservations by status")?;
                rows.iter().map(row_to_reservation_sqlite).collect()
            }
            DatabaseDriver::Mysql => {
                let mut query = sqlx::query(&sql);
                for status in statuses {
                    query = query.bind(status.as_str());
                }
                let rows = query
                    .fetch_all(mysql(self.pool.as_ref())?)
                    .await
                    .context("Failed to list reservations by status")?;
                rows.iter().map(row_to_reservation_mysql).collect()
            }
        }
    }

    async fn list_by_computer(&self, computer_id: &str, limit: i64) -> Result<Vec<Reservation>> {
        self.list_newest("computer_id", computer_id, limit).await
    }

    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Reservation>> {
        self.list_newest("user_id", user_id, limit).await
    }
}

impl SqlxReservationRepository {
    async fn list_newest(&self, column: &str, value: &str, limit: i64) -> Result<Vec<Reservation>> {
        let sql = format!(
            "{} WHERE {} = ? ORDER BY created_at DESC LIMIT ?",
            SELECT_RESERVATION, column
        );
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = sqlx::query(&sql)
                    .bind(value)
                    .bind(limit)
                    .fetch_all(sqlite(self.pool.as_ref())?)
                    .await
                    .with_context(|| format!("Failed to list reservations by {}", column))?;
                rows.iter().map(row_to_reservation_sqlite).collect()
            }
            DatabaseDriver::Mysql => {
                let rows = sqlx::query(&sql)
                    .bind(value)
                    .bind(limit)
                    .fetch_all(mysql(self.pool.as_ref())?)
                    .await
                    .with_context(|| format!("Failed to list reservations by {}", column))?;
                rows.iter().map(row_to_reservation_mysql).collect()
            }
        }
    }
}

const SELECT_RESERVATION: &str = "SELECT id, computer_id, user_id, status, created_at, \
     expires_at, confirmed_at, closed_at FROM reservations";

const CLAIM_COMPUTER_SQL: &str = "UPDATE computers SET status = ?, current_reservation = ?, \
     updated_at = ? WHERE id = ? AND status = ? AND current_reservation IS NULL";

const INSERT_RESERVATION_SQL: &str = "INSERT INTO reservations \
     (id, computer_id, user_id, status, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?)";

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Bad reservation id: {}", raw))
}

// SQLite implementations
fn row_to_reservation_sqlite(row: &SqliteRow) -> Result<Reservation> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    Ok(Reservation {
        id: parse_id(&id)?,
        computer_id: row.get("computer_id"),
        user_id: row.get("user_id"),
        status: status.parse()?,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        confirmed_at: row.get("confirmed_at"),
        closed_at: row.get("closed_at"),
    })
}

async fn insert_with_claim_sqlite(pool: &SqlitePool, r: &Reservation) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let claimed = sqlx::query(CLAIM_COMPUTER_SQL)
        .bind(ComputerStatus::Reserved.as_str())
        .bind(r.id.to_string())
        .bind(r.created_at)
        .bind(&r.computer_id)
        .bind(ComputerStatus::Available.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to claim computer row")?
        .rows_affected();
    if claimed == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(INSERT_RESERVATION_SQL)
        .bind(r.id.to_string())
        .bind(&r.computer_id)
        .bind(&r.user_id)
        .bind(r.status.as_str())
        .bind(r.created_at)
        .bind(r.expires_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert reservation")?;

    tx.commit().await.context("Failed to commit reservation")?;
    Ok(true)
}

async fn transition_sqlite(pool: &SqlitePool, t: &ReservationTransition) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let sql = t.update_reservation_sql();
    let mut query = sqlx::query(&sql)
        .bind(t.to.as_str())
        .bind(t.confirmed_at())
        .bind(t.closed_at())
        .bind(t.reservation_id.to_string());
    for status in &t.from {
        query = query.bind(status.as_str());
    }
    let updated = query
        .execute(&mut *tx)
        .await
        .context("Failed to update reservation")?
        .rows_affected();
    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(t.update_computer_sql())
        .bind(t.computer_status().as_str())
        .bind(t.at)
        .bind(&t.computer_id)
        .bind(t.reservation_id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to update computer row")?;

    tx.commit().await.context("Failed to commit transition")?;
    Ok(true)
}

// MySQL implementations
fn row_to_reservation_mysql(row: &MySqlRow) -> Result<Reservation> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    Ok(Reservation {
        id: parse_id(&id)?,
        computer_id: row.get("computer_id"),
        user_id: row.get("user_id"),
        status: status.parse()?,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        confirmed_at: row.get("confirmed_at"),
        closed_at: row.get("closed_at"),
    })
}

async fn insert_with_claim_mysql(pool: &MySqlPool, r: &Reservation) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let claimed = sqlx::query(CLAIM_COMPUTER_SQL)
        .bind(ComputerStatus::Reserved.as_str())
        .bind(r.id.to_string())
        .bind(r.created_at)
        .bind(&r.computer_id)
        .bind(ComputerStatus::Available.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to claim computer row")?
        .rows_affected();
    if claimed == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(INSERT_RESERVATION_SQL)
        .bind(r.id.to_string())
        .bind(&r.computer_id)
        .bind(&r.user_id)
        .bind(r.status.as_str())
        .bind(r.created_at)
        .bind(r.expires_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert reservation")?;

    tx.commit().await.context("Failed to commit reservation")?;
    Ok(true)
}

async fn transition_mysql(pool: &MySqlPool, t: &ReservationTransition) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let sql = t.update_reservation_sql();
    let mut query = sqlx::query(&sql)
        .bind(t.to.as_str())
        .bind(t.confirmed_at())
        .bind(t.closed_at())
        .bind(t.reservation_id.to_string());
    for status in &t.from {
        query = query.bind(status.as_str());
    }
    let updated = query
        .execute(&mut *tx)
        .await
        .context("Failed to update reservation")?
        .rows_affected();
    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(t.update_computer_sql())
        .bind(t.computer_status().as_str())
        .bind(t.at)
        .bind(&t.computer_id)
        .bind(t.reservation_id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to update computer row")?;

    tx.commit().await.context("Failed to commit transition")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::{ComputerRepository, SqlxComputerRepository};
    use crate::db::{create_test_pool, migrations};
    use crate::models::Computer;
    use chrono::Duration;

    async fn setup() -> (SqlxComputerRepository, SqlxReservationRepository) {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        let computers = SqlxComputerRepository::new(pool.clone());
        for id in ["PC-01", "PC-02"] {
            computers
                .insert_if_absent(&Computer::new(id, "main", 0, 0))
                .await
                .unwrap();
        }
        (computers, SqlxReservationRepository::new(pool))
    }

    #[tokio::test]
    async fn test_claim_writes_both_rows() {
        let (computers, repo) = setup().await;
        let r = Reservation::pending("PC-01", "u1", Duration::minutes(15));

        assert!(repo.insert_with_claim(&r).await.unwrap());

        let stored = repo.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Pending);
        assert_eq!(stored.user_id, "u1");

        let pc = computers.get("PC-01").await.unwrap().unwrap();
        assert_eq!(pc.status, ComputerStatus::Reserved);
        assert_eq!(pc.current_reservation, Some(r.id));
    }

    #[tokio::test]
    async fn test_second_claim_writes_nothing() {
        let (_, repo) = setup().await;
        let first = Reservation::pending("PC-01", "u1", Duration::minutes(15));
        let second = Reservation::pending("PC-01", "u2", Duration::minutes(15));

        assert!(repo.insert_with_claim(&first).await.unwrap());
        assert!(!repo.insert_with_claim(&second).await.unwrap());
        assert!(repo.get(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guarded_transition_applies_once() {
        let (computers, repo) = setup().await;
        let r = Reservation::pending("PC-02", "u1", Duration::minutes(15));
        repo.insert_with_claim(&r).await.unwrap();

        let confirm = ReservationTransition::new(
            &r,
            &[ReservationStatus::Pending],
            ReservationStatus::Confirmed,
        );
        assert!(repo.transition(&confirm).await.unwrap());
        assert!(!repo.transition(&confirm).await.unwrap());
        assert_eq!(
            computers.get("PC-02").await.unwrap().unwrap().status,
            ComputerStatus::InUse
        );

        let expire = ReservationTransition::new(
            &r,
            &[ReservationStatus::Pending],
            ReservationStatus::Expired,
        );
        assert!(!repo.transition(&expire).await.unwrap());

        let complete = ReservationTransition::new(
            &r,
            &[ReservationStatus::Confirmed],
            ReservationStatus::Completed,
        );
        assert!(repo.transition(&complete).await.unwrap());

        let stored = repo.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Completed);
        assert!(stored.confirmed_at.is_some());
        assert!(stored.closed_at.is_some());
        assert_eq!(stored.expires_at, r.expires_at);

        let pc = computers.get("PC-02").await.unwrap().unwrap();
        assert_eq!(pc.status, ComputerStatus::Available);
        assert!(pc.current_reservation.is_none());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (_, repo) = setup().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let r = Reservation::pending("PC-01", "u1", Duration::minutes(15));
            repo.insert_with_claim(&r).await.unwrap();
            let cancel = ReservationTransition::new(
                &r,
                &[ReservationStatus::Pending],
                ReservationStatus::Cancelled,
            );
            repo.transition(&cancel).await.unwrap();
            ids.push(r.id);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let history = repo.list_by_computer("PC-01", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);

        assert_eq!(repo.list_by_user("u1", 50).await.unwrap().len(), 3);
        assert!(repo
            .list_by_status(&[ReservationStatus::Pending])
            .await
            .unwrap()
            .is_empty());
    }
}
