//! Computer repository
//!
//! Durable workstation rows. The in-memory registry is loaded from here at
//! startup; claims and releases are written by the reservation repository in
//! the same transaction as the reservation row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{mysql::MySqlRow, sqlite::SqliteRow, MySqlPool, Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DatabaseDriver;
use crate::db::{mysql, sqlite, DynDatabasePool};
use crate::models::{Computer, ComputerStatus};

/// Repository trait for workstation rows
#[async_trait]
pub trait ComputerRepository: Send + Sync {
    /// All workstations ordered by id
    async fn list(&self) -> Result<Vec<Computer>>;

    async fn get(&self, id: &str) -> Result<Option<Computer>>;

    /// Insert a new row; returns false when the id already exists
    async fn insert_if_absent(&self, computer: &Computer) -> Result<bool>;

    /// Set an administrative status on a row that holds no reservation
    async fn set_status(&self, id: &str, status: ComputerStatus) -> Result<bool>;

    async fn touch_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;
}

/// SQLx-based computer repository
pub struct SqlxComputerRepository {
    pool: DynDatabasePool,
}

impl SqlxComputerRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ComputerRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl ComputerRepository for SqlxComputerRepository {
    async fn list(&self) -> Result<Vec<Computer>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => list_computers_sqlite(sqlite(self.pool.as_ref())?).await,
            DatabaseDriver::Mysql => list_computers_mysql(mysql(self.pool.as_ref())?).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Computer>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => get_computer_sqlite(sqlite(self.pool.as_ref())?, id).await,
            DatabaseDriver::Mysql => get_computer_mysql(mysql(self.pool.as_ref())?, id).await,
        }
    }

    async fn insert_if_absent(&self, computer: &Computer) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                insert_computer_sqlite(sqlite(self.pool.as_ref())?, computer).await
            }
            DatabaseDriver::Mysql => {
                insert_computer_mysql(mysql(self.pool.as_ref())?, computer).await
            }
        }
    }

    async fn set_status(&self, id: &str, status: ComputerStatus) -> Result<bool> {
        let sql = "UPDATE computers SET status = ?, updated_at = ? \
                   WHERE id = ? AND current_reservation IS NULL";
        let now = Utc::now();
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(status.as_str())
                .bind(now)
                .bind(id)
                .execute(sqlite(self.pool.as_ref())?)
                .await
                .map(|r| r.rows_affected()),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(status.as_str())
                .bind(now)
                .bind(id)
                .execute(mysql(self.pool.as_ref())?)
                .await
                .map(|r| r.rows_affected()),
        }
        .with_context(|| format!("Failed to set status of computer {}", id))?;
        Ok(affected > 0)
    }

    async fn touch_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let sql = "UPDATE computers SET last_heartbeat = ? WHERE id = ?";
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(sql)
                .bind(at)
                .bind(id)
                .execute(sqlite(self.pool.as_ref())?)
                .await
                .map(|r| r.rows_affected()),
            DatabaseDriver::Mysql => sqlx::query(sql)
                .bind(at)
                .bind(id)
                .execute(mysql(self.pool.as_ref())?)
                .await
                .map(|r| r.rows_affected()),
        }
        .with_context(|| format!("Failed to record heartbeat of computer {}", id))?;
        Ok(affected > 0)
    }
}

const SELECT_COMPUTER: &str =
    "SELECT id, zone, pos_x, pos_y, status, current_reservation, last_heartbeat FROM computers";

fn parse_reservation_ref(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(|s| Uuid::parse_str(&s).with_context(|| format!("Bad reservation reference: {}", s)))
        .transpose()
}

// SQLite implementations
fn row_to_computer_sqlite(row: &SqliteRow) -> Result<Computer> {
    let status: String = row.get("status");
    Ok(Computer {
        id: row.get("id"),
        zone: row.get("zone"),
        x: row.get("pos_x"),
        y: row.get("pos_y"),
        status: status.parse()?,
        current_reservation: parse_reservation_ref(row.get("current_reservation"))?,
        last_heartbeat: row.get("last_heartbeat"),
        version: 0,
    })
}

async fn list_computers_sqlite(pool: &SqlitePool) -> Result<Vec<Computer>> {
    let rows = sqlx::query(&format!("{} ORDER BY id", SELECT_COMPUTER))
        .fetch_all(pool)
        .await
        .context("Failed to list computers")?;
    rows.iter().map(row_to_computer_sqlite).collect()
}

async fn get_computer_sqlite(pool: &SqlitePool, id: &str) -> Result<Option<Computer>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COMPUTER))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get computer")?;
    row.as_ref().map(row_to_computer_sqlite).transpose()
}

async fn insert_computer_sqlite(pool: &SqlitePool, c: &Computer) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO computers (id, zone, pos_x, pos_y, status, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&c.id)
    .bind(&c.zone)
    .bind(c.x)
    .bind(c.y)
    .bind(c.status.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("Failed to insert computer {}", c.id))?;
    Ok(result.rows_affected() > 0)
}

// MySQL implementations
fn row_to_computer_mysql(row: &MySqlRow) -> Result<Computer> {
    let status: String = row.get("status");
    Ok(Computer {
        id: row.get("id"),
        zone: row.get("zone"),
        x: row.get("pos_x"),
        y: row.get("pos_y"),
        status: status.parse()?,
        current_reservation: parse_reservation_ref(row.get("current_reservation"))?,
        last_heartbeat: row.get("last_heartbeat"),
        version: 0,
    })
}

async fn list_computers_mysql(pool: &MySqlPool) -> Result<Vec<Computer>> {
    let rows = sqlx::query(&format!("{} ORDER BY id", SELECT_COMPUTER))
        .fetch_all(pool)
        .await
        .context("Failed to list computers")?;
    rows.iter().map(row_to_computer_mysql).collect()
}

async fn get_computer_mysql(pool: &MySqlPool, id: &str) -> Result<Option<Computer>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COMPUTER))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get computer")?;
    row.as_ref().map(row_to_computer_mysql).transpose()
}

async fn insert_computer_mysql(pool: &MySqlPool, c: &Computer) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT IGNORE INTO computers (id, zone, pos_x, pos_y, status, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&c.id)
    .bind(&c.zone)
    .bind(c.x)
    .bind(c.y)
    .bind(c.status.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("Failed to insert computer {}", c.id))?;
    Ok(result.rows_affected() > 0)
}
