//! Database layer
//!
//! Durable storage for settings, workstations and reservations. Supports:
//! - SQLite (default, single-file deployment)
//! - MySQL
//!
//! The driver is selected from configuration. Repositories work against the
//! [`DatabasePool`] trait and branch on the driver for dialect differences.
//!
//! # Usage
//!
//! ```ignore
//! use gamehall::config::DatabaseConfig;
//! use gamehall::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, mysql, sqlite, DatabasePool, DynDatabasePool, MysqlDatabase,
    SqliteDatabase,
};
