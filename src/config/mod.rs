//! Configuration management
//!
//! This module handles loading and parsing configuration for the gamehall engine.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Booking engine tuning
    #[serde(default)]
    pub booking: BookingConfig,
    /// Workstations registered at startup
    #[serde(default)]
    pub fleet: Vec<FleetEntry>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origin (the portal frontend)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Bearer token guarding `/admin` routes. Unset means the routes are open.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            admin_token: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/gamehall.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Booking engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    /// Upper bound for a single storage call made while serving a request
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Delay before an expiry that failed on storage is attempted again
    #[serde(default = "default_expiry_retry_seconds")]
    pub expiry_retry_seconds: u64,
    /// Capacity of the live status channel per subscriber
    #[serde(default = "default_broadcast_buffer")]
    pub broadcast_buffer: usize,
    /// Maximum rows returned by history endpoints
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            expiry_retry_seconds: default_expiry_retry_seconds(),
            broadcast_buffer: default_broadcast_buffer(),
            history_limit: default_history_limit(),
        }
    }
}

impl BookingConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn expiry_retry(&self) -> Duration {
        Duration::from_secs(self.expiry_retry_seconds)
    }
}

fn default_operation_timeout_ms() -> u64 {
    2000
}

fn default_expiry_retry_seconds() -> u64 {
    5
}

fn default_broadcast_buffer() -> usize {
    1024
}

fn default_history_limit() -> i64 {
    50
}

/// A workstation declared in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEntry {
    pub id: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - GAMEHALL_SERVER_HOST
    /// - GAMEHALL_SERVER_PORT
    /// - GAMEHALL_SERVER_CORS_ORIGIN
    /// - GAMEHALL_SERVER_ADMIN_TOKEN
    /// - GAMEHALL_DATABASE_DRIVER
    /// - GAMEHALL_DATABASE_URL
    /// - GAMEHALL_BOOKING_OPERATION_TIMEOUT_MS
    /// - GAMEHALL_BOOKING_EXPIRY_RETRY_SECONDS
    /// - GAMEHALL_BOOKING_BROADCAST_BUFFER
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    fn validate(&self) -> Result<(), ConfigError> {
        if self.booking.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "booking.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.booking.broadcast_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "booking.broadcast_buffer must be greater than zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.fleet {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "fleet entries need a non-empty id".to_string(),
                ));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate fleet id '{}'",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("GAMEHALL_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("GAMEHALL_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }
        if let Ok(cors_origin) = std::env::var("GAMEHALL_SERVER_CORS_ORIGIN") {
            self.server.cors_origin = cors_origin;
        }
        if let Ok(token) = std::env::var("GAMEHALL_SERVER_ADMIN_TOKEN") {
            self.server.admin_token = Some(token).filter(|t| !t.is_empty());
        }

        if let Ok(driver) = std::env::var("GAMEHALL_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("GAMEHALL_DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(ms) = std::env::var("GAMEHALL_BOOKING_OPERATION_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.booking.operation_timeout_ms = ms;
            }
        }
        if let Ok(secs) = std::env::var("GAMEHALL_BOOKING_EXPIRY_RETRY_SECONDS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.booking.expiry_retry_seconds = secs;
            }
        }
        if let Ok(buffer) = std::env::var("GAMEHALL_BOOKING_BROADCAST_BUFFER") {
            if let Ok(buffer) = buffer.parse::<usize>() {
                self.booking.broadcast_buffer = buffer;
            }
        }
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_booking_strategy() -> impl Strategy<Value = BookingConfig> {
        (1u64..=60_000, 0u64..=600, 1usize..=65_536, 1i64..=500).prop_map(
            |(operation_timeout_ms, expiry_retry_seconds, broadcast_buffer, history_limit)| {
                BookingConfig {
                    operation_timeout_ms,
                    expiry_retry_seconds,
                    broadcast_buffer,
                    history_limit,
                }
            },
        )
    }

    fn valid_fleet_strategy() -> impl Strategy<Value = Vec<FleetEntry>> {
        prop::collection::btree_set("PC-[0-9]{2}", 0..8).prop_flat_map(|ids| {
            let ids: Vec<String> = ids.into_iter().collect();
            let n = ids.len();
            (Just(ids), prop::collection::vec(("[a-z]{0,6}", -50i32..50, -50i32..50), n))
                .prop_map(|(ids, rest)| {
                    ids.into_iter()
                        .zip(rest)
                        .map(|(id, (zone, x, y))| FleetEntry { id, zone, x, y })
                        .collect()
                })
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        /// Serializing a valid config to YAML and loading it back yields the same values.
        #[test]
        fn config_yaml_roundtrip(
            port in 1u16..=65535,
            booking in valid_booking_strategy(),
            fleet in valid_fleet_strategy(),
        ) {
            let mut config = Config::default();
            config.server.port = port;
            config.booking = booking;
            config.fleet = fleet;

            let yaml = serde_yaml::to_string(&config).expect("Failed to serialize config");
            let mut file = NamedTempFile::new().expect("Failed to create temp file");
            write!(file, "{}", yaml).expect("Failed to write config");

            let parsed = Config::load(file.path()).expect("Failed to parse config");

            prop_assert_eq!(parsed.server.port, config.server.port);
            prop_assert_eq!(parsed.booking.operation_timeout_ms, config.booking.operation_timeout_ms);
            prop_assert_eq!(parsed.booking.expiry_retry_seconds, config.booking.expiry_retry_seconds);
            prop_assert_eq!(parsed.booking.broadcast_buffer, config.booking.broadcast_buffer);
            prop_assert_eq!(parsed.booking.history_limit, config.booking.history_limit);
            prop_assert_eq!(parsed.fleet, config.fleet);
        }
    }
}
