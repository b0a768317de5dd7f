// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use sqlx::postgres::PgConnectOptions;

/// Default maximum recovery attempts before a workflow is dead-lettered.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 50;

/// Default interval between flushes of the buffered workflow-status writes.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Engine configuration.
///
/// The system database holds the engine's own bookkeeping; the user database
/// is the application's database, which the engine only touches inside
/// transaction steps.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database server hostname.
    pub hostname: String,
    /// Database server port.
    pub port: u16,
    /// Database username.
    pub username: String,
    /// Database password.
    pub password: String,
    /// Name of the application's own database.
    pub user_database: String,
    /// Name of the engine-owned system database.
    pub system_database: String,
    /// Path to a CA bundle for TLS, if the server requires it.
    pub ssl_ca: Option<String>,
    /// Identity of this executor process, used to partition recovery.
    pub executor_id: String,
    /// Application version recorded on every workflow for recovery filtering.
    pub application_version: Option<String>,
    /// Recovery attempts after which a workflow is dead-lettered.
    pub max_recovery_attempts: u32,
    /// Interval between flushes of buffered status writes, in milliseconds.
    pub flush_interval_ms: u64,
    /// Maximum connections in each of the two pools.
    pub pool_size: u32,
}

impl Config {
    /// Build a configuration programmatically from the essential fields.
    ///
    /// The system database name defaults to `<user_database>_dbos_sys`,
    /// executor identity to `"local"`, and the remaining knobs to their
    /// documented defaults.
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        user_database: impl Into<String>,
    ) -> Self {
        let user_database = user_database.into();
        let system_database = format!("{}_dbos_sys", user_database);
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
            password: password.into(),
            user_database,
            system_database,
            ssl_ca: None,
            executor_id: "local".to_string(),
            application_version: None,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            pool_size: 10,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DURATX_DB_HOST`: database server hostname
    /// - `DURATX_APP_DB_NAME`: application database name
    ///
    /// Optional (with defaults):
    /// - `DURATX_DB_PORT`: database port (default: 5432)
    /// - `DURATX_DB_USER`: database username (default: postgres)
    /// - `PGPASSWORD` / `DB_PASSWORD`: database password (default: empty)
    /// - `DURATX_SYS_DB_NAME`: system database name (default: `<app db>_dbos_sys`)
    /// - `DURATX_DB_SSL_CA`: CA bundle path for TLS
    /// - `DBOS__VMID`: executor identity (default: "local")
    /// - `DBOS__APPVERSION`: application version
    /// - `DURATX_MAX_RECOVERY_ATTEMPTS`: dead-letter threshold (default: 50)
    pub fn from_env() -> Result<Self, ConfigError> {
        let hostname =
            std::env::var("DURATX_DB_HOST").map_err(|_| ConfigError::Missing("DURATX_DB_HOST"))?;

        let user_database = std::env::var("DURATX_APP_DB_NAME")
            .map_err(|_| ConfigError::Missing("DURATX_APP_DB_NAME"))?;

        let port: u16 = std::env::var("DURATX_DB_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("DURATX_DB_PORT", "must be a valid port number"))?;

        let username = std::env::var("DURATX_DB_USER").unwrap_or_else(|_| "postgres".to_string());

        // PGPASSWORD is the conventional variable; DB_PASSWORD is accepted
        // for environments that cannot set it.
        let password = std::env::var("PGPASSWORD")
            .or_else(|_| std::env::var("DB_PASSWORD"))
            .unwrap_or_default();

        let system_database = std::env::var("DURATX_SYS_DB_NAME")
            .unwrap_or_else(|_| format!("{}_dbos_sys", user_database));

        let max_recovery_attempts: u32 = std::env::var("DURATX_MAX_RECOVERY_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_MAX_RECOVERY_ATTEMPTS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DURATX_MAX_RECOVERY_ATTEMPTS", "must be a positive integer")
            })?;

        Ok(Self {
            hostname,
            port,
            username,
            password,
            user_database,
            system_database,
            ssl_ca: std::env::var("DURATX_DB_SSL_CA").ok(),
            executor_id: std::env::var("DBOS__VMID").unwrap_or_else(|_| "local".to_string()),
            application_version: std::env::var("DBOS__APPVERSION").ok(),
            max_recovery_attempts,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            pool_size: 10,
        })
    }

    /// Connect options for the system database.
    pub fn system_connect_options(&self) -> PgConnectOptions {
        self.connect_options(&self.system_database)
    }

    /// Connect options for the user database.
    pub fn user_connect_options(&self) -> PgConnectOptions {
        self.connect_options(&self.user_database)
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.hostname)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(database);
        if let Some(ca) = &self.ssl_ca {
            options = options
                .ssl_mode(sqlx::postgres::PgSslMode::VerifyFull)
                .ssl_root_cert(ca);
        }
        options
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_database_defaulting() {
        let config = Config::new("localhost", 5432, "postgres", "pw", "shop");
        assert_eq!(config.system_database, "shop_dbos_sys");
        assert_eq!(config.executor_id, "local");
        assert_eq!(config.max_recovery_attempts, DEFAULT_MAX_RECOVERY_ATTEMPTS);
    }

    #[test]
    fn test_connect_options_target_the_right_databases() {
        let config = Config::new("db.internal", 5433, "app", "pw", "shop");
        assert_eq!(config.system_connect_options().get_database(), Some("shop_dbos_sys"));
        assert_eq!(config.user_connect_options().get_database(), Some("shop"));
        assert_eq!(config.user_connect_options().get_host(), "db.internal");
    }
}
