//! Configuration management.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Scheduler store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Identifier of this scheduler instance (fired-trigger ownership).
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Per-type concurrency overrides, keyed by short type name.
    ///
    /// An override never raises a type above its declared `max_allowed`;
    /// the effective limit is the minimum of the two. Ordered so that
    /// startup logging is deterministic.
    #[serde(default)]
    pub concurrency_overrides: BTreeMap<String, usize>,

    /// How many times one acquisition call re-queries before giving up.
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,

    /// Database configuration for the production delegate.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            concurrency_overrides: BTreeMap::new(),
            acquire_retries: default_acquire_retries(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Timeout for acquiring a connection from the pool (seconds).
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON logging (pretty output otherwise).
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_instance_id() -> String {
    "NON_CLUSTERED".to_string()
}

fn default_acquire_retries() -> u32 {
    3
}

fn default_database_url() -> String {
    "postgres://localhost/firelane".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.instance_id, "NON_CLUSTERED");
        assert_eq!(config.acquire_retries, 3);
        assert!(config.concurrency_overrides.is_empty());
        assert_eq!(config.database.max_connections, 20);
    }

    #[test]
    fn test_deserialize_overrides() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{
                "instance_id": "sched-1",
                "concurrency_overrides": { "HashFileJob": 2, "DownloadImageJob": 4 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.instance_id, "sched-1");
        assert_eq!(config.concurrency_overrides["HashFileJob"], 2);
        assert_eq!(config.concurrency_overrides["DownloadImageJob"], 4);
    }
}
