//! Configuration loading shared by every relayd crate.
//!
//! Values come from built-in defaults, an optional TOML file, and finally
//! environment variable overrides, in that order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    pub const BROKER_URL: &str = "ws://127.0.0.1:8083/mqtt";
    pub const CLIENT_ID_PREFIX: &str = "relayd";
    pub const KEEP_ALIVE_SECS: u16 = 30;
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
    pub const PUBLISH_TIMEOUT_MS: u64 = 10_000;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
    pub const RECONNECT_DELAY_MS: u64 = 2_000;
    pub const LWT_SNAPSHOT_WAIT_MS: u64 = 600;
    pub const DISCOVERY_WINDOW_MS: u64 = 3_000;

    pub const SCHEDULER_TICK_MS: u64 = 60_000;
    pub const SCHEDULER_DUE_LIMIT: usize = 50;
    pub const SCHEDULER_CONCURRENCY: usize = 3;

    pub const DATA_DIR: &str = "data";
    pub const DATABASE_FILE: &str = "relayd.redb";
}

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_URL: &str = "RELAYD_MQTT_URL";
    pub const MQTT_USERNAME: &str = "RELAYD_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "RELAYD_MQTT_PASSWORD";
    pub const MQTT_CLIENT_ID_PREFIX: &str = "RELAYD_MQTT_CLIENT_ID_PREFIX";
    pub const SCHEDULER_ENABLED: &str = "RELAYD_SCHEDULER_ENABLED";
    pub const SCHEDULER_INTERVAL_MS: &str = "RELAYD_SCHEDULER_INTERVAL_MS";
    pub const DATA_DIR: &str = "RELAYD_DATA_DIR";
    /// Switches log output to JSON lines
    pub const LOG_JSON: &str = "RELAYD_LOG_JSON";
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// MQTT-over-WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client ids are `<prefix>-<8 hex chars>`
    pub client_id_prefix: String,
    pub keep_alive_secs: u16,
    /// Deadline for the socket open plus CONNACK
    pub connect_timeout_ms: u64,
    /// Deadline for PUBACK, and for waiting on a connection before publishing
    pub publish_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: defaults::BROKER_URL.to_string(),
            username: None,
            password: None,
            client_id_prefix: defaults::CLIENT_ID_PREFIX.to_string(),
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            publish_timeout_ms: defaults::PUBLISH_TIMEOUT_MS,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            reconnect_delay_ms: defaults::RECONNECT_DELAY_MS,
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// Maximum schedules loaded per tick
    pub due_limit: usize,
    /// Schedules executed concurrently within a tick
    pub concurrency: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: defaults::SCHEDULER_TICK_MS,
            due_limit: defaults::SCHEDULER_DUE_LIMIT,
            concurrency: defaults::SCHEDULER_CONCURRENCY,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
        }
    }
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(defaults::DATABASE_FILE)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaydConfig {
    pub broker: BrokerConfig,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
}

impl RelaydConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an optional file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                debug!(path = %path.display(), "Loaded configuration file");
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(env_vars::MQTT_URL) {
            self.broker.url = url;
        }
        if let Some(username) = lookup(env_vars::MQTT_USERNAME) {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup(env_vars::MQTT_PASSWORD) {
            self.broker.password = Some(password);
        }
        if let Some(prefix) = lookup(env_vars::MQTT_CLIENT_ID_PREFIX) {
            self.broker.client_id_prefix = prefix;
        }
        if let Some(enabled) = lookup(env_vars::SCHEDULER_ENABLED) {
            match parse_bool(&enabled) {
                Some(value) => self.scheduler.enabled = value,
                None => warn!(
                    variable = env_vars::SCHEDULER_ENABLED,
                    value = %enabled,
                    "Ignoring unparsable boolean"
                ),
            }
        }
        if let Some(interval) = lookup(env_vars::SCHEDULER_INTERVAL_MS) {
            match interval.trim().parse() {
                Ok(ms) => self.scheduler.tick_interval_ms = ms,
                Err(_) => warn!(
                    variable = env_vars::SCHEDULER_INTERVAL_MS,
                    value = %interval,
                    "Ignoring unparsable interval"
                ),
            }
        }
        if let Some(dir) = lookup(env_vars::DATA_DIR) {
            self.storage.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.broker.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "broker url must use ws:// or wss://, got '{}'",
                url
            )));
        }
        if self.broker.client_id_prefix.trim().is_empty() {
            return Err(Error::Config("client id prefix must not be empty".into()));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(Error::Config("scheduler tick interval must be positive".into()));
        }
        if self.scheduler.due_limit == 0 || self.scheduler.concurrency == 0 {
            return Err(Error::Config(
                "scheduler due_limit and concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
