use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ChimeError, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Sentinel instance id: a fresh UUID is generated per process.
pub const AUTO_INSTANCE_ID: &str = "AUTO";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;
pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_HANDLER: &str = "log";

/// Top-level config (chime.toml + CHIME_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Identity of this cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique per running process. `AUTO` generates a UUID at startup;
    /// two live nodes must never share an explicit id.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
        }
    }
}

impl NodeConfig {
    /// The effective instance id, resolving `AUTO`.
    pub fn resolve_instance_id(&self) -> String {
        if self.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) || self.instance_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.instance_id.clone()
        }
    }
}

/// Shared SQLite database. Every node of a cluster points at the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before the store
    /// reports the backend as unavailable.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Dispatch loop, cluster lock and worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lifetime of the dispatch and liveness locks without a heartbeat.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Must be strictly less than `lock_ttl_secs`; a third of it or less is recommended.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Upper bound for the retry back-off when the store is unavailable.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Handler used when a create request does not name one.
    #[serde(default = "default_handler")]
    pub default_handler: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            default_handler: default_handler(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Reject settings under which the cluster lock cannot be held safely.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ChimeError::Config(
                "scheduler.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.handler_timeout_secs == 0 {
            return Err(ChimeError::Config(
                "scheduler.handler_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(ChimeError::Config(
                "scheduler.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_interval_secs >= self.lock_ttl_secs {
            return Err(ChimeError::Config(format!(
                "scheduler.heartbeat_interval_secs ({}) must be > 0 and < lock_ttl_secs ({})",
                self.heartbeat_interval_secs, self.lock_ttl_secs
            )));
        }
        if self.lock_ttl_secs < 3 * self.heartbeat_interval_secs {
            warn!(
                ttl = self.lock_ttl_secs,
                heartbeat = self.heartbeat_interval_secs,
                "lock TTL is less than 3x the heartbeat interval; a slow node may lose the dispatch lock mid-cycle"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}
fn default_handler_timeout_secs() -> u64 {
    DEFAULT_HANDLER_TIMEOUT_SECS
}
fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}
fn default_handler() -> String {
    DEFAULT_HANDLER.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

impl ChimeConfig {
    /// Load config from a TOML file with CHIME_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CHIME_SCHEDULER__POLL_INTERVAL_MS=500`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChimeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHIME_").split("__"))
            .extract()
            .map_err(|e| ChimeError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            return Err(ChimeError::Config("gateway.port must be non-zero".to_string()));
        }
        self.scheduler.validate()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.toml", home)
}
