//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;

/// Task engine configuration.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Maximum number of tasks running at once (also sizes the blocking pool).
    pub max_concurrent_tasks: usize,
    /// Deadline applied when a task definition has no timeout of its own.
    pub default_timeout: Duration,
    /// Minimum interval between automatic (non-forced) checkpoints.
    pub checkpoint_interval: Duration,
    /// Interval of the completed-task cleanup sweep.
    pub cleanup_interval: Duration,
    /// Whether contexts get a checkpoint store at all.
    pub enable_checkpoints: bool,
    /// Root directory for checkpoint files.
    pub checkpoint_storage_path: PathBuf,
    /// Terminal results kept by the cleanup sweep (most recent first).
    pub retained_results: usize,
    /// Dispatch tick of the scheduler loop.
    pub scheduler_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            default_timeout: Duration::from_secs(900), // 15 minutes
            checkpoint_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            enable_checkpoints: true,
            checkpoint_storage_path: PathBuf::from("checkpoints"),
            retained_results: 100,
            scheduler_tick: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Overlay `AGENT_RUNTIME_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("AGENT_RUNTIME_MAX_CONCURRENT_TASKS")? {
            if v == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "AGENT_RUNTIME_MAX_CONCURRENT_TASKS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = env_secs("AGENT_RUNTIME_DEFAULT_TIMEOUT_SECS")? {
            config.default_timeout = v;
        }
        if let Some(v) = env_secs("AGENT_RUNTIME_CHECKPOINT_INTERVAL_SECS")? {
            config.checkpoint_interval = v;
        }
        if let Some(v) = env_secs("AGENT_RUNTIME_CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = v;
        }
        if let Some(v) = env_parse::<bool>("AGENT_RUNTIME_ENABLE_CHECKPOINTS")? {
            config.enable_checkpoints = v;
        }
        if let Ok(path) = std::env::var("AGENT_RUNTIME_CHECKPOINT_PATH") {
            config.checkpoint_storage_path = PathBuf::from(path);
        }
        if let Some(v) = env_parse::<usize>("AGENT_RUNTIME_RETAINED_RESULTS")? {
            config.retained_results = v;
        }
        Ok(config)
    }
}

/// Connection state manager configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionConfig {
    /// Interval of the heartbeat sweep.
    pub heartbeat_interval: Duration,
    /// Heartbeat (or connection) age after which a session is considered dead.
    pub connection_timeout: Duration,
    /// Reconnect attempts allowed before a timed-out session is evicted.
    pub max_reconnect_attempts: u32,
    /// Advisory delay between reconnect attempts, reported to transports.
    pub reconnect_delay: Duration,
    /// Whether timed-out sessions move to RECONNECTING instead of being evicted.
    pub enable_auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            enable_auto_reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Overlay `AGENT_RUNTIME_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_secs("AGENT_RUNTIME_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = v;
        }
        if let Some(v) = env_secs("AGENT_RUNTIME_CONNECTION_TIMEOUT_SECS")? {
            config.connection_timeout = v;
        }
        if let Some(v) = env_parse::<u32>("AGENT_RUNTIME_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("AGENT_RUNTIME_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<bool>("AGENT_RUNTIME_AUTO_RECONNECT")? {
            config.enable_auto_reconnect = v;
        }
        Ok(config)
    }

    /// Interval of the stale-connection sweep.
    pub fn cleanup_interval(&self) -> Duration {
        self.connection_timeout / 2
    }
}

/// Both subsystem configurations, as loaded by the binary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    pub connections: ConnectionConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::from_env()?,
            connections: ConnectionConfig::from_env()?,
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("{key}: {e}"))),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}
