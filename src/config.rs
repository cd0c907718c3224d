//! Configuration module for HeartBeats.
//!
//! Loads configuration from environment variables, read once at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ipc::ConnectionOptions;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Unix socket the RPC server listens on (`SOCKET_PATH`, required)
    pub socket_path: PathBuf,
    /// SQLite database file (`DB_PATH`, required)
    pub db_path: PathBuf,
    /// Append logs here instead of stdout (`LOG_PATH`)
    pub log_path: Option<PathBuf>,
    /// `MODE=debug`
    pub debug: bool,
    /// Parent process to watch (`PID`)
    pub parent_pid: Option<u32>,
    /// Probe cycle interval (`HEARTBEATS_PING_INTERVAL_SECS`, default: 30)
    pub ping_interval: Duration,
    /// Idle connection timeout (`HEARTBEATS_IDLE_TIMEOUT_SECS`, default: 1800)
    pub idle_timeout: Duration,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let socket_path = get("SOCKET_PATH").ok_or(ConfigError::Missing("SOCKET_PATH"))?;
        let db_path = get("DB_PATH").ok_or(ConfigError::Missing("DB_PATH"))?;

        let parent_pid = get("PID")
            .map(|v| parse_number::<u32>("PID", &v))
            .transpose()?;

        let ping_interval = match get("HEARTBEATS_PING_INTERVAL_SECS") {
            Some(v) => parse_secs("HEARTBEATS_PING_INTERVAL_SECS", &v)?,
            None => Duration::from_secs(30),
        };

        let idle_timeout = match get("HEARTBEATS_IDLE_TIMEOUT_SECS") {
            Some(v) => parse_secs("HEARTBEATS_IDLE_TIMEOUT_SECS", &v)?,
            None => Duration::from_secs(1800),
        };

        Ok(Self {
            socket_path: PathBuf::from(socket_path),
            db_path: PathBuf::from(db_path),
            log_path: get("LOG_PATH").map(PathBuf::from),
            debug: get("MODE").is_some_and(|m| m.eq_ignore_ascii_case("debug")),
            parent_pid,
            ping_interval,
            idle_timeout,
        })
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            idle_timeout: self.idle_timeout,
            ..ConnectionOptions::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

/// Whole seconds, at least one.
fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_number::<u64>(var, value)? {
        0 => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}
