//! Layered configuration loading for the resource process binary (§10).
//!
//! Precedence, lowest to highest: [`ServerConfig::default()`], an optional
//! TOML file, then `RESOURCED_`-prefixed environment variables. Each layer
//! only overrides the fields it actually sets.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::service::config::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Loads a [`ServerConfig`], applying the file then the environment on top
/// of built-in defaults.
///
/// # Errors
///
/// Returns [`ConfigError`] if `config_path` is given but unreadable or not
/// valid TOML, or if a recognized `RESOURCED_*` environment variable holds
/// a value of the wrong type.
pub fn load(config_path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match config_path {
        Some(path) => load_file(path)?,
        None => ServerConfig::default(),
    };
    apply_env(&mut config)?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

fn apply_env(config: &mut ServerConfig) -> Result<(), ConfigError> {
    if let Some(v) = env_var("RESOURCED_STORAGE_ROOT") {
        config.storage_root = PathBuf::from(v);
    }
    if let Some(v) = env_var("RESOURCED_INSTANCE_ID") {
        config.instance_id = v;
    }
    if let Some(v) = env_var("RESOURCED_SOCKET_PATH") {
        config.socket_path = Some(PathBuf::from(v));
    }
    if let Some(v) = parse_env("RESOURCED_MAX_IN_FLIGHT_COMMANDS")? {
        config.max_in_flight_commands = v;
    }
    if let Some(v) = parse_env("RESOURCED_COMMAND_TIMEOUT_MS")? {
        config.command_timeout_ms = v;
    }
    if let Some(v) = parse_env("RESOURCED_BACKOFF_INITIAL_MS")? {
        config.backoff_initial_ms = v;
    }
    if let Some(v) = parse_env("RESOURCED_BACKOFF_MAX_ATTEMPTS")? {
        config.backoff_max_attempts = v;
    }
    if let Some(v) = parse_env("RESOURCED_CLEANUP_IDLE_INTERVAL_MS")? {
        config.cleanup_idle_interval_ms = v;
    }
    if let Some(v) = parse_env("RESOURCED_OUTBOUND_CHANNEL_CAPACITY")? {
        config.outbound_channel_capacity = v;
    }
    if let Some(v) = env_var("RESOURCED_METRICS_LISTEN_ADDR") {
        let addr: SocketAddr = v.parse().map_err(|_| ConfigError::InvalidEnv { var: "RESOURCED_METRICS_LISTEN_ADDR", value: v })?;
        config.metrics_listen_addr = Some(addr);
    }
    Ok(())
}

fn env_var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var: name, value: v }),
        None => Ok(None),
    }
}
