//! Resource process configuration (§10). Loaded from layered defaults, an
//! optional TOML file, and `RESOURCED_`-prefixed environment variables by
//! `crate::config::load`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/entigrid")
}

fn default_instance_id() -> String {
    String::from("default")
}

const fn default_max_in_flight_commands() -> usize {
    64
}

const fn default_command_timeout_ms() -> u64 {
    30_000
}

const fn default_backoff_initial_ms() -> u64 {
    50
}

const fn default_backoff_max_attempts() -> u32 {
    20
}

const fn default_cleanup_idle_interval_ms() -> u64 {
    60_000
}

const fn default_outbound_channel_capacity() -> usize {
    256
}

/// Process-wide configuration for one resource instance, mirroring the
/// reference codebase's `ServerConfig`/`NetworkConfig` split: broad tunables
/// live here, per-connection ones under `outbound_channel_capacity`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_max_in_flight_commands")]
    pub max_in_flight_commands: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_attempts")]
    pub backoff_max_attempts: u32,
    #[serde(default = "default_cleanup_idle_interval_ms")]
    pub cleanup_idle_interval_ms: u64,
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
    pub metrics_listen_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            instance_id: default_instance_id(),
            socket_path: None,
            max_in_flight_commands: default_max_in_flight_commands(),
            command_timeout_ms: default_command_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_attempts: default_backoff_max_attempts(),
            cleanup_idle_interval_ms: default_cleanup_idle_interval_ms(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
            metrics_listen_addr: None,
        }
    }
}

impl ServerConfig {
    /// Resolves the listener socket path, honoring an explicit override.
    #[must_use]
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.storage_root.join(&self.instance_id).join("socket"))
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[must_use]
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    #[must_use]
    pub fn cleanup_idle_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_idle_interval_ms)
    }
}
