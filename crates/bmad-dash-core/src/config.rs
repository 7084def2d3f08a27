//! Server-scoped scheduling parameters.
//!
//! The registry and supervisor consume a small set of numeric knobs loaded
//! once at construction from `server.yaml` in the config directory. The file
//! is read-only as far as this crate is concerned; a missing file yields the
//! documented defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default maximum number of simultaneously running loops.
pub const DEFAULT_MAX_CONCURRENT_LOOPS: usize = 2;

/// Default maximum admission queue size.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10;

/// Default seconds to wait for a graceful subprocess stop.
pub const DEFAULT_SUBPROCESS_TIMEOUT_SECS: u64 = 30;

/// Default per-project log ring buffer capacity.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 500;

/// Name of the scheduling-parameters file inside the config directory.
pub const SERVER_CONFIG_FILE: &str = "server.yaml";

/// Errors loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading the file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse the file.
    #[error("Failed to parse server config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Scheduling parameters for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum simultaneously running loops.
    #[serde(default = "default_max_concurrent_loops")]
    pub max_concurrent_loops: usize,

    /// Maximum admission queue size.
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    /// Seconds to wait for a graceful subprocess stop before escalating.
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_seconds: u64,

    /// Per-project log ring buffer capacity.
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,
}

fn default_max_concurrent_loops() -> usize {
    DEFAULT_MAX_CONCURRENT_LOOPS
}

fn default_queue_max_size() -> usize {
    DEFAULT_QUEUE_MAX_SIZE
}

fn default_subprocess_timeout() -> u64 {
    DEFAULT_SUBPROCESS_TIMEOUT_SECS
}

fn default_log_buffer_size() -> usize {
    DEFAULT_LOG_BUFFER_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loops: DEFAULT_MAX_CONCURRENT_LOOPS,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            subprocess_timeout_seconds: DEFAULT_SUBPROCESS_TIMEOUT_SECS,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
        }
    }
}

/// On-disk shape of `server.yaml`: parameters nested under a `server:` key.
#[derive(Debug, Default, Deserialize)]
struct ServerConfigFile {
    #[serde(default)]
    server: Option<ServerConfig>,
}

impl ServerConfig {
    /// Loads the configuration from `<config_dir>/server.yaml`.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(SERVER_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        let file: ServerConfigFile = serde_yaml::from_str(&contents)?;
        let config = file.server.unwrap_or_default();

        info!(
            max_concurrent = config.max_concurrent_loops,
            queue_max = config.queue_max_size,
            "Loaded server config"
        );
        Ok(config)
    }
}

/// Default config directory: `~/.config/bmad-dash` (XDG), falling back to
/// a relative `.bmad-dash` when no home directory can be resolved.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("bmad-dash"))
        .unwrap_or_else(|| PathBuf::from(".bmad-dash"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_file_missing() {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::load(temp.path()).unwrap();

        assert_eq!(config.max_concurrent_loops, 2);
        assert_eq!(config.queue_max_size, 10);
        assert_eq!(config.subprocess_timeout_seconds, 30);
        assert_eq!(config.log_buffer_size, 500);
    }

    #[test]
    fn test_load_overrides() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(SERVER_CONFIG_FILE),
            "server:\n  max_concurrent_loops: 4\n  queue_max_size: 20\n",
        )
        .unwrap();

        let config = ServerConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_concurrent_loops, 4);
        assert_eq!(config.queue_max_size, 20);
        // Unspecified fields keep their defaults
        assert_eq!(config.subprocess_timeout_seconds, 30);
        assert_eq!(config.log_buffer_size, 500);
    }

    #[test]
    fn test_load_empty_server_section() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(SERVER_CONFIG_FILE), "server:\n").unwrap();

        let config = ServerConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_concurrent_loops, 2);
    }

    #[test]
    fn test_load_malformed_is_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(SERVER_CONFIG_FILE), "server: [not a map").unwrap();

        assert!(matches!(
            ServerConfig::load(temp.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
