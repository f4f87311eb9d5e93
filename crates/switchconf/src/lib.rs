//! Configuration loading for switchboard.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): the audio server executable, its
//!   network address and channel layout, timeouts, and log level. These are
//!   fixed once a server boots.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial clock tempo and meter. After
//!   startup the running session is the source of truth.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/switchboard/config.toml` (system)
//! 2. `~/.config/switchboard/config.toml` (user)
//! 3. `./switchboard.toml` (local override, replaced by an explicit path)
//! 4. Environment variables (`SWITCHBOARD_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! scsynth = "/usr/bin/scsynth"
//! synthdef_dir = "~/.local/share/switchboard/synthdefs"
//!
//! [server]
//! port = 57110
//! boot_timeout_ms = 5000
//!
//! [telemetry]
//! log_level = "switchboard=debug,info"
//!
//! [bootstrap.clock]
//! beats_per_minute = 96.0
//! time_signature = [7, 8]
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, ClockConfig};
pub use infra::{InfraConfig, PathsConfig, ServerConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

/// Complete switchboard configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Infrastructure - fixed once a server boots.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl SwitchConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local `./switchboard.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table_from_file(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::parse_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        Ok(format!("# switchboard configuration\n\n{body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SwitchConfig::default();
        assert_eq!(config.infra.server.port, 57110);
        assert_eq!(config.bootstrap.clock.time_signature, [4, 4]);
    }

    #[test]
    fn test_to_toml_round_trips_sections() {
        let config = SwitchConfig::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[server]"));
        assert!(text.contains("[bootstrap.clock]"));

        let parsed: SwitchConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[server]\nport = 57999\n\n[bootstrap.clock]\nbeats_per_minute = 90.0\n",
        )
        .unwrap();

        let (config, sources) = SwitchConfig::load_with_sources_from(Some(&path)).unwrap();
        assert_eq!(config.infra.server.port, 57999);
        assert_eq!(config.bootstrap.clock.beats_per_minute, 90.0);
        assert_eq!(sources.files.last(), Some(&path));
    }
}
