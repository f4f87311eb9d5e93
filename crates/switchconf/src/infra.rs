//! Infrastructure configuration - things that cannot change once a server boots.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations for the audio server and its synth definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Audio server executable, resolved through `PATH` when relative.
    /// Default: scsynth
    #[serde(default = "PathsConfig::default_scsynth")]
    pub scsynth: PathBuf,

    /// Directory holding precompiled `.scsyndef` files for `/d_load`.
    /// Default: ~/.local/share/switchboard/synthdefs
    #[serde(default = "PathsConfig::default_synthdef_dir")]
    pub synthdef_dir: PathBuf,
}

impl PathsConfig {
    fn default_scsynth() -> PathBuf {
        PathBuf::from("scsynth")
    }

    fn default_synthdef_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/switchboard/synthdefs"))
            .unwrap_or_else(|| PathBuf::from(".local/share/switchboard/synthdefs"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scsynth: Self::default_scsynth(),
            synthdef_dir: Self::default_synthdef_dir(),
        }
    }
}

/// Options handed to every audio server process a session boots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Default: 127.0.0.1
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,

    /// UDP port of the first context. Additional contexts pick free ports.
    /// Default: 57110
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,

    #[serde(default = "ServerConfig::default_channels")]
    pub input_channels: u32,

    #[serde(default = "ServerConfig::default_channels")]
    pub output_channels: u32,

    /// Default: 1024
    #[serde(default = "ServerConfig::default_audio_bus_channels")]
    pub audio_bus_channels: u32,

    /// Default: 16384
    #[serde(default = "ServerConfig::default_control_bus_channels")]
    pub control_bus_channels: u32,

    #[serde(default = "ServerConfig::default_buffers")]
    pub buffers: u32,

    #[serde(default = "ServerConfig::default_max_nodes")]
    pub max_nodes: u32,

    /// How long to wait for the readiness banner.
    /// Default: 10000
    #[serde(default = "ServerConfig::default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    /// How long to wait for `/synced`, `/done` and query replies.
    /// Default: 2000
    #[serde(default = "ServerConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Delay between gating an active group and freeing it.
    /// Default: 100
    #[serde(default = "ServerConfig::default_release_grace_ms")]
    pub release_grace_ms: u64,
}

impl ServerConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        57110
    }

    fn default_channels() -> u32 {
        8
    }

    fn default_audio_bus_channels() -> u32 {
        1024
    }

    fn default_control_bus_channels() -> u32 {
        16384
    }

    fn default_buffers() -> u32 {
        1024
    }

    fn default_max_nodes() -> u32 {
        1024
    }

    fn default_boot_timeout_ms() -> u64 {
        10_000
    }

    fn default_reply_timeout_ms() -> u64 {
        2_000
    }

    fn default_release_grace_ms() -> u64 {
        100
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            input_channels: Self::default_channels(),
            output_channels: Self::default_channels(),
            audio_bus_channels: Self::default_audio_bus_channels(),
            control_bus_channels: Self::default_control_bus_channels(),
            buffers: Self::default_buffers(),
            max_nodes: Self::default_max_nodes(),
            boot_timeout_ms: Self::default_boot_timeout_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
            release_grace_ms: Self::default_release_grace_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an EnvFilter string).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Complete infrastructure configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 57110);
        assert_eq!(server.input_channels + server.output_channels, 16);
        assert_eq!(server.control_bus_channels, 16384);
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let infra: InfraConfig = toml::from_str("[server]\nport = 57200\n").unwrap();
        assert_eq!(infra.server.port, 57200);
        assert_eq!(infra.server.host, "127.0.0.1");
        assert_eq!(infra.telemetry.log_level, "info");
    }
}
