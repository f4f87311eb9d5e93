//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, SwitchConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/switchboard/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("switchboard/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("switchboard.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in the overlay replaces the base value outright.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Turn a merged table into a typed config, filling gaps with defaults.
pub fn parse_table(table: toml::Table, origin: &Path) -> Result<SwitchConfig, ConfigError> {
    let mut config: SwitchConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    let paths = &mut config.infra.paths;
    paths.synthdef_dir = expand_path(&paths.synthdef_dir.to_string_lossy());
    paths.scsynth = expand_path(&paths.scsynth.to_string_lossy());
    Ok(config)
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SwitchConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("SWITCHBOARD_SCSYNTH") {
        config.infra.paths.scsynth = expand_path(&v);
        sources.env_overrides.push("SWITCHBOARD_SCSYNTH".to_string());
    }
    if let Ok(v) = env::var("SWITCHBOARD_SYNTHDEF_DIR") {
        config.infra.paths.synthdef_dir = expand_path(&v);
        sources
            .env_overrides
            .push("SWITCHBOARD_SYNTHDEF_DIR".to_string());
    }

    if let Ok(v) = env::var("SWITCHBOARD_HOST") {
        config.infra.server.host = v;
        sources.env_overrides.push("SWITCHBOARD_HOST".to_string());
    }
    if let Ok(v) = env::var("SWITCHBOARD_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.server.port = port;
            sources.env_overrides.push("SWITCHBOARD_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("SWITCHBOARD_BOOT_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.server.boot_timeout_ms = ms;
            sources
                .env_overrides
                .push("SWITCHBOARD_BOOT_TIMEOUT_MS".to_string());
        }
    }

    if let Ok(v) = env::var("SWITCHBOARD_BPM") {
        if let Ok(bpm) = v.parse() {
            config.bootstrap.clock.beats_per_minute = bpm;
            sources.env_overrides.push("SWITCHBOARD_BPM".to_string());
        }
    }

    if let Ok(v) = env::var("SWITCHBOARD_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("SWITCHBOARD_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over everything else
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            match env::var(var_name) {
                Ok(var_value) => PathBuf::from(var_value).join(&stripped[slash_pos + 1..]),
                Err(_) => PathBuf::from(path),
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/synthdefs");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("synthdefs"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/usr/bin/scsynth"), PathBuf::from("/usr/bin/scsynth"));
    }

    #[test]
    fn test_discover_config_files() {
        let _files = discover_config_files();
    }

    #[test]
    fn test_merge_keeps_untouched_keys() {
        let mut base = table("[server]\nport = 57110\nhost = \"10.0.0.2\"\n");
        merge_tables(&mut base, table("[server]\nport = 58000\n"));

        let config = parse_table(base, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.server.port, 58000);
        assert_eq!(config.infra.server.host, "10.0.0.2");
    }

    #[test]
    fn test_parse_full_toml() {
        let text = r#"
[paths]
scsynth = "/opt/sc/scsynth"
synthdef_dir = "/data/synthdefs"

[server]
port = 57120
output_channels = 2
boot_timeout_ms = 2500

[telemetry]
log_level = "debug"

[bootstrap.clock]
beats_per_minute = 140.0
time_signature = [7, 8]
"#;
        let config = parse_table(table(text), Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.paths.scsynth, PathBuf::from("/opt/sc/scsynth"));
        assert_eq!(config.infra.paths.synthdef_dir, PathBuf::from("/data/synthdefs"));
        assert_eq!(config.infra.server.port, 57120);
        assert_eq!(config.infra.server.output_channels, 2);
        assert_eq!(config.infra.server.input_channels, 8);
        assert_eq!(config.infra.server.boot_timeout_ms, 2500);
        assert_eq!(config.infra.telemetry.log_level, "debug");
        assert_eq!(config.bootstrap.clock.beats_per_minute, 140.0);
        assert_eq!(config.bootstrap.clock.time_signature, [7, 8]);
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        let err = parse_table(table("[server]\nport = \"loud\"\n"), Path::new("bad.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
