//! Bootstrap configuration - seeds runtime state, then the running session owns it.

use serde::{Deserialize, Serialize};

/// Initial tempo and meter for a session's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Default: 120.0
    #[serde(default = "ClockConfig::default_beats_per_minute")]
    pub beats_per_minute: f64,

    /// `[numerator, denominator]`.
    /// Default: [4, 4]
    #[serde(default = "ClockConfig::default_time_signature")]
    pub time_signature: [u32; 2],

    /// Upper bound on a single wait of the clock loop.
    /// Default: 1000
    #[serde(default = "ClockConfig::default_slop_ms")]
    pub slop_ms: u64,
}

impl ClockConfig {
    fn default_beats_per_minute() -> f64 {
        120.0
    }

    fn default_time_signature() -> [u32; 2] {
        [4, 4]
    }

    fn default_slop_ms() -> u64 {
        1_000
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            beats_per_minute: Self::default_beats_per_minute(),
            time_signature: Self::default_time_signature(),
            slop_ms: Self::default_slop_ms(),
        }
    }
}

/// Complete bootstrap configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub clock: ClockConfig,
}
