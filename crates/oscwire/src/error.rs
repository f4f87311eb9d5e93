use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by transports, launchers and reply parsing.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("OSC codec error: {0}")]
    Codec(String),

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        after: Duration,
        waiting_for: String,
    },

    #[error("server replied /fail to {command}: {message}")]
    Failed { command: String, message: String },

    #[error("malformed {address} reply: {reason}")]
    Malformed { address: String, reason: String },

    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("server process exited before reporting ready")]
    ProcessExited,

    #[error("server reported a boot failure: {0}")]
    BootFailed(String),
}

impl WireError {
    pub(crate) fn codec(err: rosc::OscError) -> Self {
        WireError::Codec(format!("{err:?}"))
    }

    pub(crate) fn malformed(address: &str, reason: impl Into<String>) -> Self {
        WireError::Malformed {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}
