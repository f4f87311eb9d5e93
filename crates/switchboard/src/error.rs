use crate::bus::Rate;
use crate::context::BootStatus;
use conductor::ClockError;
use oscwire::WireError;
use thiserror::Error;

/// Errors raised by session and mixer operations.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("{address} cannot be moved inside itself")]
    SelfParenting { address: String },

    #[error("{address} cannot route to itself")]
    SelfRouting { address: String },

    #[error("{address} and {other} belong to different mixers")]
    CrossMixer { address: String, other: String },

    #[error("session is {actual}, expected {expected}")]
    InvalidStatus {
        expected: BootStatus,
        actual: BootStatus,
    },

    #[error("unknown component")]
    UnknownComponent,

    #[error("component is not a {expected}")]
    WrongKind { expected: &'static str },

    #[error("unknown context")]
    UnknownContext,

    #[error("{address} could not allocate after {attempts} attempts")]
    AllocationStuck { address: String, attempts: u32 },

    #[error("out of {rate} buses (wanted {count})")]
    Exhausted { rate: Rate, count: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("context is not online")]
    ContextOffline,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Clock(#[from] ClockError),
}

pub type Result<T, E = SwitchboardError> = std::result::Result<T, E>;
