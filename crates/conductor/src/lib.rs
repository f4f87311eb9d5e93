//! conductor: a tempo-relative logical clock.
//!
//! Callers schedule callbacks and tempo/meter changes in beats, measures,
//! seconds or on a quantized grid. A single cooperative loop task converts
//! those requests into due times through the [`TempoMap`] and performs them
//! in order, one at a time.

pub mod clock;
pub mod event;
mod queue;
pub mod tempo;
pub mod time;

pub use clock::{Cancelled, Clock, ClockOptions, StartOptions};
pub use event::{CallbackContext, EventId, EventKind, Procedure, ProcedureResult, Reschedule};
pub use tempo::{TempoMap, TempoRegime};
pub use time::{Moment, Quantization, TimeSignature, TimeUnit};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    #[error("clock is already running")]
    AlreadyRunning,

    #[error("tempo must be finite and positive, got {0}")]
    InvalidTempo(f64),

    #[error("invalid time signature {numerator}/{denominator}")]
    InvalidTimeSignature { numerator: u32, denominator: u32 },

    #[error("schedule time must be finite, got {0}")]
    NonFinite(f64),

    #[error("invalid quantization {0:?}, expected one of 8M 4M 2M 1M 1/2 .. 1/128")]
    InvalidQuantization(String),
}

pub(crate) fn check_tempo(beats_per_minute: f64) -> Result<f64, ClockError> {
    if beats_per_minute.is_finite() && beats_per_minute > 0.0 {
        Ok(beats_per_minute)
    } else {
        Err(ClockError::InvalidTempo(beats_per_minute))
    }
}

pub(crate) fn check_finite(value: f64) -> Result<f64, ClockError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ClockError::NonFinite(value))
    }
}
