//! Events, commands and the procedures they carry.

use crate::clock::Clock;
use crate::time::{Moment, Quantization, TimeSignature, TimeUnit};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Identifier handed out by every schedule call. Unique for the clock's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event-{}", self.0)
    }
}

/// Kind of a due event. Changes sort ahead of callbacks at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Change = 0,
    Callback = 1,
}

/// What a callback sees when it is performed.
#[derive(Clone)]
pub struct CallbackContext {
    pub event_id: EventId,
    /// Clock position when the callback started.
    pub current: Moment,
    /// Position the callback was scheduled for.
    pub desired: Moment,
    pub clock: Clock,
}

/// Returned by a callback to run again, `delta` units after its desired moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reschedule {
    pub delta: f64,
    pub time_unit: TimeUnit,
}

impl Reschedule {
    pub fn beats(delta: f64) -> Self {
        Self {
            delta,
            time_unit: TimeUnit::Beats,
        }
    }

    pub fn measures(delta: f64) -> Self {
        Self {
            delta,
            time_unit: TimeUnit::Measures,
        }
    }

    pub fn seconds(delta: f64) -> Self {
        Self {
            delta,
            time_unit: TimeUnit::Seconds,
        }
    }
}

pub type ProcedureResult = anyhow::Result<Option<Reschedule>>;

type ProcedureFn = dyn Fn(CallbackContext) -> BoxFuture<'static, ProcedureResult> + Send + Sync;

/// A schedulable callback. Arguments travel inside the closure.
#[derive(Clone)]
pub struct Procedure(Arc<ProcedureFn>);

impl Procedure {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcedureResult> + Send + 'static,
    {
        Self(Arc::new(move |context| f(context).boxed()))
    }

    /// Wrap a plain closure that finishes without suspending.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&CallbackContext) -> ProcedureResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self(Arc::new(move |context| {
            let f = Arc::clone(&f);
            async move { f(&context) }.boxed()
        }))
    }

    pub(crate) fn invoke(&self, context: CallbackContext) -> BoxFuture<'static, ProcedureResult> {
        (self.0)(context)
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Procedure(..)")
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Action {
    Callback(Procedure),
    Change {
        beats_per_minute: Option<f64>,
        time_signature: Option<TimeSignature>,
    },
}

impl Action {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Action::Callback(_) => EventKind::Callback,
            Action::Change { .. } => EventKind::Change,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Timing {
    At { schedule_at: f64, time_unit: TimeUnit },
    /// Snap to the grid at the moment the command is drained; `None` means now.
    Cue(Option<Quantization>),
}

/// Submitted by a caller, not yet resolved against the tempo map.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub id: EventId,
    pub action: Action,
    pub timing: Timing,
}

/// How a due event follows tempo and meter changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Anchor {
    /// Fixed in clock time.
    Seconds,
    /// Fixed in beats; seconds move with tempo.
    Offset,
    /// Fixed at a measure position; offset moves with meter.
    Measure(f64),
}

/// A command resolved to concrete due times, resident in the queue.
#[derive(Debug, Clone)]
pub(crate) struct Event {
    pub id: EventId,
    pub action: Action,
    pub seconds: f64,
    pub offset: f64,
    pub anchor: Anchor,
}

impl Event {
    pub(crate) fn kind(&self) -> EventKind {
        self.action.kind()
    }

    /// Back to a command carrying the same musical position.
    pub(crate) fn into_command(self) -> Command {
        let timing = match self.anchor {
            Anchor::Seconds => Timing::At {
                schedule_at: self.seconds,
                time_unit: TimeUnit::Seconds,
            },
            Anchor::Offset => Timing::At {
                schedule_at: self.offset,
                time_unit: TimeUnit::Beats,
            },
            Anchor::Measure(measure) => Timing::At {
                schedule_at: measure,
                time_unit: TimeUnit::Measures,
            },
        };
        Command {
            id: self.id,
            action: self.action,
            timing,
        }
    }
}
