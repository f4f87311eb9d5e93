//! The clock: command buffer, due-queue and the cooperative loop task.
//!
//! Callers submit commands from any task. The loop resolves them against the
//! tempo map only at checkpoints (before peeking, and between performed
//! events), then sleeps until the earliest event is due. Sleeps are bounded
//! by `slop` and interrupted by the wake signal whenever a command arrives.

use crate::event::{
    Action, Anchor, CallbackContext, Command, Event, EventId, EventKind, Procedure, Timing,
};
use crate::queue::EventQueue;
use crate::tempo::TempoMap;
use crate::time::{Moment, Quantization, TimeSignature, TimeUnit};
use crate::{check_finite, check_tempo, ClockError};
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Events within this many seconds of now count as due.
const DUE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOptions {
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
    /// Longest single sleep before the loop re-checks its queue.
    pub slop: Duration,
}

impl Default for ClockOptions {
    fn default() -> Self {
        Self {
            beats_per_minute: 120.0,
            time_signature: TimeSignature::default(),
            slop: Duration::from_secs(1),
        }
    }
}

/// Arguments to [`Clock::start`]. Unset tempo and meter fall back to the
/// clock's defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartOptions {
    /// Clock time of `initial_offset`; defaults to now.
    pub initial_time: Option<f64>,
    pub initial_offset: f64,
    pub initial_measure: i64,
    pub beats_per_minute: Option<f64>,
    pub time_signature: Option<TimeSignature>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            initial_time: None,
            initial_offset: 0.0,
            initial_measure: 1,
            beats_per_minute: None,
            time_signature: None,
        }
    }
}

/// What a successful [`Clock::cancel`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled {
    pub event_id: EventId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Seconds elapsed since `epoch`.
    Realtime { epoch: Instant },
    /// Virtual time that jumps straight to the next due event.
    Offline,
}

struct ClockState {
    running: bool,
    stopping: bool,
    beats_per_minute: f64,
    time_signature: TimeSignature,
    tempo: TempoMap,
    commands: VecDeque<Command>,
    queue: EventQueue,
    in_flight: Option<EventId>,
    in_flight_cancelled: bool,
    virtual_now: f64,
}

struct Shared {
    state: Mutex<ClockState>,
    wake: Notify,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    mode: Mode,
    slop: Duration,
}

/// Handle to a logical clock. Clones share the same clock.
#[derive(Clone)]
pub struct Clock {
    shared: Arc<Shared>,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Clock")
            .field("mode", &self.shared.mode)
            .field("running", &state.running)
            .field("commands", &state.commands.len())
            .field("events", &state.queue.len())
            .finish()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// A realtime clock at 120 bpm in 4/4.
    pub fn new() -> Self {
        Self::build(
            ClockOptions::default(),
            Mode::Realtime {
                epoch: Instant::now(),
            },
        )
    }

    pub fn with_options(options: ClockOptions) -> Result<Self, ClockError> {
        check_tempo(options.beats_per_minute)?;
        Ok(Self::build(
            options,
            Mode::Realtime {
                epoch: Instant::now(),
            },
        ))
    }

    /// A clock in virtual time. Once started it performs everything queued
    /// as fast as possible and stops when nothing is left.
    pub fn offline(options: ClockOptions) -> Result<Self, ClockError> {
        check_tempo(options.beats_per_minute)?;
        Ok(Self::build(options, Mode::Offline))
    }

    fn build(options: ClockOptions, mode: Mode) -> Self {
        let state = ClockState {
            running: false,
            stopping: false,
            beats_per_minute: options.beats_per_minute,
            time_signature: options.time_signature,
            tempo: TempoMap::new(
                0.0,
                0.0,
                1,
                options.beats_per_minute,
                options.time_signature,
            ),
            commands: VecDeque::new(),
            queue: EventQueue::default(),
            in_flight: None,
            in_flight_cancelled: false,
            virtual_now: 0.0,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Notify::new(),
                next_id: AtomicU64::new(0),
                task: Mutex::new(None),
                mode,
                slop: options.slop,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self, state: &ClockState) -> f64 {
        match self.shared.mode {
            Mode::Realtime { epoch } => epoch.elapsed().as_secs_f64(),
            Mode::Offline => state.virtual_now,
        }
    }

    /// Current clock time in seconds.
    pub fn current_time(&self) -> f64 {
        let state = self.state();
        self.now(&state)
    }

    /// Current position through the tempo map.
    pub fn moment(&self) -> Moment {
        let state = self.state();
        let now = self.now(&state);
        state.tempo.moment_at_seconds(now)
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn tempo_map(&self) -> TempoMap {
        self.state().tempo.clone()
    }

    /// Install a fresh tempo map and spawn the loop task. Commands submitted
    /// while stopped are resolved on the loop's first pass.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, options: StartOptions) -> Result<(), ClockError> {
        if let Some(bpm) = options.beats_per_minute {
            check_tempo(bpm)?;
        }
        if let Some(time) = options.initial_time {
            check_finite(time)?;
        }
        check_finite(options.initial_offset)?;

        {
            let mut state = self.state();
            if state.running {
                return Err(ClockError::AlreadyRunning);
            }
            let beats_per_minute = options.beats_per_minute.unwrap_or(state.beats_per_minute);
            let time_signature = options.time_signature.unwrap_or(state.time_signature);
            if matches!(self.shared.mode, Mode::Offline) {
                state.virtual_now = options.initial_time.unwrap_or(0.0);
            }
            let initial_time = options.initial_time.unwrap_or_else(|| self.now(&state));

            state.beats_per_minute = beats_per_minute;
            state.time_signature = time_signature;
            state.tempo = TempoMap::new(
                initial_time,
                options.initial_offset,
                options.initial_measure,
                beats_per_minute,
                time_signature,
            );
            state.running = true;
            state.stopping = false;
            debug!(
                initial_time,
                beats_per_minute,
                %time_signature,
                pending = state.commands.len(),
                "clock starting"
            );
        }

        let handle = tokio::spawn(self.clone().run());
        *self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Ask the loop to stop after any in-flight callback finishes. Safe to
    /// call from inside a callback.
    pub fn request_stop(&self) {
        let mut state = self.state();
        if state.running {
            state.stopping = true;
            drop(state);
            self.shared.wake.notify_one();
        }
    }

    /// Wait for the loop task to exit.
    pub async fn join(&self) {
        let handle = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("clock loop task failed: {}", e);
            }
        }
    }

    /// Stop and wait for the loop. A no-op when already stopped. Queued
    /// events are kept and resolved again on the next start.
    pub async fn stop(&self) {
        self.request_stop();
        self.join().await;
    }

    fn next_id(&self) -> EventId {
        EventId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, action: Action, timing: Timing) -> EventId {
        let id = self.next_id();
        self.state().commands.push_back(Command { id, action, timing });
        self.shared.wake.notify_one();
        id
    }

    /// Run `procedure` at `schedule_at`, measured in `time_unit`.
    pub fn schedule(
        &self,
        procedure: Procedure,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<EventId, ClockError> {
        check_finite(schedule_at)?;
        Ok(self.submit(
            Action::Callback(procedure),
            Timing::At {
                schedule_at,
                time_unit,
            },
        ))
    }

    /// Change tempo and/or meter at `schedule_at`.
    pub fn schedule_change(
        &self,
        beats_per_minute: Option<f64>,
        time_signature: Option<TimeSignature>,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<EventId, ClockError> {
        check_finite(schedule_at)?;
        if let Some(bpm) = beats_per_minute {
            check_tempo(bpm)?;
        }
        Ok(self.submit(
            Action::Change {
                beats_per_minute,
                time_signature,
            },
            Timing::At {
                schedule_at,
                time_unit,
            },
        ))
    }

    /// Run `procedure` at the next grid point, or immediately without one.
    pub fn cue(
        &self,
        procedure: Procedure,
        quantization: Option<Quantization>,
    ) -> Result<EventId, ClockError> {
        Ok(self.submit(Action::Callback(procedure), Timing::Cue(quantization)))
    }

    pub fn cue_change(
        &self,
        beats_per_minute: Option<f64>,
        time_signature: Option<TimeSignature>,
        quantization: Option<Quantization>,
    ) -> Result<EventId, ClockError> {
        if let Some(bpm) = beats_per_minute {
            check_tempo(bpm)?;
        }
        Ok(self.submit(
            Action::Change {
                beats_per_minute,
                time_signature,
            },
            Timing::Cue(quantization),
        ))
    }

    /// Change tempo and/or meter now. While stopped this edits the defaults
    /// the next start uses and returns `None`.
    pub fn change(
        &self,
        beats_per_minute: Option<f64>,
        time_signature: Option<TimeSignature>,
    ) -> Result<Option<EventId>, ClockError> {
        if let Some(bpm) = beats_per_minute {
            check_tempo(bpm)?;
        }
        {
            let mut state = self.state();
            if !state.running {
                if let Some(bpm) = beats_per_minute {
                    state.beats_per_minute = bpm;
                }
                if let Some(meter) = time_signature {
                    state.time_signature = meter;
                }
                return Ok(None);
            }
        }
        self.cue_change(beats_per_minute, time_signature, None)
            .map(Some)
    }

    /// Remove a pending command or due event. An in-flight callback keeps
    /// running but will not repeat.
    pub fn cancel(&self, event_id: EventId) -> Option<Cancelled> {
        let mut guard = self.state();
        let state = &mut *guard;
        let buffered = state.commands.iter().position(|c| c.id == event_id);
        let kind = match buffered {
            Some(position) => state.commands.remove(position).map(|c| c.action.kind()),
            None => match state.queue.remove(event_id) {
                Some(event) => Some(event.kind()),
                None if state.in_flight == Some(event_id) => {
                    state.in_flight_cancelled = true;
                    Some(EventKind::Callback)
                }
                None => None,
            },
        };
        drop(guard);

        if kind.is_some() {
            self.shared.wake.notify_one();
        }
        kind.map(|kind| Cancelled { event_id, kind })
    }

    /// Move a pending command or due event to a new time, keeping its id
    /// and procedure. Returns `None` when the id is not resident.
    pub fn reschedule(
        &self,
        event_id: EventId,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<Option<EventId>, ClockError> {
        check_finite(schedule_at)?;
        let timing = Timing::At {
            schedule_at,
            time_unit,
        };
        let mut guard = self.state();
        let state = &mut *guard;
        let buffered = state.commands.iter().position(|c| c.id == event_id);
        let found = match buffered {
            Some(position) => {
                state.commands[position].timing = timing;
                true
            }
            None => match state.queue.remove(event_id) {
                Some(event) => {
                    state.commands.push_back(Command {
                        id: event.id,
                        action: event.action,
                        timing,
                    });
                    true
                }
                None => false,
            },
        };
        drop(guard);

        if found {
            self.shared.wake.notify_one();
        }
        Ok(found.then_some(event_id))
    }

    async fn run(self) {
        loop {
            let next_due = {
                let mut state = self.state();
                let now = self.now(&state);
                resolve_commands(&mut state, now);
                if state.stopping {
                    break;
                }
                state.queue.peek().map(|event| event.seconds)
            };

            let Some(due) = next_due else {
                match self.shared.mode {
                    Mode::Offline => break,
                    Mode::Realtime { .. } => {
                        self.shared.wake.notified().await;
                        continue;
                    }
                }
            };

            match self.shared.mode {
                Mode::Offline => {
                    let mut state = self.state();
                    if due > state.virtual_now {
                        state.virtual_now = due;
                    }
                }
                Mode::Realtime { epoch } => {
                    let now = epoch.elapsed().as_secs_f64();
                    if due > now + DUE_TOLERANCE {
                        let wait = Duration::from_secs_f64(due - now).min(self.shared.slop);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.shared.wake.notified() => {}
                        }
                        continue;
                    }
                }
            }

            self.perform_due().await;
        }

        let mut state = self.state();
        let demoted: Vec<Command> = state
            .queue
            .drain()
            .into_iter()
            .map(Event::into_command)
            .collect();
        for command in demoted.into_iter().rev() {
            state.commands.push_front(command);
        }
        state.running = false;
        state.stopping = false;
        debug!(pending = state.commands.len(), "clock stopped");
    }

    /// Perform every event that is due now, one at a time, picking up new
    /// commands between each.
    async fn perform_due(&self) {
        loop {
            let (procedure, context) = {
                let mut state = self.state();
                let now = self.now(&state);
                resolve_commands(&mut state, now);
                if state.stopping {
                    return;
                }
                let Some(event) = state.queue.pop_due(now + DUE_TOLERANCE) else {
                    return;
                };

                let procedure = match &event.action {
                    Action::Change {
                        beats_per_minute,
                        time_signature,
                    } => {
                        let (bpm, meter) = (*beats_per_minute, *time_signature);
                        apply_change(&mut state, event, bpm, meter);
                        continue;
                    }
                    Action::Callback(procedure) => procedure.clone(),
                };

                let desired = match event.anchor {
                    Anchor::Seconds => state.tempo.moment_at_seconds(event.seconds),
                    _ => state.tempo.moment_at_offset(event.offset),
                };
                let context = CallbackContext {
                    event_id: event.id,
                    current: state.tempo.moment_at_seconds(now),
                    desired,
                    clock: self.clone(),
                };
                state.in_flight = Some(event.id);
                state.in_flight_cancelled = false;
                (procedure, context)
            };

            let event_id = context.event_id;
            let desired = context.desired;
            let invocation = {
                let procedure = procedure.clone();
                async move { procedure.invoke(context).await }
            };
            let outcome = AssertUnwindSafe(invocation).catch_unwind().await;

            let mut state = self.state();
            let cancelled = state.in_flight_cancelled;
            state.in_flight = None;
            state.in_flight_cancelled = false;

            match outcome {
                Ok(Ok(Some(repeat))) if !cancelled => {
                    let timing = match repeat.time_unit {
                        TimeUnit::Beats => Timing::At {
                            schedule_at: desired.offset + repeat.delta,
                            time_unit: TimeUnit::Beats,
                        },
                        TimeUnit::Measures => Timing::At {
                            schedule_at: desired.measure as f64
                                + desired.measure_offset
                                    / desired.time_signature.beats_per_measure()
                                + repeat.delta,
                            time_unit: TimeUnit::Measures,
                        },
                        TimeUnit::Seconds => Timing::At {
                            schedule_at: desired.seconds + repeat.delta,
                            time_unit: TimeUnit::Seconds,
                        },
                    };
                    if let Timing::At { schedule_at, .. } = timing {
                        if !schedule_at.is_finite() {
                            warn!(%event_id, "dropping repeat with non-finite time");
                            continue;
                        }
                    }
                    state.commands.push_back(Command {
                        id: event_id,
                        action: Action::Callback(procedure),
                        timing,
                    });
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(%event_id, "clock callback failed: {:#}", e);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(%event_id, "clock callback panicked: {}", message);
                }
            }
        }
    }
}

/// Turn buffered commands into due events against the current tempo map.
fn resolve_commands(state: &mut ClockState, now: f64) {
    while let Some(command) = state.commands.pop_front() {
        let tempo = &state.tempo;
        let (seconds, offset, anchor) = match command.timing {
            Timing::At {
                schedule_at,
                time_unit: TimeUnit::Beats,
            } => (
                tempo.offset_to_seconds(schedule_at),
                schedule_at,
                Anchor::Offset,
            ),
            Timing::At {
                schedule_at,
                time_unit: TimeUnit::Measures,
            } => {
                let offset = tempo.measure_to_offset(schedule_at);
                (
                    tempo.offset_to_seconds(offset),
                    offset,
                    Anchor::Measure(schedule_at),
                )
            }
            Timing::At {
                schedule_at,
                time_unit: TimeUnit::Seconds,
            } => (
                schedule_at,
                tempo.seconds_to_offset(schedule_at),
                Anchor::Seconds,
            ),
            Timing::Cue(None) => (now, tempo.seconds_to_offset(now), Anchor::Seconds),
            Timing::Cue(Some(quantization)) => {
                let offset = tempo.quantize(tempo.seconds_to_offset(now), quantization);
                (tempo.offset_to_seconds(offset), offset, Anchor::Offset)
            }
        };
        state.queue.push(Event {
            id: command.id,
            action: command.action,
            seconds,
            offset,
            anchor,
        });
    }
}

/// Apply a due change event, then re-time every queued event. Events fixed
/// in clock time keep their seconds and take a fresh offset.
/// A meter change landing mid-measure waits for the next downbeat.
fn apply_change(
    state: &mut ClockState,
    event: Event,
    beats_per_minute: Option<f64>,
    time_signature: Option<TimeSignature>,
) {
    let ClockState { tempo, queue, .. } = &mut *state;
    let offset = match event.anchor {
        Anchor::Seconds => tempo.seconds_to_offset(event.seconds),
        Anchor::Offset | Anchor::Measure(_) => event.offset,
    }
    .max(tempo.current().offset);
    let (_, within_measure) = tempo.offset_to_measure(offset);
    let meter = time_signature.filter(|meter| *meter != tempo.time_sig_at(offset));

    match meter {
        Some(meter) if within_measure > DUE_TOLERANCE => {
            if beats_per_minute.is_some() {
                tempo.change(offset, beats_per_minute, None);
            }
            let downbeat = tempo.next_downbeat(offset);
            debug!(
                event_id = %event.id,
                offset,
                downbeat,
                %meter,
                "deferring meter change to the next downbeat"
            );
            queue.push(Event {
                id: event.id,
                action: Action::Change {
                    beats_per_minute: None,
                    time_signature: Some(meter),
                },
                seconds: tempo.offset_to_seconds(downbeat),
                offset: downbeat,
                anchor: Anchor::Offset,
            });
        }
        _ => {
            if beats_per_minute.is_none() && meter.is_none() {
                return;
            }
            tempo.change(offset, beats_per_minute, meter);
        }
    }

    let current = *tempo.current();
    state.beats_per_minute = current.beats_per_minute;
    state.time_signature = current.time_signature;
    debug!(
        offset,
        beats_per_minute = current.beats_per_minute,
        time_signature = %current.time_signature,
        "tempo changed"
    );

    let tempo = &state.tempo;
    state.queue.retime(|event| match event.anchor {
        Anchor::Offset => event.seconds = tempo.offset_to_seconds(event.offset),
        Anchor::Measure(measure) => {
            event.offset = tempo.measure_to_offset(measure);
            event.seconds = tempo.offset_to_seconds(event.offset);
        }
        Anchor::Seconds => event.offset = tempo.seconds_to_offset(event.seconds),
    });
}
