//! Builders for the server commands a controller sends.
//!
//! Every builder returns a plain `rosc::OscMessage`; callers group them into
//! a [`Batch`] when several commands must land together.

use crate::WireError;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};

pub type NodeId = i32;

/// Timetag meaning "execute on arrival".
pub const IMMEDIATELY: OscTime = OscTime {
    seconds: 0,
    fractional: 1,
};

/// Where a new or moved node lands relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddAction {
    Head = 0,
    Tail = 1,
    Before = 2,
    After = 3,
    Replace = 4,
}

impl AddAction {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(AddAction::Head),
            1 => Some(AddAction::Tail),
            2 => Some(AddAction::Before),
            3 => Some(AddAction::After),
            4 => Some(AddAction::Replace),
            _ => None,
        }
    }
}

/// A synth control value: either a literal or a mapping onto a bus.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    Float(f32),
    /// Bus mapping symbol such as `c5` (control bus 5) or `a16` (audio bus 16).
    Mapped(String),
}

impl ControlValue {
    pub fn control_bus(index: i32) -> Self {
        ControlValue::Mapped(format!("c{index}"))
    }

    pub fn audio_bus(index: i32) -> Self {
        ControlValue::Mapped(format!("a{index}"))
    }

    pub fn to_osc(&self) -> OscType {
        match self {
            ControlValue::Float(value) => OscType::Float(*value),
            ControlValue::Mapped(symbol) => OscType::String(symbol.clone()),
        }
    }

    pub fn from_osc(arg: &OscType) -> Option<Self> {
        match arg {
            OscType::Float(value) => Some(ControlValue::Float(*value)),
            OscType::Int(value) => Some(ControlValue::Float(*value as f32)),
            OscType::Double(value) => Some(ControlValue::Float(*value as f32)),
            OscType::String(symbol) => Some(ControlValue::Mapped(symbol.clone())),
            _ => None,
        }
    }
}

impl From<f32> for ControlValue {
    fn from(value: f32) -> Self {
        ControlValue::Float(value)
    }
}

impl From<i32> for ControlValue {
    fn from(value: i32) -> Self {
        ControlValue::Float(value as f32)
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Float(value) => write!(f, "{value:?}"),
            ControlValue::Mapped(symbol) => f.write_str(symbol),
        }
    }
}

fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

fn push_controls(args: &mut Vec<OscType>, controls: &[(String, ControlValue)]) {
    for (name, value) in controls {
        args.push(OscType::String(name.clone()));
        args.push(value.to_osc());
    }
}

pub fn group_new(id: NodeId, action: AddAction, target: NodeId) -> OscMessage {
    message(
        "/g_new",
        vec![
            OscType::Int(id),
            OscType::Int(action.code()),
            OscType::Int(target),
        ],
    )
}

pub fn synth_new(
    synthdef: &str,
    id: NodeId,
    action: AddAction,
    target: NodeId,
    controls: &[(String, ControlValue)],
) -> OscMessage {
    let mut args = vec![
        OscType::String(synthdef.to_string()),
        OscType::Int(id),
        OscType::Int(action.code()),
        OscType::Int(target),
    ];
    push_controls(&mut args, controls);
    message("/s_new", args)
}

pub fn node_free(ids: &[NodeId]) -> OscMessage {
    message("/n_free", ids.iter().copied().map(OscType::Int).collect())
}

pub fn node_set(id: NodeId, controls: &[(String, ControlValue)]) -> OscMessage {
    let mut args = vec![OscType::Int(id)];
    push_controls(&mut args, controls);
    message("/n_set", args)
}

pub fn node_run(id: NodeId, running: bool) -> OscMessage {
    message(
        "/n_run",
        vec![OscType::Int(id), OscType::Int(i32::from(running))],
    )
}

/// Move `node` to the head of `group`.
pub fn group_head(group: NodeId, node: NodeId) -> OscMessage {
    message("/g_head", vec![OscType::Int(group), OscType::Int(node)])
}

/// Move `node` to the tail of `group`.
pub fn group_tail(group: NodeId, node: NodeId) -> OscMessage {
    message("/g_tail", vec![OscType::Int(group), OscType::Int(node)])
}

/// Move `node` directly before `target`.
pub fn node_before(node: NodeId, target: NodeId) -> OscMessage {
    message("/n_before", vec![OscType::Int(node), OscType::Int(target)])
}

/// Move `node` directly after `target`.
pub fn node_after(node: NodeId, target: NodeId) -> OscMessage {
    message("/n_after", vec![OscType::Int(node), OscType::Int(target)])
}

pub fn group_free_all(group: NodeId) -> OscMessage {
    message("/g_freeAll", vec![OscType::Int(group)])
}

pub fn control_bus_set(values: &[(i32, f32)]) -> OscMessage {
    let mut args = Vec::with_capacity(values.len() * 2);
    for (index, value) in values {
        args.push(OscType::Int(*index));
        args.push(OscType::Float(*value));
    }
    message("/c_set", args)
}

pub fn synthdef_receive(compiled: Vec<u8>) -> OscMessage {
    message("/d_recv", vec![OscType::Blob(compiled)])
}

pub fn synthdef_load(path: &Path) -> OscMessage {
    message(
        "/d_load",
        vec![OscType::String(path.to_string_lossy().into_owned())],
    )
}

pub fn sync(id: i32) -> OscMessage {
    message("/sync", vec![OscType::Int(id)])
}

pub fn query_tree(group: NodeId, include_controls: bool) -> OscMessage {
    message(
        "/g_queryTree",
        vec![OscType::Int(group), OscType::Int(i32::from(include_controls))],
    )
}

pub fn notify(enabled: bool) -> OscMessage {
    message("/notify", vec![OscType::Int(i32::from(enabled))])
}

pub fn status() -> OscMessage {
    message("/status", Vec::new())
}

pub fn quit() -> OscMessage {
    message("/quit", Vec::new())
}

/// Messages that must reach the server together, in order.
///
/// A batch with a single undelayed message is sent bare; anything else
/// becomes a bundle, timestamped `now + delay` when a delay is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub messages: Vec<OscMessage>,
    pub delay: Option<Duration>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            messages: Vec::new(),
            delay: Some(delay),
        }
    }

    pub fn push(&mut self, message: OscMessage) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn into_packet(mut self) -> Result<OscPacket, WireError> {
        if self.delay.is_none() && self.messages.len() == 1 {
            if let Some(only) = self.messages.pop() {
                return Ok(OscPacket::Message(only));
            }
        }

        let timetag = match self.delay {
            Some(delay) => OscTime::try_from(SystemTime::now() + delay)
                .map_err(|e| WireError::Codec(format!("{e:?}")))?,
            None => IMMEDIATELY,
        };

        Ok(OscPacket::Bundle(OscBundle {
            timetag,
            content: self.messages.into_iter().map(OscPacket::Message).collect(),
        }))
    }
}

/// Every message in a packet, bundles flattened depth-first.
pub fn flatten(packet: &OscPacket) -> Vec<&OscMessage> {
    let mut out = Vec::new();
    collect(packet, &mut out);
    out
}

fn collect<'a>(packet: &'a OscPacket, out: &mut Vec<&'a OscMessage>) {
    match packet {
        OscPacket::Message(message) => out.push(message),
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                collect(inner, out);
            }
        }
    }
}
