//! The local mirror of a mixer graph.
//!
//! Components live in an arena keyed by [`ComponentId`]. A component knows
//! its parent by id; containers own ordered lists of child ids. Positions
//! (`graph_order`, `address`) are always computed from the current lists.

use crate::bus::BusGroup;
use crate::routing::{Connection, ConnectionKind, Endpoint};
use crate::synthdefs::{
    SynthDef, CHANNEL_STRIP_2, DEVICE_DC_TESTER_2, FB_PATCH_CABLE_2_2, METERS_2, PATCH_CABLE_2_2,
};
use oscwire::NodeId;
use slotmap::{new_key_type, SlotMap};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

new_key_type! {
    pub struct ComponentId;
}

/// Name of a remote resource held by a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Group,
    Tracks,
    Devices,
    ChannelStrip,
    InputLevels,
    OutputLevels,
    Synth,
    Main,
    Active,
    Gain,
    Feedback,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Group => "group",
            Resource::Tracks => "tracks",
            Resource::Devices => "devices",
            Resource::ChannelStrip => "channel-strip",
            Resource::InputLevels => "input-levels",
            Resource::OutputLevels => "output-levels",
            Resource::Synth => "synth",
            Resource::Main => "main",
            Resource::Active => "active",
            Resource::Gain => "gain",
            Resource::Feedback => "feedback",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Mixer,
    Track,
    Device,
    Connection,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Mixer => "mixer",
            ComponentKind::Track => "track",
            ComponentKind::Device => "device",
            ComponentKind::Connection => "connection",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MixerBody {
    pub tracks: Vec<ComponentId>,
    pub devices: Vec<ComponentId>,
    pub output: ComponentId,
}

#[derive(Debug, Clone)]
pub(crate) struct TrackBody {
    pub tracks: Vec<ComponentId>,
    pub devices: Vec<ComponentId>,
    pub sends: Vec<ComponentId>,
    pub feedback: ComponentId,
    pub input: ComponentId,
    pub output: ComponentId,
}

#[derive(Debug, Clone)]
pub(crate) enum Body {
    Mixer(MixerBody),
    Track(TrackBody),
    Device,
    Connection(Connection),
}

#[derive(Debug, Clone)]
pub struct Component {
    pub(crate) parent: Option<ComponentId>,
    pub(crate) body: Body,
    pub(crate) nodes: BTreeMap<Resource, NodeId>,
    pub(crate) audio_buses: BTreeMap<Resource, BusGroup>,
    pub(crate) control_buses: BTreeMap<Resource, BusGroup>,
    /// Connections reading from or writing to this component.
    pub(crate) dependents: BTreeSet<ComponentId>,
    /// The subset of `dependents` that write through the feedback bus.
    pub(crate) feedback_dependents: BTreeSet<ComponentId>,
    pub(crate) active: bool,
}

impl Component {
    fn new(body: Body) -> Self {
        Self {
            parent: None,
            body,
            nodes: BTreeMap::new(),
            audio_buses: BTreeMap::new(),
            control_buses: BTreeMap::new(),
            dependents: BTreeSet::new(),
            feedback_dependents: BTreeSet::new(),
            active: true,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self.body {
            Body::Mixer(_) => ComponentKind::Mixer,
            Body::Track(_) => ComponentKind::Track,
            Body::Device => ComponentKind::Device,
            Body::Connection(_) => ComponentKind::Connection,
        }
    }

    pub fn parent(&self) -> Option<ComponentId> {
        self.parent
    }

    pub fn node(&self, resource: Resource) -> Option<NodeId> {
        self.nodes.get(&resource).copied()
    }

    pub fn audio_bus(&self, resource: Resource) -> Option<BusGroup> {
        self.audio_buses.get(&resource).copied()
    }

    pub fn control_bus(&self, resource: Resource) -> Option<BusGroup> {
        self.control_buses.get(&resource).copied()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_allocated(&self) -> bool {
        !self.nodes.is_empty() || !self.audio_buses.is_empty() || !self.control_buses.is_empty()
    }

    pub(crate) fn connection(&self) -> Option<&Connection> {
        match &self.body {
            Body::Connection(connection) => Some(connection),
            _ => None,
        }
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut Connection> {
        match &mut self.body {
            Body::Connection(connection) => Some(connection),
            _ => None,
        }
    }

    /// Definitions this component instantiates once allocated.
    pub(crate) fn synthdefs(&self) -> &'static [SynthDef] {
        match self.body {
            Body::Mixer(_) | Body::Track(_) => &[CHANNEL_STRIP_2, METERS_2],
            Body::Device => &[DEVICE_DC_TESTER_2],
            Body::Connection(_) => &[FB_PATCH_CABLE_2_2, PATCH_CABLE_2_2],
        }
    }
}

/// Arena holding every mixer subtree of a session.
#[derive(Debug, Default)]
pub struct ComponentTree {
    components: SlotMap<ComponentId, Component>,
    mixers: Vec<ComponentId>,
}

impl ComponentTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.get_mut(id)
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.components.contains_key(id)
    }

    pub fn kind(&self, id: ComponentId) -> Option<ComponentKind> {
        self.get(id).map(Component::kind)
    }

    pub fn parent(&self, id: ComponentId) -> Option<ComponentId> {
        self.get(id).and_then(|component| component.parent)
    }

    pub fn mixers(&self) -> &[ComponentId] {
        &self.mixers
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    fn insert_child(&mut self, parent: ComponentId, component: Component) -> ComponentId {
        let id = self.components.insert(component);
        if let Some(child) = self.components.get_mut(id) {
            child.parent = Some(parent);
        }
        id
    }

    fn connection(&mut self, parent: ComponentId, kind: ConnectionKind) -> ComponentId {
        let connection = match kind {
            ConnectionKind::TrackFeedback | ConnectionKind::TrackInput => {
                Connection::new(kind, None, Some(Endpoint::Default))
            }
            _ => Connection::new(kind, Some(Endpoint::Default), Some(Endpoint::Default)),
        };
        self.insert_child(parent, Component::new(Body::Connection(connection)))
    }

    /// A new mixer at the end of the session, holding one default track.
    pub(crate) fn add_mixer(&mut self) -> ComponentId {
        let mixer = self.components.insert(Component::new(Body::Mixer(MixerBody {
            tracks: Vec::new(),
            devices: Vec::new(),
            output: ComponentId::default(),
        })));
        let output = self.connection(mixer, ConnectionKind::MixerOutput);
        if let Some(Body::Mixer(body)) = self.components.get_mut(mixer).map(|m| &mut m.body) {
            body.output = output;
        }
        self.mixers.push(mixer);
        self.add_track(mixer);
        mixer
    }

    /// A new track appended to `container`. Returns `None` when the
    /// container is neither a mixer nor a track.
    pub(crate) fn add_track(&mut self, container: ComponentId) -> Option<ComponentId> {
        if !matches!(
            self.kind(container),
            Some(ComponentKind::Mixer | ComponentKind::Track)
        ) {
            return None;
        }
        let track = self.insert_child(
            container,
            Component::new(Body::Track(TrackBody {
                tracks: Vec::new(),
                devices: Vec::new(),
                sends: Vec::new(),
                feedback: ComponentId::default(),
                input: ComponentId::default(),
                output: ComponentId::default(),
            })),
        );
        let feedback = self.connection(track, ConnectionKind::TrackFeedback);
        let input = self.connection(track, ConnectionKind::TrackInput);
        let output = self.connection(track, ConnectionKind::TrackOutput);
        if let Some(Body::Track(body)) = self.components.get_mut(track).map(|t| &mut t.body) {
            body.feedback = feedback;
            body.input = input;
            body.output = output;
        }
        self.tracks_mut(container)?.push(track);
        Some(track)
    }

    pub(crate) fn add_device(&mut self, container: ComponentId) -> Option<ComponentId> {
        if !matches!(
            self.kind(container),
            Some(ComponentKind::Mixer | ComponentKind::Track)
        ) {
            return None;
        }
        let device = self.insert_child(container, Component::new(Body::Device));
        self.devices_mut(container)?.push(device);
        Some(device)
    }

    pub(crate) fn add_send(
        &mut self,
        track: ComponentId,
        target: ComponentId,
        postfader: bool,
    ) -> Option<ComponentId> {
        if self.kind(track) != Some(ComponentKind::Track) {
            return None;
        }
        let mut connection = Connection::new(
            ConnectionKind::TrackSend,
            Some(Endpoint::Default),
            Some(Endpoint::Component(target)),
        );
        connection.postfader = postfader;
        let send = self.insert_child(track, Component::new(Body::Connection(connection)));
        match self.components.get_mut(track).map(|t| &mut t.body) {
            Some(Body::Track(body)) => body.sends.push(send),
            _ => return None,
        }
        Some(send)
    }

    pub fn tracks(&self, container: ComponentId) -> &[ComponentId] {
        match self.get(container).map(|c| &c.body) {
            Some(Body::Mixer(body)) => &body.tracks,
            Some(Body::Track(body)) => &body.tracks,
            _ => &[],
        }
    }

    pub(crate) fn tracks_mut(&mut self, container: ComponentId) -> Option<&mut Vec<ComponentId>> {
        match self.get_mut(container).map(|c| &mut c.body) {
            Some(Body::Mixer(body)) => Some(&mut body.tracks),
            Some(Body::Track(body)) => Some(&mut body.tracks),
            _ => None,
        }
    }

    pub fn devices(&self, container: ComponentId) -> &[ComponentId] {
        match self.get(container).map(|c| &c.body) {
            Some(Body::Mixer(body)) => &body.devices,
            Some(Body::Track(body)) => &body.devices,
            _ => &[],
        }
    }

    fn devices_mut(&mut self, container: ComponentId) -> Option<&mut Vec<ComponentId>> {
        match self.get_mut(container).map(|c| &mut c.body) {
            Some(Body::Mixer(body)) => Some(&mut body.devices),
            Some(Body::Track(body)) => Some(&mut body.devices),
            _ => None,
        }
    }

    pub fn sends(&self, track: ComponentId) -> &[ComponentId] {
        match self.get(track).map(|c| &c.body) {
            Some(Body::Track(body)) => &body.sends,
            _ => &[],
        }
    }

    pub(crate) fn track_body(&self, track: ComponentId) -> Option<&TrackBody> {
        match self.get(track).map(|c| &c.body) {
            Some(Body::Track(body)) => Some(body),
            _ => None,
        }
    }

    /// The connection writing a mixer's or track's signal onward.
    pub fn output_of(&self, id: ComponentId) -> Option<ComponentId> {
        match self.get(id).map(|c| &c.body) {
            Some(Body::Mixer(body)) => Some(body.output),
            Some(Body::Track(body)) => Some(body.output),
            _ => None,
        }
    }

    /// Children in processing order.
    pub fn children(&self, id: ComponentId) -> Vec<ComponentId> {
        match self.get(id).map(|c| &c.body) {
            Some(Body::Mixer(body)) => body
                .tracks
                .iter()
                .chain(&body.devices)
                .copied()
                .chain(std::iter::once(body.output))
                .collect(),
            Some(Body::Track(body)) => {
                let (postfader, prefader): (Vec<ComponentId>, Vec<ComponentId>) =
                    body.sends.iter().copied().partition(|send| {
                        self.get(*send)
                            .and_then(Component::connection)
                            .is_some_and(|connection| connection.postfader)
                    });
                let mut children = vec![body.feedback, body.input];
                children.extend(&body.tracks);
                children.extend(&body.devices);
                children.extend(prefader);
                children.push(body.output);
                children.extend(postfader);
                children
            }
            _ => Vec::new(),
        }
    }

    /// `id` and every descendant, depth first, parents before children.
    pub fn walk(&self, id: ComponentId) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !self.contains(next) {
                continue;
            }
            out.push(next);
            stack.extend(self.children(next).into_iter().rev());
        }
        out
    }

    /// `id` followed by each ancestor up to the root.
    pub fn parentage(&self, id: ComponentId) -> Vec<ComponentId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !self.contains(current) {
                break;
            }
            chain.push(current);
            cursor = self.parent(current);
        }
        chain
    }

    pub fn mixer_of(&self, id: ComponentId) -> Option<ComponentId> {
        self.parentage(id)
            .into_iter()
            .find(|ancestor| self.kind(*ancestor) == Some(ComponentKind::Mixer))
    }

    /// Sibling indices from the session down to `id`. `None` once detached.
    pub fn graph_order(&self, id: ComponentId) -> Option<Vec<usize>> {
        let chain = self.parentage(id);
        let root = *chain.last()?;
        let mut order = Vec::with_capacity(chain.len());
        order.push(self.mixers.iter().position(|mixer| *mixer == root)?);
        for pair in chain.windows(2).rev() {
            let (child, parent) = (pair[0], pair[1]);
            order.push(self.children(parent).iter().position(|c| *c == child)?);
        }
        Some(order)
    }

    /// Dotted path such as `session.mixers[0].tracks[1].sends[0]`.
    pub fn address(&self, id: ComponentId) -> String {
        let Some(component) = self.get(id) else {
            return "?".to_string();
        };
        let parent = component.parent;
        let indexed = |name: &str, siblings: &[ComponentId]| match parent {
            Some(parent) => match siblings.iter().position(|s| *s == id) {
                Some(index) => format!("{}.{name}[{index}]", self.address(parent)),
                None => format!("{}.{name}[?]", self.address(parent)),
            },
            None => format!("{name}[?]"),
        };
        match &component.body {
            Body::Mixer(_) => match self.mixers.iter().position(|m| *m == id) {
                Some(index) => format!("session.mixers[{index}]"),
                None => "mixers[?]".to_string(),
            },
            Body::Track(_) => indexed("tracks", parent.map_or(&[][..], |p| self.tracks(p))),
            Body::Device => indexed("devices", parent.map_or(&[][..], |p| self.devices(p))),
            Body::Connection(connection) if connection.kind == ConnectionKind::TrackSend => {
                indexed("sends", parent.map_or(&[][..], |p| self.sends(p)))
            }
            Body::Connection(connection) => match parent {
                Some(parent) => format!("{}.{}", self.address(parent), connection.kind.name()),
                None => connection.kind.name().to_string(),
            },
        }
    }

    /// Unlink `id` from its parent's child list. The component stays in the
    /// arena with its parent pointer intact.
    pub(crate) fn unlink(&mut self, id: ComponentId) -> Option<usize> {
        let parent = self.parent(id)?;
        let kind = self.kind(id)?;
        let list = match (self.get_mut(parent).map(|p| &mut p.body), kind) {
            (Some(Body::Mixer(body)), ComponentKind::Track) => &mut body.tracks,
            (Some(Body::Track(body)), ComponentKind::Track) => &mut body.tracks,
            (Some(Body::Mixer(body)), ComponentKind::Device) => &mut body.devices,
            (Some(Body::Track(body)), ComponentKind::Device) => &mut body.devices,
            (Some(Body::Track(body)), ComponentKind::Connection) => &mut body.sends,
            _ => return None,
        };
        let index = list.iter().position(|child| *child == id)?;
        list.remove(index);
        Some(index)
    }

    /// Remove `id` and its descendants from the arena, unlinking it first.
    /// Mixers also leave the session's mixer list.
    pub(crate) fn remove_subtree(&mut self, id: ComponentId) -> Vec<ComponentId> {
        let walk = self.walk(id);
        self.unlink(id);
        self.mixers.retain(|mixer| *mixer != id);
        for component in &walk {
            self.components.remove(*component);
        }
        walk
    }
}
