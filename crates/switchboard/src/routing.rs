//! Signal connections between components.
//!
//! A connection reads one bus and writes another through a patch-cable
//! synth. Each [`ConnectionKind`] supplies its defaults and placement
//! through [`ConnectionRole`]; the shared resolution and reconciliation
//! logic lives in [`crate::allocation`].

use crate::bus::BusGroup;
use crate::component::{ComponentId, ComponentKind, ComponentTree, Resource};
use crate::synthdefs::{SynthDef, FB_PATCH_CABLE_2_2, PATCH_CABLE_2_2};
use oscwire::{AddAction, NodeId};

/// One end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Bus(BusGroup),
    Component(ComponentId),
    /// Whatever the connection's role resolves by default.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    TrackFeedback,
    TrackInput,
    TrackOutput,
    TrackSend,
    MixerOutput,
}

impl ConnectionKind {
    pub fn name(self) -> &'static str {
        self.role().name()
    }

    pub(crate) fn role(self) -> &'static dyn ConnectionRole {
        match self {
            ConnectionKind::TrackFeedback => &TrackFeedbackRole,
            ConnectionKind::TrackInput => &TrackInputRole,
            ConnectionKind::TrackOutput => &TrackOutputRole,
            ConnectionKind::TrackSend => &TrackSendRole,
            ConnectionKind::MixerOutput => &MixerOutputRole,
        }
    }
}

/// The last state a connection was reconciled to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub feedsback: Option<bool>,
    pub postfader: bool,
    pub source_bus: Option<BusGroup>,
    pub source_component: Option<ComponentId>,
    pub target_bus: Option<BusGroup>,
    pub target_component: Option<ComponentId>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            feedsback: None,
            postfader: true,
            source_bus: None,
            source_component: None,
            target_bus: None,
            target_component: None,
        }
    }
}

impl ConnectionState {
    /// `false` while both ends name components but one has no bus yet.
    pub fn is_satisfied(&self) -> bool {
        !(self.source_component.is_some()
            && self.target_component.is_some()
            && (self.source_bus.is_none() || self.target_bus.is_none()))
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub source: Option<Endpoint>,
    pub target: Option<Endpoint>,
    pub postfader: bool,
    pub(crate) cached: ConnectionState,
}

impl Connection {
    pub(crate) fn new(
        kind: ConnectionKind,
        source: Option<Endpoint>,
        target: Option<Endpoint>,
    ) -> Self {
        Self {
            kind,
            source,
            target,
            postfader: true,
            cached: ConnectionState::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.cached
    }
}

/// Whether a patch from `source` to `target` must read the previous block.
///
/// Orders are compared lexicographically. When the source sits deeper than
/// the target, the target's truncated order is compared inclusively; when
/// the target sits deeper, strictly. A component feeding itself always
/// feeds back. Detached components yield `None`.
pub fn feedsback(source: Option<&[usize]>, target: Option<&[usize]>) -> Option<bool> {
    let (source, target) = (source?, target?);
    let length = source.len().min(target.len());
    if source.len() < target.len() {
        Some(&target[..length] <= source)
    } else if target.len() < source.len() {
        Some(target < &source[..length])
    } else {
        Some(target <= source)
    }
}

/// A resolved endpoint: the component it names and the bus it reads or writes.
pub(crate) type Resolved = (Option<ComponentId>, Option<BusGroup>);

/// Where a connection's synth goes relative to its parent's nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub action: AddAction,
    pub target: NodeId,
}

/// Per-kind behaviour of a connection.
pub(crate) trait ConnectionRole: Sync {
    fn name(&self) -> &'static str;

    fn default_source(&self, _tree: &ComponentTree, _parent: ComponentId) -> Resolved {
        (None, None)
    }

    fn default_target(
        &self,
        _tree: &ComponentTree,
        _parent: ComponentId,
        _context_output: Option<BusGroup>,
    ) -> Resolved {
        (None, None)
    }

    fn synthdef(&self) -> &'static SynthDef {
        &PATCH_CABLE_2_2
    }

    fn placement(
        &self,
        tree: &ComponentTree,
        parent: ComponentId,
        _state: &ConnectionState,
    ) -> Option<Placement> {
        Some(Placement {
            action: AddAction::Tail,
            target: tree.get(parent)?.node(Resource::Group)?,
        })
    }

    /// Whether the synth follows the parent's `active` control bus.
    fn maps_active(&self) -> bool {
        true
    }
}

struct TrackFeedbackRole;

impl ConnectionRole for TrackFeedbackRole {
    fn name(&self) -> &'static str {
        "feedback"
    }

    fn default_target(
        &self,
        _tree: &ComponentTree,
        parent: ComponentId,
        _context_output: Option<BusGroup>,
    ) -> Resolved {
        (Some(parent), None)
    }

    fn synthdef(&self) -> &'static SynthDef {
        &FB_PATCH_CABLE_2_2
    }

    fn placement(
        &self,
        tree: &ComponentTree,
        parent: ComponentId,
        _state: &ConnectionState,
    ) -> Option<Placement> {
        Some(Placement {
            action: AddAction::Head,
            target: tree.get(parent)?.node(Resource::Group)?,
        })
    }
}

struct TrackInputRole;

impl ConnectionRole for TrackInputRole {
    fn name(&self) -> &'static str {
        "input"
    }

    fn default_target(
        &self,
        _tree: &ComponentTree,
        parent: ComponentId,
        _context_output: Option<BusGroup>,
    ) -> Resolved {
        (Some(parent), None)
    }

    fn placement(
        &self,
        tree: &ComponentTree,
        parent: ComponentId,
        _state: &ConnectionState,
    ) -> Option<Placement> {
        Some(Placement {
            action: AddAction::Before,
            target: tree.get(parent)?.node(Resource::Tracks)?,
        })
    }
}

struct TrackOutputRole;

impl ConnectionRole for TrackOutputRole {
    fn name(&self) -> &'static str {
        "output"
    }

    fn default_source(&self, _tree: &ComponentTree, parent: ComponentId) -> Resolved {
        (Some(parent), None)
    }

    fn default_target(
        &self,
        tree: &ComponentTree,
        parent: ComponentId,
        _context_output: Option<BusGroup>,
    ) -> Resolved {
        (tree.parent(parent), None)
    }
}

struct TrackSendRole;

impl ConnectionRole for TrackSendRole {
    fn name(&self) -> &'static str {
        "send"
    }

    fn default_source(&self, _tree: &ComponentTree, parent: ComponentId) -> Resolved {
        (Some(parent), None)
    }

    fn placement(
        &self,
        tree: &ComponentTree,
        parent: ComponentId,
        state: &ConnectionState,
    ) -> Option<Placement> {
        Some(Placement {
            action: if state.postfader {
                AddAction::After
            } else {
                AddAction::Before
            },
            target: tree.get(parent)?.node(Resource::ChannelStrip)?,
        })
    }
}

struct MixerOutputRole;

impl ConnectionRole for MixerOutputRole {
    fn name(&self) -> &'static str {
        "output"
    }

    fn default_source(&self, _tree: &ComponentTree, parent: ComponentId) -> Resolved {
        (Some(parent), None)
    }

    fn default_target(
        &self,
        _tree: &ComponentTree,
        _parent: ComponentId,
        context_output: Option<BusGroup>,
    ) -> Resolved {
        (None, context_output)
    }

    fn maps_active(&self) -> bool {
        false
    }
}

/// Resolve one end of a connection. Components stand for their main bus.
pub(crate) fn resolve_endpoint(
    tree: &ComponentTree,
    endpoint: Option<Endpoint>,
    default: impl FnOnce() -> Resolved,
) -> Resolved {
    let (component, bus) = match endpoint {
        None => (None, None),
        Some(Endpoint::Bus(bus)) => (None, Some(bus)),
        Some(Endpoint::Component(id)) => (Some(id).filter(|id| tree.contains(*id)), None),
        Some(Endpoint::Default) => default(),
    };
    match component {
        Some(id) => (
            Some(id),
            tree.get(id).and_then(|c| c.audio_bus(Resource::Main)),
        ),
        None => (None, bus),
    }
}

/// Whether `target` may receive a send or output from `track`.
pub(crate) fn is_container(tree: &ComponentTree, id: ComponentId) -> bool {
    matches!(
        tree.kind(id),
        Some(ComponentKind::Mixer | ComponentKind::Track)
    )
}
