//! Turning components into server resources and keeping connections in step.
//!
//! A [`Patchbay`] borrows the component tree together with the context the
//! tree is allocated on. Every remote mutation it makes is queued on the
//! context; callers flush once the whole operation has been applied.

use crate::bus::{BusGroup, Rate};
use crate::component::{Component, ComponentId, ComponentKind, ComponentTree, Resource};
use crate::context::{Context, DEFAULT_GROUP};
use crate::error::{Result, SwitchboardError};
use crate::routing::{feedsback, resolve_endpoint, ConnectionState, Endpoint};
use crate::synthdefs::{SynthDef, CHANNEL_STRIP_2, DEVICE_DC_TESTER_2, METERS_2};
use oscwire::requests::{self, AddAction, Batch, ControlValue, NodeId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// Allocation attempts after which a component is reported as stuck.
const MAX_ATTEMPTS: u32 = 2;

fn control(name: &str, value: ControlValue) -> (String, ControlValue) {
    (name.to_string(), value)
}

/// Fetch the bus `component` holds under `resource`, allocating it first
/// when missing.
fn bus(
    context: &mut Context,
    component: &mut Component,
    rate: Rate,
    resource: Resource,
    count: u32,
) -> Result<BusGroup> {
    let buses = match rate {
        Rate::Audio => &mut component.audio_buses,
        Rate::Control => &mut component.control_buses,
    };
    if let Some(bus) = buses.get(&resource) {
        return Ok(*bus);
    }
    let bus = context.allocate_bus(rate, count)?;
    buses.insert(resource, bus);
    Ok(bus)
}

/// Buses behind one channel strip.
struct StripBuses {
    main: BusGroup,
    active: Option<BusGroup>,
    gain: BusGroup,
    input_levels: BusGroup,
    output_levels: BusGroup,
}

/// Queue the group layout shared by mixers and tracks:
///
/// ```text
/// group
///     tracks
///     input-levels
///     devices
///     channel-strip
///     output-levels
/// ```
fn build_strip(
    context: &mut Context,
    component: &mut Component,
    batch: &mut Batch,
    placement: (AddAction, NodeId),
    buses: &StripBuses,
) {
    let group = context.next_node_id();
    let tracks = context.next_node_id();
    let devices = context.next_node_id();
    let channel_strip = context.next_node_id();
    let input_levels = context.next_node_id();
    let output_levels = context.next_node_id();

    let mut strip_controls = vec![
        control("bus", buses.main.as_value()),
        control("gain", buses.gain.map_symbol()),
    ];
    if let Some(active) = buses.active {
        strip_controls.insert(0, control("active", active.map_symbol()));
    }

    batch.push(requests::group_new(group, placement.0, placement.1));
    batch.push(requests::group_new(tracks, AddAction::Head, group));
    batch.push(requests::group_new(devices, AddAction::Tail, group));
    batch.push(requests::synth_new(
        CHANNEL_STRIP_2.name,
        channel_strip,
        AddAction::Tail,
        group,
        &strip_controls,
    ));
    batch.push(requests::synth_new(
        METERS_2.name,
        input_levels,
        AddAction::After,
        tracks,
        &[
            control("in_", buses.main.as_value()),
            control("out", buses.input_levels.as_value()),
        ],
    ));
    batch.push(requests::synth_new(
        METERS_2.name,
        output_levels,
        AddAction::After,
        channel_strip,
        &[
            control("in_", buses.main.as_value()),
            control("out", buses.output_levels.as_value()),
        ],
    ));

    component.nodes.insert(Resource::Group, group);
    component.nodes.insert(Resource::Tracks, tracks);
    component.nodes.insert(Resource::Devices, devices);
    component.nodes.insert(Resource::ChannelStrip, channel_strip);
    component.nodes.insert(Resource::InputLevels, input_levels);
    component.nodes.insert(Resource::OutputLevels, output_levels);
}

/// The component tree bound to the context it is allocated on.
///
/// With no context only local bookkeeping happens: buses and nodes are
/// forgotten and connections settle to their empty state.
pub(crate) struct Patchbay<'a> {
    pub tree: &'a mut ComponentTree,
    pub context: Option<&'a mut Context>,
}

impl<'a> Patchbay<'a> {
    pub fn new(tree: &'a mut ComponentTree, context: Option<&'a mut Context>) -> Self {
        Self { tree, context }
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self.context.as_deref_mut() {
            Some(context) => context.flush().await,
            None => Ok(()),
        }
    }

    /// Allocate `root` and everything beneath it, uploading any missing
    /// definitions first. Components whose prerequisites are not there yet
    /// are retried after the rest of the subtree.
    pub async fn allocate_deep(&mut self, root: ComponentId) -> Result<()> {
        let context = self
            .context
            .as_deref_mut()
            .ok_or(SwitchboardError::ContextOffline)?;
        let walk = self.tree.walk(root);

        let mut wanted: BTreeMap<&'static str, SynthDef> = BTreeMap::new();
        for id in &walk {
            if let Some(component) = self.tree.get(*id) {
                for synthdef in component.synthdefs() {
                    wanted.insert(synthdef.name, *synthdef);
                }
            }
        }
        let missing: Vec<SynthDef> = wanted
            .into_values()
            .filter(|synthdef| !context.synthdefs().contains(synthdef.name))
            .collect();
        context.upload_synthdefs(&missing).await?;

        let mut pending: VecDeque<(ComponentId, u32)> =
            walk.into_iter().map(|id| (id, 0)).collect();
        let outcome = self.drain(&mut pending);
        let flushed = self.flush().await;
        outcome?;
        flushed
    }

    fn drain(&mut self, pending: &mut VecDeque<(ComponentId, u32)>) -> Result<()> {
        while let Some((id, attempts)) = pending.pop_front() {
            if attempts > MAX_ATTEMPTS {
                return Err(SwitchboardError::AllocationStuck {
                    address: self.tree.address(id),
                    attempts,
                });
            }
            if !self.allocate(id)? {
                trace!(address = %self.tree.address(id), attempts, "deferring allocation");
                pending.push_back((id, attempts + 1));
            }
        }
        Ok(())
    }

    /// Allocate a single component. `false` means a prerequisite elsewhere
    /// in the tree is not allocated yet.
    pub fn allocate(&mut self, id: ComponentId) -> Result<bool> {
        match self.tree.kind(id) {
            None => Ok(true),
            Some(ComponentKind::Mixer) => self.allocate_mixer(id),
            Some(ComponentKind::Track) => self.allocate_track(id),
            Some(ComponentKind::Device) => self.allocate_device(id),
            Some(ComponentKind::Connection) => self.reconcile(id),
        }
    }

    fn allocate_mixer(&mut self, id: ComponentId) -> Result<bool> {
        let context = self
            .context
            .as_deref_mut()
            .ok_or(SwitchboardError::ContextOffline)?;
        let Some(component) = self.tree.get_mut(id) else {
            return Ok(true);
        };
        if component.nodes.contains_key(&Resource::Group) {
            return Ok(true);
        }

        let buses = StripBuses {
            main: bus(context, component, Rate::Audio, Resource::Main, 2)?,
            active: None,
            gain: bus(context, component, Rate::Control, Resource::Gain, 1)?,
            input_levels: bus(context, component, Rate::Control, Resource::InputLevels, 2)?,
            output_levels: bus(context, component, Rate::Control, Resource::OutputLevels, 2)?,
        };
        let mut batch = Batch::new();
        let levels: Vec<(i32, f32)> = buses
            .gain
            .fill(0.0)
            .chain(buses.input_levels.fill(0.0))
            .chain(buses.output_levels.fill(0.0))
            .collect();
        batch.push(requests::control_bus_set(&levels));
        build_strip(
            context,
            component,
            &mut batch,
            (AddAction::Tail, DEFAULT_GROUP),
            &buses,
        );
        context.submit(batch);
        debug!(address = %self.tree.address(id), "allocated mixer");
        Ok(true)
    }

    fn allocate_track(&mut self, id: ComponentId) -> Result<bool> {
        let context = self
            .context
            .as_deref_mut()
            .ok_or(SwitchboardError::ContextOffline)?;
        let Some(parent) = self.tree.parent(id) else {
            return Ok(true);
        };
        let Some(parent_tracks) = self
            .tree
            .get(parent)
            .and_then(|p| p.node(Resource::Tracks))
        else {
            return Ok(false);
        };
        let Some(component) = self.tree.get_mut(id) else {
            return Ok(true);
        };
        if component.nodes.contains_key(&Resource::Group) {
            return Ok(true);
        }

        let buses = StripBuses {
            main: bus(context, component, Rate::Audio, Resource::Main, 2)?,
            active: Some(bus(context, component, Rate::Control, Resource::Active, 1)?),
            gain: bus(context, component, Rate::Control, Resource::Gain, 1)?,
            input_levels: bus(context, component, Rate::Control, Resource::InputLevels, 2)?,
            output_levels: bus(context, component, Rate::Control, Resource::OutputLevels, 2)?,
        };
        let active = if component.active { 1.0 } else { 0.0 };
        let mut levels: Vec<(i32, f32)> = Vec::new();
        if let Some(active_bus) = buses.active {
            levels.extend(active_bus.fill(active));
        }
        levels.extend(buses.gain.fill(0.0));
        levels.extend(buses.input_levels.fill(0.0));
        levels.extend(buses.output_levels.fill(0.0));

        let mut batch = Batch::new();
        batch.push(requests::control_bus_set(&levels));
        build_strip(
            context,
            component,
            &mut batch,
            (AddAction::Tail, parent_tracks),
            &buses,
        );
        context.submit(batch);
        debug!(address = %self.tree.address(id), "allocated track");
        Ok(true)
    }

    fn allocate_device(&mut self, id: ComponentId) -> Result<bool> {
        let context = self
            .context
            .as_deref_mut()
            .ok_or(SwitchboardError::ContextOffline)?;
        let Some(parent) = self.tree.parent(id).and_then(|p| self.tree.get(p)) else {
            return Ok(true);
        };
        let (Some(parent_main), Some(parent_devices)) = (
            parent.audio_bus(Resource::Main),
            parent.node(Resource::Devices),
        ) else {
            return Ok(false);
        };
        let Some(component) = self.tree.get_mut(id) else {
            return Ok(true);
        };
        if component.nodes.contains_key(&Resource::Group) {
            return Ok(true);
        }

        let group = context.next_node_id();
        let synth = context.next_node_id();
        let mut batch = Batch::new();
        batch.push(requests::group_new(group, AddAction::Tail, parent_devices));
        batch.push(requests::synth_new(
            DEVICE_DC_TESTER_2.name,
            synth,
            AddAction::Tail,
            group,
            &[control("out", parent_main.as_value())],
        ));
        if !component.active {
            batch.push(requests::node_run(group, false));
        }
        component.nodes.insert(Resource::Group, group);
        component.nodes.insert(Resource::Synth, synth);
        context.submit(batch);
        Ok(true)
    }

    /// Bring a connection's synth in line with what its endpoints resolve
    /// to now. Returns whether the connection is satisfied.
    pub fn reconcile(&mut self, id: ComponentId) -> Result<bool> {
        match self.resolve_state(id)? {
            Some(state) => self.apply_state(id, state),
            None => Ok(true),
        }
    }

    fn resolve_state(&mut self, id: ComponentId) -> Result<Option<ConnectionState>> {
        let Some(component) = self.tree.get(id) else {
            return Ok(None);
        };
        let Some(connection) = component.connection() else {
            return Ok(None);
        };
        let parent = component.parent;
        let role = connection.kind.role();
        let (source, target, postfader) = (connection.source, connection.target, connection.postfader);
        let context_output = self.context.as_deref().map(Context::output_bus);

        let tree = &*self.tree;
        let (source_component, source_bus) = resolve_endpoint(tree, source, || {
            parent.map_or((None, None), |parent| role.default_source(tree, parent))
        });
        let (target_component, mut target_bus) = resolve_endpoint(tree, target, || {
            parent.map_or((None, None), |parent| {
                role.default_target(tree, parent, context_output)
            })
        });
        let feeds = feedsback(
            source_component
                .and_then(|c| tree.graph_order(c))
                .as_deref(),
            target_component
                .and_then(|c| tree.graph_order(c))
                .as_deref(),
        );

        if feeds == Some(true) {
            if let Some(target) = target_component {
                if let Some(feedback) = self.register_feedback(target, id)? {
                    target_bus = Some(feedback);
                }
            }
        }

        Ok(Some(ConnectionState {
            feedsback: feeds,
            postfader,
            source_bus,
            source_component,
            target_bus,
            target_component,
        }))
    }

    fn apply_state(&mut self, id: ComponentId, state: ConnectionState) -> Result<bool> {
        let Some(cached) = self
            .tree
            .get(id)
            .and_then(Component::connection)
            .map(|connection| connection.cached.clone())
        else {
            return Ok(true);
        };
        self.reconcile_dependencies(id, &cached, &state)?;
        self.reconcile_synth(id, &cached, &state);
        let satisfied = state.is_satisfied();
        if let Some(connection) = self.tree.get_mut(id).and_then(Component::connection_mut) {
            connection.cached = state;
        }
        Ok(satisfied)
    }

    fn reconcile_dependencies(
        &mut self,
        id: ComponentId,
        cached: &ConnectionState,
        state: &ConnectionState,
    ) -> Result<()> {
        for (old, new) in [
            (cached.source_component, state.source_component),
            (cached.target_component, state.target_component),
        ] {
            if old == new {
                continue;
            }
            if let Some(old) = old {
                self.unregister_dependency(old, id)?;
            }
            if let Some(component) = new.and_then(|new| self.tree.get_mut(new)) {
                component.dependents.insert(id);
            }
        }
        if let Some(target) = state.target_component {
            if state.feedsback != Some(true) {
                self.unregister_feedback(target, id)?;
            }
        }
        Ok(())
    }

    fn reconcile_synth(&mut self, id: ComponentId, cached: &ConnectionState, state: &ConnectionState) {
        let Some(context) = self.context.as_deref_mut() else {
            return;
        };
        let Some(component) = self.tree.get(id) else {
            return;
        };
        let (Some(parent), Some(connection)) = (component.parent, component.connection()) else {
            return;
        };
        if state == cached && component.nodes.contains_key(&Resource::Synth) {
            return;
        }
        let role = connection.kind.role();
        let active = if role.maps_active() {
            self.tree
                .get(parent)
                .and_then(|p| p.control_bus(Resource::Active))
        } else {
            None
        };
        let placement = role.placement(self.tree, parent, state);

        let mut batch = Batch::new();
        let previous = self
            .tree
            .get_mut(id)
            .and_then(|component| component.nodes.remove(&Resource::Synth));
        if let Some(previous) = previous {
            batch.push(requests::node_free(&[previous]));
        }
        if let (Some(source), Some(target)) = (state.source_bus, state.target_bus) {
            match placement {
                Some(placement) => {
                    let mut controls = vec![
                        control("in_", source.as_value()),
                        control("out", target.as_value()),
                    ];
                    if let Some(active) = active {
                        controls.insert(0, control("active", active.map_symbol()));
                    }
                    let node = context.next_node_id();
                    batch.push(requests::synth_new(
                        role.synthdef().name,
                        node,
                        placement.action,
                        placement.target,
                        &controls,
                    ));
                    if let Some(component) = self.tree.get_mut(id) {
                        component.nodes.insert(Resource::Synth, node);
                    }
                }
                None => trace!(address = %self.tree.address(id), "connection parent not allocated"),
            }
        }
        context.submit(batch);
    }

    /// Record `dependent` as writing back into `target` and, for tracks,
    /// route it through the track's feedback bus.
    fn register_feedback(
        &mut self,
        target: ComponentId,
        dependent: ComponentId,
    ) -> Result<Option<BusGroup>> {
        let Some(component) = self.tree.get_mut(target) else {
            return Ok(None);
        };
        component.dependents.insert(dependent);
        component.feedback_dependents.insert(dependent);

        let Some(feedback) = self.tree.track_body(target).map(|body| body.feedback) else {
            return Ok(None);
        };
        let Some(context) = self.context.as_deref_mut() else {
            return Ok(None);
        };
        let Some(component) = self.tree.get_mut(target) else {
            return Ok(None);
        };
        let feedback_bus = bus(context, component, Rate::Audio, Resource::Feedback, 2)?;
        if let Some(connection) = self
            .tree
            .get_mut(feedback)
            .and_then(Component::connection_mut)
        {
            connection.source = Some(Endpoint::Bus(feedback_bus));
        }
        self.reconcile(feedback)?;
        Ok(Some(feedback_bus))
    }

    fn unregister_dependency(&mut self, component: ComponentId, dependent: ComponentId) -> Result<bool> {
        if let Some(component) = self.tree.get_mut(component) {
            component.dependents.remove(&dependent);
        }
        self.unregister_feedback(component, dependent)
    }

    /// Drop `dependent` from `target`'s feedback writers. The last writer
    /// leaving releases the feedback bus. Returns whether it did.
    fn unregister_feedback(&mut self, target: ComponentId, dependent: ComponentId) -> Result<bool> {
        let Some(component) = self.tree.get_mut(target) else {
            return Ok(false);
        };
        let had_writers = !component.feedback_dependents.is_empty();
        component.feedback_dependents.remove(&dependent);
        if !had_writers || !component.feedback_dependents.is_empty() {
            return Ok(false);
        }

        let Some(feedback) = self.tree.track_body(target).map(|body| body.feedback) else {
            return Ok(true);
        };
        let released = self
            .tree
            .get_mut(target)
            .and_then(|component| component.audio_buses.remove(&Resource::Feedback));
        if let (Some(released), Some(context)) = (released, self.context.as_deref_mut()) {
            context.free_bus(released);
        }
        if let Some(connection) = self
            .tree
            .get_mut(feedback)
            .and_then(Component::connection_mut)
        {
            connection.source = None;
        }
        debug!(address = %self.tree.address(target), "feedback bus released");
        self.reconcile(feedback)?;
        Ok(true)
    }

    /// Queue the remote release of `root`'s top-level node. Active groups
    /// fade out through their `gate` before being freed.
    fn release_remote(&mut self, root: ComponentId) {
        let Some(context) = self.context.as_deref_mut() else {
            return;
        };
        let Some(component) = self.tree.get(root) else {
            return;
        };
        if let Some(group) = component.node(Resource::Group) {
            if component.active {
                let mut gate = Batch::new();
                gate.push(requests::node_set(group, &[control("gate", ControlValue::Float(0.0))]));
                context.submit(gate);
                let mut free = Batch::delayed(context.release_grace());
                free.push(requests::node_free(&[group]));
                context.submit(free);
            } else {
                let mut free = Batch::new();
                free.push(requests::node_free(&[group]));
                context.submit(free);
            }
        } else if let Some(synth) = component.node(Resource::Synth) {
            let mut free = Batch::new();
            free.push(requests::node_free(&[synth]));
            context.submit(free);
        }
    }

    /// Forget `id`'s nodes and return its buses. Connections also drop
    /// their dependency registrations.
    fn deallocate(&mut self, id: ComponentId) -> Result<()> {
        let Some(component) = self.tree.get_mut(id) else {
            return Ok(());
        };
        let buses: Vec<BusGroup> = std::mem::take(&mut component.audio_buses)
            .into_values()
            .chain(std::mem::take(&mut component.control_buses).into_values())
            .collect();
        component.nodes.clear();
        let is_connection = component.kind() == ComponentKind::Connection;
        if let Some(context) = self.context.as_deref_mut() {
            for bus in buses {
                context.free_bus(bus);
            }
        }
        if is_connection {
            self.apply_state(id, ConnectionState::default())?;
        }
        Ok(())
    }

    /// Release `root` remotely, then deallocate its subtree children first.
    pub fn deallocate_deep(&mut self, root: ComponentId) -> Result<()> {
        self.release_remote(root);
        for id in self.tree.walk(root).into_iter().rev() {
            self.deallocate(id)?;
        }
        Ok(())
    }

    /// Connections outside `root`'s subtree that depend on something inside it.
    fn external_dependents(&self, root: ComponentId) -> Vec<ComponentId> {
        let subtree: BTreeSet<ComponentId> = self.tree.walk(root).into_iter().collect();
        let mut external = BTreeSet::new();
        for id in &subtree {
            if let Some(component) = self.tree.get(*id) {
                external.extend(
                    component
                        .dependents
                        .iter()
                        .filter(|dependent| !subtree.contains(dependent)),
                );
            }
        }
        external.into_iter().collect()
    }

    /// Deallocate and remove `root`'s subtree. Connections elsewhere that
    /// pointed into it lose that endpoint and are reconciled.
    pub async fn delete(&mut self, root: ComponentId) -> Result<()> {
        let outcome = self.delete_local(root);
        let flushed = self.flush().await;
        outcome?;
        flushed
    }

    fn delete_local(&mut self, root: ComponentId) -> Result<()> {
        let external = self.external_dependents(root);
        self.deallocate_deep(root)?;
        let removed: BTreeSet<ComponentId> = self.tree.remove_subtree(root).into_iter().collect();

        let points_into_removed = |endpoint: Option<Endpoint>| {
            matches!(endpoint, Some(Endpoint::Component(id)) if removed.contains(&id))
        };
        for dependent in external {
            let Some(connection) = self
                .tree
                .get_mut(dependent)
                .and_then(Component::connection_mut)
            else {
                continue;
            };
            if points_into_removed(connection.source) {
                connection.source = None;
            }
            if points_into_removed(connection.target) {
                connection.target = None;
            }
            self.reconcile(dependent)?;
        }
        Ok(())
    }

    /// Move `track` to position `index` among `parent`'s tracks, keeping the
    /// server's node order and every affected connection in step.
    pub async fn move_track(
        &mut self,
        track: ComponentId,
        parent: ComponentId,
        index: usize,
    ) -> Result<()> {
        let outcome = self.move_local(track, parent, index);
        let flushed = self.flush().await;
        outcome?;
        flushed
    }

    fn move_local(&mut self, track: ComponentId, parent: ComponentId, index: usize) -> Result<()> {
        if self.tree.kind(track) != Some(ComponentKind::Track) {
            return Err(SwitchboardError::WrongKind { expected: "track" });
        }
        if !matches!(
            self.tree.kind(parent),
            Some(ComponentKind::Mixer | ComponentKind::Track)
        ) {
            return Err(SwitchboardError::WrongKind {
                expected: "mixer or track",
            });
        }
        if self.tree.mixer_of(track) != self.tree.mixer_of(parent) {
            return Err(SwitchboardError::CrossMixer {
                address: self.tree.address(track),
                other: self.tree.address(parent),
            });
        }
        if self.tree.parentage(parent).contains(&track) {
            return Err(SwitchboardError::SelfParenting {
                address: self.tree.address(track),
            });
        }

        let old_parent = self.tree.parent(track);
        let old_index = self.tree.tracks(parent).iter().position(|t| *t == track);
        let siblings = self.tree.tracks(parent).len() - usize::from(old_index.is_some());
        let index = index.min(siblings);
        if old_parent == Some(parent) && old_index == Some(index) {
            return Ok(());
        }

        self.tree.unlink(track);
        match self.tree.tracks_mut(parent) {
            Some(tracks) => tracks.insert(index, track),
            None => return Err(SwitchboardError::UnknownComponent),
        }
        if let Some(component) = self.tree.get_mut(track) {
            component.parent = Some(parent);
        }
        debug!(address = %self.tree.address(track), "moved track");

        if let Some(context) = self.context.as_deref_mut() {
            let group = self.tree.get(track).and_then(|t| t.node(Resource::Group));
            if let Some(group) = group {
                let message = if index == 0 {
                    self.tree
                        .get(parent)
                        .and_then(|p| p.node(Resource::Tracks))
                        .map(|tracks| requests::group_head(tracks, group))
                } else {
                    let previous = self.tree.tracks(parent)[index - 1];
                    self.tree
                        .get(previous)
                        .and_then(|p| p.node(Resource::Group))
                        .map(|previous| requests::node_after(group, previous))
                };
                match message {
                    Some(message) => {
                        let mut batch = Batch::new();
                        batch.push(message);
                        context.submit(batch);
                    }
                    None => warn!(address = %self.tree.address(track), "new position not allocated"),
                }
            }
        }

        let mut dependents = BTreeSet::new();
        for id in self.tree.walk(track) {
            if let Some(component) = self.tree.get(id) {
                dependents.extend(component.dependents.iter().copied());
            }
        }
        for dependent in dependents {
            self.reconcile(dependent)?;
        }
        Ok(())
    }

    /// Mute or unmute a track or device.
    pub fn set_active(&mut self, id: ComponentId, active: bool) -> Result<()> {
        let Some(component) = self.tree.get_mut(id) else {
            return Err(SwitchboardError::UnknownComponent);
        };
        let kind = component.kind();
        if !matches!(kind, ComponentKind::Track | ComponentKind::Device) {
            return Err(SwitchboardError::WrongKind {
                expected: "track or device",
            });
        }
        if component.active == active {
            return Ok(());
        }
        component.active = active;
        let Some(context) = self.context.as_deref_mut() else {
            return Ok(());
        };
        let value = if active { 1.0 } else { 0.0 };
        let mut batch = Batch::new();
        match kind {
            ComponentKind::Track => {
                if let Some(bus) = component.control_bus(Resource::Active) {
                    batch.push(requests::control_bus_set(&bus.fill(value).collect::<Vec<_>>()));
                }
            }
            _ => {
                if let Some(group) = component.node(Resource::Group) {
                    batch.push(requests::node_run(group, active));
                    batch.push(requests::node_set(group, &[control("active", ControlValue::Float(value))]));
                }
            }
        }
        context.submit(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthdefs;
    use oscwire::{LoopbackLauncher, ServerOptions};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;

    async fn online() -> (LoopbackLauncher, Context) {
        let launcher = LoopbackLauncher::new(synthdefs::descriptors());
        let mut context = Context::new(
            ServerOptions::default(),
            PathBuf::from("/synthdefs"),
            Duration::from_millis(10),
        );
        context.boot(&launcher).await.unwrap();
        (launcher, context)
    }

    #[tokio::test]
    async fn mixer_allocation_lays_out_the_strip() {
        let (launcher, mut context) = online().await;
        let mut tree = ComponentTree::new();
        let mixer = tree.add_mixer();

        Patchbay::new(&mut tree, Some(&mut context))
            .allocate_deep(mixer)
            .await
            .unwrap();

        let component = tree.get(mixer).unwrap();
        assert_eq!(component.node(Resource::Group), Some(1000));
        assert_eq!(component.audio_bus(Resource::Main).unwrap().index, 16);
        let track = tree.tracks(mixer)[0];
        assert_eq!(tree.get(track).unwrap().audio_bus(Resource::Main).unwrap().index, 18);
        assert!(tree.get(tree.output_of(mixer).unwrap()).unwrap().node(Resource::Synth).is_some());

        context.sync().await.unwrap();
        let engine = launcher.latest().unwrap();
        assert_eq!(engine.control_bus(5), Some(1.0));
        assert!(engine.has_node(1013));
    }

    #[tokio::test]
    async fn reconciling_an_unchanged_connection_sends_nothing() {
        let (launcher, mut context) = online().await;
        let mut tree = ComponentTree::new();
        let mixer = tree.add_mixer();
        let output = tree.output_of(mixer).unwrap();
        let mut patchbay = Patchbay::new(&mut tree, Some(&mut context));
        patchbay.allocate_deep(mixer).await.unwrap();

        let engine = launcher.latest().unwrap();
        engine.clear_transcript();
        assert!(patchbay.reconcile(output).unwrap());
        patchbay.flush().await.unwrap();
        assert!(engine.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn devices_wait_for_their_container() {
        let (_launcher, mut context) = online().await;
        let mut tree = ComponentTree::new();
        let mixer = tree.add_mixer();
        let track = tree.tracks(mixer)[0];
        let device = tree.add_device(track).unwrap();
        let mut patchbay = Patchbay::new(&mut tree, Some(&mut context));

        assert!(!patchbay.allocate(device).unwrap());
        patchbay.allocate_deep(mixer).await.unwrap();
        assert!(tree.get(device).unwrap().node(Resource::Synth).is_some());
    }

    #[tokio::test]
    async fn backward_send_goes_through_the_feedback_bus() {
        let (_launcher, mut context) = online().await;
        let mut tree = ComponentTree::new();
        let mixer = tree.add_mixer();
        let one = tree.tracks(mixer)[0];
        let two = tree.add_track(mixer).unwrap();
        let send = tree.add_send(two, one, true).unwrap();
        let mut patchbay = Patchbay::new(&mut tree, Some(&mut context));
        patchbay.allocate_deep(mixer).await.unwrap();

        let feedback_bus = tree.get(one).unwrap().audio_bus(Resource::Feedback).unwrap();
        let state = tree.get(send).unwrap().connection().unwrap().state().clone();
        assert_eq!(state.feedsback, Some(true));
        assert_eq!(state.target_bus, Some(feedback_bus));
        let feedback = tree.track_body(one).unwrap().feedback;
        assert!(tree.get(feedback).unwrap().node(Resource::Synth).is_some());

        let mut patchbay = Patchbay::new(&mut tree, Some(&mut context));
        patchbay.delete(send).await.unwrap();
        assert!(tree.get(one).unwrap().audio_bus(Resource::Feedback).is_none());
        assert!(tree.get(feedback).unwrap().node(Resource::Synth).is_none());
    }

    #[tokio::test]
    async fn offline_deallocation_forgets_everything() {
        let (_launcher, mut context) = online().await;
        let mut tree = ComponentTree::new();
        let mixer = tree.add_mixer();
        Patchbay::new(&mut tree, Some(&mut context))
            .allocate_deep(mixer)
            .await
            .unwrap();

        Patchbay::new(&mut tree, None).deallocate_deep(mixer).unwrap();
        for id in tree.walk(mixer) {
            assert!(!tree.get(id).unwrap().is_allocated(), "{}", tree.address(id));
        }
    }

    #[tokio::test]
    async fn allocating_without_a_context_fails() {
        let mut tree = ComponentTree::new();
        let mixer = tree.add_mixer();
        let result = Patchbay::new(&mut tree, None).allocate_deep(mixer).await;
        assert!(matches!(result, Err(SwitchboardError::ContextOffline)));
    }
}
