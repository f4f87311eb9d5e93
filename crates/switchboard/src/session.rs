//! The session: contexts, the mixers attached to them, and the operations
//! callers drive them with.
//!
//! All state sits behind one async mutex. Every operation takes the lock for
//! its whole duration, including remote round trips, so operations apply in
//! the order they acquire it.

use crate::allocation::Patchbay;
use crate::bus::{BusGroup, Rate};
use crate::component::{Component, ComponentId, ComponentKind, ComponentTree, Resource};
use crate::context::{BootStatus, Context};
use crate::error::{Result, SwitchboardError};
use crate::routing::{is_container, Connection, ConnectionState, Endpoint};
use conductor::{Clock, ClockOptions, TimeSignature};
use futures::future::join_all;
use oscwire::{Launcher, NodeId, ServerOptions};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchconf::SwitchConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Options for the first context. Later contexts pick a free port.
    pub server: ServerOptions,
    pub synthdef_dir: PathBuf,
    /// How long an active group's gate has to close before it is freed.
    pub release_grace: Duration,
    pub clock: ClockOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            server: ServerOptions::default(),
            synthdef_dir: PathBuf::from("synthdefs"),
            release_grace: Duration::from_millis(250),
            clock: ClockOptions::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &SwitchConfig) -> Result<Self> {
        let server = &config.infra.server;
        let host: IpAddr = server.host.parse().map_err(|_| {
            SwitchboardError::InvalidConfig(format!("server.host {:?} is not an IP address", server.host))
        })?;
        let clock = &config.bootstrap.clock;
        let [numerator, denominator] = clock.time_signature;
        Ok(Self {
            server: ServerOptions {
                executable: config.infra.paths.scsynth.clone(),
                host,
                port: server.port,
                input_channels: server.input_channels,
                output_channels: server.output_channels,
                audio_bus_channels: server.audio_bus_channels,
                control_bus_channels: server.control_bus_channels,
                buffers: server.buffers,
                max_nodes: server.max_nodes,
                boot_timeout: Duration::from_millis(server.boot_timeout_ms),
                reply_timeout: Duration::from_millis(server.reply_timeout_ms),
            },
            synthdef_dir: config.infra.paths.synthdef_dir.clone(),
            release_grace: Duration::from_millis(server.release_grace_ms),
            clock: ClockOptions {
                beats_per_minute: clock.beats_per_minute,
                time_signature: TimeSignature::new(numerator, denominator)?,
                slop: Duration::from_millis(clock.slop_ms),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MixerId(pub(crate) ComponentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub(crate) ComponentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) ComponentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(pub(crate) ComponentId);

/// Something tracks and devices can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerId {
    Mixer(MixerId),
    Track(TrackId),
}

impl From<MixerId> for ContainerId {
    fn from(id: MixerId) -> Self {
        ContainerId::Mixer(id)
    }
}

impl From<TrackId> for ContainerId {
    fn from(id: TrackId) -> Self {
        ContainerId::Track(id)
    }
}

macro_rules! component_id {
    ($($id:ty),*) => {$(
        impl From<$id> for ComponentId {
            fn from(id: $id) -> Self {
                id.0
            }
        }
    )*};
}

component_id!(MixerId, TrackId, DeviceId, SendId);

impl From<ContainerId> for ComponentId {
    fn from(id: ContainerId) -> Self {
        match id {
            ContainerId::Mixer(mixer) => mixer.0,
            ContainerId::Track(track) => track.0,
        }
    }
}

/// What a track reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackInput {
    None,
    Track(TrackId),
    Bus(BusGroup),
}

/// Where a track writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutput {
    None,
    /// The enclosing mixer or track.
    Default,
    Container(ContainerId),
    Bus(BusGroup),
}

struct ContextEntry {
    id: ContextId,
    context: Context,
    mixers: Vec<ComponentId>,
}

struct SessionState {
    status: BootStatus,
    tree: ComponentTree,
    contexts: Vec<ContextEntry>,
    next_context: u64,
    launcher: Arc<dyn Launcher>,
    options: SessionOptions,
}

impl SessionState {
    fn require(&self, expected: BootStatus) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(SwitchboardError::InvalidStatus {
                expected,
                actual: self.status,
            })
        }
    }

    fn context_index(&self, id: ContextId) -> Result<usize> {
        self.contexts
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(SwitchboardError::UnknownContext)
    }

    fn context_of(&self, component: ComponentId) -> Option<usize> {
        let mixer = self.tree.mixer_of(component)?;
        self.contexts
            .iter()
            .position(|entry| entry.mixers.contains(&mixer))
    }

    fn expect_kind(&self, id: ComponentId, kind: ComponentKind) -> Result<()> {
        match self.tree.kind(id) {
            None => Err(SwitchboardError::UnknownComponent),
            Some(actual) if actual != kind => Err(SwitchboardError::WrongKind {
                expected: kind.as_str(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// `from` may write into or read from `to`.
    fn check_route(&self, from: ComponentId, to: ComponentId) -> Result<()> {
        if !self.tree.contains(to) {
            return Err(SwitchboardError::UnknownComponent);
        }
        if from == to {
            return Err(SwitchboardError::SelfRouting {
                address: self.tree.address(from),
            });
        }
        if self.tree.mixer_of(from) != self.tree.mixer_of(to) {
            return Err(SwitchboardError::CrossMixer {
                address: self.tree.address(from),
                other: self.tree.address(to),
            });
        }
        Ok(())
    }

    /// The tree bound to whichever online context hosts `component`.
    fn patchbay(&mut self, component: ComponentId) -> Patchbay<'_> {
        let context = match self.context_of(component) {
            Some(index) => self
                .contexts
                .get_mut(index)
                .map(|entry| &mut entry.context)
                .filter(|context| context.is_online()),
            None => None,
        };
        Patchbay::new(&mut self.tree, context)
    }

    async fn allocate(&mut self, component: ComponentId) -> Result<()> {
        let mut patchbay = self.patchbay(component);
        if patchbay.context.is_none() {
            return Ok(());
        }
        patchbay.allocate_deep(component).await
    }

    async fn push_context(&mut self) -> Result<ContextId> {
        let mut server = self.options.server.clone();
        if self.next_context > 0 {
            server.port = 0;
        }
        let id = ContextId(self.next_context);
        self.next_context += 1;
        let mut context = Context::new(
            server,
            self.options.synthdef_dir.clone(),
            self.options.release_grace,
        );
        if self.status == BootStatus::Online {
            let launcher = Arc::clone(&self.launcher);
            context.boot(launcher.as_ref()).await?;
        }
        self.contexts.push(ContextEntry {
            id,
            context,
            mixers: Vec::new(),
        });
        debug!(context = id.0, "added context");
        Ok(id)
    }

    async fn allocate_all(&mut self) -> Result<()> {
        for entry in &mut self.contexts {
            for mixer in entry.mixers.clone() {
                Patchbay::new(&mut self.tree, Some(&mut entry.context))
                    .allocate_deep(mixer)
                    .await?;
            }
            entry.context.sync().await?;
        }
        Ok(())
    }

    /// Forget every remote resource locally and shut the contexts down.
    async fn teardown(&mut self) {
        let mixers = self.tree.mixers().to_vec();
        let mut patchbay = Patchbay::new(&mut self.tree, None);
        for mixer in mixers {
            if let Err(e) = patchbay.deallocate_deep(mixer) {
                warn!(error = %e, "local deallocation failed");
            }
        }
        join_all(self.contexts.iter_mut().map(|entry| entry.context.quit())).await;
    }

    async fn delete(&mut self, component: ComponentId) -> Result<()> {
        let mixer = self.tree.kind(component) == Some(ComponentKind::Mixer);
        self.patchbay(component).delete(component).await?;
        if mixer {
            for entry in &mut self.contexts {
                entry.mixers.retain(|m| *m != component);
            }
        }
        Ok(())
    }

    /// Apply `change` to a connection and reconcile it.
    async fn rewire(
        &mut self,
        connection: ComponentId,
        change: impl FnOnce(&mut Connection),
    ) -> Result<()> {
        let target = self
            .tree
            .get_mut(connection)
            .and_then(Component::connection_mut)
            .ok_or(SwitchboardError::UnknownComponent)?;
        change(target);
        let mut patchbay = self.patchbay(connection);
        patchbay.reconcile(connection)?;
        patchbay.flush().await
    }
}

/// Handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
    clock: Clock,
}

impl Session {
    /// An offline session with one context and one mixer holding one track.
    pub async fn new(options: SessionOptions, launcher: Arc<dyn Launcher>) -> Result<Self> {
        let clock = Clock::with_options(options.clock)?;
        let mut state = SessionState {
            status: BootStatus::Offline,
            tree: ComponentTree::new(),
            contexts: Vec::new(),
            next_context: 0,
            launcher,
            options,
        };
        state.push_context().await?;
        let mixer = state.tree.add_mixer();
        if let Some(entry) = state.contexts.first_mut() {
            entry.mixers.push(mixer);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
            clock,
        })
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub async fn status(&self) -> BootStatus {
        self.inner.lock().await.status
    }

    /// Boot every context and allocate every mixer. Booting an online
    /// session does nothing; a failure anywhere leaves it offline.
    pub async fn boot(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        match state.status {
            BootStatus::Online => return Ok(()),
            BootStatus::Offline => {}
            actual => {
                return Err(SwitchboardError::InvalidStatus {
                    expected: BootStatus::Offline,
                    actual,
                })
            }
        }
        state.status = BootStatus::Booting;
        info!(contexts = state.contexts.len(), "booting session");

        let launcher = Arc::clone(&state.launcher);
        let booted = join_all(
            state
                .contexts
                .iter_mut()
                .map(|entry| entry.context.boot(launcher.as_ref())),
        )
        .await;
        let outcome = match booted.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => state.allocate_all().await,
        };
        if let Err(e) = outcome {
            warn!(error = %e, "session boot failed");
            state.teardown().await;
            state.status = BootStatus::Offline;
            return Err(e);
        }

        state.status = BootStatus::Online;
        info!("session online");
        Ok(())
    }

    /// Quit every context. Local components stay and are reallocated by the
    /// next boot.
    pub async fn quit(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        match state.status {
            BootStatus::Offline => return Ok(()),
            BootStatus::Online => {}
            actual => {
                return Err(SwitchboardError::InvalidStatus {
                    expected: BootStatus::Online,
                    actual,
                })
            }
        }
        state.status = BootStatus::Quitting;
        state.teardown().await;
        state.status = BootStatus::Offline;
        info!("session offline");
        Ok(())
    }

    /// Add a context, booting it when the session is online.
    pub async fn add_context(&self) -> Result<ContextId> {
        self.inner.lock().await.push_context().await
    }

    /// Delete a context along with every mixer on it.
    pub async fn delete_context(&self, context: ContextId) -> Result<()> {
        let mut state = self.inner.lock().await;
        let index = state.context_index(context)?;
        for mixer in state.contexts[index].mixers.clone() {
            state.delete(mixer).await?;
        }
        let mut entry = state.contexts.remove(index);
        entry.context.quit().await;
        debug!(context = context.0, "deleted context");
        Ok(())
    }

    pub async fn contexts(&self) -> Vec<ContextId> {
        let state = self.inner.lock().await;
        state.contexts.iter().map(|entry| entry.id).collect()
    }

    /// Add a mixer holding one track to `context`, or to the first context
    /// when none is given. A session without contexts gets one.
    pub async fn add_mixer(&self, context: Option<ContextId>) -> Result<MixerId> {
        let mut state = self.inner.lock().await;
        let index = match context {
            Some(id) => state.context_index(id)?,
            None => {
                if state.contexts.is_empty() {
                    state.push_context().await?;
                }
                0
            }
        };
        let mixer = state.tree.add_mixer();
        if let Some(entry) = state.contexts.get_mut(index) {
            entry.mixers.push(mixer);
        }
        state.allocate(mixer).await?;
        Ok(MixerId(mixer))
    }

    pub async fn delete_mixer(&self, mixer: MixerId) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(mixer.0, ComponentKind::Mixer)?;
        state.delete(mixer.0).await
    }

    /// Move a mixer to another context. Its resources are released on the
    /// old context and allocated afresh on the new one.
    pub async fn set_mixer_context(&self, mixer: MixerId, context: ContextId) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(mixer.0, ComponentKind::Mixer)?;
        let target = state.context_index(context)?;
        let source = state
            .context_of(mixer.0)
            .ok_or(SwitchboardError::UnknownComponent)?;
        if source == target {
            return Ok(());
        }

        {
            let mut patchbay = state.patchbay(mixer.0);
            patchbay.deallocate_deep(mixer.0)?;
            patchbay.flush().await?;
        }
        state.contexts[source].mixers.retain(|m| *m != mixer.0);
        state.contexts[target].mixers.push(mixer.0);
        info!(
            address = %state.tree.address(mixer.0),
            context = context.0,
            "mixer moved to context"
        );
        state.allocate(mixer.0).await
    }

    pub async fn mixers(&self) -> Vec<MixerId> {
        let state = self.inner.lock().await;
        state.tree.mixers().iter().copied().map(MixerId).collect()
    }

    pub async fn mixer_context(&self, mixer: MixerId) -> Option<ContextId> {
        let state = self.inner.lock().await;
        let index = state.context_of(mixer.0)?;
        state.contexts.get(index).map(|entry| entry.id)
    }

    /// Wait until every context has processed everything sent to it.
    pub async fn sync(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.require(BootStatus::Online)?;
        for entry in &mut state.contexts {
            entry.context.sync().await?;
        }
        Ok(())
    }

    /// The remote node tree of every context, each node labelled with the
    /// component address and resource that owns it.
    pub async fn dump_tree(&self) -> Result<String> {
        let mut guard = self.inner.lock().await;
        guard.require(BootStatus::Online)?;
        let state = &mut *guard;

        let mut sections = Vec::with_capacity(state.contexts.len());
        for (index, entry) in state.contexts.iter_mut().enumerate() {
            let mut lines = vec![format!("<session.contexts[{index}]>")];
            let annotations = annotations_for(&state.tree, &entry.mixers);
            for mixer in &entry.mixers {
                let Some(group) = state.tree.get(*mixer).and_then(|m| m.node(Resource::Group)) else {
                    continue;
                };
                let reply = entry.context.query_tree(group).await?;
                lines.extend(reply.render(&annotations).lines().map(|line| format!("    {line}")));
            }
            sections.push(lines.join("\n"));
        }
        Ok(sections.join("\n"))
    }

    /// Every component with the kinds of resource it holds, without any
    /// remote ids. Identical across reboots of the same tree.
    pub async fn dump_components(&self) -> String {
        let state = self.inner.lock().await;
        let mut lines = Vec::new();
        for mixer in state.tree.mixers() {
            for id in state.tree.walk(*mixer) {
                let Some(component) = state.tree.get(id) else {
                    continue;
                };
                let mut line = format!("{} ({})", state.tree.address(id), component.kind());
                for (label, resources) in [
                    ("nodes", component.nodes.keys().collect::<Vec<_>>()),
                    ("audio", component.audio_buses.keys().collect()),
                    ("control", component.control_buses.keys().collect()),
                ] {
                    if !resources.is_empty() {
                        let names: Vec<&str> = resources.iter().map(|r| r.as_str()).collect();
                        line.push_str(&format!(" {label}=[{}]", names.join(", ")));
                    }
                }
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    /// Reserve `count` buses on an online context for outside use.
    pub async fn add_bus_group(&self, context: ContextId, rate: Rate, count: u32) -> Result<BusGroup> {
        let mut state = self.inner.lock().await;
        let index = state.context_index(context)?;
        let context = &mut state.contexts[index].context;
        if !context.is_online() {
            return Err(SwitchboardError::ContextOffline);
        }
        context.allocate_bus(rate, count)
    }

    pub async fn free_bus_group(&self, context: ContextId, bus: BusGroup) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let index = state.context_index(context)?;
        Ok(state.contexts[index].context.free_bus(bus))
    }

    /// Live audio and control bus blocks on a context.
    pub async fn bus_usage(&self, context: ContextId) -> Result<(usize, usize)> {
        let state = self.inner.lock().await;
        let index = state.context_index(context)?;
        Ok(state.contexts[index].context.live_buses())
    }

    pub async fn add_track(&self, container: impl Into<ContainerId>) -> Result<TrackId> {
        let mut state = self.inner.lock().await;
        let container = ComponentId::from(container.into());
        let track = state
            .tree
            .add_track(container)
            .ok_or(SwitchboardError::UnknownComponent)?;
        debug!(address = %state.tree.address(track), "added track");
        state.allocate(track).await?;
        Ok(TrackId(track))
    }

    pub async fn delete_track(&self, track: TrackId) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(track.0, ComponentKind::Track)?;
        state.delete(track.0).await
    }

    /// Move `track` to `index` within `container`'s tracks. The index is
    /// clamped to the end of the list.
    pub async fn move_track(
        &self,
        track: TrackId,
        container: impl Into<ContainerId>,
        index: usize,
    ) -> Result<()> {
        let mut state = self.inner.lock().await;
        let container = ComponentId::from(container.into());
        state
            .patchbay(track.0)
            .move_track(track.0, container, index)
            .await
    }

    pub async fn set_track_active(&self, track: TrackId, active: bool) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(track.0, ComponentKind::Track)?;
        let mut patchbay = state.patchbay(track.0);
        patchbay.set_active(track.0, active)?;
        patchbay.flush().await
    }

    pub async fn set_input(&self, track: TrackId, input: TrackInput) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(track.0, ComponentKind::Track)?;
        let source = match input {
            TrackInput::None => None,
            TrackInput::Track(other) => {
                state.expect_kind(other.0, ComponentKind::Track)?;
                state.check_route(track.0, other.0)?;
                Some(Endpoint::Component(other.0))
            }
            TrackInput::Bus(bus) => Some(Endpoint::Bus(bus)),
        };
        let connection = state
            .tree
            .track_body(track.0)
            .map(|body| body.input)
            .ok_or(SwitchboardError::UnknownComponent)?;
        state
            .rewire(connection, |connection| connection.source = source)
            .await
    }

    pub async fn set_output(&self, track: TrackId, output: TrackOutput) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(track.0, ComponentKind::Track)?;
        let target = match output {
            TrackOutput::None => None,
            TrackOutput::Default => Some(Endpoint::Default),
            TrackOutput::Container(container) => {
                let container = ComponentId::from(container);
                state.check_route(track.0, container)?;
                Some(Endpoint::Component(container))
            }
            TrackOutput::Bus(bus) => Some(Endpoint::Bus(bus)),
        };
        let connection = state
            .tree
            .output_of(track.0)
            .ok_or(SwitchboardError::UnknownComponent)?;
        state
            .rewire(connection, |connection| connection.target = target)
            .await
    }

    pub async fn add_device(&self, container: impl Into<ContainerId>) -> Result<DeviceId> {
        let mut state = self.inner.lock().await;
        let container = ComponentId::from(container.into());
        let device = state
            .tree
            .add_device(container)
            .ok_or(SwitchboardError::UnknownComponent)?;
        state.allocate(device).await?;
        Ok(DeviceId(device))
    }

    pub async fn delete_device(&self, device: DeviceId) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(device.0, ComponentKind::Device)?;
        state.delete(device.0).await
    }

    pub async fn set_device_active(&self, device: DeviceId, active: bool) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(device.0, ComponentKind::Device)?;
        let mut patchbay = state.patchbay(device.0);
        patchbay.set_active(device.0, active)?;
        patchbay.flush().await
    }

    /// Send `track`'s signal to another mixer or track, before or after its
    /// channel strip.
    pub async fn add_send(
        &self,
        track: TrackId,
        target: impl Into<ContainerId>,
        postfader: bool,
    ) -> Result<SendId> {
        let mut state = self.inner.lock().await;
        let target = ComponentId::from(target.into());
        state.expect_kind(track.0, ComponentKind::Track)?;
        state.check_route(track.0, target)?;
        let send = state
            .tree
            .add_send(track.0, target, postfader)
            .ok_or(SwitchboardError::UnknownComponent)?;
        debug!(address = %state.tree.address(send), "added send");
        state.allocate(send).await?;
        Ok(SendId(send))
    }

    pub async fn delete_send(&self, send: SendId) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(send.0, ComponentKind::Connection)?;
        state.delete(send.0).await
    }

    pub async fn set_send_target(&self, send: SendId, target: impl Into<ContainerId>) -> Result<()> {
        let mut state = self.inner.lock().await;
        let target = ComponentId::from(target.into());
        let track = state
            .tree
            .parent(send.0)
            .ok_or(SwitchboardError::UnknownComponent)?;
        state.check_route(track, target)?;
        state
            .rewire(send.0, |connection| {
                connection.target = Some(Endpoint::Component(target))
            })
            .await
    }

    pub async fn set_send_postfader(&self, send: SendId, postfader: bool) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.expect_kind(send.0, ComponentKind::Connection)?;
        state
            .rewire(send.0, |connection| connection.postfader = postfader)
            .await
    }

    pub async fn tracks(&self, container: impl Into<ContainerId>) -> Vec<TrackId> {
        let state = self.inner.lock().await;
        let container = ComponentId::from(container.into());
        state.tree.tracks(container).iter().copied().map(TrackId).collect()
    }

    pub async fn devices(&self, container: impl Into<ContainerId>) -> Vec<DeviceId> {
        let state = self.inner.lock().await;
        let container = ComponentId::from(container.into());
        state.tree.devices(container).iter().copied().map(DeviceId).collect()
    }

    pub async fn sends(&self, track: TrackId) -> Vec<SendId> {
        let state = self.inner.lock().await;
        state.tree.sends(track.0).iter().copied().map(SendId).collect()
    }

    /// The connection carrying a mixer's or track's signal onward.
    pub async fn output_of(&self, container: impl Into<ContainerId>) -> Option<ComponentId> {
        let state = self.inner.lock().await;
        state.tree.output_of(ComponentId::from(container.into()))
    }

    pub async fn address(&self, component: impl Into<ComponentId>) -> String {
        self.inner.lock().await.tree.address(component.into())
    }

    pub async fn graph_order(&self, component: impl Into<ComponentId>) -> Option<Vec<usize>> {
        self.inner.lock().await.tree.graph_order(component.into())
    }

    pub async fn node(&self, component: impl Into<ComponentId>, resource: Resource) -> Option<NodeId> {
        let state = self.inner.lock().await;
        state.tree.get(component.into())?.node(resource)
    }

    pub async fn audio_bus(
        &self,
        component: impl Into<ComponentId>,
        resource: Resource,
    ) -> Option<BusGroup> {
        let state = self.inner.lock().await;
        state.tree.get(component.into())?.audio_bus(resource)
    }

    pub async fn control_bus(
        &self,
        component: impl Into<ComponentId>,
        resource: Resource,
    ) -> Option<BusGroup> {
        let state = self.inner.lock().await;
        state.tree.get(component.into())?.control_bus(resource)
    }

    pub async fn is_active(&self, component: impl Into<ComponentId>) -> Option<bool> {
        let state = self.inner.lock().await;
        state.tree.get(component.into()).map(Component::is_active)
    }

    /// The state a connection was last reconciled to.
    pub async fn connection_state(&self, connection: impl Into<ComponentId>) -> Option<ConnectionState> {
        let state = self.inner.lock().await;
        state
            .tree
            .get(connection.into())?
            .connection()
            .map(|connection| connection.state().clone())
    }

    /// Whether `component` could receive a send.
    pub async fn is_container(&self, component: impl Into<ComponentId>) -> bool {
        is_container(&self.inner.lock().await.tree, component.into())
    }
}

fn annotations_for(tree: &ComponentTree, mixers: &[ComponentId]) -> HashMap<NodeId, String> {
    let mut annotations = HashMap::new();
    for mixer in mixers {
        for id in tree.walk(*mixer) {
            let Some(component) = tree.get(id) else {
                continue;
            };
            let address = tree.address(id);
            for (resource, node) in &component.nodes {
                annotations.insert(*node, format!("{address}:{resource}"));
            }
        }
    }
    annotations
}
