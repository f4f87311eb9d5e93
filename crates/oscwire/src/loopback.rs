//! An in-process stand-in for a server.
//!
//! `Loopback` keeps a node tree the way the real server does and answers
//! the same replies, so controllers can be exercised without audio hardware.
//! `LoopbackLauncher` hands out a fresh engine on every connect.

use crate::dispatch::{Callback, Dispatcher, ListenerId, Pattern};
use crate::process::{Launcher, ServerOptions, ServerProcess};
use crate::requests::{flatten, ControlValue, NodeId, IMMEDIATELY};
use crate::responses::{QueryTreeGroup, QueryTreeNode, QueryTreeSynth, StatusInfo};
use crate::transport::Transport;
use crate::WireError;
use async_trait::async_trait;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Parameter layout of a synth definition the engine can instantiate.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthDescriptor {
    pub name: String,
    pub parameters: Vec<(String, f32)>,
}

/// How a launched loopback process behaves during boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootBehavior {
    #[default]
    Ready,
    /// The readiness banner never arrives.
    Stall,
    /// The process reports ready but the transport never answers.
    Unresponsive,
}

#[derive(Debug)]
enum NodeKind {
    Group(Vec<NodeId>),
    Synth {
        synthdef: String,
        controls: Vec<(String, ControlValue)>,
    },
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
    running: bool,
}

#[derive(Debug)]
struct Engine {
    nodes: HashMap<NodeId, Node>,
    loaded: BTreeSet<String>,
    control_buses: HashMap<i32, f32>,
    quit: bool,
}

impl Engine {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            0,
            Node {
                parent: None,
                kind: NodeKind::Group(Vec::new()),
                running: true,
            },
        );
        Self {
            nodes,
            loaded: BTreeSet::new(),
            control_buses: HashMap::new(),
            quit: false,
        }
    }

    fn children_mut(&mut self, group: NodeId) -> Result<&mut Vec<NodeId>, String> {
        match self.nodes.get_mut(&group).map(|node| &mut node.kind) {
            Some(NodeKind::Group(children)) => Ok(children),
            Some(NodeKind::Synth { .. }) => Err(format!("Node {group} is not a group")),
            None => Err(format!("Group {group} not found")),
        }
    }

    fn position_of(&self, node: NodeId) -> Result<(NodeId, usize), String> {
        let parent = self
            .nodes
            .get(&node)
            .ok_or_else(|| format!("Node {node} not found"))?
            .parent
            .ok_or_else(|| format!("Node {node} has no parent"))?;
        match self.nodes.get(&parent).map(|n| &n.kind) {
            Some(NodeKind::Group(children)) => children
                .iter()
                .position(|child| *child == node)
                .map(|index| (parent, index))
                .ok_or_else(|| format!("Node {node} missing from its parent")),
            _ => Err(format!("Parent of {node} is not a group")),
        }
    }

    /// Resolve an add action into (parent group, index within it).
    fn placement(&self, action: i32, target: NodeId) -> Result<(NodeId, usize), String> {
        match action {
            0 | 1 => match self.nodes.get(&target).map(|n| &n.kind) {
                Some(NodeKind::Group(children)) => {
                    Ok((target, if action == 0 { 0 } else { children.len() }))
                }
                Some(NodeKind::Synth { .. }) => Err(format!("Node {target} is not a group")),
                None => Err(format!("Group {target} not found")),
            },
            2 | 4 => self.position_of(target),
            3 => self.position_of(target).map(|(parent, index)| (parent, index + 1)),
            other => Err(format!("invalid add action {other}")),
        }
    }

    fn insert(&mut self, id: NodeId, action: i32, target: NodeId, kind: NodeKind) -> Result<(), String> {
        if self.nodes.contains_key(&id) {
            return Err(format!("duplicate node ID {id}"));
        }
        let (parent, index) = self.placement(action, target)?;
        if action == 4 {
            self.free(target)?;
        }
        self.children_mut(parent)?.insert(index, id);
        self.nodes.insert(
            id,
            Node {
                parent: Some(parent),
                kind,
                running: true,
            },
        );
        Ok(())
    }

    fn detach(&mut self, id: NodeId) -> Result<(), String> {
        let (parent, index) = self.position_of(id)?;
        self.children_mut(parent)?.remove(index);
        Ok(())
    }

    fn free(&mut self, id: NodeId) -> Result<(), String> {
        if id == 0 {
            return Err("cannot free the root group".to_string());
        }
        self.detach(id)?;
        self.drop_subtree(id);
        Ok(())
    }

    fn drop_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            if let NodeKind::Group(children) = node.kind {
                for child in children {
                    self.drop_subtree(child);
                }
            }
        }
    }

    fn free_children(&mut self, group: NodeId) -> Result<(), String> {
        let children = std::mem::take(self.children_mut(group)?);
        for child in children {
            self.drop_subtree(child);
        }
        Ok(())
    }

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn relocate(&mut self, node: NodeId, action: i32, target: NodeId) -> Result<(), String> {
        if !self.nodes.contains_key(&node) {
            return Err(format!("Node {node} not found"));
        }
        if self.contains(node, target) {
            return Err(format!("cannot move {node} relative to itself"));
        }
        self.detach(node)?;
        let (parent, index) = self.placement(action, target)?;
        self.children_mut(parent)?.insert(index, node);
        if let Some(moved) = self.nodes.get_mut(&node) {
            moved.parent = Some(parent);
        }
        Ok(())
    }

    fn set_controls(&mut self, id: NodeId, pairs: &[(String, ControlValue)]) -> Result<(), String> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| format!("Node {id} not found"))?;
        match &mut node.kind {
            NodeKind::Synth { controls, .. } => {
                for (name, value) in pairs {
                    if let Some(slot) = controls.iter_mut().find(|(n, _)| n == name) {
                        slot.1 = value.clone();
                    }
                }
                Ok(())
            }
            NodeKind::Group(children) => {
                for child in children.clone() {
                    self.set_controls(child, pairs)?;
                }
                Ok(())
            }
        }
    }

    fn snapshot(&self, id: NodeId, with_controls: bool) -> Option<QueryTreeNode> {
        let node = self.nodes.get(&id)?;
        Some(match &node.kind {
            NodeKind::Group(children) => QueryTreeNode::Group(QueryTreeGroup {
                node_id: id,
                children: children
                    .iter()
                    .filter_map(|child| self.snapshot(*child, with_controls))
                    .collect(),
            }),
            NodeKind::Synth { synthdef, controls } => QueryTreeNode::Synth(QueryTreeSynth {
                node_id: id,
                synthdef: synthdef.clone(),
                controls: with_controls.then(|| controls.clone()),
            }),
        })
    }

    fn counts(&self) -> (i32, i32) {
        let groups = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Group(_)))
            .count();
        let synths = self.nodes.len() - groups;
        (synths as i32, groups as i32)
    }
}

fn int(arg: Option<&OscType>) -> Option<i32> {
    match arg? {
        OscType::Int(v) => Some(*v),
        OscType::Float(v) => Some(*v as i32),
        _ => None,
    }
}

fn float(arg: Option<&OscType>) -> Option<f32> {
    match arg? {
        OscType::Float(v) => Some(*v),
        OscType::Int(v) => Some(*v as f32),
        OscType::Double(v) => Some(*v as f32),
        _ => None,
    }
}

fn control_pairs(args: &[OscType]) -> Vec<(String, ControlValue)> {
    args.chunks(2)
        .filter_map(|pair| match pair {
            [OscType::String(name), value] => {
                ControlValue::from_osc(value).map(|value| (name.clone(), value))
            }
            _ => None,
        })
        .collect()
}

/// Name of the first definition in a compiled `SCgf` blob.
fn first_scgf_name(blob: &[u8]) -> Option<String> {
    if blob.len() < 11 || &blob[..4] != b"SCgf" {
        return None;
    }
    let len = usize::from(blob[10]);
    let name = blob.get(11..11 + len)?;
    String::from_utf8(name.to_vec()).ok()
}

fn reply(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

fn fail(command: &str, message: impl Into<String>) -> OscMessage {
    reply(
        "/fail",
        vec![
            OscType::String(command.to_string()),
            OscType::String(message.into()),
        ],
    )
}

pub struct Loopback {
    library: HashMap<String, Vec<(String, f32)>>,
    engine: Mutex<Engine>,
    dispatcher: Dispatcher,
    transcript: Mutex<Vec<OscPacket>>,
    closed: AtomicBool,
    unresponsive: bool,
    this: Weak<Loopback>,
}

impl Loopback {
    pub fn new(library: impl IntoIterator<Item = SynthDescriptor>) -> Arc<Self> {
        Self::build(library, false)
    }

    fn build(library: impl IntoIterator<Item = SynthDescriptor>, unresponsive: bool) -> Arc<Self> {
        let library = library
            .into_iter()
            .map(|descriptor| (descriptor.name, descriptor.parameters))
            .collect();
        Arc::new_cyclic(|this| Self {
            library,
            engine: Mutex::new(Engine::new()),
            dispatcher: Dispatcher::new(),
            transcript: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            unresponsive,
            this: this.clone(),
        })
    }

    fn engine(&self) -> std::sync::MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every packet received so far, in arrival order.
    pub fn transcript(&self) -> Vec<OscPacket> {
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The transcript with bundles flattened into their messages.
    pub fn sent_messages(&self) -> Vec<OscMessage> {
        self.transcript()
            .iter()
            .flat_map(|packet| flatten(packet).into_iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn clear_transcript(&self) {
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn has_quit(&self) -> bool {
        self.engine().quit
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.engine().nodes.contains_key(&id)
    }

    pub fn loaded_synthdefs(&self) -> Vec<String> {
        self.engine().loaded.iter().cloned().collect()
    }

    pub fn control_bus(&self, index: i32) -> Option<f32> {
        self.engine().control_buses.get(&index).copied()
    }

    pub fn is_running(&self, id: NodeId) -> Option<bool> {
        self.engine().nodes.get(&id).map(|node| node.running)
    }

    /// Inspect the tree directly, without a round trip.
    pub fn tree(&self, group: NodeId) -> Option<QueryTreeGroup> {
        match self.engine().snapshot(group, true)? {
            QueryTreeNode::Group(group) => Some(group),
            QueryTreeNode::Synth(_) => None,
        }
    }

    fn apply_packet(&self, packet: &OscPacket, replies: &mut Vec<OscMessage>) {
        match packet {
            OscPacket::Message(message) => self.apply_message(message, replies),
            OscPacket::Bundle(bundle) => match delay_until(bundle.timetag) {
                Some(delay) => self.defer(bundle.clone(), delay),
                None => {
                    for inner in &bundle.content {
                        self.apply_packet(inner, replies);
                    }
                }
            },
        }
    }

    fn defer(&self, bundle: OscBundle, delay: Duration) {
        let this = self.this.clone();
        trace!(?delay, "deferring timestamped bundle");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = this.upgrade() {
                let mut replies = Vec::new();
                for inner in &bundle.content {
                    engine.apply_packet(inner, &mut replies);
                }
                engine.deliver(replies);
            }
        });
    }

    fn deliver(&self, replies: Vec<OscMessage>) {
        if self.unresponsive || self.is_closed() {
            return;
        }
        for message in &replies {
            self.dispatcher.dispatch(message);
        }
    }

    fn apply_message(&self, message: &OscMessage, replies: &mut Vec<OscMessage>) {
        let addr = message.addr.as_str();
        let args = &message.args;
        let mut engine = self.engine();

        match addr {
            "/g_new" => {
                for chunk in args.chunks(3) {
                    let (Some(id), Some(action), Some(target)) =
                        (int(chunk.first()), int(chunk.get(1)), int(chunk.get(2)))
                    else {
                        replies.push(fail(addr, "malformed arguments"));
                        continue;
                    };
                    if let Err(e) = engine.insert(id, action, target, NodeKind::Group(Vec::new())) {
                        replies.push(fail(addr, e));
                    }
                }
            }
            "/s_new" => {
                let (Some(OscType::String(synthdef)), Some(id), Some(action), Some(target)) =
                    (args.first(), int(args.get(1)), int(args.get(2)), int(args.get(3)))
                else {
                    replies.push(fail(addr, "malformed arguments"));
                    return;
                };
                if !engine.loaded.contains(synthdef) {
                    replies.push(fail(addr, format!("SynthDef {synthdef} not found")));
                    return;
                }
                let overrides = control_pairs(&args[4..]);
                let controls = self
                    .library
                    .get(synthdef)
                    .map(|parameters| {
                        parameters
                            .iter()
                            .map(|(name, default)| {
                                let value = overrides
                                    .iter()
                                    .find(|(n, _)| n == name)
                                    .map(|(_, v)| v.clone())
                                    .unwrap_or(ControlValue::Float(*default));
                                (name.clone(), value)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let kind = NodeKind::Synth {
                    synthdef: synthdef.clone(),
                    controls,
                };
                if let Err(e) = engine.insert(id, action, target, kind) {
                    replies.push(fail(addr, e));
                }
            }
            "/n_free" => {
                for id in args.iter().filter_map(|a| int(Some(a))) {
                    if let Err(e) = engine.free(id) {
                        replies.push(fail(addr, e));
                    }
                }
            }
            "/n_set" => {
                let Some(id) = int(args.first()) else {
                    replies.push(fail(addr, "malformed arguments"));
                    return;
                };
                if let Err(e) = engine.set_controls(id, &control_pairs(&args[1..])) {
                    replies.push(fail(addr, e));
                }
            }
            "/n_run" => {
                for pair in args.chunks(2) {
                    if let (Some(id), Some(flag)) = (int(pair.first()), int(pair.get(1))) {
                        match engine.nodes.get_mut(&id) {
                            Some(node) => node.running = flag != 0,
                            None => replies.push(fail(addr, format!("Node {id} not found"))),
                        }
                    }
                }
            }
            "/g_head" | "/g_tail" | "/n_before" | "/n_after" => {
                for pair in args.chunks(2) {
                    let (Some(a), Some(b)) = (int(pair.first()), int(pair.get(1))) else {
                        replies.push(fail(addr, "malformed arguments"));
                        continue;
                    };
                    let result = match addr {
                        "/g_head" => engine.relocate(b, 0, a),
                        "/g_tail" => engine.relocate(b, 1, a),
                        "/n_before" => engine.relocate(a, 2, b),
                        _ => engine.relocate(a, 3, b),
                    };
                    if let Err(e) = result {
                        replies.push(fail(addr, e));
                    }
                }
            }
            "/g_freeAll" | "/g_deepFree" => {
                for group in args.iter().filter_map(|a| int(Some(a))) {
                    if let Err(e) = engine.free_children(group) {
                        replies.push(fail(addr, e));
                    }
                }
            }
            "/c_set" => {
                for pair in args.chunks(2) {
                    if let (Some(index), Some(value)) = (int(pair.first()), float(pair.get(1))) {
                        engine.control_buses.insert(index, value);
                    }
                }
            }
            "/d_recv" => match args.first() {
                Some(OscType::Blob(blob)) => {
                    if let Some(name) = first_scgf_name(blob) {
                        engine.loaded.insert(name);
                    }
                    replies.push(reply("/done", vec![OscType::String(addr.to_string())]));
                }
                _ => replies.push(fail(addr, "expected a blob")),
            },
            "/d_load" => match args.first() {
                Some(OscType::String(path)) => {
                    let stem = Path::new(path)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned());
                    if let Some(name) = stem {
                        engine.loaded.insert(name);
                    }
                    replies.push(reply("/done", vec![OscType::String(addr.to_string())]));
                }
                _ => replies.push(fail(addr, "expected a path")),
            },
            "/sync" => {
                let id = int(args.first()).unwrap_or(0);
                replies.push(reply("/synced", vec![OscType::Int(id)]));
            }
            "/notify" => {
                replies.push(reply(
                    "/done",
                    vec![OscType::String(addr.to_string()), OscType::Int(0)],
                ));
            }
            "/status" => {
                let (synths, groups) = engine.counts();
                let status = StatusInfo {
                    ugens: 0,
                    synths,
                    groups,
                    synthdefs: engine.loaded.len() as i32,
                    average_cpu: 0.0,
                    peak_cpu: 0.0,
                    target_sample_rate: 48_000.0,
                    actual_sample_rate: 48_000.0,
                };
                replies.push(status.to_message());
            }
            "/g_queryTree" => {
                for pair in args.chunks(2) {
                    let group = int(pair.first()).unwrap_or(0);
                    let with_controls = int(pair.get(1)).unwrap_or(0) != 0;
                    match engine.snapshot(group, with_controls) {
                        Some(QueryTreeNode::Group(tree)) => replies.push(tree.to_message(with_controls)),
                        _ => replies.push(fail(addr, format!("Group {group} not found"))),
                    }
                }
            }
            "/quit" => {
                engine.quit = true;
                replies.push(reply("/done", vec![OscType::String(addr.to_string())]));
            }
            _ => {
                debug!(addr, "loopback ignoring unknown command");
                replies.push(fail(addr, "Command not found"));
            }
        }
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, packet: OscPacket) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::Closed);
        }
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(packet.clone());

        let mut replies = Vec::new();
        self.apply_packet(&packet, &mut replies);
        self.deliver(replies);
        Ok(())
    }

    fn register(
        &self,
        pattern: Pattern,
        once: bool,
        parse_response: bool,
        callback: Callback,
    ) -> ListenerId {
        self.dispatcher
            .register(pattern, once, parse_response, callback)
    }

    fn unregister(&self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct LoopbackProcess {
    behavior: BootBehavior,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl ServerProcess for LoopbackProcess {
    async fn wait_ready(&mut self) -> Result<(), WireError> {
        match self.behavior {
            BootBehavior::Stall => std::future::pending().await,
            BootBehavior::Ready | BootBehavior::Unresponsive => Ok(()),
        }
    }

    async fn shutdown(&mut self, _grace: Duration) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Launches loopback engines. Every `connect` creates a fresh engine.
pub struct LoopbackLauncher {
    library: Vec<SynthDescriptor>,
    behavior: Mutex<BootBehavior>,
    engines: Mutex<Vec<Arc<Loopback>>>,
    processes: Mutex<Vec<Arc<AtomicBool>>>,
}

impl LoopbackLauncher {
    pub fn new(library: impl IntoIterator<Item = SynthDescriptor>) -> Self {
        Self {
            library: library.into_iter().collect(),
            behavior: Mutex::new(BootBehavior::Ready),
            engines: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: BootBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    fn behavior(&self) -> BootBehavior {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Engines in connect order.
    pub fn engines(&self) -> Vec<Arc<Loopback>> {
        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn latest(&self) -> Option<Arc<Loopback>> {
        self.engines().last().cloned()
    }

    pub fn launched(&self) -> usize {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Processes launched and not yet shut down.
    pub fn live_processes(&self) -> usize {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|alive| alive.load(Ordering::Acquire))
            .count()
    }
}

#[async_trait]
impl Launcher for LoopbackLauncher {
    async fn launch(&self, options: &ServerOptions) -> Result<Box<dyn ServerProcess>, WireError> {
        debug!(port = options.port, "launching loopback engine");
        let alive = Arc::new(AtomicBool::new(true));
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&alive));
        Ok(Box::new(LoopbackProcess {
            behavior: self.behavior(),
            alive,
        }))
    }

    async fn connect(&self, _options: &ServerOptions) -> Result<Arc<dyn Transport>, WireError> {
        let unresponsive = self.behavior() == BootBehavior::Unresponsive;
        let engine = Loopback::build(self.library.clone(), unresponsive);
        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&engine));
        let transport: Arc<dyn Transport> = engine;
        Ok(transport)
    }
}

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u32 = 2_208_988_800;

/// How long until a bundle is due; `None` when it is due now. Timetags
/// before the Unix epoch, `IMMEDIATELY` among them, are always due.
fn delay_until(timetag: OscTime) -> Option<Duration> {
    if timetag == IMMEDIATELY || timetag.seconds < NTP_UNIX_OFFSET {
        return None;
    }
    SystemTime::from(timetag)
        .duration_since(SystemTime::now())
        .ok()
        .filter(|delay| !delay.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{self, AddAction, Batch};
    use crate::transport::request;
    use crate::Response;
    use pretty_assertions::assert_eq;

    fn library() -> Vec<SynthDescriptor> {
        vec![SynthDescriptor {
            name: "tone".to_string(),
            parameters: vec![("freq".to_string(), 440.0), ("out".to_string(), 0.0)],
        }]
    }

    async fn send(engine: &Loopback, message: OscMessage) {
        engine.send(OscPacket::Message(message)).await.unwrap();
    }

    #[tokio::test]
    async fn add_actions_place_nodes() {
        let engine = Loopback::new(library());
        send(&engine, requests::group_new(1, AddAction::Head, 0)).await;
        send(&engine, requests::group_new(10, AddAction::Tail, 1)).await;
        send(&engine, requests::group_new(11, AddAction::Head, 1)).await;
        send(&engine, requests::group_new(12, AddAction::After, 11)).await;
        send(&engine, requests::group_new(13, AddAction::Before, 11)).await;

        let tree = engine.tree(1).unwrap();
        assert_eq!(tree.node_ids(), vec![1, 13, 11, 12, 10]);

        send(&engine, requests::node_after(13, 10)).await;
        send(&engine, requests::group_head(1, 10)).await;
        assert_eq!(engine.tree(1).unwrap().node_ids(), vec![1, 10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn synths_need_loaded_definitions() {
        let engine = Loopback::new(library());
        send(&engine, requests::group_new(1, AddAction::Head, 0)).await;

        let refused = request(
            engine.as_ref(),
            OscPacket::Message(requests::synth_new("tone", 1000, AddAction::Tail, 1, &[])),
            Pattern::new("/never"),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(refused, Err(WireError::Failed { .. })));
        assert!(!engine.has_node(1000));

        send(&engine, requests::synthdef_load(Path::new("/defs/tone.scsyndef"))).await;
        send(
            &engine,
            requests::synth_new(
                "tone",
                1000,
                AddAction::Tail,
                1,
                &[("out".to_string(), ControlValue::control_bus(3))],
            ),
        )
        .await;

        let rendered = engine.tree(1).unwrap().to_string();
        assert_eq!(rendered, "NODE TREE 1 group\n    1000 tone\n        freq: 440.0, out: c3");
    }

    #[tokio::test]
    async fn sync_and_query_tree_reply() {
        let engine = Loopback::new(library());
        send(&engine, requests::group_new(1, AddAction::Head, 0)).await;

        let synced = request(
            engine.as_ref(),
            OscPacket::Message(requests::sync(9)),
            Pattern::new("/synced").with_arg(9),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(synced, Response::Synced(9));

        let tree = request(
            engine.as_ref(),
            OscPacket::Message(requests::query_tree(1, true)),
            Pattern::new("/g_queryTree.reply"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(matches!(tree, Response::QueryTree(g) if g.node_id == 1));
    }

    #[tokio::test]
    async fn compiled_definitions_register_by_embedded_name() {
        let mut blob = b"SCgf".to_vec();
        blob.extend_from_slice(&2i32.to_be_bytes());
        blob.extend_from_slice(&1i16.to_be_bytes());
        blob.push(4);
        blob.extend_from_slice(b"tone");

        let engine = Loopback::new(library());
        send(&engine, requests::synthdef_receive(blob)).await;
        assert_eq!(engine.loaded_synthdefs(), vec!["tone".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn future_bundles_are_deferred() {
        let engine = Loopback::new(library());
        send(&engine, requests::group_new(1, AddAction::Head, 0)).await;
        send(&engine, requests::group_new(100, AddAction::Tail, 1)).await;

        let mut batch = Batch::delayed(Duration::from_millis(200));
        batch.push(requests::node_free(&[100]));
        engine.send(batch.into_packet().unwrap()).await.unwrap();
        assert!(engine.has_node(100));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!engine.has_node(100));
    }

    #[tokio::test]
    async fn immediate_batches_apply_in_order() {
        let engine = Loopback::new(library());
        send(&engine, requests::group_new(1, AddAction::Head, 0)).await;

        let mut batch = Batch::new();
        batch.push(requests::group_new(100, AddAction::Tail, 1));
        batch.push(requests::group_new(101, AddAction::Before, 100));
        let packet = batch.into_packet().unwrap();
        assert!(matches!(&packet, OscPacket::Bundle(b) if b.timetag == IMMEDIATELY));
        engine.send(packet).await.unwrap();

        assert_eq!(engine.tree(1).unwrap().node_ids(), vec![1, 101, 100]);
    }

    #[test]
    fn pre_unix_timetags_are_due_now() {
        assert_eq!(delay_until(IMMEDIATELY), None);
        assert_eq!(delay_until(OscTime { seconds: 5, fractional: 0 }), None);
    }

    #[tokio::test]
    async fn closed_engine_refuses_packets() {
        let engine = Loopback::new(library());
        engine.close().await;
        let result = engine.send(OscPacket::Message(requests::status())).await;
        assert!(matches!(result, Err(WireError::Closed)));
    }
}
