//! Parsing of the replies a server sends back.

use crate::requests::{ControlValue, NodeId};
use crate::WireError;
use rosc::{OscMessage, OscType};
use std::collections::HashMap;
use std::fmt;

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Done { command: String, args: Vec<OscType> },
    Fail { command: String, message: String },
    Synced(i32),
    QueryTree(QueryTreeGroup),
    Status(StatusInfo),
    Other(OscMessage),
}

impl Response {
    pub fn from_message(message: &OscMessage) -> Result<Self, WireError> {
        let addr = message.addr.as_str();
        let args = &message.args;
        match addr {
            "/done" => Ok(Response::Done {
                command: string_at(addr, args, 0)?,
                args: args.iter().skip(1).cloned().collect(),
            }),
            "/fail" => Ok(Response::Fail {
                command: string_at(addr, args, 0)?,
                message: string_at(addr, args, 1).unwrap_or_default(),
            }),
            "/synced" => Ok(Response::Synced(int_at(addr, args, 0)?)),
            "/g_queryTree.reply" => QueryTreeGroup::from_reply(message).map(Response::QueryTree),
            "/status.reply" => StatusInfo::from_reply(message).map(Response::Status),
            _ => Ok(Response::Other(message.clone())),
        }
    }
}

fn int_at(addr: &str, args: &[OscType], index: usize) -> Result<i32, WireError> {
    match args.get(index) {
        Some(OscType::Int(value)) => Ok(*value),
        Some(OscType::Float(value)) => Ok(*value as i32),
        other => Err(WireError::malformed(
            addr,
            format!("expected int at {index}, found {other:?}"),
        )),
    }
}

fn float_at(addr: &str, args: &[OscType], index: usize) -> Result<f64, WireError> {
    match args.get(index) {
        Some(OscType::Float(value)) => Ok(f64::from(*value)),
        Some(OscType::Double(value)) => Ok(*value),
        Some(OscType::Int(value)) => Ok(f64::from(*value)),
        other => Err(WireError::malformed(
            addr,
            format!("expected number at {index}, found {other:?}"),
        )),
    }
}

fn string_at(addr: &str, args: &[OscType], index: usize) -> Result<String, WireError> {
    match args.get(index) {
        Some(OscType::String(value)) => Ok(value.clone()),
        other => Err(WireError::malformed(
            addr,
            format!("expected string at {index}, found {other:?}"),
        )),
    }
}

/// Server load figures from `/status.reply`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusInfo {
    pub ugens: i32,
    pub synths: i32,
    pub groups: i32,
    pub synthdefs: i32,
    pub average_cpu: f64,
    pub peak_cpu: f64,
    pub target_sample_rate: f64,
    pub actual_sample_rate: f64,
}

impl StatusInfo {
    fn from_reply(message: &OscMessage) -> Result<Self, WireError> {
        let addr = message.addr.as_str();
        let args = &message.args;
        // args[0] is an unused legacy flag
        Ok(Self {
            ugens: int_at(addr, args, 1)?,
            synths: int_at(addr, args, 2)?,
            groups: int_at(addr, args, 3)?,
            synthdefs: int_at(addr, args, 4)?,
            average_cpu: float_at(addr, args, 5)?,
            peak_cpu: float_at(addr, args, 6)?,
            target_sample_rate: float_at(addr, args, 7)?,
            actual_sample_rate: float_at(addr, args, 8)?,
        })
    }

    pub fn to_message(&self) -> OscMessage {
        OscMessage {
            addr: "/status.reply".to_string(),
            args: vec![
                OscType::Int(1),
                OscType::Int(self.ugens),
                OscType::Int(self.synths),
                OscType::Int(self.groups),
                OscType::Int(self.synthdefs),
                OscType::Float(self.average_cpu as f32),
                OscType::Float(self.peak_cpu as f32),
                OscType::Double(self.target_sample_rate),
                OscType::Double(self.actual_sample_rate),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryTreeNode {
    Group(QueryTreeGroup),
    Synth(QueryTreeSynth),
}

impl QueryTreeNode {
    pub fn node_id(&self) -> NodeId {
        match self {
            QueryTreeNode::Group(group) => group.node_id,
            QueryTreeNode::Synth(synth) => synth.node_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTreeGroup {
    pub node_id: NodeId,
    pub children: Vec<QueryTreeNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTreeSynth {
    pub node_id: NodeId,
    pub synthdef: String,
    /// Present only when the query asked for controls.
    pub controls: Option<Vec<(String, ControlValue)>>,
}

impl QueryTreeGroup {
    /// Parse a `/g_queryTree.reply`:
    /// `flag, id, child_count, ...` depth-first, where synths carry
    /// `id, -1, def, [control_count, (name, value)*]`.
    pub fn from_reply(message: &OscMessage) -> Result<Self, WireError> {
        let addr = message.addr.as_str();
        let args = &message.args;
        let with_controls = int_at(addr, args, 0)? != 0;
        let mut cursor = 1;
        match parse_node(addr, args, &mut cursor, with_controls)? {
            QueryTreeNode::Group(group) => Ok(group),
            QueryTreeNode::Synth(_) => Err(WireError::malformed(addr, "root node is a synth")),
        }
    }

    /// Encode as a `/g_queryTree.reply`.
    pub fn to_message(&self, with_controls: bool) -> OscMessage {
        let mut args = vec![OscType::Int(i32::from(with_controls))];
        encode_group(self, with_controls, &mut args);
        OscMessage {
            addr: "/g_queryTree.reply".to_string(),
            args,
        }
    }

    /// Every node id in depth-first order, this group included.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids = vec![self.node_id];
        for child in &self.children {
            match child {
                QueryTreeNode::Group(group) => ids.extend(group.node_ids()),
                QueryTreeNode::Synth(synth) => ids.push(synth.node_id),
            }
        }
        ids
    }

    /// Render the textual `NODE TREE` dump, suffixing each annotated node
    /// with ` (label)`.
    pub fn render(&self, annotations: &HashMap<NodeId, String>) -> String {
        let mut lines = Vec::new();
        render_group(self, 0, true, annotations, &mut lines);
        lines.join("\n")
    }
}

impl fmt::Display for QueryTreeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&HashMap::new()))
    }
}

fn parse_node(
    addr: &str,
    args: &[OscType],
    cursor: &mut usize,
    with_controls: bool,
) -> Result<QueryTreeNode, WireError> {
    let node_id = int_at(addr, args, *cursor)?;
    let child_count = int_at(addr, args, *cursor + 1)?;
    *cursor += 2;

    if child_count < 0 {
        let synthdef = string_at(addr, args, *cursor)?;
        *cursor += 1;
        let controls = if with_controls {
            let count = int_at(addr, args, *cursor)?;
            *cursor += 1;
            let mut controls = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let name = match args.get(*cursor) {
                    Some(OscType::String(name)) => name.clone(),
                    Some(OscType::Int(index)) => index.to_string(),
                    other => {
                        return Err(WireError::malformed(
                            addr,
                            format!("bad control name {other:?}"),
                        ))
                    }
                };
                let value = args
                    .get(*cursor + 1)
                    .and_then(ControlValue::from_osc)
                    .ok_or_else(|| WireError::malformed(addr, "bad control value"))?;
                controls.push((name, value));
                *cursor += 2;
            }
            Some(controls)
        } else {
            None
        };
        return Ok(QueryTreeNode::Synth(QueryTreeSynth {
            node_id,
            synthdef,
            controls,
        }));
    }

    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(parse_node(addr, args, cursor, with_controls)?);
    }
    Ok(QueryTreeNode::Group(QueryTreeGroup { node_id, children }))
}

fn encode_group(group: &QueryTreeGroup, with_controls: bool, args: &mut Vec<OscType>) {
    args.push(OscType::Int(group.node_id));
    args.push(OscType::Int(group.children.len() as i32));
    for child in &group.children {
        match child {
            QueryTreeNode::Group(inner) => encode_group(inner, with_controls, args),
            QueryTreeNode::Synth(synth) => {
                args.push(OscType::Int(synth.node_id));
                args.push(OscType::Int(-1));
                args.push(OscType::String(synth.synthdef.clone()));
                if with_controls {
                    let controls = synth.controls.as_deref().unwrap_or(&[]);
                    args.push(OscType::Int(controls.len() as i32));
                    for (name, value) in controls {
                        args.push(OscType::String(name.clone()));
                        args.push(value.to_osc());
                    }
                }
            }
        }
    }
}

fn annotate(base: String, node_id: NodeId, annotations: &HashMap<NodeId, String>) -> String {
    match annotations.get(&node_id) {
        Some(label) => format!("{base} ({label})"),
        None => base,
    }
}

fn render_group(
    group: &QueryTreeGroup,
    depth: usize,
    root: bool,
    annotations: &HashMap<NodeId, String>,
    lines: &mut Vec<String>,
) {
    let indent = "    ".repeat(depth);
    let prefix = if root { "NODE TREE " } else { "" };
    let line = format!("{indent}{prefix}{} group", group.node_id);
    lines.push(annotate(line, group.node_id, annotations));

    for child in &group.children {
        match child {
            QueryTreeNode::Group(inner) => render_group(inner, depth + 1, false, annotations, lines),
            QueryTreeNode::Synth(synth) => {
                let indent = "    ".repeat(depth + 1);
                let line = format!("{indent}{} {}", synth.node_id, synth.synthdef);
                lines.push(annotate(line, synth.node_id, annotations));
                if let Some(controls) = synth.controls.as_ref().filter(|c| !c.is_empty()) {
                    let rendered: Vec<String> = controls
                        .iter()
                        .map(|(name, value)| format!("{name}: {value}"))
                        .collect();
                    lines.push(format!("{indent}    {}", rendered.join(", ")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_tree() -> QueryTreeGroup {
        QueryTreeGroup {
            node_id: 1000,
            children: vec![
                QueryTreeNode::Group(QueryTreeGroup {
                    node_id: 1001,
                    children: Vec::new(),
                }),
                QueryTreeNode::Synth(QueryTreeSynth {
                    node_id: 1003,
                    synthdef: "switchboard:channel-strip:2".to_string(),
                    controls: Some(vec![
                        ("active".to_string(), ControlValue::Float(1.0)),
                        ("gain".to_string(), ControlValue::control_bus(0)),
                    ]),
                }),
            ],
        }
    }

    #[test]
    fn query_tree_reply_parses_back() {
        let tree = sample_tree();
        let reply = tree.to_message(true);
        match Response::from_message(&reply).unwrap() {
            Response::QueryTree(parsed) => assert_eq!(parsed, tree),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn render_annotates_and_indents() {
        let mut labels = HashMap::new();
        labels.insert(1000, "session.mixers[0]:group".to_string());
        labels.insert(1003, "session.mixers[0]:channel-strip".to_string());

        let expected = "\
NODE TREE 1000 group (session.mixers[0]:group)
    1001 group
    1003 switchboard:channel-strip:2 (session.mixers[0]:channel-strip)
        active: 1.0, gain: c0";
        assert_eq!(sample_tree().render(&labels), expected);
    }

    #[test]
    fn truncated_reply_is_malformed() {
        let message = OscMessage {
            addr: "/g_queryTree.reply".to_string(),
            args: vec![OscType::Int(0), OscType::Int(1000), OscType::Int(2)],
        };
        assert!(matches!(
            Response::from_message(&message),
            Err(WireError::Malformed { .. })
        ));
    }

    #[test]
    fn fail_reply_keeps_command_and_reason() {
        let message = OscMessage {
            addr: "/fail".to_string(),
            args: vec![
                OscType::String("/s_new".to_string()),
                OscType::String("SynthDef not found".to_string()),
            ],
        };
        assert_eq!(
            Response::from_message(&message).unwrap(),
            Response::Fail {
                command: "/s_new".to_string(),
                message: "SynthDef not found".to_string(),
            }
        );
    }
}
