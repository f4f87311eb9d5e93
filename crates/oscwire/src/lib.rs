//! oscwire: talking OSC to SuperCollider-style audio servers.
//!
//! - [`requests`]: builders for node, bus, definition and sync commands
//! - [`responses`]: parsed replies, including `/g_queryTree.reply` trees
//! - [`dispatch`]: pattern-matched listener registry
//! - [`transport`]: the [`Transport`] seam and the [`request`] helper
//! - [`udp`]: the real UDP transport
//! - [`process`]: server launching with a readiness banner and boot timeout
//! - [`loopback`]: an in-process engine for tests and dry runs

pub mod dispatch;
mod error;
pub mod loopback;
pub mod process;
pub mod requests;
pub mod responses;
pub mod transport;
pub mod udp;

pub use dispatch::{Callback, Dispatcher, Incoming, ListenerId, Pattern};
pub use error::WireError;
pub use loopback::{BootBehavior, Loopback, LoopbackLauncher, SynthDescriptor};
pub use process::{Launcher, ScsynthLauncher, ServerOptions, ServerProcess, READY_BANNER};
pub use requests::{AddAction, Batch, ControlValue, NodeId};
pub use responses::{QueryTreeGroup, QueryTreeNode, QueryTreeSynth, Response, StatusInfo};
pub use transport::{request, Transport};
pub use udp::{find_free_port, UdpTransport};

pub use rosc::{OscMessage, OscPacket, OscType};
