//! switchboard: client-side control of SuperCollider-style mixing graphs.
//!
//! A [`Session`] owns one or more [`Context`]s, each a connection to one
//! audio server, and the mixers attached to them. Mixers hold tracks,
//! tracks hold devices, sends and further tracks; every component is
//! mirrored onto the server as groups, synths and buses.
//!
//! - [`allocator`]: bus and node id allocation
//! - [`component`]: the arena-backed component tree and its addressing
//! - [`routing`]: connection endpoints, feedback detection and roles
//! - [`context`]: one booted server and its allocators
//! - [`session`]: the public operations, serialised behind one lock

mod allocation;
pub mod allocator;
pub mod bus;
pub mod component;
pub mod context;
mod error;
pub mod routing;
pub mod session;
pub mod synthdefs;
pub mod telemetry;

pub use bus::{BusGroup, Rate};
pub use component::{ComponentId, ComponentKind, Resource};
pub use context::{BootStatus, Context, DEFAULT_GROUP};
pub use error::{Result, SwitchboardError};
pub use routing::{feedsback, ConnectionKind, ConnectionState, Endpoint};
pub use session::{
    ContainerId, ContextId, DeviceId, MixerId, SendId, Session, SessionOptions, TrackId,
    TrackInput, TrackOutput,
};
