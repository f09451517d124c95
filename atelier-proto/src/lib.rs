//! # atelier-proto
//!
//! Wire protocol and shared model for the atelier collaborative workspace.
//!
//! Everything that crosses the client/server boundary lives here: the
//! bincode-encoded message envelopes, the event scoping key used to route
//! server pushes to the right session, and the capability facts that gate
//! writes.
//!
//! ## Modules
//!
//! - [`model`] — room/user/file descriptors and capability resolution
//! - [`message`] — `ClientMessage` / `ServerMessage` envelopes and [`Scope`]

pub mod message;
pub mod model;

pub use message::{ClientMessage, ProtocolError, Scope, ServerMessage};
pub use model::{Capability, FileId, FileNode, NodeKind, RoomInfo, UserInfo};
