//! # atelier-channel
//!
//! The transport channel: one persistent, bidirectional, namespaced message
//! channel per client process, shared by every session.
//!
//! ```text
//! FileSessionCoordinator ──┐                      ┌── join/save acks
//!                           ├── Channel ── server ─┤
//! TerminalController ──────┘      │                └── scoped pushes
//!                                  │
//!                          Subscription per Scope
//! ```
//!
//! Sessions never own the socket; they hold an `Arc<dyn Channel>` handed to
//! them at construction, which keeps ownership explicit and lets tests
//! substitute the in-memory [`local::LocalChannel`] for the WebSocket-backed
//! [`ws::WsChannel`].
//!
//! Routing rules:
//! - acknowledgements are matched to pending requests by `request_id`; an
//!   ack nobody is waiting for is dropped, which is what makes a late ack
//!   for an already-closed session a no-op,
//! - push events are fanned out to subscriptions whose [`Scope`] matches,
//!   so concurrent sessions never see each other's traffic.

pub mod channel;
pub mod local;
pub mod ws;

pub use channel::{Channel, ChannelConfig, ChannelError, PendingReply, Subscription};
pub use local::{local_pair, LocalChannel, LocalServer};
pub use ws::WsChannel;
