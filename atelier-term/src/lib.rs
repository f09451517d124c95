//! # atelier-term — interactive terminal sessions
//!
//! The per-user terminal half of the workspace: one session per
//! (room, user), multiplexed over the same shared channel as the file
//! sessions.
//!
//! Recovery model: `exit` is informational (banner, session stays
//! inspectable); `error` is fatal and the whole session is recreated under
//! a new instance token rather than partially repaired. Stale instances
//! are identified by token and their late events dropped.

pub mod controller;
mod viewport;

pub use controller::{
    CaptureSurface, RunOutcome, SharedTerminalSurface, TerminalConfig, TerminalController,
    TerminalError, TerminalState, TerminalSurface,
};
