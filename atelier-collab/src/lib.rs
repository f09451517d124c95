//! # atelier-collab — collaborative file editing sessions
//!
//! The per-file synchronization core: a CRDT-backed text replica, the
//! editor-surface binding, and the session coordinator that ties both to
//! the shared transport channel.
//!
//! ```text
//! keystrokes ── EditorBinding ── TextReplica ──┐ LocalEdit deltas
//!                                   ▲          ├──────────────────► Channel
//!                                   │ merge    │
//!                 Channel ──────────┘          ▼
//!            (remote deltas)              EditorSurface
//! ```
//!
//! ## Guarantees
//!
//! - **Convergence** — replicas merging the same deltas in any order end up
//!   with identical text and identical encoded state.
//! - **No-echo** — a delta received from the transport is never re-emitted;
//!   only `LocalEdit`-origin changes are forwarded.
//! - **Hydration order** — no remote delta is merged before the replica is
//!   hydrated; early arrivals are buffered and replayed.
//! - **Capability gate** — viewers cannot produce deltas; enforcement is
//!   local, in the binding, not just a UI affordance.

pub mod binding;
pub mod replica;
pub mod session;

pub use binding::{BufferSurface, EditorBinding, EditorSurface, SharedSurface};
pub use replica::{ChangeOrigin, ReplicaChange, ReplicaError, TextReplica};
pub use session::{
    FileSession, FileSessionCoordinator, FileSessionState, SaveStatus, SessionError,
};
