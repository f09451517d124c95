//! Editor surface adapter.
//!
//! The [`EditorBinding`] is the bidirectional bridge between a visual
//! editing surface and the replica, handed out for contributors only.
//! Keystrokes flow in through [`EditorBinding::insert`] /
//! [`EditorBinding::delete`]; the surface is expected to already display its
//! own keystrokes, so local edits are never written back. Remote merges flow
//! the other way, applied by the session's pump through
//! [`EditorSurface::sync_text`].
//!
//! Viewers get no binding at all; the session installs a passive observer
//! that replaces the displayed content when it drifts from the replica.
//! Cursor and scroll preservation across such replacement is best-effort by
//! contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use atelier_proto::Capability;

use crate::replica::TextReplica;
use crate::session::SessionError;

/// The visual text-editing surface, implemented by the embedding UI.
pub trait EditorSurface: Send {
    /// Apply replicated content to the visible buffer. Implementations may
    /// diff against the current buffer to preserve cursors.
    fn sync_text(&mut self, text: &str);

    /// Currently displayed value.
    fn text(&self) -> String;
}

/// Shared handle to a surface, usable from session pump tasks.
pub type SharedSurface = Arc<Mutex<dyn EditorSurface>>;

/// Write-side adapter from the surface's input handler to the replica.
pub struct EditorBinding {
    replica: Arc<TextReplica>,
    capability: Capability,
    closed: Arc<AtomicBool>,
}

impl EditorBinding {
    pub(crate) fn new(
        replica: Arc<TextReplica>,
        capability: Capability,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            replica,
            capability,
            closed,
        }
    }

    fn check_writable(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        if !self.capability.can_write() {
            return Err(SessionError::ReadOnly);
        }
        Ok(())
    }

    /// Forward an insertion keystroke to the replica.
    pub fn insert(&self, index: u32, chunk: &str) -> Result<(), SessionError> {
        self.check_writable()?;
        self.replica.insert(index, chunk);
        Ok(())
    }

    /// Forward a deletion to the replica.
    pub fn delete(&self, index: u32, len: u32) -> Result<(), SessionError> {
        self.check_writable()?;
        self.replica.delete(index, len);
        Ok(())
    }
}

/// In-memory surface used by tests and headless embeddings.
#[derive(Default)]
pub struct BufferSurface {
    content: String,
    /// How many times the buffer was replaced wholesale.
    pub sync_count: usize,
}

impl BufferSurface {
    pub fn shared() -> Arc<Mutex<BufferSurface>> {
        Arc::new(Mutex::new(BufferSurface::default()))
    }
}

impl EditorSurface for BufferSurface {
    fn sync_text(&mut self, text: &str) {
        self.content = text.to_string();
        self.sync_count += 1;
    }

    fn text(&self) -> String {
        self.content.clone()
    }
}
