//! Per-file session lifecycle.
//!
//! [`FileSessionCoordinator`] owns at most one live [`FileSession`] at a
//! time: opening a file tears the previous session down before the next one
//! is established, and a monotonically increasing generation token makes a
//! late join acknowledgement for a superseded session a no-op.
//!
//! Ordering: merging a remote delta against a pre-hydration replica would
//! diverge from peers. The coordinator therefore subscribes to the file
//! scope BEFORE sending the join request, so deltas racing ahead of the ack
//! park in the subscription queue, and only starts draining that queue
//! after the replica is hydrated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use atelier_channel::{Channel, ChannelError, Subscription};
use atelier_proto::{
    Capability, ClientMessage, FileId, FileNode, RoomInfo, Scope, ServerMessage, UserInfo,
};

use crate::binding::{EditorBinding, SharedSurface};
use crate::replica::{ChangeOrigin, ReplicaChange, ReplicaError, TextReplica};

/// File-session failures. None of them invalidate in-memory edits.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to join {path}")]
    Join { path: String },
    #[error("failed to save {path}")]
    Save { path: String },
    #[error("read-only room membership")]
    ReadOnly,
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// Lifecycle of one file session.
///
/// `Joining` covers the span between the join request and its
/// acknowledgement; a handle is only ever observed in the later states
/// because failures during `Joining` go straight to `Closed` without
/// producing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSessionState {
    Joining,
    /// Hydrated, with an editor binding (contributor).
    Bound,
    /// Hydrated, passively observing (viewer).
    Observing,
    Closing,
    Closed,
}

/// Persistence status of the open file.
///
/// Failed saves and local edits both land on `Stale`; the in-memory content
/// is never rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    Saving,
    Stale,
}

struct SessionInner {
    channel: Arc<dyn Channel>,
    room_id: Uuid,
    file: Mutex<FileNode>,
    replica: Arc<TextReplica>,
    binding: Option<EditorBinding>,
    surface: SharedSurface,
    capability: Capability,
    state: Mutex<FileSessionState>,
    status: Mutex<SaveStatus>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock().unwrap() = FileSessionState::Closing;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let file = self.file.lock().unwrap().clone();
        if let Err(e) = self.channel.send(ClientMessage::LeaveFile {
            room_id: self.room_id,
            file: file.clone(),
        }) {
            log::debug!("leave-file for {} not delivered: {e}", file.path);
        }
        *self.state.lock().unwrap() = FileSessionState::Closed;
        log::info!("closed file session for {}", file.path);
    }

    fn current_target(&self) -> (FileId, String) {
        let file = self.file.lock().unwrap();
        (FileId::from_path(&file.path), file.path.clone())
    }
}

/// Handle to one open file's session. Clones share the same session; any
/// clone may close it.
#[derive(Clone)]
pub struct FileSession {
    inner: Arc<SessionInner>,
}

impl FileSession {
    pub fn state(&self) -> FileSessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn save_status(&self) -> SaveStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn capability(&self) -> Capability {
        self.inner.capability
    }

    /// The replica backing this session.
    pub fn replica(&self) -> Arc<TextReplica> {
        self.inner.replica.clone()
    }

    /// The editor binding; `None` in viewer mode.
    pub fn binding(&self) -> Option<&EditorBinding> {
        self.inner.binding.as_ref()
    }

    /// Current file descriptor (its path may be rewritten by a remote
    /// rename).
    pub fn file(&self) -> FileNode {
        self.inner.file.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Persist the file server-side.
    ///
    /// On failure the in-memory content is untouched and the status stays
    /// `Stale` until the next successful save.
    pub async fn save(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let (file_id, file_path) = self.inner.current_target();
        *self.inner.status.lock().unwrap() = SaveStatus::Saving;

        let request_id = self.inner.channel.next_request_id();
        let reply = match self.inner.channel.request(ClientMessage::SaveFile {
            request_id,
            room_id: self.inner.room_id,
            file_id,
            file_path: file_path.clone(),
        }) {
            Ok(reply) => reply,
            Err(e) => {
                *self.inner.status.lock().unwrap() = SaveStatus::Stale;
                return Err(e.into());
            }
        };

        match reply.recv().await {
            Ok(ServerMessage::SaveFileAck { success: true, .. }) => {
                // An edit made while the save was in flight keeps the
                // status at Stale.
                let mut status = self.inner.status.lock().unwrap();
                if *status == SaveStatus::Saving {
                    *status = SaveStatus::Saved;
                }
                log::debug!("saved {file_path}");
                Ok(())
            }
            Ok(_) => {
                *self.inner.status.lock().unwrap() = SaveStatus::Stale;
                log::warn!("save rejected for {file_path}");
                Err(SessionError::Save { path: file_path })
            }
            Err(e) => {
                *self.inner.status.lock().unwrap() = SaveStatus::Stale;
                Err(e.into())
            }
        }
    }

    /// Release every listener and sub-resource. Idempotent; also safe to
    /// call from any clone of the handle.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Owns the lifecycle of the client's open-file session.
pub struct FileSessionCoordinator {
    channel: Arc<dyn Channel>,
    user: UserInfo,
    room: RoomInfo,
    generation: AtomicU64,
    active: Mutex<Option<FileSession>>,
}

impl FileSessionCoordinator {
    pub fn new(channel: Arc<dyn Channel>, user: UserInfo, room: RoomInfo) -> Self {
        Self {
            channel,
            user,
            room,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    pub fn capability(&self) -> Capability {
        Capability::resolve(&self.user, &self.room)
    }

    /// The currently active session, if any.
    pub fn active(&self) -> Option<FileSession> {
        self.active.lock().unwrap().clone()
    }

    /// Open a file: join, hydrate, wire the surface, start the pumps.
    ///
    /// Any previously active session (including one still joining) is fully
    /// disposed first.
    pub async fn open_file(
        &self,
        file: FileNode,
        surface: SharedSurface,
    ) -> Result<FileSession, SessionError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(prev) = self.active.lock().unwrap().take() {
            prev.close();
        }

        let room_id = self.room.id;
        let file_id = FileId::from_path(&file.path);

        // Subscribe before joining: a delta racing ahead of the ack parks
        // in the subscription queue until hydration has completed.
        let delta_sub = self.channel.subscribe(Scope::File {
            room_id,
            file_id: file_id.clone(),
        });
        let tree_sub = self.channel.subscribe(Scope::Room { room_id });

        let request_id = self.channel.next_request_id();
        log::debug!("joining {} (request {request_id})", file.path);
        let reply = self.channel.request(ClientMessage::JoinFile {
            request_id,
            room_id,
            file: file.clone(),
        })?;
        let ack = reply.recv().await?;

        let (success, content, state) = match ack {
            ServerMessage::JoinFileAck {
                success,
                content,
                state,
                ..
            } => (success, content, state),
            _ => (false, None, None),
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            // Superseded while awaiting the ack. If the join went through,
            // release the server-side membership; either way no session
            // object is retained and the subscriptions die here.
            if success {
                let _ = self.channel.send(ClientMessage::LeaveFile { room_id, file });
            }
            return Err(SessionError::Closed);
        }
        if !success {
            log::warn!("join rejected for {}", file.path);
            return Err(SessionError::Join { path: file.path });
        }

        let replica = Arc::new(TextReplica::new());
        let hydrated = if let Some(state) = state {
            replica.hydrate(&state)
        } else {
            if let Some(content) = content {
                replica.seed(&content);
            }
            Ok(())
        };
        if let Err(e) = hydrated {
            let _ = self.channel.send(ClientMessage::LeaveFile { room_id, file });
            return Err(e.into());
        }

        let capability = self.capability();
        let closed = Arc::new(AtomicBool::new(false));
        let binding = capability
            .can_write()
            .then(|| EditorBinding::new(replica.clone(), capability, closed.clone()));

        // Initial paint; remote deltas queued so far are merged by the
        // delta pump below, strictly after this point.
        surface.lock().unwrap().sync_text(&replica.text());

        let changes = replica.subscribe();
        let inner = Arc::new(SessionInner {
            channel: self.channel.clone(),
            room_id,
            file: Mutex::new(file),
            replica,
            binding,
            surface,
            capability,
            state: Mutex::new(if capability.can_write() {
                FileSessionState::Bound
            } else {
                FileSessionState::Observing
            }),
            status: Mutex::new(SaveStatus::Saved),
            closed,
            tasks: Mutex::new(Vec::new()),
        });

        spawn_delta_pump(&inner, delta_sub);
        spawn_change_pump(&inner, changes);
        spawn_tree_pump(&inner, tree_sub);

        let session = FileSession { inner };
        *self.active.lock().unwrap() = Some(session.clone());
        log::info!(
            "opened {} as {:?}",
            session.file().path,
            session.capability()
        );
        Ok(session)
    }

    /// Close whatever is active, including a join still in flight (whose
    /// late ack then becomes a no-op).
    pub fn close_active(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.active.lock().unwrap().take() {
            session.close();
        }
    }
}

/// Remote deltas → replica. Spawned only after hydration, so the events the
/// subscription buffered during the join are merged against a hydrated
/// base.
fn spawn_delta_pump(inner: &Arc<SessionInner>, mut sub: Subscription) {
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            if let ServerMessage::RemoteDelta { update, .. } = event {
                if let Err(e) = inner.replica.apply_delta(&update) {
                    log::warn!("dropping unmergeable remote delta: {e}");
                }
            }
        }
    });
    inner.tasks.lock().unwrap().push(task);
}

/// Replica changes → transport (local edits only, the no-echo filter) and
/// → surface (remote merges).
fn spawn_change_pump(
    inner: &Arc<SessionInner>,
    mut changes: mpsc::UnboundedReceiver<ReplicaChange>,
) {
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            match change.origin {
                ChangeOrigin::LocalEdit => {
                    *inner.status.lock().unwrap() = SaveStatus::Stale;
                    let (file_id, file_path) = inner.current_target();
                    if let Err(e) = inner.channel.send(ClientMessage::Delta {
                        room_id: inner.room_id,
                        file_id,
                        file_path,
                        update: change.update,
                    }) {
                        log::warn!("failed to forward local delta: {e}");
                    }
                }
                ChangeOrigin::RemoteMerge => {
                    let text = inner.replica.text();
                    let mut surface = inner.surface.lock().unwrap();
                    // Bound surfaces get every merge; observer mode only
                    // replaces content when it actually drifted.
                    if inner.binding.is_some() || surface.text() != text {
                        surface.sync_text(&text);
                    }
                }
                ChangeOrigin::Hydration => {}
            }
        }
    });
    inner.tasks.lock().unwrap().push(task);
}

/// Room-scoped file-tree events: a remote delete of the open file (or a
/// parent directory) closes the session; a rename rewrites its path.
fn spawn_tree_pump(inner: &Arc<SessionInner>, mut sub: Subscription) {
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            match event {
                ServerMessage::FileRemoved { path, .. } => {
                    let hit = {
                        let file = inner.file.lock().unwrap();
                        path_covers(&path, &file.path)
                    };
                    if hit {
                        log::info!("open file removed remotely; closing session");
                        inner.close();
                        break;
                    }
                }
                ServerMessage::FileRenamed {
                    old_path, new_path, ..
                } => {
                    let mut file = inner.file.lock().unwrap();
                    if file.path == old_path {
                        file.path = new_path.clone();
                        file.name = new_path
                            .rsplit(['/', '\\'])
                            .next()
                            .unwrap_or(new_path.as_str())
                            .to_string();
                        log::info!("open file renamed to {new_path}");
                    } else if path_covers(&old_path, &file.path) {
                        let updated = file.path.replacen(&old_path, &new_path, 1);
                        file.path = updated;
                        log::info!("parent folder renamed; now {}", file.path);
                    }
                }
                _ => {}
            }
        }
    });
    inner.tasks.lock().unwrap().push(task);
}

/// Whether `ancestor` names `path` itself or a directory containing it.
fn path_covers(ancestor: &str, path: &str) -> bool {
    path == ancestor
        || path.starts_with(&format!("{ancestor}/"))
        || path.starts_with(&format!("{ancestor}\\"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_covers() {
        assert!(path_covers("src/main.py", "src/main.py"));
        assert!(path_covers("src", "src/main.py"));
        assert!(path_covers("src", "src\\main.py"));
        assert!(!path_covers("src", "srcx/main.py"));
        assert!(!path_covers("src/main.py", "src"));
    }
}
