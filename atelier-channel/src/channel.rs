//! The `Channel` trait and the routing core shared by its implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use atelier_proto::{ClientMessage, ProtocolError, Scope, ServerMessage};

/// Channel-level failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The connection is gone; pending requests will never resolve.
    #[error("channel closed")]
    Closed,
    /// The outgoing queue is full (slow or stalled connection).
    #[error("outgoing queue full")]
    Congested,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server URL (`ws://host:port`).
    pub url: String,
    /// Outgoing messages buffered before `send` reports congestion.
    pub outgoing_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            outgoing_capacity: 256,
        }
    }
}

/// The process-wide message channel shared by all sessions.
///
/// Implementations must be cheap to share behind an `Arc`; every method is
/// callable from any task.
pub trait Channel: Send + Sync {
    /// Allocate a correlation id for a tracked request.
    fn next_request_id(&self) -> u64;

    /// Fire-and-forget send (deltas, terminal input, leave notifications).
    fn send(&self, msg: ClientMessage) -> Result<(), ChannelError>;

    /// Send a request expecting an acknowledgement. The message must carry a
    /// `request_id` obtained from [`Channel::next_request_id`]; the returned
    /// [`PendingReply`] resolves with the matching ack.
    fn request(&self, msg: ClientMessage) -> Result<PendingReply, ChannelError>;

    /// Subscribe to server pushes under one scope. Dropping the returned
    /// [`Subscription`] unregisters it.
    fn subscribe(&self, scope: Scope) -> Subscription;
}

/// An in-flight request's reply slot.
pub struct PendingReply {
    rx: oneshot::Receiver<ServerMessage>,
}

impl PendingReply {
    /// Await the acknowledgement. Resolves to `ChannelError::Closed` when
    /// the connection (or the channel itself) went away first.
    pub async fn recv(self) -> Result<ServerMessage, ChannelError> {
        self.rx.await.map_err(|_| ChannelError::Closed)
    }
}

/// A scoped stream of server pushes.
pub struct Subscription {
    scope: Scope,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Next event under this scope; `None` once the channel shuts down.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Non-blocking variant, used when draining buffered events.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

struct SubscriptionGuard {
    router: Arc<Router>,
    scope: Scope,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.router.unsubscribe(&self.scope, self.id);
    }
}

/// Routing core shared by channel implementations: pending-request table
/// plus scope-keyed subscription fan-out.
pub(crate) struct Router {
    subs: Mutex<HashMap<Scope, Vec<(u64, mpsc::UnboundedSender<ServerMessage>)>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>,
    next_sub_id: AtomicU64,
    next_request_id: AtomicU64,
}

impl Router {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a reply slot for `request_id`.
    pub(crate) fn register_request(&self, request_id: u64) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        pending.insert(request_id, tx);
        PendingReply { rx }
    }

    /// Register a reply slot for a tracked request message, rejecting
    /// messages that carry no request id.
    pub(crate) fn register_request_for(
        &self,
        msg: &ClientMessage,
    ) -> Result<PendingReply, ChannelError> {
        match msg.request_id() {
            Some(request_id) => Ok(self.register_request(request_id)),
            None => Err(ChannelError::Protocol(ProtocolError::Encode(
                "request message carries no request id".into(),
            ))),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, scope: Scope) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subs.lock().unwrap();
        subs.entry(scope.clone()).or_default().push((id, tx));
        Subscription {
            scope: scope.clone(),
            rx,
            _guard: SubscriptionGuard {
                router: self.clone(),
                scope,
                id,
            },
        }
    }

    fn unsubscribe(&self, scope: &Scope, id: u64) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(list) = subs.get_mut(scope) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subs.remove(scope);
            }
        }
    }

    /// Route one inbound message: ack → its reply slot, push → matching
    /// subscriptions. Unmatched messages are dropped.
    pub(crate) fn deliver(&self, msg: ServerMessage) {
        if let Some(request_id) = msg.ack_of() {
            let slot = self.pending.lock().unwrap().remove(&request_id);
            match slot {
                // A closed session has dropped its receiver; the send
                // fails and the late ack goes nowhere.
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => log::debug!("dropping ack for unknown request {request_id}"),
            }
            return;
        }

        let Some(scope) = msg.scope() else {
            return;
        };
        let mut subs = self.subs.lock().unwrap();
        if let Some(list) = subs.get_mut(&scope) {
            list.retain(|(_, tx)| tx.send(msg.clone()).is_ok());
        } else {
            log::trace!("dropping event with no subscriber: {scope:?}");
        }
    }

    /// Fail every outstanding request (connection loss). Dropping the
    /// oneshot senders resolves the receivers with `ChannelError::Closed`.
    pub(crate) fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Close all subscriptions (channel shutdown).
    pub(crate) fn close_subscriptions(&self) {
        self.subs.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_proto::FileId;
    use uuid::Uuid;

    fn file_scope(room_id: Uuid) -> Scope {
        Scope::File {
            room_id,
            file_id: FileId::from_path("main.py"),
        }
    }

    #[tokio::test]
    async fn test_ack_routed_to_pending_request() {
        let router = Router::new();
        let reply = router.register_request(3);
        router.deliver(ServerMessage::SaveFileAck {
            request_id: 3,
            success: true,
        });
        let msg = reply.recv().await.unwrap();
        assert_eq!(msg.ack_of(), Some(3));
    }

    #[tokio::test]
    async fn test_late_ack_is_noop() {
        let router = Router::new();
        let reply = router.register_request(9);
        drop(reply);
        // Nobody is waiting; must not panic or leak.
        router.deliver(ServerMessage::SaveFileAck {
            request_id: 9,
            success: true,
        });
        assert!(router.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_routed_by_scope() {
        let router = Router::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let mut sub_a = router.subscribe(file_scope(room_a));
        let mut sub_b = router.subscribe(file_scope(room_b));

        router.deliver(ServerMessage::RemoteDelta {
            room_id: room_a,
            file_id: FileId::from_path("main.py"),
            update: vec![1],
        });

        assert!(sub_a.try_recv().is_some());
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let router = Router::new();
        let room = Uuid::new_v4();
        let sub = router.subscribe(file_scope(room));
        drop(sub);
        assert!(router.subs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_pending_resolves_closed() {
        let router = Router::new();
        let reply = router.register_request(1);
        router.fail_pending();
        assert!(matches!(reply.recv().await, Err(ChannelError::Closed)));
    }
}
