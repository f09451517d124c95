//! In-memory loopback channel.
//!
//! [`local_pair`] yields a client end implementing [`Channel`] and a
//! [`LocalServer`] end that observes everything the client sent and injects
//! server messages. Tests script the server end by hand; embedded setups can
//! bridge it to anything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use atelier_proto::{ClientMessage, Scope, ServerMessage};

use crate::channel::{Channel, ChannelError, PendingReply, Router, Subscription};

/// Create a connected loopback pair.
pub fn local_pair() -> (Arc<LocalChannel>, LocalServer) {
    let router = Router::new();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let channel = Arc::new(LocalChannel {
        router: router.clone(),
        out_tx,
        closed: closed.clone(),
    });
    let server = LocalServer {
        rx: Mutex::new(out_rx),
        router,
        closed,
    };
    (channel, server)
}

/// Client end of the loopback pair.
pub struct LocalChannel {
    router: Arc<Router>,
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    closed: Arc<AtomicBool>,
}

impl Channel for LocalChannel {
    fn next_request_id(&self) -> u64 {
        self.router.next_request_id()
    }

    fn send(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.out_tx.send(msg).map_err(|_| ChannelError::Closed)
    }

    fn request(&self, msg: ClientMessage) -> Result<PendingReply, ChannelError> {
        let reply = self.router.register_request_for(&msg)?;
        self.send(msg)?;
        Ok(reply)
    }

    fn subscribe(&self, scope: Scope) -> Subscription {
        self.router.subscribe(scope)
    }
}

/// Server end of the loopback pair.
pub struct LocalServer {
    rx: Mutex<mpsc::UnboundedReceiver<ClientMessage>>,
    router: Arc<Router>,
    closed: Arc<AtomicBool>,
}

impl LocalServer {
    /// Next message the client sent.
    pub async fn recv(&self) -> Option<ClientMessage> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking receive.
    pub async fn try_recv(&self) -> Option<ClientMessage> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Drain everything sent so far.
    pub async fn drain(&self) -> Vec<ClientMessage> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Inject a server message into the client's router.
    pub fn push(&self, msg: ServerMessage) {
        self.router.deliver(msg);
    }

    /// Simulate connection loss: outstanding requests resolve with
    /// `ChannelError::Closed`, subscriptions end, sends start failing.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        self.router.fail_pending();
        self.router.close_subscriptions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_proto::{FileId, FileNode};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_send_is_observable_on_server_end() {
        let (channel, server) = local_pair();
        let room_id = Uuid::new_v4();
        channel
            .send(ClientMessage::LeaveFile {
                room_id,
                file: FileNode::file("a.py"),
            })
            .unwrap();

        match server.recv().await {
            Some(ClientMessage::LeaveFile { room_id: r, .. }) => assert_eq!(r, room_id),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_reply_cycle() {
        let (channel, server) = local_pair();
        let request_id = channel.next_request_id();
        let reply = channel
            .request(ClientMessage::SaveFile {
                request_id,
                room_id: Uuid::new_v4(),
                file_id: FileId::from_path("a.py"),
                file_path: "a.py".into(),
            })
            .unwrap();

        let sent = server.recv().await.unwrap();
        assert_eq!(sent.request_id(), Some(request_id));
        server.push(ServerMessage::SaveFileAck {
            request_id,
            success: true,
        });

        match reply.recv().await.unwrap() {
            ServerMessage::SaveFileAck { success, .. } => assert!(success),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_without_id_rejected() {
        let (channel, _server) = local_pair();
        let result = channel.request(ClientMessage::LeaveTerminal {
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_future_sends() {
        let (channel, server) = local_pair();
        let request_id = channel.next_request_id();
        let reply = channel
            .request(ClientMessage::SaveFile {
                request_id,
                room_id: Uuid::new_v4(),
                file_id: FileId::from_path("a.py"),
                file_path: "a.py".into(),
            })
            .unwrap();

        server.disconnect();
        assert!(matches!(reply.recv().await, Err(ChannelError::Closed)));
        assert!(matches!(
            channel.send(ClientMessage::LeaveTerminal {
                room_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            }),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_subscription_scoping_end_to_end() {
        let (channel, server) = local_pair();
        let room_id = Uuid::new_v4();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        let mut sub_a = channel.subscribe(Scope::Terminal {
            room_id,
            user_id: user_a,
        });

        server.push(ServerMessage::TerminalOutput {
            room_id,
            user_id: user_b,
            data: "not yours".into(),
        });
        server.push(ServerMessage::TerminalOutput {
            room_id,
            user_id: user_a,
            data: "yours".into(),
        });

        match sub_a.recv().await.unwrap() {
            ServerMessage::TerminalOutput { data, .. } => assert_eq!(data, "yours"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
