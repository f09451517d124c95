//! WebSocket-backed channel implementation.
//!
//! Connection layout mirrors the rest of the stack: one writer task drains
//! the outgoing queue into the socket sink, one reader task decodes inbound
//! frames and hands them to the router. When the socket drops, every pending
//! request resolves with `ChannelError::Closed` and all subscriptions end;
//! recovery is the sessions' responsibility (file sessions surface the
//! error, terminal sessions reinitialize).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use atelier_proto::{ClientMessage, Scope, ServerMessage};

use crate::channel::{Channel, ChannelConfig, ChannelError, PendingReply, Router, Subscription};

/// Channel over one persistent WebSocket connection.
pub struct WsChannel {
    router: Arc<Router>,
    out_tx: mpsc::Sender<ClientMessage>,
    closed: Arc<AtomicBool>,
}

impl WsChannel {
    /// Connect and spawn the reader/writer tasks.
    pub async fn connect(config: ChannelConfig) -> Result<Arc<Self>, ChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&config.url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        log::info!("channel connected to {}", config.url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(config.outgoing_capacity);
        let router = Router::new();
        let closed = Arc::new(AtomicBool::new(false));

        // Writer: outgoing queue → socket sink.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("dropping unencodable outgoing message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader: socket → router.
        let reader_router = router.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(msg) => reader_router.deliver(msg),
                            Err(e) => log::warn!("dropping undecodable server message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_closed.store(true, Ordering::Release);
            reader_router.fail_pending();
            reader_router.close_subscriptions();
            log::info!("channel connection closed");
        });

        Ok(Arc::new(Self {
            router,
            out_tx,
            closed,
        }))
    }

    /// Whether the underlying connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Channel for WsChannel {
    fn next_request_id(&self) -> u64 {
        self.router.next_request_id()
    }

    fn send(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.out_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Congested,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
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
