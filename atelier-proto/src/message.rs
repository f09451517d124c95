//! Message envelopes crossing the client/server channel.
//!
//! Requests that expect an acknowledgement carry a `request_id` which the
//! server echoes back in the matching ack; push events carry enough routing
//! information for [`ServerMessage::scope`] to classify them. Envelopes are
//! bincode-encoded for minimal overhead.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{FileId, FileNode};

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Namespacing key for server-push subscriptions.
///
/// Every session subscribes under exactly one scope, so concurrent sessions
/// sharing the process-wide channel never receive each other's events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Events for one open file in one room.
    File { room_id: Uuid, file_id: FileId },
    /// Events for one user's interactive session in one room.
    Terminal { room_id: Uuid, user_id: Uuid },
    /// Room-wide events (file-tree changes).
    Room { room_id: Uuid },
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinFile {
        request_id: u64,
        room_id: Uuid,
        file: FileNode,
    },
    LeaveFile {
        room_id: Uuid,
        file: FileNode,
    },
    /// Outgoing CRDT delta produced by a local edit.
    Delta {
        room_id: Uuid,
        file_id: FileId,
        file_path: String,
        update: Vec<u8>,
    },
    SaveFile {
        request_id: u64,
        room_id: Uuid,
        file_id: FileId,
        file_path: String,
    },
    InitTerminal {
        room_id: Uuid,
        user_id: Uuid,
        session_key: String,
    },
    TerminalInput {
        data: String,
        room_id: Uuid,
        user_id: Uuid,
        session_key: String,
    },
    ResizeTerminal {
        cols: u16,
        rows: u16,
        room_id: Uuid,
        user_id: Uuid,
    },
    RunFile {
        file: FileNode,
        room_id: Uuid,
        user_id: Uuid,
    },
    LeaveTerminal {
        room_id: Uuid,
        user_id: Uuid,
    },
}

/// Server → client messages: acks for tracked requests plus scoped pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    JoinFileAck {
        request_id: u64,
        success: bool,
        /// Plain initial content, present for the first opener.
        content: Option<String>,
        /// Authoritative replica snapshot, present once collaborators exist.
        state: Option<Vec<u8>>,
    },
    SaveFileAck {
        request_id: u64,
        success: bool,
    },
    /// Incremental CRDT delta from a remote peer.
    RemoteDelta {
        room_id: Uuid,
        file_id: FileId,
        update: Vec<u8>,
    },
    TerminalOutput {
        room_id: Uuid,
        user_id: Uuid,
        data: String,
    },
    TerminalExit {
        room_id: Uuid,
        user_id: Uuid,
        exit_code: i32,
    },
    TerminalError {
        room_id: Uuid,
        user_id: Uuid,
        error: String,
    },
    FileRemoved {
        room_id: Uuid,
        path: String,
    },
    FileRenamed {
        room_id: Uuid,
        old_path: String,
        new_path: String,
    },
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// The request id, for messages expecting an acknowledgement.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::JoinFile { request_id, .. }
            | ClientMessage::SaveFile { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// The request id this message acknowledges, if it is an ack.
    pub fn ack_of(&self) -> Option<u64> {
        match self {
            ServerMessage::JoinFileAck { request_id, .. }
            | ServerMessage::SaveFileAck { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// The subscription scope this push event belongs to.
    ///
    /// Acks return `None`: they are routed by request id, not by scope.
    pub fn scope(&self) -> Option<Scope> {
        match self {
            ServerMessage::RemoteDelta {
                room_id, file_id, ..
            } => Some(Scope::File {
                room_id: *room_id,
                file_id: file_id.clone(),
            }),
            ServerMessage::TerminalOutput {
                room_id, user_id, ..
            }
            | ServerMessage::TerminalExit {
                room_id, user_id, ..
            }
            | ServerMessage::TerminalError {
                room_id, user_id, ..
            } => Some(Scope::Terminal {
                room_id: *room_id,
                user_id: *user_id,
            }),
            ServerMessage::FileRemoved { room_id, .. }
            | ServerMessage::FileRenamed { room_id, .. } => {
                Some(Scope::Room { room_id: *room_id })
            }
            ServerMessage::JoinFileAck { .. } | ServerMessage::SaveFileAck { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_file_roundtrip() {
        let msg = ClientMessage::JoinFile {
            request_id: 7,
            room_id: Uuid::new_v4(),
            file: FileNode::file("main.py"),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_delta_roundtrip() {
        let msg = ClientMessage::Delta {
            room_id: Uuid::new_v4(),
            file_id: FileId::from_path("src/main.py"),
            file_path: "src/main.py".into(),
            update: vec![1, 2, 3, 4],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_request_id_only_on_tracked_requests() {
        let join = ClientMessage::JoinFile {
            request_id: 1,
            room_id: Uuid::new_v4(),
            file: FileNode::file("a.py"),
        };
        assert_eq!(join.request_id(), Some(1));

        let leave = ClientMessage::LeaveTerminal {
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        assert_eq!(leave.request_id(), None);
    }

    #[test]
    fn test_ack_routing() {
        let ack = ServerMessage::SaveFileAck {
            request_id: 42,
            success: true,
        };
        assert_eq!(ack.ack_of(), Some(42));
        assert_eq!(ack.scope(), None);
    }

    #[test]
    fn test_remote_delta_scoped_to_file() {
        let room_id = Uuid::new_v4();
        let msg = ServerMessage::RemoteDelta {
            room_id,
            file_id: FileId::from_path("main.py"),
            update: vec![9],
        };
        assert_eq!(
            msg.scope(),
            Some(Scope::File {
                room_id,
                file_id: FileId::from_path("main.py"),
            })
        );
    }

    #[test]
    fn test_terminal_events_scoped_to_user() {
        let room_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let scope = Scope::Terminal { room_id, user_id };

        let out = ServerMessage::TerminalOutput {
            room_id,
            user_id,
            data: "$ ".into(),
        };
        let exit = ServerMessage::TerminalExit {
            room_id,
            user_id,
            exit_code: 0,
        };
        assert_eq!(out.scope(), Some(scope.clone()));
        assert_eq!(exit.scope(), Some(scope));
    }

    #[test]
    fn test_tree_events_scoped_to_room() {
        let room_id = Uuid::new_v4();
        let msg = ServerMessage::FileRemoved {
            room_id,
            path: "old.py".into(),
        };
        assert_eq!(msg.scope(), Some(Scope::Room { room_id }));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ServerMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }
}
