//! Conflict-free replicated text buffer.
//!
//! One [`TextReplica`] per open file, exclusively owned by that file's
//! session. Merges are commutative and idempotent (delegated to the Yrs
//! CRDT), so remote deltas can be applied in any arrival order once the
//! replica is hydrated. Character identity is positional-index-free inside
//! the CRDT; the `u32` indices taken by [`TextReplica::insert`] and
//! [`TextReplica::delete`] address the current local text in UTF-8 bytes
//! (the Yrs default offset kind).

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Replica-level failures.
#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    #[error("malformed delta: {0}")]
    Decode(String),
    #[error("merge rejected: {0}")]
    Merge(String),
}

/// Who caused a replica change.
///
/// The session coordinator forwards only `LocalEdit` changes to the
/// transport; that filter is the no-echo guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    LocalEdit,
    RemoteMerge,
    Hydration,
}

/// One change notification: its origin plus the encoded delta it produced.
#[derive(Debug, Clone)]
pub struct ReplicaChange {
    pub origin: ChangeOrigin,
    pub update: Vec<u8>,
}

/// A client's local copy of one file's CRDT-backed document.
pub struct TextReplica {
    doc: Doc,
    text: TextRef,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ReplicaChange>>>,
}

impl TextReplica {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        Self {
            doc,
            text,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Build a replica already hydrated from an authoritative snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        replica.hydrate(snapshot)?;
        Ok(replica)
    }

    /// Register a change listener. Every mutation is reported with its
    /// origin and the delta it encoded.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ReplicaChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn notify(&self, origin: ChangeOrigin, update: Vec<u8>) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| {
            tx.send(ReplicaChange {
                origin,
                update: update.clone(),
            })
            .is_ok()
        });
    }

    /// Insert text at a byte offset (local edit).
    pub fn insert(&self, index: u32, chunk: &str) {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::LocalEdit, update);
    }

    /// Delete `len` bytes starting at a byte offset (local edit).
    pub fn delete(&self, index: u32, len: u32) {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::LocalEdit, update);
    }

    /// Merge a remote delta. Reapplying an already-seen delta is a no-op;
    /// merge order does not affect the converged state.
    pub fn apply_delta(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let decoded = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let produced = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ReplicaError::Merge(e.to_string()))?;
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::RemoteMerge, produced);
        Ok(())
    }

    /// Hydrate from a full-state snapshot (late-joiner path; no history
    /// replay).
    pub fn hydrate(&self, snapshot: &[u8]) -> Result<(), ReplicaError> {
        let decoded =
            Update::decode_v1(snapshot).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let produced = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ReplicaError::Merge(e.to_string()))?;
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::Hydration, produced);
        Ok(())
    }

    /// Seed an empty replica with plain initial content (first-opener path).
    pub fn seed(&self, content: &str) {
        if content.is_empty() {
            return;
        }
        let update = {
            let mut txn = self.doc.transact_mut();
            self.text.insert(&mut txn, 0, content);
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::Hydration, update);
    }

    /// Full serialized state, suitable for hydrating another replica.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current text contents.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Current length in bytes.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TextReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ReplicaChange>) -> Vec<ReplicaChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[test]
    fn test_local_insert_and_read() {
        let replica = TextReplica::new();
        replica.insert(0, "hello");
        replica.insert(5, " world");
        assert_eq!(replica.text(), "hello world");
        assert_eq!(replica.len(), 11);
    }

    #[test]
    fn test_delete_range() {
        let replica = TextReplica::new();
        replica.insert(0, "hello world");
        replica.delete(5, 6);
        assert_eq!(replica.text(), "hello");
    }

    #[test]
    fn test_local_edit_produces_delta_for_peer() {
        let a = TextReplica::new();
        let b = TextReplica::new();

        let mut changes = a.subscribe();
        a.insert(0, "print(1)");
        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, ChangeOrigin::LocalEdit);

        b.apply_delta(&change.update).unwrap();
        assert_eq!(b.text(), "print(1)");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = TextReplica::new();
        let b = TextReplica::new();

        let mut changes = a.subscribe();
        a.insert(0, "abc");
        let delta = changes.try_recv().unwrap().update;

        b.apply_delta(&delta).unwrap();
        b.apply_delta(&delta).unwrap();
        assert_eq!(b.text(), "abc");
        assert_eq!(b.snapshot(), {
            let c = TextReplica::new();
            c.apply_delta(&delta).unwrap();
            c.snapshot()
        });
    }

    #[test]
    fn test_merge_is_commutative() {
        let alice = TextReplica::new();
        let bob = TextReplica::new();

        let mut alice_changes = alice.subscribe();
        let mut bob_changes = bob.subscribe();
        alice.insert(0, "alpha ");
        bob.insert(0, "beta ");
        let d1 = alice_changes.try_recv().unwrap().update;
        let d2 = bob_changes.try_recv().unwrap().update;

        let forward = TextReplica::new();
        forward.apply_delta(&d1).unwrap();
        forward.apply_delta(&d2).unwrap();

        let reverse = TextReplica::new();
        reverse.apply_delta(&d2).unwrap();
        reverse.apply_delta(&d1).unwrap();

        assert_eq!(forward.text(), reverse.text());
        assert_eq!(forward.snapshot(), reverse.snapshot());
    }

    #[test]
    fn test_concurrent_edits_at_divergent_positions() {
        let a = TextReplica::new();
        a.seed("fn main() {}\n");
        let b = TextReplica::from_snapshot(&a.snapshot()).unwrap();

        let mut a_changes = a.subscribe();
        let mut b_changes = b.subscribe();
        a.insert(0, "// header\n");
        b.insert(b.len(), "// footer\n");

        for change in drain(&mut a_changes) {
            b.apply_delta(&change.update).unwrap();
        }
        for change in drain(&mut b_changes) {
            if change.origin == ChangeOrigin::LocalEdit {
                a.apply_delta(&change.update).unwrap();
            }
        }

        assert_eq!(a.text(), b.text());
        assert!(a.text().starts_with("// header\n"));
        assert!(a.text().ends_with("// footer\n"));
    }

    #[test]
    fn test_snapshot_hydration() {
        let original = TextReplica::new();
        original.seed("print(1)\n");
        original.insert(9, "print(2)\n");

        let joiner = TextReplica::from_snapshot(&original.snapshot()).unwrap();
        assert_eq!(joiner.text(), original.text());
    }

    #[test]
    fn test_origin_tagging() {
        let replica = TextReplica::new();
        let mut changes = replica.subscribe();

        replica.seed("seeded");
        replica.insert(6, "!");

        let peer = TextReplica::new();
        let mut peer_changes = peer.subscribe();
        peer.insert(0, "x");
        let remote = peer_changes.try_recv().unwrap().update;
        replica.apply_delta(&remote).unwrap();

        let origins: Vec<_> = drain(&mut changes).into_iter().map(|c| c.origin).collect();
        assert_eq!(
            origins,
            vec![
                ChangeOrigin::Hydration,
                ChangeOrigin::LocalEdit,
                ChangeOrigin::RemoteMerge,
            ]
        );
    }

    #[test]
    fn test_seed_empty_content_is_noop() {
        let replica = TextReplica::new();
        let mut changes = replica.subscribe();
        replica.seed("");
        assert!(changes.try_recv().is_err());
        assert!(replica.is_empty());
    }

    #[test]
    fn test_malformed_delta_rejected() {
        let replica = TextReplica::new();
        assert!(matches!(
            replica.apply_delta(&[0xFF, 0x00, 0x12]),
            Err(ReplicaError::Decode(_))
        ));
    }
}
