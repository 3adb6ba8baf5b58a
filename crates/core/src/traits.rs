//! Collaborator capabilities consumed by hosts executing action batches.
//!
//! The state machine itself never touches these; they define the seam
//! between it and the runner. Production runners back them with real
//! transport and storage; tests use the in-memory implementations from
//! `weft-test-helpers`.

use std::io;
use weft_messages::Msg;
use weft_types::{Hash, NodeId, Persistent, QEntry, RequestAck};

/// Best-effort message transport. May reorder, drop, or duplicate.
pub trait Link {
    /// Send `msg` to `dest`. Sends to our own id must loop back through
    /// `StateMachine::step` like any other delivery.
    fn send(&mut self, dest: NodeId, msg: &Msg);
}

/// The replicated application log.
pub trait AppLog {
    /// Apply a finally-ordered batch.
    fn apply(&mut self, entry: &QEntry);

    /// Snapshot the application state, returning a value that strongly
    /// identifies it (checkpoint values compare by equality across
    /// replicas).
    fn snap(&mut self) -> Vec<u8>;
}

/// The write-ahead log. Failures are not survivable: a host that cannot
/// persist must halt and recover by replay.
pub trait Wal {
    /// Append an entry.
    fn append(&mut self, entry: &Persistent) -> io::Result<()>;

    /// Durability barrier: everything appended so far is on disk when
    /// this returns.
    fn sync(&mut self) -> io::Result<()>;
}

/// Durable store of request payloads keyed by `(client, req_no, digest)`.
pub trait RequestStore {
    /// Store a payload under its acknowledgement key.
    fn store(&mut self, ack: &RequestAck, data: &[u8]) -> io::Result<()>;

    /// Fetch a payload, if present.
    fn get(&self, ack: &RequestAck) -> io::Result<Option<Vec<u8>>>;

    /// Durability barrier.
    fn sync(&mut self) -> io::Result<()>;
}

/// An accumulating digest computation.
pub trait DigestHasher {
    /// Feed bytes into the digest.
    fn update(&mut self, data: &[u8]);

    /// Finish and produce the digest.
    fn finalize(self) -> Hash;
}

/// Source of fresh hashers. Must be cryptographically strong (SHA-256
/// class) and identical across all replicas.
pub trait HashProvider {
    /// The hasher type.
    type Hasher: DigestHasher;

    /// A fresh hasher.
    fn hasher(&self) -> Self::Hasher;

    /// Digest a series of byte slices in order.
    fn digest(&self, parts: &[Vec<u8>]) -> Hash {
        let mut hasher = self.hasher();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize()
    }
}
