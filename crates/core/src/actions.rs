//! Action and result aggregates for the deterministic state machine.
//!
//! The state machine never performs I/O. Every call into it returns an
//! [`Actions`] batch describing the sends, persists, hashes, and commits
//! the host must execute; results that feed back in arrive as an
//! [`ActionResults`] batch.

use weft_messages::Msg;
use weft_types::{CEntry, EpochChange, Hash, NewEpochConfig, NodeId, PEntry, QEntry, RequestData};

/// Everything the host must do on behalf of the state machine after one
/// call into it.
///
/// Field order is meaningful to the host: WAL entries must be durable and
/// request payloads synced before the corresponding broadcast or unicast
/// leaves the node; commits are applied to the application log in the
/// order given; hashing may run in parallel with everything else.
///
/// All fields are plain vectors appended in a deterministic order —
/// feeding the same events to the same state yields byte-identical
/// batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions {
    /// Messages to send to every node, including ourselves.
    pub broadcast: Vec<Msg>,

    /// Messages to send to one node.
    pub unicast: Vec<Unicast>,

    /// Requests the host must validate and digest, answering with a
    /// [`PreprocessResult`].
    pub preprocess: Vec<Request>,

    /// Data to digest, answering with a [`HashResult`] carrying the same
    /// origin tag.
    pub hash: Vec<HashRequest>,

    /// Checkpoint records to persist; each supersedes the WAL content
    /// below its sequence.
    pub c_entries: Vec<CEntry>,

    /// Preprepare records to persist. Multiple entries may exist for one
    /// sequence number across epochs; all must be retained.
    pub q_entries: Vec<QEntry>,

    /// Prepare records to persist. An entry for an older epoch at the
    /// same sequence may be discarded once superseded.
    pub p_entries: Vec<PEntry>,

    /// Batches that reached final order, to apply to the application log
    /// in this order. A checkpoint-flagged commit obligates the host to
    /// return a [`CheckpointResult`] before later commits are reported
    /// applied.
    pub commits: Vec<CommitEntry>,
}

impl Actions {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every field is empty.
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty()
            && self.unicast.is_empty()
            && self.preprocess.is_empty()
            && self.hash.is_empty()
            && self.c_entries.is_empty()
            && self.q_entries.is_empty()
            && self.p_entries.is_empty()
            && self.commits.is_empty()
    }

    /// Drain `other` into this batch, field by field, preserving order.
    pub fn append(&mut self, mut other: Actions) {
        self.broadcast.append(&mut other.broadcast);
        self.unicast.append(&mut other.unicast);
        self.preprocess.append(&mut other.preprocess);
        self.hash.append(&mut other.hash);
        self.c_entries.append(&mut other.c_entries);
        self.q_entries.append(&mut other.q_entries);
        self.p_entries.append(&mut other.p_entries);
        self.commits.append(&mut other.commits);
    }

    /// Clear all fields.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A batch containing a single broadcast.
    pub fn broadcast(msg: Msg) -> Self {
        Self {
            broadcast: vec![msg],
            ..Self::default()
        }
    }

    /// A batch containing a single unicast.
    pub fn unicast(target: NodeId, msg: Msg) -> Self {
        Self {
            unicast: vec![Unicast { target, msg }],
            ..Self::default()
        }
    }

    /// A batch containing a single hash request.
    pub fn hash(data: Vec<Vec<u8>>, origin: HashOrigin) -> Self {
        Self {
            hash: vec![HashRequest { data, origin }],
            ..Self::default()
        }
    }
}

/// A message for one specific node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unicast {
    /// The destination.
    pub target: NodeId,

    /// The message.
    pub msg: Msg,
}

/// A client request handed to the host for validation and digesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Where the request entered the protocol: ourselves for local
    /// proposals, the forwarding peer otherwise. Hosts may validate
    /// third-party submissions more strictly than their own.
    pub source: NodeId,

    /// The request payload.
    pub request: RequestData,
}

/// Host's answer to a [`Request`] preprocess action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessResult {
    /// Digest of the request payload.
    pub digest: Hash,

    /// The preprocessed request.
    pub request: Request,

    /// Set when the request fails application validation. Validation
    /// must be state-independent so every honest node agrees.
    pub invalid: bool,
}

/// Data to digest plus the context to resume with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRequest {
    /// Byte slices to feed to the hasher, in order.
    pub data: Vec<Vec<u8>>,

    /// Where the result routes back to.
    pub origin: HashOrigin,
}

/// The caller context of a hash request. Carries owned data only; no
/// borrowed state crosses the core/host boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOrigin {
    /// A batch being preprepared at `(epoch, seq_no)`.
    Batch {
        /// The bucket leader that proposed the batch.
        source: NodeId,
        /// Epoch the sequence belongs to.
        epoch: u64,
        /// The sequence number.
        seq_no: u64,
    },

    /// A forwarded request payload being checked against the digest its
    /// forwarder claimed.
    VerifyRequest {
        /// The forwarding peer.
        source: NodeId,
        /// The forwarded payload.
        request: RequestData,
        /// The digest the forwarder claimed.
        expected_digest: Hash,
    },

    /// A peer's epoch change being digested for acknowledgement.
    EpochChange {
        /// The originator of the epoch change.
        source: NodeId,
        /// The epoch change itself.
        epoch_change: EpochChange,
    },

    /// A new-epoch configuration being digested for echo.
    NewEpochConfig {
        /// The configuration.
        config: NewEpochConfig,
    },
}

/// Host's answer to a [`HashRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashResult {
    /// The digest of the request's data.
    pub digest: Hash,

    /// The origin tag from the request, unchanged.
    pub origin: HashOrigin,
}

/// A finally-ordered batch ready for the application log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    /// The batch, as persisted.
    pub q_entry: QEntry,

    /// Set on checkpoint-interval boundaries: the host must snapshot the
    /// application and return a [`CheckpointResult`] for this sequence.
    pub checkpoint: bool,
}

/// Host's snapshot value after applying a checkpoint-flagged commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointResult {
    /// The checkpoint-aligned sequence number.
    pub seq_no: u64,

    /// Application snapshot value; a strong digest of world state.
    pub value: Vec<u8>,
}

/// Results of executing an [`Actions`] batch, fed back to the state
/// machine in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResults {
    /// Answers to `hash` requests.
    pub digests: Vec<HashResult>,

    /// Answers to `preprocess` requests.
    pub preprocessed: Vec<PreprocessResult>,

    /// Answers to checkpoint-flagged commits.
    pub checkpoints: Vec<CheckpointResult>,
}

impl ActionResults {
    /// Whether every field is empty.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty() && self.preprocessed.is_empty() && self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_messages::Msg;
    use weft_types::{ClientId, Prepare};

    fn prepare_msg(seq_no: u64) -> Msg {
        Msg::Prepare(Prepare {
            epoch: 0,
            seq_no,
            digest: Hash::from_bytes(b"d"),
        })
    }

    #[test]
    fn test_append_preserves_order() {
        let mut a = Actions::broadcast(prepare_msg(1));
        let mut b = Actions::broadcast(prepare_msg(2));
        b.append(Actions::unicast(NodeId(3), prepare_msg(3)));
        a.append(b);

        assert_eq!(a.broadcast.len(), 2);
        assert_eq!(a.unicast.len(), 1);
        assert!(matches!(&a.broadcast[0], Msg::Prepare(p) if p.seq_no == 1));
        assert!(matches!(&a.broadcast[1], Msg::Prepare(p) if p.seq_no == 2));
    }

    #[test]
    fn test_is_empty() {
        assert!(Actions::new().is_empty());

        let mut actions = Actions::new();
        actions.q_entries.push(QEntry {
            seq_no: 1,
            epoch: 0,
            digest: Hash::ZERO,
            requests: vec![],
        });
        assert!(!actions.is_empty());
        actions.clear();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_hash_origin_round_trips_through_result() {
        let origin = HashOrigin::VerifyRequest {
            source: NodeId(2),
            request: RequestData {
                client_id: ClientId(1),
                req_no: 7,
                data: b"abc".to_vec(),
            },
            expected_digest: Hash::from_bytes(b"abc"),
        };
        let request = HashRequest {
            data: vec![b"abc".to_vec()],
            origin: origin.clone(),
        };
        let result = HashResult {
            digest: Hash::from_bytes(b"abc"),
            origin: request.origin,
        };
        assert_eq!(result.origin, origin);
    }
}
