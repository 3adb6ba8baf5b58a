//! Single-slot ordering state machine.
//!
//! One [`Sequence`] owns one sequence number inside the active epoch and
//! walks it monotonically through `Free → Allocated → Preprepared →
//! Prepared → Committed`. Prepare and commit votes are collected per
//! digest; quorum is only ever checked against the locally preprepared
//! digest, so an equivocating leader can stall a slot but never split it.
//!
//! Commit delivery to the application is not emitted here: the epoch
//! drains committed slots in sequence order, so a slot that commits
//! early waits for its predecessors.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};
use weft_core::{Actions, HashOrigin};
use weft_messages::Msg;
use weft_types::{Commit, ForwardRequest, Hash, NodeId, PEntry, Prepare, Preprepare, QEntry};

/// Lifecycle of one sequence slot. Transitions are monotonic; a slot
/// never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SequenceState {
    /// No batch assigned yet.
    Free,

    /// A batch is assigned and being digested.
    Allocated,

    /// The batch digest is known and persisted; collecting prepares.
    Preprepared,

    /// A prepare quorum formed; collecting commits.
    Prepared,

    /// A commit quorum formed; the batch is finally ordered.
    Committed,
}

/// One sequence slot.
#[derive(Debug)]
pub(crate) struct Sequence {
    seq_no: u64,
    epoch: u64,
    leader: NodeId,
    my_id: NodeId,
    quorum: usize,

    state: SequenceState,
    digest: Option<Hash>,
    batch: Vec<ForwardRequest>,

    /// Prepare votes per claimed digest. Votes arriving before our own
    /// digest is known are parked here and counted once it is.
    prepares: BTreeMap<Hash, BTreeSet<NodeId>>,

    /// Commit votes per claimed digest.
    commits: BTreeMap<Hash, BTreeSet<NodeId>>,
}

impl Sequence {
    pub(crate) fn new(seq_no: u64, epoch: u64, leader: NodeId, my_id: NodeId, quorum: usize) -> Self {
        Self {
            seq_no,
            epoch,
            leader,
            my_id,
            quorum,
            state: SequenceState::Free,
            digest: None,
            batch: Vec::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }

    pub(crate) fn state(&self) -> SequenceState {
        self.state
    }

    pub(crate) fn seq_no(&self) -> u64 {
        self.seq_no
    }

    /// The persisted form of this slot's batch.
    ///
    /// # Panics
    ///
    /// Panics before the digest is known.
    pub(crate) fn to_q_entry(&self) -> QEntry {
        QEntry {
            seq_no: self.seq_no,
            epoch: self.epoch,
            digest: self.digest.expect("slot has no digest yet"),
            requests: self.batch.clone(),
        }
    }

    /// Assign a batch to this slot and request its digest. Used both by
    /// the local proposer (we lead the bucket) and when a leader's
    /// preprepare arrives (resolved against the client windows).
    ///
    /// Idempotent: a slot past `Free` ignores reassignment.
    pub(crate) fn allocate(&mut self, batch: Vec<ForwardRequest>) -> Actions {
        if self.state != SequenceState::Free {
            trace!(seq_no = self.seq_no, state = ?self.state, "slot already assigned, ignoring");
            return Actions::new();
        }

        self.state = SequenceState::Allocated;
        self.batch = batch;

        let mut data: Vec<Vec<u8>> = Vec::with_capacity(self.batch.len() * 3);
        for fwd in &self.batch {
            data.push(fwd.ack.client_id.0.to_le_bytes().to_vec());
            data.push(fwd.ack.req_no.to_le_bytes().to_vec());
            data.push(fwd.ack.digest.to_bytes().to_vec());
        }

        Actions::hash(
            data,
            HashOrigin::Batch {
                source: self.leader,
                epoch: self.epoch,
                seq_no: self.seq_no,
            },
        )
    }

    /// The batch digest arrived: persist the preprepare record and vote.
    ///
    /// Every replica broadcasts a `Prepare`, the leader included — its
    /// `Preprepare` names the batch but is not a vote. Votes loop back
    /// through the broadcast, so nobody is special-cased in the quorum
    /// arithmetic, and a leader that withholds its prepare cannot be
    /// completed by its own proposal.
    pub(crate) fn apply_batch_digest(&mut self, digest: Hash) -> Actions {
        if self.state != SequenceState::Allocated {
            trace!(seq_no = self.seq_no, state = ?self.state, "stale batch digest, ignoring");
            return Actions::new();
        }

        debug!(seq_no = self.seq_no, epoch = self.epoch, %digest, "preprepared");
        self.state = SequenceState::Preprepared;
        self.digest = Some(digest);

        let mut actions = Actions::new();
        actions.q_entries.push(self.to_q_entry());

        if self.leader == self.my_id {
            actions.broadcast.push(Msg::Preprepare(Box::new(Preprepare {
                epoch: self.epoch,
                seq_no: self.seq_no,
                batch: self.batch.clone(),
            })));
        }
        actions.broadcast.push(Msg::Prepare(Prepare {
            epoch: self.epoch,
            seq_no: self.seq_no,
            digest,
        }));

        actions.append(self.check_prepared());
        actions
    }

    /// Record a prepare vote. Duplicates are idempotent; votes for other
    /// digests are parked and can never reach quorum against ours.
    pub(crate) fn apply_prepare(&mut self, source: NodeId, digest: Hash) -> Actions {
        self.prepares.entry(digest).or_default().insert(source);
        self.check_prepared()
    }

    /// Record a commit vote.
    pub(crate) fn apply_commit(&mut self, source: NodeId, digest: Hash) -> Actions {
        self.commits.entry(digest).or_default().insert(source);
        self.check_committed()
    }

    /// Install this slot as already prepared, derived from a new-epoch
    /// certificate. The commit broadcast is the caller's responsibility.
    pub(crate) fn install_prepared(&mut self, digest: Hash, batch: Vec<ForwardRequest>) -> Actions {
        assert_eq!(self.state, SequenceState::Free, "install into a used slot");

        self.state = SequenceState::Prepared;
        self.digest = Some(digest);
        self.batch = batch;

        let mut actions = Actions::new();
        actions.q_entries.push(self.to_q_entry());
        actions.p_entries.push(PEntry {
            seq_no: self.seq_no,
            epoch: self.epoch,
            digest,
        });
        actions
    }

    /// Install this slot as a committed null batch (an epoch-change gap
    /// filler).
    pub(crate) fn install_null(&mut self) -> Actions {
        assert_eq!(self.state, SequenceState::Free, "install into a used slot");

        self.state = SequenceState::Committed;
        self.digest = Some(Hash::ZERO);

        let mut actions = Actions::new();
        actions.q_entries.push(self.to_q_entry());
        actions
    }

    /// Restore a replayed slot directly into a state, without re-emitting
    /// the persistence that already happened.
    pub(crate) fn restore(
        &mut self,
        state: SequenceState,
        digest: Hash,
        batch: Vec<ForwardRequest>,
    ) {
        assert_eq!(self.state, SequenceState::Free, "restore into a used slot");
        self.state = state;
        self.digest = Some(digest);
        self.batch = batch;
    }

    fn check_prepared(&mut self) -> Actions {
        if self.state != SequenceState::Preprepared {
            return Actions::new();
        }
        let digest = self.digest.expect("preprepared slot has a digest");
        let votes = self.prepares.get(&digest).map_or(0, BTreeSet::len);
        if votes < self.quorum {
            return Actions::new();
        }

        debug!(seq_no = self.seq_no, epoch = self.epoch, %digest, "prepared");
        self.state = SequenceState::Prepared;

        let mut actions = Actions::new();
        actions.p_entries.push(PEntry {
            seq_no: self.seq_no,
            epoch: self.epoch,
            digest,
        });
        actions.broadcast.push(Msg::Commit(Commit {
            epoch: self.epoch,
            seq_no: self.seq_no,
            digest,
        }));

        actions.append(self.check_committed());
        actions
    }

    fn check_committed(&mut self) -> Actions {
        if self.state != SequenceState::Prepared {
            return Actions::new();
        }
        let digest = self.digest.expect("prepared slot has a digest");
        let votes = self.commits.get(&digest).map_or(0, BTreeSet::len);
        if votes < self.quorum {
            return Actions::new();
        }

        debug!(seq_no = self.seq_no, epoch = self.epoch, %digest, "committed");
        self.state = SequenceState::Committed;
        Actions::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::{ClientId, RequestAck};

    fn batch_entry(req_no: u64) -> ForwardRequest {
        ForwardRequest {
            ack: RequestAck {
                client_id: ClientId(1),
                req_no,
                digest: Hash::from_bytes(format!("req{req_no}").as_bytes()),
            },
            data: format!("payload{req_no}").into_bytes(),
        }
    }

    fn leader_sequence() -> Sequence {
        // Four nodes, we are the leader (node 0), quorum 3.
        Sequence::new(1, 0, NodeId(0), NodeId(0), 3)
    }

    fn follower_sequence() -> Sequence {
        Sequence::new(1, 0, NodeId(0), NodeId(1), 3)
    }

    #[test]
    fn test_leader_walks_to_commit() {
        let mut seq = leader_sequence();
        let digest = Hash::from_bytes(b"batch");

        let actions = seq.allocate(vec![batch_entry(7)]);
        assert_eq!(actions.hash.len(), 1);
        assert_eq!(seq.state(), SequenceState::Allocated);

        let actions = seq.apply_batch_digest(digest);
        assert_eq!(seq.state(), SequenceState::Preprepared);
        assert_eq!(actions.q_entries.len(), 1);
        // The leader announces the batch and votes for it.
        assert!(matches!(&actions.broadcast[0], Msg::Preprepare(_)));
        assert!(matches!(&actions.broadcast[1], Msg::Prepare(_)));

        // Our own looped-back prepare plus two peers reach quorum.
        seq.apply_prepare(NodeId(0), digest);
        assert!(seq.apply_prepare(NodeId(1), digest).is_empty());
        let actions = seq.apply_prepare(NodeId(2), digest);
        assert_eq!(seq.state(), SequenceState::Prepared);
        assert_eq!(actions.p_entries.len(), 1);
        assert!(matches!(&actions.broadcast[0], Msg::Commit(_)));

        seq.apply_commit(NodeId(0), digest);
        seq.apply_commit(NodeId(1), digest);
        seq.apply_commit(NodeId(2), digest);
        assert_eq!(seq.state(), SequenceState::Committed);
        assert_eq!(seq.to_q_entry().digest, digest);
    }

    #[test]
    fn test_follower_broadcasts_only_prepare() {
        let mut seq = follower_sequence();
        seq.allocate(vec![batch_entry(7)]);
        let actions = seq.apply_batch_digest(Hash::from_bytes(b"batch"));
        assert_eq!(actions.broadcast.len(), 1);
        assert!(matches!(&actions.broadcast[0], Msg::Prepare(_)));
    }

    #[test]
    fn test_early_votes_count_once_digest_known() {
        let mut seq = follower_sequence();
        let digest = Hash::from_bytes(b"batch");

        // Votes arrive before the digest result.
        seq.apply_prepare(NodeId(0), digest);
        seq.apply_prepare(NodeId(2), digest);
        seq.apply_prepare(NodeId(3), digest);

        seq.allocate(vec![batch_entry(7)]);
        let actions = seq.apply_batch_digest(digest);

        // The three early votes are a quorum; prepared immediately.
        assert_eq!(seq.state(), SequenceState::Prepared);
        assert_eq!(actions.p_entries.len(), 1);
    }

    #[test]
    fn test_wrong_digest_votes_never_reach_quorum() {
        let mut seq = follower_sequence();
        let ours = Hash::from_bytes(b"ours");
        let theirs = Hash::from_bytes(b"theirs");

        seq.allocate(vec![batch_entry(7)]);
        seq.apply_batch_digest(ours);

        seq.apply_prepare(NodeId(2), theirs);
        seq.apply_prepare(NodeId(3), theirs);
        let actions = seq.apply_prepare(NodeId(0), theirs);

        assert!(actions.is_empty());
        assert_eq!(seq.state(), SequenceState::Preprepared);
    }

    #[test]
    fn test_duplicate_votes_are_idempotent() {
        let mut seq = follower_sequence();
        let digest = Hash::from_bytes(b"batch");
        seq.allocate(vec![batch_entry(7)]);
        seq.apply_batch_digest(digest);

        seq.apply_prepare(NodeId(2), digest);
        let actions = seq.apply_prepare(NodeId(2), digest);
        assert!(actions.is_empty());
        assert_eq!(seq.state(), SequenceState::Preprepared);
    }

    #[test]
    fn test_install_null_is_committed_empty() {
        let mut seq = Sequence::new(3, 1, NodeId(2), NodeId(0), 3);
        let actions = seq.install_null();
        assert_eq!(seq.state(), SequenceState::Committed);
        assert_eq!(actions.q_entries.len(), 1);
        assert!(seq.to_q_entry().digest.is_zero());
        assert!(seq.to_q_entry().requests.is_empty());
    }

    #[test]
    fn test_install_prepared_persists_both_records() {
        let mut seq = Sequence::new(2, 1, NodeId(1), NodeId(0), 3);
        let digest = Hash::from_bytes(b"inherited");
        let actions = seq.install_prepared(digest, vec![batch_entry(9)]);

        assert_eq!(seq.state(), SequenceState::Prepared);
        assert_eq!(actions.q_entries.len(), 1);
        assert_eq!(actions.p_entries.len(), 1);
        assert_eq!(actions.q_entries[0].epoch, 1);
    }
}
