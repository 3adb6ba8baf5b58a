//! Epoch-change sub-protocol messages.

use crate::{Checkpoint, Hash, NodeId};
use sbor::prelude::*;

/// A replica's declaration that it suspects the leaders of `epoch`.
///
/// `f + 1` distinct suspicions of epoch `e` justify abandoning `e` and
/// moving to the change protocol for `e + 1`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Suspect {
    /// The epoch under suspicion.
    pub epoch: u64,
}

/// One entry of an epoch change's P or Q certificate set: a sequence this
/// replica holds a persisted Prepare (P) or Preprepare (Q) record for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, BasicSbor)]
pub struct SetEntry {
    /// Epoch the record was made in.
    pub epoch: u64,

    /// The sequence number.
    pub seq_no: u64,

    /// Digest of the batch.
    pub digest: Hash,
}

/// A replica's certified state offered to the new epoch: its highest
/// stable checkpoint and every not-yet-pruned Q/P record above it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct EpochChange {
    /// The epoch this change proposes to enter.
    pub new_epoch: u64,

    /// Stable checkpoints the replica vouches for (highest first is not
    /// required; receivers take the maximum with quorum support).
    pub checkpoints: Vec<Checkpoint>,

    /// Sequences with a persisted Prepare certificate.
    pub p_set: Vec<SetEntry>,

    /// Sequences with a persisted Preprepare record.
    pub q_set: Vec<SetEntry>,
}

/// Acknowledgement of a peer's epoch change, identified by the digest of
/// its serialized content. `2f + 1` matching acks make the change usable
/// in a new-epoch certificate.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct EpochChangeAck {
    /// The replica whose epoch change is being acknowledged.
    pub originator: NodeId,

    /// Digest of the acknowledged epoch change.
    pub digest: Hash,
}

/// The leader assignment of one epoch.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct EpochConfig {
    /// The epoch number.
    pub number: u64,

    /// Leaders, ordered; bucket `b` is led by `leaders[b % leaders.len()]`.
    pub leaders: Vec<NodeId>,
}

/// The full configuration a new epoch starts from, derived
/// deterministically from a quorum of epoch changes.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewEpochConfig {
    /// Epoch number and leader set.
    pub config: EpochConfig,

    /// The checkpoint the epoch resumes from.
    pub starting_checkpoint: Checkpoint,

    /// One slot per sequence in `(checkpoint, max certified seq]`:
    /// `Some(digest)` re-proposes that batch as already prepared, `None`
    /// fills the slot with a null batch.
    pub final_preprepares: Vec<Option<Hash>>,
}

/// Reference to one epoch change included in a new-epoch certificate.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RemoteEpochChange {
    /// The originator of the epoch change.
    pub node_id: NodeId,

    /// Digest of the epoch change.
    pub digest: Hash,
}

/// The new epoch proposal broadcast by the epoch's leader, combining a
/// quorum of acknowledged epoch changes.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewEpoch {
    /// The derived starting configuration.
    pub config: NewEpochConfig,

    /// The epoch changes the configuration was derived from.
    pub epoch_changes: Vec<RemoteEpochChange>,
}

/// Echo of a new-epoch configuration, identified by its digest.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewEpochEcho {
    /// Digest of the echoed configuration.
    pub digest: Hash,
}

/// Readiness declaration for a new-epoch configuration.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewEpochReady {
    /// Digest of the configuration.
    pub digest: Hash,
}

impl EpochConfig {
    /// The leader owning bucket `bucket`.
    ///
    /// # Panics
    ///
    /// Panics if the leader set is empty (configs are validated on
    /// construction).
    pub fn bucket_leader(&self, bucket: u64) -> NodeId {
        self.leaders[(bucket % self.leaders.len() as u64) as usize]
    }
}
