//! Ordering-pipeline messages: Preprepare, Prepare, Commit, Checkpoint.

use crate::{ForwardRequest, Hash};
use sbor::prelude::*;

/// A leader's proposal of a batch for one sequence number.
///
/// Carries the full forwarded requests so a replica that has not yet
/// stored some payload can verify and adopt it before preparing.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Preprepare {
    /// Epoch the sequence is being ordered in.
    pub epoch: u64,

    /// The sequence number being proposed.
    pub seq_no: u64,

    /// The proposed requests, in order.
    pub batch: Vec<ForwardRequest>,
}

/// A replica's vote that it holds the preprepared batch for a sequence.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Prepare {
    /// Epoch the sequence is being ordered in.
    pub epoch: u64,

    /// The sequence number.
    pub seq_no: u64,

    /// Digest of the batch.
    pub digest: Hash,
}

/// A replica's vote that a sequence is prepared and may commit.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Commit {
    /// Epoch the sequence is being ordered in.
    pub epoch: u64,

    /// The sequence number.
    pub seq_no: u64,

    /// Digest of the batch.
    pub digest: Hash,
}

/// A replica's snapshot value at a checkpoint-aligned sequence number.
///
/// `2f + 1` matching values make the checkpoint stable, allowing
/// watermarks to advance and history below it to be pruned.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Checkpoint {
    /// The checkpoint-aligned sequence number.
    pub seq_no: u64,

    /// Application snapshot value at that point, opaque to the protocol.
    pub value: Vec<u8>,
}
