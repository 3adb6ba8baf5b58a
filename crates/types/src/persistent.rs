//! Durable write-ahead-log entries.
//!
//! The state machine emits these for the host to persist; on restart the
//! host replays them in order to reconstruct the state machine exactly.

use crate::{EpochConfig, ForwardRequest, Hash, NetworkState};
use sbor::prelude::*;

/// Checkpoint entry: a stable cut of the network's state.
///
/// Replay is guaranteed to see a CEntry before any Q/P entry. It installs
/// the network configuration, the client windows, and the epoch that was
/// active at the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct CEntry {
    /// The checkpoint-aligned sequence number.
    pub seq_no: u64,

    /// Application snapshot value at that point.
    pub value: Vec<u8>,

    /// Network configuration and per-client window state.
    pub network_state: NetworkState,

    /// The epoch active when the checkpoint was taken.
    pub epoch_config: EpochConfig,
}

/// Preprepare record: a batch this replica accepted for a sequence.
///
/// Multiple QEntries may exist for one sequence number across different
/// epochs; all are retained until pruned by a stable checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct QEntry {
    /// The sequence number.
    pub seq_no: u64,

    /// Epoch the batch was accepted in.
    pub epoch: u64,

    /// Digest of the batch. Zero for a null batch.
    pub digest: Hash,

    /// The batched requests, in order. Empty for a null batch.
    pub requests: Vec<ForwardRequest>,
}

/// Prepare record: this replica saw a prepare quorum for the digest.
///
/// A PEntry for a newer epoch supersedes one for an older epoch at the
/// same sequence number.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PEntry {
    /// The sequence number.
    pub seq_no: u64,

    /// Epoch the quorum formed in.
    pub epoch: u64,

    /// Digest of the prepared batch.
    pub digest: Hash,
}

/// The WAL record envelope.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Persistent {
    /// Checkpoint entry.
    C(CEntry),

    /// Preprepare record.
    Q(QEntry),

    /// Prepare record.
    P(PEntry),
}

impl Persistent {
    /// Record type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Persistent::C(_) => "CEntry",
            Persistent::Q(_) => "QEntry",
            Persistent::P(_) => "PEntry",
        }
    }
}
