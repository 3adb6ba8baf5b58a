//! Diagnostic status tree.

use std::fmt;
use weft_types::{ClientId, NodeId};

use crate::admission::PeerCounters;

/// Point-in-time diagnostic view of the state machine.
#[derive(Debug, Clone)]
pub struct Status {
    /// Our node id.
    pub node_id: NodeId,

    /// The last installed epoch.
    pub epoch: u64,

    /// The epoch currently being changed to, if any.
    pub pending_epoch: Option<u64>,

    /// Active-epoch low watermark (exclusive); zero when no epoch is
    /// active.
    pub low_watermark: u64,

    /// Active-epoch high watermark (inclusive).
    pub high_watermark: u64,

    /// Last sequence delivered to the application.
    pub last_committed: u64,

    /// Per-peer admission counters.
    pub nodes: Vec<NodeStatus>,

    /// Per-client window state.
    pub clients: Vec<ClientWindowStatus>,

    /// Per-bucket ownership and proposer backlog.
    pub buckets: Vec<BucketStatus>,

    /// In-flight checkpoint windows.
    pub checkpoints: Vec<CheckpointStatus>,

    /// Epoch-change targets.
    pub epoch_targets: Vec<EpochTargetStatus>,
}

/// One peer's admission view.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// The peer.
    pub id: NodeId,

    /// Admission counters.
    pub counters: PeerCounters,

    /// Messages currently buffered as future.
    pub buffered: usize,
}

/// One client window.
#[derive(Debug, Clone)]
pub struct ClientWindowStatus {
    /// The client.
    pub client_id: ClientId,

    /// Lowest admissible request number.
    pub low_watermark: u64,

    /// Highest admissible request number.
    pub high_watermark: u64,

    /// Next request number to release to the ready list.
    pub next_ready_mark: u64,

    /// Bumped each time the window slides.
    pub generation: u64,
}

/// One bucket.
#[derive(Debug, Clone)]
pub struct BucketStatus {
    /// Bucket number.
    pub bucket: u64,

    /// Its leader in the active epoch.
    pub leader: NodeId,

    /// Requests queued locally for proposal.
    pub queued: usize,
}

/// One checkpoint window.
#[derive(Debug, Clone)]
pub struct CheckpointStatus {
    /// The checkpoint-aligned sequence number.
    pub seq_no: u64,

    /// Whether a quorum agreed on a value.
    pub stable: bool,

    /// Whether our application returned its snapshot.
    pub locally_applied: bool,

    /// Largest agreement count over any value.
    pub max_agreements: usize,
}

/// One epoch-change target.
#[derive(Debug, Clone)]
pub struct EpochTargetStatus {
    /// The candidate epoch.
    pub epoch: u64,

    /// Lifecycle state name.
    pub state: &'static str,

    /// Distinct suspicions of its predecessor.
    pub suspicions: usize,

    /// Epoch changes held.
    pub changes: usize,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} epoch={} watermarks=({},{}] committed={} clients={} targets={}",
            self.node_id,
            self.epoch,
            self.low_watermark,
            self.high_watermark,
            self.last_committed,
            self.clients.len(),
            self.epoch_targets.len(),
        )?;
        if let Some(pending) = self.pending_epoch {
            write!(f, " changing->{pending}")?;
        }
        Ok(())
    }
}
