//! Network configuration and quorum arithmetic.

use crate::{ClientId, NodeId};
use sbor::prelude::*;

/// Immutable network configuration, fixed across an epoch.
///
/// Derives the fault bound `f` from the replica count and provides the
/// two quorum sizes every component uses. Any quorum comparison anywhere
/// in the protocol must go through [`some_correct_quorum`] or
/// [`intersection_quorum`]; there are no other thresholds.
///
/// [`some_correct_quorum`]: NetworkConfig::some_correct_quorum
/// [`intersection_quorum`]: NetworkConfig::intersection_quorum
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NetworkConfig {
    /// Replica ids, ordered. `n = nodes.len()` must satisfy `n = 3f + 1`
    /// for some `f >= 0`.
    pub nodes: Vec<NodeId>,

    /// Number of buckets partitioning the sequence space. At least 1.
    pub num_buckets: u64,

    /// Sequence interval between checkpoints.
    pub checkpoint_interval: u64,

    /// Maximum number of sequences one epoch may allocate.
    pub max_epoch_length: u64,
}

impl NetworkConfig {
    /// Number of replicas.
    pub fn n(&self) -> usize {
        self.nodes.len()
    }

    /// Maximum number of Byzantine faults tolerated: `f = (n - 1) / 3`.
    pub fn f(&self) -> usize {
        (self.nodes.len() - 1) / 3
    }

    /// `f + 1`: any set of this size contains at least one honest node.
    pub fn some_correct_quorum(&self) -> usize {
        self.f() + 1
    }

    /// `2f + 1`: two sets of this size intersect in at least one honest
    /// node.
    pub fn intersection_quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// Whether `id` is a member of the network.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// The deterministic leader of epoch `epoch`: `nodes[epoch mod n]`.
    pub fn epoch_leader(&self, epoch: u64) -> NodeId {
        self.nodes[(epoch % self.nodes.len() as u64) as usize]
    }

    /// Validate structural constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if self.nodes.len() % 3 != 1 {
            return Err(ConfigError::BadReplicaCount {
                n: self.nodes.len(),
            });
        }
        if self.num_buckets == 0 {
            return Err(ConfigError::NoBuckets);
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::NoCheckpointInterval);
        }
        if self.max_epoch_length < self.checkpoint_interval {
            return Err(ConfigError::EpochShorterThanCheckpoint {
                max_epoch_length: self.max_epoch_length,
                checkpoint_interval: self.checkpoint_interval,
            });
        }
        Ok(())
    }
}

/// Structural problems with a [`NetworkConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The node list is empty.
    #[error("network has no nodes")]
    NoNodes,

    /// `n` is not of the form `3f + 1`.
    #[error("replica count {n} is not 3f + 1")]
    BadReplicaCount { n: usize },

    /// Zero buckets.
    #[error("num_buckets must be at least 1")]
    NoBuckets,

    /// Zero checkpoint interval.
    #[error("checkpoint_interval must be at least 1")]
    NoCheckpointInterval,

    /// An epoch cannot span even one checkpoint window.
    #[error("max_epoch_length {max_epoch_length} below checkpoint_interval {checkpoint_interval}")]
    EpochShorterThanCheckpoint {
        max_epoch_length: u64,
        checkpoint_interval: u64,
    },
}

/// Durable network state recorded in checkpoint entries.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NetworkState {
    /// The network configuration.
    pub config: NetworkConfig,

    /// Per-client request-window state at the checkpoint.
    pub clients: Vec<ClientState>,
}

/// Per-client durable state: the lowest uncommitted request number for
/// each bucket, used to rebuild the client's window on replay.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ClientState {
    /// The client.
    pub id: ClientId,

    /// One low watermark per bucket, indexed by bucket number.
    pub bucket_low_watermarks: Vec<u64>,
}

impl ClientState {
    /// The client's overall low watermark: the minimum across buckets.
    pub fn low_watermark(&self) -> u64 {
        self.bucket_low_watermarks
            .iter()
            .copied()
            .min()
            .unwrap_or(0)
    }
}
