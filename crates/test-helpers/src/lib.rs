//! Test fixtures for the weft consensus protocol.
//!
//! Provides in-memory collaborator implementations, a serial action
//! processor, and a deterministic multi-node cluster harness. Everything
//! here is for tests; nothing is production-grade.

mod cluster;
mod storage;

pub use cluster::{Cluster, ClusterNode};
pub use storage::{Blake3DigestHasher, Blake3HashProvider, MemAppLog, MemRequestStore, MemWal};

use weft_bft::Config;
use weft_types::{ClientId, NetworkConfig, NodeId, RequestData};

/// A standard `n`-node network: `checkpoint_interval` 5, generous epoch
/// length.
pub fn test_net(n: u64, num_buckets: u64) -> NetworkConfig {
    NetworkConfig {
        nodes: (0..n).map(NodeId).collect(),
        num_buckets,
        checkpoint_interval: 5,
        max_epoch_length: 1000,
    }
}

/// The standard four-node cluster (`f = 1`) with immediate batching.
pub fn four_node_cluster(num_buckets: u64) -> Cluster {
    Cluster::new(test_net(4, num_buckets), |id| {
        Config::new(id).with_batch_size(1)
    })
}

/// A client request with a payload derived from its identity.
pub fn test_request(client: u64, req_no: u64) -> RequestData {
    RequestData {
        client_id: ClientId(client),
        req_no,
        data: format!("payload-{client}-{req_no}").into_bytes(),
    }
}
