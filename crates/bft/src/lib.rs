//! Deterministic state machine for the weft BFT atomic broadcast
//! protocol.
//!
//! A fixed set of `n = 3f + 1` replicas orders client requests under up
//! to `f` Byzantine faults, with multiple leaders proposing in parallel
//! across buckets of the sequence space. The [`StateMachine`] here is
//! the entire protocol: single-threaded, synchronous, and free of I/O.
//! Hosts deliver events and execute the returned
//! [`Actions`](weft_core::Actions) batches; see `weft-core` for the
//! boundary contract.
//!
//! # Component map
//!
//! - client windows: per-client request windows, ack quorums, and the
//!   ready list
//! - admission: per-peer buffers classifying messages past, current, or
//!   future
//! - sequences and the active epoch: the Preprepare → Prepare → Commit
//!   pipeline over bucketed sequence numbers
//! - the epoch changer: Suspect / EpochChange / NewEpoch recovery when
//!   leaders are faulty
//! - the checkpoint tracker: stability quorums gating watermark
//!   movement and garbage collection

mod admission;
mod checkpoint;
mod clients;
mod config;
mod epoch;
mod epoch_change;
mod replay;
mod sequence;
mod state;
mod status;

pub use admission::PeerCounters;
pub use config::Config;
pub use state::{bootstrap_log, StateMachine};
pub use status::{
    BucketStatus, CheckpointStatus, ClientWindowStatus, EpochTargetStatus, NodeStatus, Status,
};
