//! The active epoch: its sequence window, bucket ownership, and the
//! local proposer.
//!
//! Sequence numbers are partitioned into buckets by `seq_no %
//! num_buckets`; bucket `b` is owned by `leaders[b % leaders.len()]`.
//! Client requests map to buckets by `(client_id + req_no) %
//! num_buckets`, so each leader proposes a disjoint share of the request
//! space. The proposer consumes released-ready requests for the buckets
//! we lead, cutting batches by size or delay.
//!
//! Commit entries are drained strictly in sequence order: a slot that
//! reaches quorum early waits for its predecessors before being handed
//! to the application.

use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};
use weft_core::{Actions, CommitEntry};
use weft_messages::Msg;
use weft_types::{
    ClientId, Commit, EpochConfig, ForwardRequest, Hash, NetworkConfig, NodeId,
};

use crate::sequence::{Sequence, SequenceState};

/// A batch the proposer just assigned to a sequence; the driver marks
/// the member requests as allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AllocatedBatch {
    pub(crate) seq_no: u64,
    pub(crate) members: Vec<(ClientId, u64)>,
}

#[derive(Debug, Default)]
struct BucketQueue {
    pending: VecDeque<ForwardRequest>,
    /// Ticks the oldest pending request has waited.
    waited: u64,
}

/// Per-bucket batching of ready requests for the buckets we lead.
#[derive(Debug)]
struct Proposer {
    queues: BTreeMap<u64, BucketQueue>,
}

impl Proposer {
    fn new(own_buckets: impl Iterator<Item = u64>) -> Self {
        Self {
            queues: own_buckets.map(|b| (b, BucketQueue::default())).collect(),
        }
    }

    fn enqueue(&mut self, bucket: u64, fwd: ForwardRequest) {
        if let Some(queue) = self.queues.get_mut(&bucket) {
            queue.pending.push_back(fwd);
        }
    }

    fn cut(&mut self, bucket: u64, batch_size: usize) -> Vec<ForwardRequest> {
        let queue = self.queues.get_mut(&bucket).expect("own bucket");
        let take = queue.pending.len().min(batch_size);
        let batch: Vec<ForwardRequest> = queue.pending.drain(..take).collect();
        if queue.pending.is_empty() {
            queue.waited = 0;
        }
        batch
    }

    fn queued(&self, bucket: u64) -> usize {
        self.queues.get(&bucket).map_or(0, |q| q.pending.len())
    }
}

/// The epoch currently ordering sequences.
#[derive(Debug)]
pub(crate) struct ActiveEpoch {
    config: EpochConfig,
    net: NetworkConfig,
    my_id: NodeId,
    batch_size: usize,
    checkpoint_windows: u64,

    /// Low watermark at epoch start; caps the epoch's reach at
    /// `epoch_start_base + max_epoch_length`.
    epoch_start_base: u64,

    /// Current low watermark (exclusive).
    base_seq_no: u64,

    /// Current high watermark (inclusive).
    high_seq_no: u64,

    /// Last sequence whose commit entry was handed to the application.
    last_committed: u64,

    sequences: BTreeMap<u64, Sequence>,
    proposer: Proposer,

    /// Next candidate sequence per locally led bucket.
    next_allocation: BTreeMap<u64, u64>,

    ticks_since_progress: u64,
    suspected: bool,
}

impl ActiveEpoch {
    pub(crate) fn new(
        config: EpochConfig,
        net: NetworkConfig,
        my_id: NodeId,
        batch_size: usize,
        checkpoint_windows: u64,
        base_seq_no: u64,
        last_committed: u64,
    ) -> Self {
        assert!(!config.leaders.is_empty(), "epoch with no leaders");

        let own_buckets: Vec<u64> = (0..net.num_buckets)
            .filter(|&b| config.bucket_leader(b) == my_id)
            .collect();

        let next_allocation = own_buckets
            .iter()
            .map(|&b| {
                let mut seq = base_seq_no + 1;
                while seq % net.num_buckets != b {
                    seq += 1;
                }
                (b, seq)
            })
            .collect();

        let mut epoch = Self {
            proposer: Proposer::new(own_buckets.into_iter()),
            config,
            net,
            my_id,
            batch_size,
            checkpoint_windows,
            epoch_start_base: base_seq_no,
            base_seq_no,
            high_seq_no: base_seq_no,
            last_committed: last_committed.max(base_seq_no),
            sequences: BTreeMap::new(),
            next_allocation,
            ticks_since_progress: 0,
            suspected: false,
        };
        epoch.extend_high();
        epoch
    }

    fn extend_high(&mut self) {
        let target = (self.base_seq_no + self.checkpoint_windows * self.net.checkpoint_interval)
            .min(self.epoch_start_base + self.net.max_epoch_length);
        let quorum = self.net.intersection_quorum();
        for seq_no in (self.high_seq_no + 1)..=target {
            let leader = self.leader_of(seq_no);
            self.sequences.insert(
                seq_no,
                Sequence::new(seq_no, self.config.number, leader, self.my_id, quorum),
            );
        }
        self.high_seq_no = self.high_seq_no.max(target);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.config.number
    }

    pub(crate) fn base_seq_no(&self) -> u64 {
        self.base_seq_no
    }

    pub(crate) fn high_seq_no(&self) -> u64 {
        self.high_seq_no
    }

    #[cfg(test)]
    pub(crate) fn last_committed(&self) -> u64 {
        self.last_committed
    }

    pub(crate) fn in_window(&self, seq_no: u64) -> bool {
        seq_no > self.base_seq_no && seq_no <= self.high_seq_no
    }

    pub(crate) fn leader_of(&self, seq_no: u64) -> NodeId {
        self.config.bucket_leader(seq_no % self.net.num_buckets)
    }

    /// The bucket a client request belongs to.
    pub(crate) fn bucket_of_request(&self, client_id: ClientId, req_no: u64) -> u64 {
        (client_id.0 + req_no) % self.net.num_buckets
    }

    /// Whether we lead the bucket this request maps to.
    pub(crate) fn we_lead_request(&self, client_id: ClientId, req_no: u64) -> bool {
        self.config
            .bucket_leader(self.bucket_of_request(client_id, req_no))
            == self.my_id
    }

    /// Queue a ready request into its bucket, if we lead it.
    pub(crate) fn enqueue_request(&mut self, fwd: ForwardRequest) {
        if !self.we_lead_request(fwd.ack.client_id, fwd.ack.req_no) {
            return;
        }
        let bucket = self.bucket_of_request(fwd.ack.client_id, fwd.ack.req_no);
        trace!(bucket, req_no = fwd.ack.req_no, "queued ready request");
        self.proposer.enqueue(bucket, fwd);
    }

    /// Lowest free sequence of `bucket` within the window.
    fn next_free_seq(&mut self, bucket: u64) -> Option<u64> {
        let cursor = self.next_allocation.get_mut(&bucket)?;
        let mut seq_no = *cursor;
        while seq_no <= self.high_seq_no {
            match self.sequences.get(&seq_no) {
                Some(seq) if seq.state() == SequenceState::Free => {
                    *cursor = seq_no + self.net.num_buckets;
                    return Some(seq_no);
                }
                _ => seq_no += self.net.num_buckets,
            }
        }
        *cursor = seq_no;
        None
    }

    /// Cut and allocate every full batch we can place.
    pub(crate) fn drain_proposer(&mut self) -> (Actions, Vec<AllocatedBatch>) {
        let mut actions = Actions::new();
        let mut allocated = Vec::new();

        let buckets: Vec<u64> = self.proposer.queues.keys().copied().collect();
        for bucket in buckets {
            while self.proposer.queued(bucket) >= self.batch_size {
                let Some(seq_no) = self.next_free_seq(bucket) else {
                    break;
                };
                let batch = self.proposer.cut(bucket, self.batch_size);
                allocated.push(self.allocate_batch(seq_no, &batch, &mut actions));
            }
        }

        (actions, allocated)
    }

    fn allocate_batch(
        &mut self,
        seq_no: u64,
        batch: &[ForwardRequest],
        actions: &mut Actions,
    ) -> AllocatedBatch {
        debug!(seq_no, epoch = self.config.number, len = batch.len(), "allocating batch");
        let members = batch
            .iter()
            .map(|fwd| (fwd.ack.client_id, fwd.ack.req_no))
            .collect();
        let seq = self.sequences.get_mut(&seq_no).expect("windowed slot");
        actions.append(seq.allocate(batch.to_vec()));
        AllocatedBatch { seq_no, members }
    }

    /// Whether any slot past the delivered prefix is in flight.
    fn has_inflight(&self) -> bool {
        self.sequences
            .values()
            .any(|s| s.seq_no() > self.last_committed && s.state() != SequenceState::Free)
    }

    /// Advance proposer delay timers and the epoch progress timer.
    ///
    /// `outstanding_requests` reports whether ready requests are still
    /// waiting to be ordered; an epoch with neither those nor in-flight
    /// slots is idle, not stalled, and is never suspected.
    ///
    /// Returns the action batch, the batches allocated by delay cuts,
    /// and whether the epoch just crossed its suspicion timeout.
    pub(crate) fn tick(
        &mut self,
        batch_delay_ticks: u64,
        suspect_ticks: u64,
        outstanding_requests: bool,
    ) -> (Actions, Vec<AllocatedBatch>, bool) {
        let mut actions = Actions::new();
        let mut allocated = Vec::new();

        let buckets: Vec<u64> = self.proposer.queues.keys().copied().collect();
        for bucket in buckets {
            let queue = self.proposer.queues.get_mut(&bucket).expect("own bucket");
            if queue.pending.is_empty() {
                continue;
            }
            queue.waited += 1;
            if queue.waited < batch_delay_ticks {
                continue;
            }
            let Some(seq_no) = self.next_free_seq(bucket) else {
                continue;
            };
            let batch = self.proposer.cut(bucket, self.batch_size);
            allocated.push(self.allocate_batch(seq_no, &batch, &mut actions));
        }

        let mut suspect_now = false;
        if !outstanding_requests && !self.has_inflight() {
            self.ticks_since_progress = 0;
        } else {
            self.ticks_since_progress += 1;
            if self.ticks_since_progress >= suspect_ticks && !self.suspected {
                warn!(epoch = self.config.number, "no progress, suspecting epoch leaders");
                self.suspected = true;
                suspect_now = true;
            }
        }

        (actions, allocated, suspect_now)
    }

    /// Apply a leader's preprepare to its slot. The driver has already
    /// validated the source and resolved the batch against the client
    /// windows.
    pub(crate) fn apply_preprepare(&mut self, seq_no: u64, batch: Vec<ForwardRequest>) -> Actions {
        let seq = self.sequences.get_mut(&seq_no).expect("windowed slot");
        seq.allocate(batch)
    }

    /// Route a batch digest result to its slot.
    pub(crate) fn apply_batch_digest(&mut self, seq_no: u64, digest: Hash) -> Actions {
        let Some(seq) = self.sequences.get_mut(&seq_no) else {
            // Watermarks moved past the slot while the digest was in
            // flight.
            return Actions::new();
        };
        let mut actions = seq.apply_batch_digest(digest);
        actions.append(self.advance_uncommitted());
        actions
    }

    /// Route a prepare vote to its slot.
    pub(crate) fn apply_prepare(&mut self, source: NodeId, seq_no: u64, digest: Hash) -> Actions {
        let seq = self.sequences.get_mut(&seq_no).expect("windowed slot");
        let mut actions = seq.apply_prepare(source, digest);
        actions.append(self.advance_uncommitted());
        actions
    }

    /// Route a commit vote to its slot.
    pub(crate) fn apply_commit(&mut self, source: NodeId, seq_no: u64, digest: Hash) -> Actions {
        let seq = self.sequences.get_mut(&seq_no).expect("windowed slot");
        seq.apply_commit(source, digest);
        self.advance_uncommitted()
    }

    /// Install a slot inherited as prepared from a new-epoch certificate
    /// and vote to commit it.
    pub(crate) fn install_prepared(
        &mut self,
        seq_no: u64,
        digest: Hash,
        batch: Vec<ForwardRequest>,
    ) -> Actions {
        let epoch = self.config.number;
        let seq = self.sequences.get_mut(&seq_no).expect("windowed slot");
        let mut actions = seq.install_prepared(digest, batch);
        actions.broadcast.push(Msg::Commit(Commit {
            epoch,
            seq_no,
            digest,
        }));
        actions
    }

    /// Install a null slot from a new-epoch certificate.
    pub(crate) fn install_null(&mut self, seq_no: u64) -> Actions {
        let seq = self.sequences.get_mut(&seq_no).expect("windowed slot");
        seq.install_null()
    }

    /// Restore a replayed slot.
    pub(crate) fn restore_sequence(
        &mut self,
        seq_no: u64,
        state: SequenceState,
        digest: Hash,
        batch: Vec<ForwardRequest>,
    ) {
        if let Some(seq) = self.sequences.get_mut(&seq_no) {
            seq.restore(state, digest, batch);
        }
    }

    /// Hand committed slots to the application strictly in order.
    pub(crate) fn advance_uncommitted(&mut self) -> Actions {
        let mut actions = Actions::new();
        while self.last_committed < self.high_seq_no {
            let next = self.last_committed + 1;
            let Some(seq) = self.sequences.get(&next) else {
                break;
            };
            if seq.state() != SequenceState::Committed {
                break;
            }
            actions.commits.push(CommitEntry {
                q_entry: seq.to_q_entry(),
                checkpoint: next % self.net.checkpoint_interval == 0,
            });
            self.last_committed = next;
            self.ticks_since_progress = 0;
        }
        actions
    }

    /// Retire slots at or below a stable, applied checkpoint and grow
    /// the window.
    pub(crate) fn move_watermarks(&mut self, new_base: u64) {
        if new_base <= self.base_seq_no {
            return;
        }
        debug!(epoch = self.config.number, new_base, "moving watermarks");
        self.sequences.retain(|&s, _| s > new_base);
        self.base_seq_no = new_base;
        self.extend_high();
    }

    /// Diagnostic bucket view: `(bucket, leader, queued)`.
    pub(crate) fn bucket_status(&self) -> Vec<(u64, NodeId, usize)> {
        (0..self.net.num_buckets)
            .map(|b| {
                (
                    b,
                    self.config.bucket_leader(b),
                    self.proposer.queued(b),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::RequestAck;

    fn net() -> NetworkConfig {
        NetworkConfig {
            nodes: (0..4).map(NodeId).collect(),
            num_buckets: 2,
            checkpoint_interval: 5,
            max_epoch_length: 200,
        }
    }

    fn epoch_for(my_id: NodeId) -> ActiveEpoch {
        // All four nodes lead; buckets 0 and 1 go to nodes 0 and 1.
        let config = EpochConfig {
            number: 0,
            leaders: (0..4).map(NodeId).collect(),
        };
        ActiveEpoch::new(config, net(), my_id, 1, 2, 0, 0)
    }

    fn fwd(client: u64, req_no: u64) -> ForwardRequest {
        ForwardRequest {
            ack: RequestAck {
                client_id: ClientId(client),
                req_no,
                digest: Hash::from_bytes(format!("{client}/{req_no}").as_bytes()),
            },
            data: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_window_spans_checkpoint_windows() {
        let epoch = epoch_for(NodeId(0));
        assert_eq!(epoch.base_seq_no(), 0);
        assert_eq!(epoch.high_seq_no(), 10);
        assert!(epoch.in_window(1));
        assert!(epoch.in_window(10));
        assert!(!epoch.in_window(11));
    }

    #[test]
    fn test_bucket_and_leader_mapping() {
        let epoch = epoch_for(NodeId(0));
        // Buckets rotate across leaders: bucket 0 -> node 0, bucket 1 -> node 1.
        assert_eq!(epoch.leader_of(2), NodeId(0));
        assert_eq!(epoch.leader_of(3), NodeId(1));
        // Request (client 1, reqno 1) maps to bucket (1+1)%2 = 0.
        assert!(epoch.we_lead_request(ClientId(1), 1));
        assert!(!epoch.we_lead_request(ClientId(1), 2));
    }

    #[test]
    fn test_proposer_cuts_by_size() {
        let mut epoch = epoch_for(NodeId(0));
        // (1,1) maps to bucket 0, which we lead. Batch size is 1.
        epoch.enqueue_request(fwd(1, 1));
        let (actions, allocated) = epoch.drain_proposer();

        assert_eq!(allocated.len(), 1);
        // Bucket 0 sequences are the even ones; first in window is 2.
        assert_eq!(allocated[0].seq_no, 2);
        assert_eq!(allocated[0].members, vec![(ClientId(1), 1)]);
        assert_eq!(actions.hash.len(), 1);
    }

    #[test]
    fn test_proposer_cuts_by_delay() {
        let mut epoch = ActiveEpoch::new(
            EpochConfig {
                number: 0,
                leaders: (0..4).map(NodeId).collect(),
            },
            net(),
            NodeId(0),
            // Batch size 8: a single request never fills a batch.
            8,
            2,
            0,
            0,
        );
        epoch.enqueue_request(fwd(1, 1));
        let (_, allocated) = epoch.drain_proposer();
        assert!(allocated.is_empty());

        let (_, allocated, _) = epoch.tick(2, 100, true);
        assert!(allocated.is_empty());
        let (_, allocated, _) = epoch.tick(2, 100, true);
        assert_eq!(allocated.len(), 1);
    }

    #[test]
    fn test_commits_drain_in_order() {
        let mut epoch = epoch_for(NodeId(0));
        let d2 = Hash::from_bytes(b"s2");
        let d1 = Hash::from_bytes(b"s1");

        // Walk seq 2 (ours, bucket 0) to committed first.
        epoch.apply_preprepare(2, vec![fwd(1, 1)]);
        epoch.apply_batch_digest(2, d2);
        epoch.apply_prepare(NodeId(0), 2, d2);
        epoch.apply_prepare(NodeId(1), 2, d2);
        epoch.apply_prepare(NodeId(2), 2, d2);
        for i in 0..3 {
            let actions = epoch.apply_commit(NodeId(i), 2, d2);
            // Seq 1 has not committed; nothing may be delivered yet.
            assert!(actions.commits.is_empty());
        }

        // Now commit seq 1 (node 1's bucket).
        epoch.apply_preprepare(1, vec![fwd(1, 2)]);
        epoch.apply_batch_digest(1, d1);
        epoch.apply_prepare(NodeId(1), 1, d1);
        epoch.apply_prepare(NodeId(2), 1, d1);
        epoch.apply_prepare(NodeId(3), 1, d1);
        epoch.apply_commit(NodeId(1), 1, d1);
        epoch.apply_commit(NodeId(2), 1, d1);
        let actions = epoch.apply_commit(NodeId(3), 1, d1);

        // Both deliver now, in order.
        assert_eq!(actions.commits.len(), 2);
        assert_eq!(actions.commits[0].q_entry.seq_no, 1);
        assert_eq!(actions.commits[1].q_entry.seq_no, 2);
        assert_eq!(epoch.last_committed(), 2);
    }

    #[test]
    fn test_checkpoint_flag_on_interval() {
        let mut epoch = epoch_for(NodeId(0));
        // Commit sequences 1..=5 in order.
        for seq_no in 1..=5 {
            let digest = Hash::from_bytes(format!("s{seq_no}").as_bytes());
            epoch.apply_preprepare(seq_no, vec![fwd(1, seq_no)]);
            epoch.apply_batch_digest(seq_no, digest);
            epoch.apply_prepare(NodeId(1), seq_no, digest);
            epoch.apply_prepare(NodeId(2), seq_no, digest);
            epoch.apply_prepare(NodeId(3), seq_no, digest);
            epoch.apply_commit(NodeId(1), seq_no, digest);
            epoch.apply_commit(NodeId(2), seq_no, digest);
            let actions = epoch.apply_commit(NodeId(3), seq_no, digest);
            let entry = &actions.commits[0];
            assert_eq!(entry.checkpoint, seq_no == 5);
        }
    }

    #[test]
    fn test_move_watermarks_grows_window() {
        let mut epoch = epoch_for(NodeId(0));
        epoch.move_watermarks(5);
        assert_eq!(epoch.base_seq_no(), 5);
        assert_eq!(epoch.high_seq_no(), 15);
        assert!(!epoch.in_window(5));
        assert!(epoch.in_window(15));
    }

    #[test]
    fn test_window_capped_by_epoch_length() {
        let mut cfg = net();
        cfg.max_epoch_length = 8;
        let epoch = ActiveEpoch::new(
            EpochConfig {
                number: 0,
                leaders: (0..4).map(NodeId).collect(),
            },
            cfg,
            NodeId(0),
            1,
            2,
            0,
            0,
        );
        assert_eq!(epoch.high_seq_no(), 8);
    }

    #[test]
    fn test_suspicion_after_stall() {
        let mut epoch = epoch_for(NodeId(0));
        let mut suspected = false;
        for _ in 0..8 {
            let (_, _, s) = epoch.tick(2, 8, true);
            suspected |= s;
        }
        assert!(suspected);

        // Fires once, not repeatedly.
        let (_, _, again) = epoch.tick(2, 8, true);
        assert!(!again);
    }

    #[test]
    fn test_idle_epoch_is_never_suspected() {
        let mut epoch = epoch_for(NodeId(0));
        for _ in 0..100 {
            let (_, _, suspect) = epoch.tick(2, 8, false);
            assert!(!suspect);
        }
    }
}
