//! Deterministic in-memory cluster harness.
//!
//! Each node couples a [`StateMachine`] with in-memory collaborators and
//! a serial action processor honoring the host ordering rules: persist,
//! then transmit, then hash and apply. Messages travel through per-node
//! FIFO queues; delivery is either round-robin deterministic or shuffled
//! by a seeded RNG. Links can be blocked and raw messages injected to
//! script Byzantine behavior.

use rand::Rng;
use std::collections::{BTreeSet, VecDeque};
use tracing::trace;
use weft_bft::{bootstrap_log, Config, StateMachine};
use weft_core::{
    ActionResults, Actions, HashProvider, HashResult, PreprocessResult, RequestStore as _, Wal as _,
};
use weft_core::AppLog as _;
use weft_messages::Msg;
use weft_types::{Hash, NetworkConfig, NodeId, Persistent, RequestData};

use crate::storage::{Blake3HashProvider, MemAppLog, MemRequestStore, MemWal};

/// One replica with its collaborators.
pub struct ClusterNode {
    pub id: NodeId,
    pub sm: StateMachine,
    pub wal: MemWal,
    pub store: MemRequestStore,
    pub log: MemAppLog,
    hasher: Blake3HashProvider,

    /// Results accumulated from executed actions, fed back on the next
    /// scheduling turn.
    pending: ActionResults,

    /// Every commit this node delivered, as `(seq_no, digest)`.
    pub commits: Vec<(u64, Hash)>,
}

impl ClusterNode {
    fn new(id: NodeId, config: Config, initial_log: Vec<Persistent>) -> Self {
        let mut wal = MemWal::new();
        for entry in &initial_log {
            wal.append(entry).expect("in-memory append");
        }
        Self {
            id,
            sm: StateMachine::new(config, initial_log),
            wal,
            store: MemRequestStore::new(),
            log: MemAppLog::new(),
            hasher: Blake3HashProvider,
            pending: ActionResults::default(),
            commits: Vec::new(),
        }
    }

    /// Execute an action batch serially: persist, then transmit, then
    /// hash and apply. Returns the outbound messages.
    fn execute(&mut self, actions: Actions) -> Vec<(Destination, Msg)> {
        // Persist before anything leaves the node.
        for c_entry in &actions.c_entries {
            self.wal
                .append(&Persistent::C(c_entry.clone()))
                .expect("in-memory append");
        }
        for q_entry in &actions.q_entries {
            for fwd in &q_entry.requests {
                self.store
                    .store(&fwd.ack, &fwd.data)
                    .expect("in-memory store");
            }
            self.wal
                .append(&Persistent::Q(q_entry.clone()))
                .expect("in-memory append");
        }
        for p_entry in &actions.p_entries {
            self.wal
                .append(&Persistent::P(p_entry.clone()))
                .expect("in-memory append");
        }
        self.store.sync().expect("in-memory sync");
        self.wal.sync().expect("in-memory sync");

        let mut outbound = Vec::new();
        for msg in &actions.broadcast {
            outbound.push((Destination::All, msg.clone()));
        }
        for unicast in &actions.unicast {
            outbound.push((Destination::One(unicast.target), unicast.msg.clone()));
        }

        // Hashing may interleave with the above; here it simply follows.
        for hash_request in actions.hash {
            let digest = self.hasher.digest(&hash_request.data);
            self.pending.digests.push(HashResult {
                digest,
                origin: hash_request.origin,
            });
        }

        for request in actions.preprocess {
            let digest = self.hasher.digest(&[
                request.request.client_id.0.to_le_bytes().to_vec(),
                request.request.req_no.to_le_bytes().to_vec(),
                request.request.data.clone(),
            ]);
            self.pending.preprocessed.push(PreprocessResult {
                digest,
                request,
                invalid: false,
            });
        }

        // Commits apply in the order given; checkpoint-flagged commits
        // snapshot before anything later is applied.
        for commit in actions.commits {
            self.log.apply(&commit.q_entry);
            self.commits
                .push((commit.q_entry.seq_no, commit.q_entry.digest));
            if commit.checkpoint {
                let value = self.log.snap();
                self.pending.checkpoints.push(weft_core::CheckpointResult {
                    seq_no: commit.q_entry.seq_no,
                    value,
                });
            }
        }

        outbound
    }

    fn has_pending_results(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy)]
enum Destination {
    /// Every node, the sender included.
    All,
    /// One node.
    One(NodeId),
}

/// A network of replicas with scriptable delivery.
pub struct Cluster {
    pub nodes: Vec<ClusterNode>,
    queues: Vec<VecDeque<(NodeId, Msg)>>,
    blocked: BTreeSet<(u64, u64)>,
}

impl Cluster {
    /// A fresh cluster on `net`, every node booted from the same genesis
    /// log.
    pub fn new(net: NetworkConfig, configure: impl Fn(NodeId) -> Config) -> Self {
        let genesis = bootstrap_log(net.clone(), b"genesis".to_vec());
        let nodes = net
            .nodes
            .iter()
            .map(|&id| ClusterNode::new(id, configure(id), genesis.clone()))
            .collect::<Vec<_>>();
        let queues = nodes.iter().map(|_| VecDeque::new()).collect();
        Self {
            nodes,
            queues,
            blocked: BTreeSet::new(),
        }
    }

    /// Drop all traffic from `from` to `to`.
    pub fn block_link(&mut self, from: u64, to: u64) {
        self.blocked.insert((from, to));
    }

    /// Restore all links.
    pub fn unblock_all(&mut self) {
        self.blocked.clear();
    }

    /// Queue a raw message as if `from` had sent it to `to`; the way to
    /// script Byzantine senders.
    pub fn inject(&mut self, to: u64, from: u64, msg: Msg) {
        self.queues[to as usize].push_back((NodeId(from), msg));
    }

    /// Submit a client request at one node.
    pub fn propose(&mut self, node: u64, request: RequestData) {
        let actions = self.nodes[node as usize].sm.propose(request);
        self.dispatch(node as usize, actions);
    }

    /// Advance every node's timers once.
    pub fn tick_all(&mut self) {
        for i in 0..self.nodes.len() {
            let actions = self.nodes[i].sm.tick();
            self.dispatch(i, actions);
        }
    }

    fn dispatch(&mut self, from: usize, actions: Actions) {
        let outbound = self.nodes[from].execute(actions);
        let from_id = self.nodes[from].id;
        for (dest, msg) in outbound {
            match dest {
                Destination::All => {
                    for to in 0..self.queues.len() {
                        self.route(from_id, to as u64, msg.clone());
                    }
                }
                Destination::One(node) => self.route(from_id, node.0, msg),
            }
        }
    }

    fn route(&mut self, from: NodeId, to: u64, msg: Msg) {
        if self.blocked.contains(&(from.0, to)) {
            trace!(%from, to, msg = msg.type_name(), "link blocked, dropping");
            return;
        }
        self.queues[to as usize].push_back((from, msg));
    }

    /// One scheduling turn for one node: feed pending results first,
    /// else deliver the next queued message. Returns whether it did
    /// anything.
    fn turn(&mut self, i: usize) -> bool {
        if self.nodes[i].has_pending_results() {
            let results = std::mem::take(&mut self.nodes[i].pending);
            let actions = self.nodes[i].sm.process_results(results);
            self.dispatch(i, actions);
            return true;
        }
        if let Some((from, msg)) = self.queues[i].pop_front() {
            let actions = self.nodes[i].sm.step(from, msg);
            self.dispatch(i, actions);
            return true;
        }
        false
    }

    /// Run round-robin until no node has queued work.
    ///
    /// # Panics
    ///
    /// Panics after `max_rounds` without quiescing; scenarios are
    /// expected to settle.
    pub fn run_until_quiet(&mut self, max_rounds: usize) {
        for _ in 0..max_rounds {
            let mut progressed = false;
            for i in 0..self.nodes.len() {
                progressed |= self.turn(i);
            }
            if !progressed {
                return;
            }
        }
        panic!("cluster did not quiesce within {max_rounds} rounds");
    }

    /// Run with randomized scheduling from a seeded RNG until quiet.
    pub fn run_shuffled(&mut self, rng: &mut impl Rng, max_events: usize) {
        for _ in 0..max_events {
            let busy: Vec<usize> = (0..self.nodes.len())
                .filter(|&i| {
                    self.nodes[i].has_pending_results() || !self.queues[i].is_empty()
                })
                .collect();
            if busy.is_empty() {
                return;
            }
            let i = busy[rng.gen_range(0..busy.len())];
            self.turn(i);
        }
        panic!("cluster did not quiesce within {max_events} events");
    }

    /// Commits delivered by one node, as `(seq_no, digest)`.
    pub fn committed(&self, node: u64) -> &[(u64, Hash)] {
        &self.nodes[node as usize].commits
    }

    /// Assert every pair of replicas agrees on the digest of every
    /// sequence both committed.
    pub fn assert_agreement(&self) {
        for a in &self.nodes {
            for b in &self.nodes {
                for (seq_a, digest_a) in &a.commits {
                    for (seq_b, digest_b) in &b.commits {
                        if seq_a == seq_b {
                            assert_eq!(
                                digest_a, digest_b,
                                "{} and {} disagree at seq {}",
                                a.id, b.id, seq_a
                            );
                        }
                    }
                }
            }
        }
    }
}
