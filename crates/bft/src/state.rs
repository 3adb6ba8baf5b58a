//! The protocol driver: a synchronous, deterministic state machine.
//!
//! The driver owns every protocol component exclusively and performs no
//! I/O. Each public entry point — [`propose`], [`step`], [`tick`],
//! [`process_results`] — consumes one event atomically and returns an
//! [`Actions`] batch for the host to execute. Feeding identical events
//! to identical state yields byte-identical batches.
//!
//! Inbound messages pass through per-peer admission buffers; whenever
//! state moves, every buffer is re-drained through classification, one
//! message per peer per round, until a full round yields nothing.
//!
//! [`propose`]: StateMachine::propose
//! [`step`]: StateMachine::step
//! [`tick`]: StateMachine::tick
//! [`process_results`]: StateMachine::process_results

use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use weft_core::{ActionResults, Actions, HashOrigin, Request};
use weft_messages::Msg;
use weft_types::{
    CEntry, Checkpoint, EpochChange, EpochConfig, NetworkConfig, NetworkState, NodeId, Persistent,
    Preprepare, RequestData,
};

use crate::admission::{Applyable, NodeMsgs};
use crate::checkpoint::CheckpointTracker;
use crate::clients::ClientWindows;
use crate::config::Config;
use crate::epoch::{ActiveEpoch, AllocatedBatch};
use crate::epoch_change::{EpochChanger, TargetState};
use crate::replay::PersistedLog;
use crate::sequence::SequenceState;
use crate::status::{
    BucketStatus, CheckpointStatus, ClientWindowStatus, EpochTargetStatus, NodeStatus, Status,
};

/// The deterministic core of one replica.
pub struct StateMachine {
    config: Config,
    net: NetworkConfig,
    node_msgs: BTreeMap<NodeId, NodeMsgs>,
    clients: ClientWindows,
    active_epoch: Option<ActiveEpoch>,
    checkpoints: CheckpointTracker,
    changer: EpochChanger,
    persisted: PersistedLog,

    /// Last sequence handed to the application, carried across epochs.
    last_committed: u64,

    /// The most recently installed epoch configuration, recorded into
    /// checkpoint entries.
    epoch_config: EpochConfig,
}

impl StateMachine {
    /// Build a replica from its replayed write-ahead log. For a fresh
    /// deployment pass [`bootstrap_log`].
    ///
    /// # Panics
    ///
    /// Panics on a structurally invalid log or network configuration;
    /// neither is a recoverable state.
    pub fn new(config: Config, initial_log: Vec<Persistent>) -> Self {
        let persisted = PersistedLog::replay(initial_log);
        let c_entry = persisted.last_c_entry().clone();

        let net = c_entry.network_state.config.clone();
        net.validate().expect("invalid network configuration");
        assert!(
            net.contains(config.id),
            "node {} is not in the network configuration",
            config.id
        );

        let mut clients = ClientWindows::new(net.clone(), config.id, config.client_window_width);
        for client in &c_entry.network_state.clients {
            clients.restore_window(client.id, client.low_watermark());
        }

        // Requests inside persisted prepare certificates are strong: a
        // quorum stood behind their batches.
        for p_entry in persisted.p_entries_above(c_entry.seq_no) {
            let q_entry = persisted
                .find_q_by_digest(p_entry.digest)
                .expect("PEntry without its QEntry survived replay");
            for fwd in &q_entry.requests {
                clients.restore_strong(fwd.request_data(), fwd.ack.digest);
            }
        }
        clients.advance_all_ready();

        let checkpoints = CheckpointTracker::new(
            net.clone(),
            Checkpoint {
                seq_no: c_entry.seq_no,
                value: c_entry.value.clone(),
            },
        );
        let changer = EpochChanger::new(config.id, net.clone(), c_entry.epoch_config.number);

        let node_msgs = net
            .nodes
            .iter()
            .map(|&id| (id, NodeMsgs::new(id, config.buffered_messages_per_peer)))
            .collect();

        let mut sm = Self {
            active_epoch: None,
            node_msgs,
            clients,
            checkpoints,
            changer,
            last_committed: c_entry.seq_no,
            epoch_config: c_entry.epoch_config.clone(),
            net,
            config,
            persisted,
        };
        sm.install_replayed_epoch(&c_entry);
        sm
    }

    /// Reinstall the epoch active at the checkpoint we booted from and
    /// restore its in-flight sequences from retained Q/P entries.
    fn install_replayed_epoch(&mut self, c_entry: &CEntry) {
        let mut epoch = ActiveEpoch::new(
            c_entry.epoch_config.clone(),
            self.net.clone(),
            self.config.id,
            self.config.batch_size,
            self.config.checkpoint_windows,
            c_entry.seq_no,
            self.last_committed,
        );

        let epoch_no = c_entry.epoch_config.number;
        let prepared: BTreeMap<u64, weft_types::Hash> = self
            .persisted
            .p_entries_above(c_entry.seq_no)
            .filter(|p| p.epoch == epoch_no)
            .map(|p| (p.seq_no, p.digest))
            .collect();

        let restorable: Vec<_> = self
            .persisted
            .q_entries_above(c_entry.seq_no)
            .filter(|q| q.epoch == epoch_no && epoch.in_window(q.seq_no))
            .map(|q| (q.seq_no, q.digest, q.requests.clone()))
            .collect();
        for (seq_no, digest, requests) in restorable {
            let state = match prepared.get(&seq_no) {
                Some(&p_digest) if p_digest == digest => SequenceState::Prepared,
                _ => SequenceState::Preprepared,
            };
            for fwd in &requests {
                self.clients
                    .mark_allocated(fwd.ack.client_id, fwd.ack.req_no, epoch_no, seq_no);
            }
            epoch.restore_sequence(seq_no, state, digest, requests);
        }

        for fwd in self.clients.unordered_ready_requests(epoch_no) {
            epoch.enqueue_request(fwd);
        }
        self.clients.take_newly_ready();
        self.active_epoch = Some(epoch);
    }

    /// Submit a client request entering the protocol at this replica.
    pub fn propose(&mut self, request: RequestData) -> Actions {
        let mut actions = Actions::new();
        actions.preprocess.push(Request {
            source: self.config.id,
            request,
        });
        actions
    }

    /// Ingest one message from a peer and drain everything applicable.
    ///
    /// # Panics
    ///
    /// Panics when `source` is not in the network configuration.
    pub fn step(&mut self, source: NodeId, msg: Msg) -> Actions {
        let mut actions = self.begin_preprepare_resolution(source, &msg);

        let node_msgs = self
            .node_msgs
            .get_mut(&source)
            .unwrap_or_else(|| panic!("message from unknown node {source}"));
        node_msgs.note_received();
        node_msgs.buffer(msg);

        actions.append(self.drain_all());
        actions.append(self.feed_proposer());
        self.absorb(&actions);
        actions
    }

    /// Advance all tick-based timers.
    pub fn tick(&mut self) -> Actions {
        let mut actions = Actions::new();

        let mut suspected_epoch = None;
        if let Some(epoch) = &mut self.active_epoch {
            let outstanding = self.clients.has_unordered_ready(epoch.epoch());
            let (tick_actions, allocated, suspect_now) = epoch.tick(
                self.config.batch_delay_ticks,
                self.config.suspect_ticks,
                outstanding,
            );
            actions.append(tick_actions);
            if suspect_now {
                suspected_epoch = Some(epoch.epoch());
            }
            self.note_allocations(&allocated);
        }
        if let Some(epoch_no) = suspected_epoch {
            actions.append(self.abandon_and_join(epoch_no + 1));
        }

        actions.append(self.changer.tick(self.config.new_epoch_ticks));
        actions.append(self.drain_all());
        self.absorb(&actions);
        actions
    }

    /// Feed back the results of executed actions.
    pub fn process_results(&mut self, results: ActionResults) -> Actions {
        let mut actions = Actions::new();

        for checkpoint in results.checkpoints {
            actions.append(self.apply_checkpoint_result(checkpoint.seq_no, checkpoint.value));
        }

        for preprocessed in results.preprocessed {
            if preprocessed.invalid {
                warn!(
                    client = %preprocessed.request.request.client_id,
                    req_no = preprocessed.request.request.req_no,
                    "dropping invalid request"
                );
                continue;
            }
            actions.append(
                self.clients
                    .allocate(preprocessed.request.request, preprocessed.digest),
            );
        }

        for result in results.digests {
            match result.origin {
                HashOrigin::Batch {
                    epoch, seq_no, ..
                } => {
                    match &mut self.active_epoch {
                        Some(active) if active.epoch() == epoch => {
                            actions.append(active.apply_batch_digest(seq_no, result.digest));
                        }
                        // The epoch moved on while the digest was in
                        // flight.
                        _ => {}
                    }
                }
                HashOrigin::VerifyRequest {
                    source,
                    request,
                    expected_digest,
                } => {
                    self.clients.verification_done(
                        request.client_id,
                        request.req_no,
                        expected_digest,
                    );
                    if result.digest == expected_digest {
                        actions.append(self.clients.allocate(request, expected_digest));
                    } else {
                        warn!(peer = %source, client = %request.client_id, req_no = request.req_no,
                            "forwarded request fails digest check");
                        self.note_byzantine(source);
                    }
                }
                HashOrigin::EpochChange {
                    source,
                    epoch_change,
                } => {
                    actions.append(self.changer.apply_epoch_change_digest(
                        source,
                        &epoch_change,
                        result.digest,
                    ));
                }
                HashOrigin::NewEpochConfig { config } => {
                    actions.append(self.changer.apply_config_digest(&config, result.digest));
                    actions.append(self.maybe_install());
                }
            }
        }

        self.absorb(&actions);
        actions.append(self.drain_all());
        actions.append(self.feed_proposer());
        self.absorb(&actions);
        actions
    }

    /// Diagnostic status tree.
    pub fn status(&self) -> Status {
        let nodes = self
            .node_msgs
            .values()
            .map(|nm| NodeStatus {
                id: nm.id(),
                counters: nm.counters(),
                buffered: nm.buffered(),
            })
            .collect();

        let clients = self
            .clients
            .clients()
            .map(|client_id| {
                let window = self.clients.window(client_id).expect("listed client");
                ClientWindowStatus {
                    client_id,
                    low_watermark: window.low_watermark(),
                    high_watermark: window.high_watermark(),
                    next_ready_mark: window.next_ready_mark(),
                    generation: window.generation(),
                }
            })
            .collect();

        let buckets = self
            .active_epoch
            .as_ref()
            .map(|epoch| {
                epoch
                    .bucket_status()
                    .into_iter()
                    .map(|(bucket, leader, queued)| BucketStatus {
                        bucket,
                        leader,
                        queued,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let checkpoints = self
            .checkpoints
            .status()
            .into_iter()
            .map(|(seq_no, stable, locally_applied, max_agreements)| CheckpointStatus {
                seq_no,
                stable,
                locally_applied,
                max_agreements,
            })
            .collect();

        let epoch_targets = self
            .changer
            .targets()
            .map(|target| EpochTargetStatus {
                epoch: target.epoch(),
                state: match target.state() {
                    TargetState::Pending => "pending",
                    TargetState::Verifying => "verifying",
                    TargetState::Verified => "verified",
                    TargetState::Ready => "ready",
                    TargetState::Idle => "idle",
                },
                suspicions: target.suspicions(),
                changes: target.changes(),
            })
            .collect();

        Status {
            node_id: self.config.id,
            epoch: self.changer.last_active_epoch(),
            pending_epoch: self.changer.pending_epoch(),
            low_watermark: self.active_epoch.as_ref().map_or(0, ActiveEpoch::base_seq_no),
            high_watermark: self.active_epoch.as_ref().map_or(0, ActiveEpoch::high_seq_no),
            last_committed: self.last_committed,
            nodes,
            clients,
            buckets,
            checkpoints,
            epoch_targets,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Admission and dispatch
    // ═══════════════════════════════════════════════════════════════════

    /// Re-drain every peer buffer through classification, one message
    /// per peer per round, until a full round yields nothing.
    fn drain_all(&mut self) -> Actions {
        let ids: Vec<NodeId> = self.node_msgs.keys().copied().collect();
        let mut actions = Actions::new();

        loop {
            let mut progressed = false;
            for &id in &ids {
                let msg = {
                    let Self {
                        node_msgs,
                        clients,
                        active_epoch,
                        checkpoints,
                        changer,
                        ..
                    } = self;
                    let nm = node_msgs.get_mut(&id).expect("known node");
                    nm.next(|m| classify(clients, active_epoch.as_ref(), checkpoints, changer, m))
                };
                if let Some(msg) = msg {
                    progressed = true;
                    self.node_msgs.get_mut(&id).expect("known node").note_applied();
                    let msg_actions = self.apply_current(id, msg);
                    // Mirror emitted entries immediately: a later message
                    // in this same drain may assemble an epoch-change
                    // certificate from the retained log.
                    self.absorb(&msg_actions);
                    actions.append(msg_actions);
                }
            }
            if !progressed {
                return actions;
            }
        }
    }

    /// Apply one current-classified message.
    fn apply_current(&mut self, source: NodeId, msg: Msg) -> Actions {
        match msg {
            Msg::RequestAck(_) | Msg::ForwardRequest(_) | Msg::FetchRequest(_) => {
                self.clients.apply_msg(source, &msg)
            }

            Msg::Preprepare(preprepare) => self.apply_preprepare(source, *preprepare),
            Msg::Prepare(prepare) => {
                let epoch = self.active_epoch.as_mut().expect("classified current");
                epoch.apply_prepare(source, prepare.seq_no, prepare.digest)
            }
            Msg::Commit(commit) => {
                let epoch = self.active_epoch.as_mut().expect("classified current");
                epoch.apply_commit(source, commit.seq_no, commit.digest)
            }

            Msg::Checkpoint(checkpoint) => {
                let outcome = self.checkpoints.apply_checkpoint_msg(
                    source,
                    checkpoint.seq_no,
                    checkpoint.value,
                );
                if outcome.divergent {
                    self.note_byzantine(source);
                }
                if outcome.ready_to_gc {
                    self.garbage_collect(checkpoint.seq_no)
                } else {
                    Actions::new()
                }
            }

            Msg::Suspect(suspect) => {
                if self.changer.apply_suspect(source, suspect.epoch) {
                    self.abandon_and_join(suspect.epoch + 1)
                } else {
                    Actions::new()
                }
            }
            Msg::EpochChange(change) => self.changer.apply_epoch_change(source, &change),
            Msg::EpochChangeAck(ack) => self.changer.apply_epoch_change_ack(source, &ack),
            Msg::NewEpoch(new_epoch) => {
                let (actions, byzantine) = self.changer.apply_new_epoch(source, &new_epoch);
                if byzantine {
                    self.note_byzantine(source);
                }
                actions
            }
            Msg::NewEpochEcho(echo) => {
                let mut actions = self.changer.apply_new_epoch_echo(source, &echo);
                actions.append(self.maybe_install());
                actions
            }
            Msg::NewEpochReady(ready) => {
                let mut actions = self.changer.apply_new_epoch_ready(source, &ready);
                actions.append(self.maybe_install());
                actions
            }
        }
    }

    fn apply_preprepare(&mut self, source: NodeId, preprepare: Preprepare) -> Actions {
        let epoch = self.active_epoch.as_mut().expect("classified current");
        if epoch.leader_of(preprepare.seq_no) != source {
            warn!(
                peer = %source,
                seq_no = preprepare.seq_no,
                "preprepare from a node that does not lead the slot"
            );
            self.note_byzantine(source);
            return Actions::new();
        }

        let epoch_no = epoch.epoch();
        for fwd in &preprepare.batch {
            self.clients
                .mark_allocated(fwd.ack.client_id, fwd.ack.req_no, epoch_no, preprepare.seq_no);
        }

        let epoch = self.active_epoch.as_mut().expect("classified current");
        epoch.apply_preprepare(preprepare.seq_no, preprepare.batch)
    }

    /// When a preprepare arrives whose batch members we do not hold yet,
    /// start digest checks for the embedded payloads so the buffered
    /// preprepare can eventually classify current.
    fn begin_preprepare_resolution(&mut self, source: NodeId, msg: &Msg) -> Actions {
        let Msg::Preprepare(preprepare) = msg else {
            return Actions::new();
        };
        let Some(epoch) = &self.active_epoch else {
            return Actions::new();
        };
        if preprepare.epoch != epoch.epoch()
            || !epoch.in_window(preprepare.seq_no)
            || epoch.leader_of(preprepare.seq_no) != source
        {
            return Actions::new();
        }

        let mut actions = Actions::new();
        for fwd in &preprepare.batch {
            if !self.clients.is_resolved(&fwd.ack) {
                actions.append(self.clients.request_verification(
                    source,
                    fwd.request_data(),
                    fwd.ack.digest,
                ));
            }
        }
        actions
    }

    /// Re-run payload resolution for every buffered preprepare. Needed
    /// after epoch installs and watermark moves, when proposals buffered
    /// as future come into range without re-entering `step`.
    fn resolve_buffered_preprepares(&mut self) -> Actions {
        let buffered: Vec<(NodeId, Msg)> = self
            .node_msgs
            .values()
            .flat_map(|nm| {
                nm.buffered_msgs()
                    .filter(|msg| matches!(msg, Msg::Preprepare(_)))
                    .map(move |msg| (nm.id(), msg.clone()))
            })
            .collect();

        let mut actions = Actions::new();
        for (source, msg) in buffered {
            actions.append(self.begin_preprepare_resolution(source, &msg));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════
    // Checkpoints and watermarks
    // ═══════════════════════════════════════════════════════════════════

    fn apply_checkpoint_result(&mut self, seq_no: u64, value: Vec<u8>) -> Actions {
        let (mut actions, ready) = self.checkpoints.apply_checkpoint_result(seq_no, value.clone());
        if actions.is_empty() && !ready {
            return actions;
        }

        actions.c_entries.push(CEntry {
            seq_no,
            value,
            network_state: NetworkState {
                config: self.net.clone(),
                clients: self.clients.client_configs(),
            },
            epoch_config: self.epoch_config.clone(),
        });

        if ready {
            actions.append(self.garbage_collect(seq_no));
        }
        actions
    }

    fn garbage_collect(&mut self, seq_no: u64) -> Actions {
        info!(seq_no, "checkpoint stable and applied, advancing watermarks");
        self.clients.garbage_collect(seq_no);
        self.persisted.garbage_collect(seq_no);
        self.checkpoints.garbage_collect(seq_no);
        if let Some(epoch) = &mut self.active_epoch {
            epoch.move_watermarks(seq_no);
        }
        // Fresh window space may unblock buffered messages and queued
        // batches; the enclosing drain loop refilters buffers.
        let mut actions = self.resolve_buffered_preprepares();
        actions.append(self.feed_proposer());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════
    // Epoch lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Abandon the active epoch (if any) and join the change to
    /// `target_epoch`, offering our certified state.
    fn abandon_and_join(&mut self, target_epoch: u64) -> Actions {
        if self.changer.joined(target_epoch) {
            return Actions::new();
        }
        if let Some(epoch) = &self.active_epoch {
            info!(epoch = epoch.epoch(), target_epoch, "abandoning active epoch");
        }
        self.active_epoch = None;

        let base = self.checkpoints.highest_stable().seq_no;
        let change = EpochChange {
            new_epoch: target_epoch,
            checkpoints: vec![self.checkpoints.highest_stable().clone()],
            p_set: self.persisted.p_set(base),
            q_set: self.persisted.q_set(base),
        };
        self.changer.join(target_epoch, change)
    }

    /// Install the pending epoch once its target reaches `Ready`.
    fn maybe_install(&mut self) -> Actions {
        let Some(new_config) = self.changer.ready_target().cloned() else {
            return Actions::new();
        };

        let epoch_no = new_config.config.number;
        let base = new_config.starting_checkpoint.seq_no;
        info!(epoch = epoch_no, base, "installing new epoch");

        if self.checkpoints.highest_stable().seq_no < base {
            // Peers certified a checkpoint we never saw; without state
            // transfer we can only adopt it and resume above it.
            warn!(base, "starting checkpoint is ahead of local stable checkpoint");
        }
        self.checkpoints
            .install_base(new_config.starting_checkpoint.clone());
        self.clients.clear_stale_allocations(epoch_no);

        let mut epoch = ActiveEpoch::new(
            new_config.config.clone(),
            self.net.clone(),
            self.config.id,
            self.config.batch_size,
            self.config.checkpoint_windows,
            base,
            self.last_committed,
        );

        let mut actions = Actions::new();
        for (i, slot) in new_config.final_preprepares.iter().enumerate() {
            let seq_no = base + 1 + i as u64;
            if !epoch.in_window(seq_no) {
                warn!(seq_no, "certificate extends past the new epoch's window");
                break;
            }
            match slot {
                Some(digest) => match self.persisted.find_q_by_digest(*digest) {
                    Some(q_entry) => {
                        let requests = q_entry.requests.clone();
                        for fwd in &requests {
                            self.clients.mark_allocated(
                                fwd.ack.client_id,
                                fwd.ack.req_no,
                                epoch_no,
                                seq_no,
                            );
                        }
                        actions.append(epoch.install_prepared(seq_no, *digest, requests));
                    }
                    None => {
                        // The quorum holds this batch; we never saw it.
                        // Without request fetch the slot stays open and
                        // the quorum commits without us.
                        warn!(seq_no, %digest, "inherited digest with no local batch");
                    }
                },
                None => {
                    actions.append(epoch.install_null(seq_no));
                }
            }
        }
        actions.append(epoch.advance_uncommitted());

        for fwd in self.clients.unordered_ready_requests(epoch_no) {
            epoch.enqueue_request(fwd);
        }
        self.clients.take_newly_ready();

        self.epoch_config = new_config.config;
        self.active_epoch = Some(epoch);
        self.changer.install_complete(epoch_no);

        actions.append(self.resolve_buffered_preprepares());
        actions.append(self.feed_proposer());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════
    // Proposer plumbing
    // ═══════════════════════════════════════════════════════════════════

    /// Move newly released requests into the proposer and cut whatever
    /// is cuttable.
    fn feed_proposer(&mut self) -> Actions {
        let Some(epoch) = &mut self.active_epoch else {
            return Actions::new();
        };
        for fwd in self.clients.take_newly_ready() {
            epoch.enqueue_request(fwd);
        }
        let (actions, allocated) = epoch.drain_proposer();
        self.note_allocations(&allocated);
        actions
    }

    fn note_allocations(&mut self, allocated: &[AllocatedBatch]) {
        let Some(epoch) = &self.active_epoch else {
            return;
        };
        let epoch_no = epoch.epoch();
        for batch in allocated {
            for &(client_id, req_no) in &batch.members {
                self.clients
                    .mark_allocated(client_id, req_no, epoch_no, batch.seq_no);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Bookkeeping
    // ═══════════════════════════════════════════════════════════════════

    /// Mirror an outgoing action batch into local state: persisted
    /// entries into the retained log, commit entries into the client
    /// windows and the committed cursor.
    fn absorb(&mut self, actions: &Actions) {
        for q_entry in &actions.q_entries {
            self.persisted.record_q(q_entry.clone());
        }
        for p_entry in &actions.p_entries {
            self.persisted.record_p(p_entry.clone());
        }
        for c_entry in &actions.c_entries {
            self.persisted.record_c(c_entry.clone());
        }
        for commit in &actions.commits {
            let seq_no = commit.q_entry.seq_no;
            if seq_no > self.last_committed {
                debug!(seq_no, requests = commit.q_entry.requests.len(), "commit delivered");
                self.last_committed = seq_no;
            }
            for fwd in &commit.q_entry.requests {
                self.clients
                    .mark_committed(fwd.ack.client_id, fwd.ack.req_no, seq_no);
            }
        }
    }

    fn note_byzantine(&mut self, source: NodeId) {
        if let Some(nm) = self.node_msgs.get_mut(&source) {
            nm.note_byzantine();
        }
    }
}

/// Classify a message against current protocol state.
fn classify(
    clients: &ClientWindows,
    active_epoch: Option<&ActiveEpoch>,
    checkpoints: &CheckpointTracker,
    changer: &EpochChanger,
    msg: &Msg,
) -> Applyable {
    let current_epoch = changer
        .pending_epoch()
        .unwrap_or_else(|| changer.last_active_epoch());

    match msg {
        Msg::RequestAck(_) | Msg::ForwardRequest(_) | Msg::FetchRequest(_) => clients.filter(msg),

        Msg::Preprepare(preprepare) => {
            match classify_pipeline(active_epoch, current_epoch, preprepare.epoch, preprepare.seq_no)
            {
                Applyable::Current => {
                    // Hold the proposal until every member request is
                    // verified and allocated.
                    if preprepare.batch.iter().all(|fwd| clients.is_resolved(&fwd.ack)) {
                        Applyable::Current
                    } else {
                        Applyable::Future
                    }
                }
                other => other,
            }
        }
        Msg::Prepare(prepare) => {
            classify_pipeline(active_epoch, current_epoch, prepare.epoch, prepare.seq_no)
        }
        Msg::Commit(commit) => {
            classify_pipeline(active_epoch, current_epoch, commit.epoch, commit.seq_no)
        }

        Msg::Checkpoint(checkpoint) => {
            if checkpoints.is_past(checkpoint.seq_no) {
                Applyable::Past
            } else {
                match active_epoch {
                    Some(epoch) if checkpoint.seq_no > epoch.high_seq_no() => Applyable::Future,
                    // With no active epoch the tracker just pools them.
                    _ => Applyable::Current,
                }
            }
        }

        Msg::Suspect(suspect) => {
            if suspect.epoch < changer.last_active_epoch() {
                Applyable::Past
            } else {
                Applyable::Current
            }
        }
        Msg::EpochChange(change) => {
            if change.new_epoch <= changer.last_active_epoch() {
                Applyable::Past
            } else {
                Applyable::Current
            }
        }
        Msg::NewEpoch(new_epoch) => {
            if new_epoch.config.config.number <= changer.last_active_epoch() {
                Applyable::Past
            } else {
                Applyable::Current
            }
        }

        // Digest-keyed; the changer pools and matches them.
        Msg::EpochChangeAck(_) | Msg::NewEpochEcho(_) | Msg::NewEpochReady(_) => Applyable::Current,
    }
}

/// Watermark classification shared by the three pipeline messages.
fn classify_pipeline(
    active_epoch: Option<&ActiveEpoch>,
    current_epoch: u64,
    msg_epoch: u64,
    seq_no: u64,
) -> Applyable {
    if msg_epoch < current_epoch {
        return Applyable::Past;
    }
    if msg_epoch > current_epoch {
        return Applyable::Future;
    }
    match active_epoch {
        // Mid epoch change: the epoch may still install.
        None => Applyable::Future,
        Some(epoch) => {
            if seq_no <= epoch.base_seq_no() {
                Applyable::Past
            } else if seq_no > epoch.high_seq_no() {
                Applyable::Future
            } else {
                Applyable::Current
            }
        }
    }
}

/// Build the genesis write-ahead log for a fresh deployment: one CEntry
/// at sequence zero, epoch zero, every node a leader.
pub fn bootstrap_log(net: NetworkConfig, value: Vec<u8>) -> Vec<Persistent> {
    let leaders = net.nodes.clone();
    vec![Persistent::C(CEntry {
        seq_no: 0,
        value,
        network_state: NetworkState {
            config: net,
            clients: Vec::new(),
        },
        epoch_config: EpochConfig {
            number: 0,
            leaders,
        },
    })]
}
