//! Epoch-change sub-protocol.
//!
//! Each candidate epoch gets an [`EpochTarget`] walking `Pending →
//! Verifying → Verified → Ready → Idle`. Suspicions of epoch `e`
//! aggregate in target `e + 1`; once a replica joins a change it offers
//! its certified state in an `EpochChange`, every peer digests and
//! acknowledges every change, and the new epoch's leader combines a
//! quorum of acknowledged changes into a `NewEpoch` whose configuration
//! is a pure function of the certificate — every replica recomputes and
//! compares before echoing. Echo and ready quorums then drive
//! installation, Bracha-style.
//!
//! `EpochChangeAck`, `NewEpochEcho`, and `NewEpochReady` carry only a
//! digest on the wire, so they are pooled by digest here and matched to
//! targets as local digests become known.

use std::collections::{BTreeMap, BTreeSet};
use sbor::prelude::*;
use tracing::{debug, info, warn};
use weft_core::{Actions, HashOrigin};
use weft_messages::Msg;
use weft_types::{
    Checkpoint, EpochChange, EpochChangeAck, EpochConfig, Hash, NetworkConfig, NewEpoch,
    NewEpochConfig, NewEpochEcho, NewEpochReady, NodeId, RemoteEpochChange, SetEntry, Suspect,
};

/// Lifecycle of one candidate epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TargetState {
    /// Known only from peers' messages; aggregating suspicions.
    Pending,

    /// We joined the change; accumulating acknowledged epoch changes.
    Verifying,

    /// A valid new-epoch configuration was seen and echoed.
    Verified,

    /// Ready quorum reached; waiting for the driver to install.
    Ready,

    /// Installed.
    Idle,
}

/// One candidate epoch.
#[derive(Debug)]
pub(crate) struct EpochTarget {
    epoch: u64,
    state: TargetState,

    /// Nodes suspecting `epoch - 1`.
    suspicions: BTreeSet<NodeId>,

    /// Our own offered state, once we join.
    my_epoch_change: Option<EpochChange>,

    /// The leaders we would prefer for this epoch; diagnostic only, the
    /// binding set is derived from the certificate.
    my_leader_choice: Vec<NodeId>,

    /// First epoch change seen per originator. Equivocators are removed
    /// and ignored thereafter.
    changes: BTreeMap<NodeId, EpochChange>,

    /// Our locally computed digest of each originator's change.
    change_digests: BTreeMap<NodeId, Hash>,

    equivocators: BTreeSet<NodeId>,

    /// A received new-epoch proposal awaiting validation.
    pending_new_epoch: Option<NewEpoch>,

    /// The validated configuration.
    network_new_epoch: Option<NewEpochConfig>,

    /// Our digest of the validated configuration.
    my_config_digest: Option<Hash>,

    suspect_sent: bool,
    config_hash_requested: bool,
    new_epoch_sent: bool,
    echo_sent: bool,
    ready_sent: bool,

    ticks: u64,
}

impl EpochTarget {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            state: TargetState::Pending,
            suspicions: BTreeSet::new(),
            my_epoch_change: None,
            my_leader_choice: Vec::new(),
            changes: BTreeMap::new(),
            change_digests: BTreeMap::new(),
            equivocators: BTreeSet::new(),
            pending_new_epoch: None,
            network_new_epoch: None,
            my_config_digest: None,
            suspect_sent: false,
            config_hash_requested: false,
            new_epoch_sent: false,
            echo_sent: false,
            ready_sent: false,
            ticks: 0,
        }
    }

    pub(crate) fn state(&self) -> TargetState {
        self.state
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn suspicions(&self) -> usize {
        self.suspicions.len()
    }

    pub(crate) fn changes(&self) -> usize {
        self.changes.len()
    }
}

/// Drives epoch changes across all candidate targets.
#[derive(Debug)]
pub(crate) struct EpochChanger {
    my_id: NodeId,
    net: NetworkConfig,

    /// The last installed epoch.
    last_active_epoch: u64,

    /// The target we are currently changing toward, if any.
    pending_epoch: Option<u64>,

    targets: BTreeMap<u64, EpochTarget>,

    // Digest-keyed pools; the wire shapes carry no epoch number.
    acks: BTreeMap<(NodeId, Hash), BTreeSet<NodeId>>,
    echos: BTreeMap<Hash, BTreeSet<NodeId>>,
    readies: BTreeMap<Hash, BTreeSet<NodeId>>,
}

impl EpochChanger {
    pub(crate) fn new(my_id: NodeId, net: NetworkConfig, last_active_epoch: u64) -> Self {
        Self {
            my_id,
            net,
            last_active_epoch,
            pending_epoch: None,
            targets: BTreeMap::new(),
            acks: BTreeMap::new(),
            echos: BTreeMap::new(),
            readies: BTreeMap::new(),
        }
    }

    pub(crate) fn last_active_epoch(&self) -> u64 {
        self.last_active_epoch
    }

    pub(crate) fn pending_epoch(&self) -> Option<u64> {
        self.pending_epoch
    }

    pub(crate) fn targets(&self) -> impl Iterator<Item = &EpochTarget> {
        self.targets.values()
    }

    fn target_mut(&mut self, epoch: u64) -> &mut EpochTarget {
        self.targets
            .entry(epoch)
            .or_insert_with(|| EpochTarget::new(epoch))
    }

    /// Record a suspicion of `epoch`. Returns true when `f + 1` distinct
    /// nodes now suspect it and we have not yet joined the change to
    /// `epoch + 1` — the driver then abandons the epoch and joins.
    pub(crate) fn apply_suspect(&mut self, source: NodeId, epoch: u64) -> bool {
        if epoch < self.last_active_epoch {
            return false;
        }
        let quorum = self.net.some_correct_quorum();
        let target = self.target_mut(epoch + 1);
        target.suspicions.insert(source);
        target.suspicions.len() >= quorum && target.my_epoch_change.is_none()
    }

    /// Whether we already joined the change to `epoch`.
    pub(crate) fn joined(&self, epoch: u64) -> bool {
        self.targets
            .get(&epoch)
            .is_some_and(|t| t.my_epoch_change.is_some())
    }

    /// Join the change to `epoch`: broadcast our suspicion of its
    /// predecessor (once) and our epoch change. Our own broadcasts loop
    /// back and are processed like any peer's.
    pub(crate) fn join(&mut self, epoch: u64, my_change: EpochChange) -> Actions {
        assert!(epoch > 0, "cannot change into epoch 0");
        assert_eq!(my_change.new_epoch, epoch, "epoch change targets wrong epoch");
        let nodes = self.net.nodes.clone();
        let target = self.target_mut(epoch);
        if target.my_epoch_change.is_some() {
            return Actions::new();
        }

        info!(epoch, "joining epoch change");
        target.my_epoch_change = Some(my_change.clone());
        target.my_leader_choice = nodes;
        if target.state < TargetState::Verifying {
            target.state = TargetState::Verifying;
        }

        let mut actions = Actions::new();
        if !target.suspect_sent {
            target.suspect_sent = true;
            actions
                .broadcast
                .push(Msg::Suspect(Suspect { epoch: epoch - 1 }));
        }
        actions
            .broadcast
            .push(Msg::EpochChange(Box::new(my_change)));

        self.pending_epoch = Some(self.pending_epoch.map_or(epoch, |p| p.max(epoch)));
        actions
    }

    /// Absorb a peer's epoch change: store it (detecting equivocation)
    /// and ask for its digest so it can be acknowledged.
    pub(crate) fn apply_epoch_change(&mut self, source: NodeId, msg: &EpochChange) -> Actions {
        let target = self.target_mut(msg.new_epoch);
        if target.equivocators.contains(&source) {
            return Actions::new();
        }

        match target.changes.get(&source) {
            Some(existing) if existing == msg => return Actions::new(),
            Some(_) => {
                warn!(peer = %source, epoch = msg.new_epoch, "equivocating epoch change");
                target.equivocators.insert(source);
                target.changes.remove(&source);
                target.change_digests.remove(&source);
                return Actions::new();
            }
            None => {}
        }

        target.changes.insert(source, msg.clone());

        let encoded = basic_encode(msg).expect("epoch change encodes");
        Actions::hash(
            vec![encoded],
            HashOrigin::EpochChange {
                source,
                epoch_change: msg.clone(),
            },
        )
    }

    /// Our digest of a peer's epoch change arrived: acknowledge it.
    pub(crate) fn apply_epoch_change_digest(
        &mut self,
        source: NodeId,
        epoch_change: &EpochChange,
        digest: Hash,
    ) -> Actions {
        let target = self.target_mut(epoch_change.new_epoch);
        match target.changes.get(&source) {
            // The change may have been replaced by equivocation handling
            // while the digest was in flight.
            Some(stored) if stored == epoch_change => {}
            _ => return Actions::new(),
        }
        target.change_digests.insert(source, digest);

        let mut actions = Actions::broadcast(Msg::EpochChangeAck(EpochChangeAck {
            originator: source,
            digest,
        }));
        actions.append(self.try_progress(epoch_change.new_epoch));
        actions
    }

    /// Candidate epochs that may still make progress.
    fn live_targets(&self) -> Vec<u64> {
        self.targets
            .iter()
            .filter(|(_, t)| t.state < TargetState::Ready)
            .map(|(&e, _)| e)
            .collect()
    }

    /// Pool a peer's acknowledgement.
    pub(crate) fn apply_epoch_change_ack(&mut self, source: NodeId, ack: &EpochChangeAck) -> Actions {
        self.acks
            .entry((ack.originator, ack.digest))
            .or_default()
            .insert(source);
        self.prune_pools();

        let mut actions = Actions::new();
        for epoch in self.live_targets() {
            actions.append(self.try_progress(epoch));
        }
        actions
    }

    /// Absorb a new-epoch proposal. Returns the action batch and whether
    /// the message was Byzantine-attributable to its sender.
    pub(crate) fn apply_new_epoch(&mut self, source: NodeId, msg: &NewEpoch) -> (Actions, bool) {
        let epoch = msg.config.config.number;
        if source != self.net.epoch_leader(epoch) {
            warn!(peer = %source, epoch, "new epoch from non-leader");
            return (Actions::new(), true);
        }
        if msg.epoch_changes.len() < self.net.intersection_quorum() {
            warn!(peer = %source, epoch, "new epoch with undersized certificate");
            return (Actions::new(), true);
        }

        let target = self.target_mut(epoch);
        match &target.pending_new_epoch {
            Some(existing) if *existing == *msg => return (Actions::new(), false),
            Some(_) => {
                // The leader proposed two different configurations.
                warn!(peer = %source, epoch, "equivocating new epoch proposal");
                return (Actions::new(), true);
            }
            None => target.pending_new_epoch = Some(msg.clone()),
        }

        (self.try_progress(epoch), false)
    }

    /// Our digest of a validated configuration arrived: echo it.
    pub(crate) fn apply_config_digest(&mut self, config: &NewEpochConfig, digest: Hash) -> Actions {
        let epoch = config.config.number;
        let target = self.target_mut(epoch);
        if target.network_new_epoch.as_ref() != Some(config) || target.echo_sent {
            return Actions::new();
        }

        debug!(epoch, %digest, "echoing new epoch configuration");
        target.my_config_digest = Some(digest);
        target.echo_sent = true;
        if target.state < TargetState::Verified {
            target.state = TargetState::Verified;
        }

        let mut actions = Actions::broadcast(Msg::NewEpochEcho(NewEpochEcho { digest }));
        actions.append(self.check_quorums(epoch));
        actions
    }

    /// Pool an echo.
    pub(crate) fn apply_new_epoch_echo(&mut self, source: NodeId, echo: &NewEpochEcho) -> Actions {
        self.echos.entry(echo.digest).or_default().insert(source);
        self.prune_pools();
        let mut actions = Actions::new();
        for epoch in self.live_targets() {
            actions.append(self.check_quorums(epoch));
        }
        actions
    }

    /// Pool a ready.
    pub(crate) fn apply_new_epoch_ready(&mut self, source: NodeId, ready: &NewEpochReady) -> Actions {
        self.readies.entry(ready.digest).or_default().insert(source);
        self.prune_pools();
        let mut actions = Actions::new();
        for epoch in self.live_targets() {
            actions.append(self.check_quorums(epoch));
        }
        actions
    }

    /// The configuration to install once a target reaches `Ready`. The
    /// network may converge on a target other than the one we escalated
    /// to; the highest ready target wins.
    pub(crate) fn ready_target(&self) -> Option<&NewEpochConfig> {
        self.targets
            .values()
            .rev()
            .find(|t| t.state == TargetState::Ready)
            .and_then(|t| t.network_new_epoch.as_ref())
    }

    /// The driver installed `epoch`; retire the machinery below it.
    pub(crate) fn install_complete(&mut self, epoch: u64) {
        let matched_digests: Vec<Hash> = self
            .targets
            .get(&epoch)
            .map(|t| {
                t.change_digests
                    .values()
                    .copied()
                    .chain(t.my_config_digest)
                    .collect()
            })
            .unwrap_or_default();

        if let Some(target) = self.targets.get_mut(&epoch) {
            target.state = TargetState::Idle;
        }

        self.last_active_epoch = epoch;
        self.pending_epoch = None;
        self.targets.retain(|&e, _| e > epoch);

        self.acks.retain(|&(_, d), _| !matched_digests.contains(&d));
        for digest in &matched_digests {
            self.echos.remove(digest);
            self.readies.remove(digest);
        }
    }

    /// Advance the stall timer of the pending target; re-suspect it when
    /// it cannot make progress, escalating the change one epoch further.
    pub(crate) fn tick(&mut self, new_epoch_ticks: u64) -> Actions {
        let Some(epoch) = self.pending_epoch else {
            return Actions::new();
        };
        let target = self.target_mut(epoch);
        if target.state >= TargetState::Ready {
            return Actions::new();
        }

        target.ticks += 1;
        if target.ticks < new_epoch_ticks {
            return Actions::new();
        }
        target.ticks = 0;

        warn!(epoch, "epoch change stalled, suspecting it");
        Actions::broadcast(Msg::Suspect(Suspect { epoch }))
    }

    /// Attempt leader proposal and pending-proposal validation.
    fn try_progress(&mut self, epoch: u64) -> Actions {
        let mut actions = Actions::new();

        let verified = self.verified_changes(epoch);

        // Leader proposal once a quorum of changes verified.
        let is_leader = self.net.epoch_leader(epoch) == self.my_id;
        if is_leader && verified.len() >= self.net.intersection_quorum() {
            let should_propose = {
                let target = self.target_mut(epoch);
                if !target.new_epoch_sent && target.my_epoch_change.is_some() {
                    target.new_epoch_sent = true;
                    true
                } else {
                    false
                }
            };
            if should_propose {
                let config = compute_config(epoch, &verified, &self.net);
                let epoch_changes = verified
                    .iter()
                    .map(|(node_id, (_, digest))| RemoteEpochChange {
                        node_id: *node_id,
                        digest: *digest,
                    })
                    .collect();
                info!(epoch, "proposing new epoch");
                actions.broadcast.push(Msg::NewEpoch(Box::new(NewEpoch {
                    config,
                    epoch_changes,
                })));
            }
        }

        // Validate a pending proposal against our own verified changes.
        let target = self.target_mut(epoch);
        let proposal = if target.network_new_epoch.is_none() && !target.config_hash_requested {
            target.pending_new_epoch.clone()
        } else {
            None
        };
        if let Some(proposal) = proposal {
            let mut referenced = BTreeMap::new();
            let mut all_verified = true;
            for remote in &proposal.epoch_changes {
                match verified.get(&remote.node_id) {
                    Some((change, digest)) if *digest == remote.digest => {
                        referenced.insert(remote.node_id, (change.clone(), *digest));
                    }
                    _ => {
                        all_verified = false;
                        break;
                    }
                }
            }

            if all_verified {
                let expected = compute_config(epoch, &referenced, &self.net);
                if expected == proposal.config {
                    let target = self.target_mut(epoch);
                    target.network_new_epoch = Some(proposal.config.clone());
                    target.config_hash_requested = true;
                    let encoded = basic_encode(&proposal.config).expect("config encodes");
                    actions.append(Actions::hash(
                        vec![encoded],
                        HashOrigin::NewEpochConfig {
                            config: proposal.config,
                        },
                    ));
                } else {
                    warn!(epoch, "new epoch proposal does not match its certificate");
                    self.target_mut(epoch).pending_new_epoch = None;
                }
            }
        }

        actions
    }

    /// Check echo and ready quorums for a target whose config digest we
    /// know.
    fn check_quorums(&mut self, epoch: u64) -> Actions {
        let intersection = self.net.intersection_quorum();
        let some_correct = self.net.some_correct_quorum();

        let Some(target) = self.targets.get(&epoch) else {
            return Actions::new();
        };
        let Some(digest) = target.my_config_digest else {
            return Actions::new();
        };

        let echo_count = self.echos.get(&digest).map_or(0, BTreeSet::len);
        let ready_count = self.readies.get(&digest).map_or(0, BTreeSet::len);

        let mut actions = Actions::new();

        let target = self.target_mut(epoch);
        if !target.ready_sent && (echo_count >= intersection || ready_count >= some_correct) {
            debug!(epoch, %digest, echo_count, ready_count, "declaring readiness");
            target.ready_sent = true;
            actions
                .broadcast
                .push(Msg::NewEpochReady(NewEpochReady { digest }));
        }

        if target.ready_sent && ready_count >= intersection && target.state < TargetState::Ready {
            info!(epoch, "new epoch ready to install");
            target.state = TargetState::Ready;
        }

        actions
    }

    /// Changes for `epoch` whose digest holds an ack quorum.
    fn verified_changes(&self, epoch: u64) -> BTreeMap<NodeId, (EpochChange, Hash)> {
        let quorum = self.net.intersection_quorum();
        let Some(target) = self.targets.get(&epoch) else {
            return BTreeMap::new();
        };

        target
            .changes
            .iter()
            .filter_map(|(&originator, change)| {
                let digest = *target.change_digests.get(&originator)?;
                let ack_count = self
                    .acks
                    .get(&(originator, digest))
                    .map_or(0, BTreeSet::len);
                (ack_count >= quorum).then(|| (originator, (change.clone(), digest)))
            })
            .collect()
    }

    /// Keep the digest-keyed pools bounded against spam.
    fn prune_pools(&mut self) {
        let cap = 8 * self.net.n();
        while self.acks.len() > cap {
            let key = *self.acks.keys().next().expect("non-empty");
            self.acks.remove(&key);
        }
        while self.echos.len() > cap {
            let key = *self.echos.keys().next().expect("non-empty");
            self.echos.remove(&key);
        }
        while self.readies.len() > cap {
            let key = *self.readies.keys().next().expect("non-empty");
            self.readies.remove(&key);
        }
    }
}

/// Derive a new epoch's configuration from a set of verified changes.
///
/// Pure and deterministic: every replica computes the same configuration
/// from the same certificate, which is what makes the leader's proposal
/// checkable.
///
/// - Leaders: the sorted originators of the certificate. A leader that
///   stalled contributed no change and drops out, rotating its buckets
///   to the survivors.
/// - Starting checkpoint: the highest `(seq, value)` with `f + 1`
///   support.
/// - Final preprepares: one slot per sequence from the checkpoint to the
///   highest certified sequence; a digest with `f + 1` support in the Q
///   sets is re-proposed, anything else is filled null.
pub(crate) fn compute_config(
    epoch: u64,
    changes: &BTreeMap<NodeId, (EpochChange, Hash)>,
    net: &NetworkConfig,
) -> NewEpochConfig {
    let some_correct = net.some_correct_quorum();

    let leaders: Vec<NodeId> = changes.keys().copied().collect();

    // Starting checkpoint: per-originator dedup, then support count.
    let mut checkpoint_support: BTreeMap<(u64, Vec<u8>), BTreeSet<NodeId>> = BTreeMap::new();
    for (&originator, (change, _)) in changes {
        let mut seen: BTreeSet<u64> = BTreeSet::new();
        for checkpoint in &change.checkpoints {
            if seen.insert(checkpoint.seq_no) {
                checkpoint_support
                    .entry((checkpoint.seq_no, checkpoint.value.clone()))
                    .or_default()
                    .insert(originator);
            }
        }
    }
    let starting_checkpoint = checkpoint_support
        .iter()
        .filter(|(_, support)| support.len() >= some_correct)
        .map(|((seq_no, value), _)| (*seq_no, value.clone()))
        .max_by_key(|(seq_no, _)| *seq_no)
        .or_else(|| {
            // No checkpoint has quorum support; fall back to the lowest
            // offered so no certified history is skipped.
            checkpoint_support
                .keys()
                .next()
                .map(|(seq_no, value)| (*seq_no, value.clone()))
        })
        .map(|(seq_no, value)| Checkpoint { seq_no, value })
        .unwrap_or(Checkpoint {
            seq_no: 0,
            value: Vec::new(),
        });

    // Q-set digest support per sequence.
    let mut digest_support: BTreeMap<u64, BTreeMap<Hash, BTreeSet<NodeId>>> = BTreeMap::new();
    let mut max_seq = starting_checkpoint.seq_no;
    for (&originator, (change, _)) in changes {
        for entry in change.q_set.iter().chain(change.p_set.iter()) {
            max_seq = max_seq.max(entry.seq_no);
        }
        for SetEntry { seq_no, digest, .. } in &change.q_set {
            digest_support
                .entry(*seq_no)
                .or_default()
                .entry(*digest)
                .or_default()
                .insert(originator);
        }
    }

    let final_preprepares = ((starting_checkpoint.seq_no + 1)..=max_seq)
        .map(|seq_no| {
            digest_support.get(&seq_no).and_then(|digests| {
                digests
                    .iter()
                    .filter(|(_, support)| support.len() >= some_correct)
                    .max_by(|(d_a, s_a), (d_b, s_b)| {
                        s_a.len().cmp(&s_b.len()).then(d_b.cmp(d_a))
                    })
                    .map(|(&digest, _)| digest)
            })
        })
        .collect();

    NewEpochConfig {
        config: EpochConfig {
            number: epoch,
            leaders,
        },
        starting_checkpoint,
        final_preprepares,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> NetworkConfig {
        NetworkConfig {
            nodes: (0..4).map(NodeId).collect(),
            num_buckets: 2,
            checkpoint_interval: 5,
            max_epoch_length: 200,
        }
    }

    fn change(epoch: u64) -> EpochChange {
        EpochChange {
            new_epoch: epoch,
            checkpoints: vec![Checkpoint {
                seq_no: 0,
                value: b"genesis".to_vec(),
            }],
            p_set: vec![],
            q_set: vec![],
        }
    }

    fn changer_for(id: u64) -> EpochChanger {
        EpochChanger::new(NodeId(id), net(), 0)
    }

    /// Feed a change through store → digest → quorum of acks.
    fn verify_change(
        changer: &mut EpochChanger,
        originator: NodeId,
        msg: &EpochChange,
    ) -> (Hash, Actions) {
        changer.apply_epoch_change(originator, msg);
        let digest = Hash::from_bytes(&basic_encode(msg).unwrap());
        changer.apply_epoch_change_digest(originator, msg, digest);
        let mut last = Actions::new();
        for acker in 0..4 {
            last = changer.apply_epoch_change_ack(
                NodeId(acker),
                &EpochChangeAck {
                    originator,
                    digest,
                },
            );
        }
        (digest, last)
    }

    #[test]
    fn test_suspect_quorum_triggers_join() {
        let mut changer = changer_for(2);

        assert!(!changer.apply_suspect(NodeId(0), 0));
        assert!(changer.apply_suspect(NodeId(1), 0));

        let actions = changer.join(1, change(1));
        assert!(matches!(&actions.broadcast[0], Msg::Suspect(s) if s.epoch == 0));
        assert!(matches!(&actions.broadcast[1], Msg::EpochChange(_)));
        assert_eq!(changer.pending_epoch(), Some(1));

        // Further suspicions do not re-trigger.
        assert!(!changer.apply_suspect(NodeId(3), 0));
    }

    #[test]
    fn test_epoch_change_is_hashed_then_acked() {
        let mut changer = changer_for(2);
        let msg = change(1);

        let actions = changer.apply_epoch_change(NodeId(0), &msg);
        assert_eq!(actions.hash.len(), 1);

        let digest = Hash::from_bytes(b"ec0");
        let actions = changer.apply_epoch_change_digest(NodeId(0), &msg, digest);
        assert!(matches!(
            &actions.broadcast[0],
            Msg::EpochChangeAck(a) if a.originator == NodeId(0) && a.digest == digest
        ));
    }

    #[test]
    fn test_equivocating_change_is_ignored() {
        let mut changer = changer_for(2);
        let msg = change(1);
        let mut other = change(1);
        other.checkpoints[0].value = b"different".to_vec();

        changer.apply_epoch_change(NodeId(0), &msg);
        changer.apply_epoch_change(NodeId(0), &other);

        // Neither the original nor anything further from node 0 counts.
        let actions = changer.apply_epoch_change(NodeId(0), &msg);
        assert!(actions.is_empty());
        assert_eq!(changer.targets().next().unwrap().changes(), 0);
    }

    #[test]
    fn test_leader_proposes_after_quorum_of_verified_changes() {
        // Node 1 leads epoch 1.
        let mut changer = changer_for(1);
        changer.join(1, change(1));

        let mut proposed = false;
        for originator in 0..3 {
            let (_, actions) = verify_change(&mut changer, NodeId(originator), &change(1));
            proposed |= actions
                .broadcast
                .iter()
                .any(|m| matches!(m, Msg::NewEpoch(_)));
        }
        assert!(proposed);
    }

    #[test]
    fn test_non_leader_new_epoch_is_byzantine() {
        let mut changer = changer_for(2);
        let config = compute_config(1, &BTreeMap::new(), &net());
        let msg = NewEpoch {
            config,
            epoch_changes: vec![],
        };
        let (_, byzantine) = changer.apply_new_epoch(NodeId(3), &msg);
        assert!(byzantine);
    }

    #[test]
    fn test_full_change_reaches_ready() {
        // Node 2 is a follower for epoch 1 (node 1 leads).
        let mut changer = changer_for(2);
        changer.join(1, change(1));

        let mut verified = BTreeMap::new();
        for originator in 0..3 {
            let msg = change(1);
            let (digest, _) = verify_change(&mut changer, NodeId(originator), &msg);
            verified.insert(NodeId(originator), (msg, digest));
        }

        let config = compute_config(1, &verified, &net());
        let proposal = NewEpoch {
            config: config.clone(),
            epoch_changes: verified
                .iter()
                .map(|(&node_id, &(_, digest))| RemoteEpochChange { node_id, digest })
                .collect(),
        };

        let (actions, byzantine) = changer.apply_new_epoch(NodeId(1), &proposal);
        assert!(!byzantine);
        assert_eq!(actions.hash.len(), 1, "validated proposal is digested");

        let config_digest = Hash::from_bytes(&basic_encode(&config).unwrap());
        let actions = changer.apply_config_digest(&config, config_digest);
        assert!(matches!(&actions.broadcast[0], Msg::NewEpochEcho(e) if e.digest == config_digest));

        for node in 0..3 {
            changer.apply_new_epoch_echo(NodeId(node), &NewEpochEcho {
                digest: config_digest,
            });
        }
        for node in 0..3 {
            changer.apply_new_epoch_ready(NodeId(node), &NewEpochReady {
                digest: config_digest,
            });
        }

        let ready = changer.ready_target().expect("target ready");
        assert_eq!(ready.config.number, 1);

        changer.install_complete(1);
        assert_eq!(changer.last_active_epoch(), 1);
        assert_eq!(changer.pending_epoch(), None);
    }

    #[test]
    fn test_stalled_target_escalates() {
        let mut changer = changer_for(2);
        changer.join(1, change(1));

        for _ in 0..15 {
            assert!(changer.tick(16).is_empty());
        }
        let actions = changer.tick(16);
        assert!(matches!(&actions.broadcast[0], Msg::Suspect(s) if s.epoch == 1));
    }

    #[test]
    fn test_compute_config_re_proposes_supported_digests() {
        let supported = Hash::from_bytes(b"supported");
        let unsupported = Hash::from_bytes(b"unsupported");

        let mut changes = BTreeMap::new();
        for node in 0..3 {
            let mut c = change(1);
            c.q_set.push(SetEntry {
                epoch: 0,
                seq_no: 1,
                digest: supported,
            });
            if node == 0 {
                c.q_set.push(SetEntry {
                    epoch: 0,
                    seq_no: 3,
                    digest: unsupported,
                });
            }
            changes.insert(NodeId(node), (c, Hash::from_bytes(&[node as u8])));
        }

        let config = compute_config(1, &changes, &net());
        assert_eq!(config.config.leaders, vec![NodeId(0), NodeId(1), NodeId(2)]);
        assert_eq!(config.starting_checkpoint.seq_no, 0);
        // Sequences 1..=3: 1 re-proposed, 2 and 3 null.
        assert_eq!(
            config.final_preprepares,
            vec![Some(supported), None, None]
        );
    }

    #[test]
    fn test_compute_config_is_deterministic() {
        let mut changes = BTreeMap::new();
        for node in 0..3 {
            changes.insert(NodeId(node), (change(1), Hash::from_bytes(&[node as u8])));
        }
        assert_eq!(
            compute_config(1, &changes, &net()),
            compute_config(1, &changes, &net())
        );
    }
}
