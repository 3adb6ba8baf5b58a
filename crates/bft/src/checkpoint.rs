//! Checkpoint collection and stability tracking.
//!
//! Each checkpoint-aligned sequence number gets a window collecting
//! `(source, value)` pairs. A window is *stable* once `2f + 1` sources
//! report one identical value. Watermarks may advance only when a window
//! is both stable and locally applied — the application has returned its
//! own snapshot value for that sequence — so a replica never discards
//! history it has not executed.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};
use weft_core::Actions;
use weft_messages::Msg;
use weft_types::{Checkpoint, NetworkConfig, NodeId};

/// Outcome of absorbing one checkpoint message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CheckpointOutcome {
    /// The window just became eligible for garbage collection (stable
    /// and locally applied).
    pub(crate) ready_to_gc: bool,

    /// The sender disagreed with an already-stable value; attributable.
    pub(crate) divergent: bool,
}

#[derive(Debug)]
struct CheckpointWindow {
    seq_no: u64,
    values: BTreeMap<Vec<u8>, BTreeSet<NodeId>>,
    stable_value: Option<Vec<u8>>,
    locally_applied: bool,
}

impl CheckpointWindow {
    fn new(seq_no: u64) -> Self {
        Self {
            seq_no,
            values: BTreeMap::new(),
            stable_value: None,
            locally_applied: false,
        }
    }

    fn ready_to_gc(&self) -> bool {
        self.stable_value.is_some() && self.locally_applied
    }
}

/// Tracks checkpoint windows above the last garbage-collected base.
#[derive(Debug)]
pub(crate) struct CheckpointTracker {
    net: NetworkConfig,
    windows: BTreeMap<u64, CheckpointWindow>,

    /// The last garbage-collected checkpoint; everything at or below it
    /// is history.
    base_seq_no: u64,

    /// The highest stable checkpoint, offered in epoch changes.
    highest_stable: Checkpoint,
}

impl CheckpointTracker {
    /// Start from a known-stable, already-applied checkpoint (genesis or
    /// the CEntry a replay booted from).
    pub(crate) fn new(net: NetworkConfig, base: Checkpoint) -> Self {
        Self {
            net,
            windows: BTreeMap::new(),
            base_seq_no: base.seq_no,
            highest_stable: base,
        }
    }

    pub(crate) fn highest_stable(&self) -> &Checkpoint {
        &self.highest_stable
    }

    /// Whether a checkpoint message for `seq_no` is already history.
    pub(crate) fn is_past(&self, seq_no: u64) -> bool {
        seq_no <= self.base_seq_no
    }

    /// Absorb a peer's checkpoint value.
    pub(crate) fn apply_checkpoint_msg(
        &mut self,
        source: NodeId,
        seq_no: u64,
        value: Vec<u8>,
    ) -> CheckpointOutcome {
        let quorum = self.net.intersection_quorum();
        let window = self
            .windows
            .entry(seq_no)
            .or_insert_with(|| CheckpointWindow::new(seq_no));

        if let Some(stable) = &window.stable_value {
            if *stable != value {
                warn!(seq_no, peer = %source, "checkpoint value diverges from stable value");
                return CheckpointOutcome {
                    ready_to_gc: false,
                    divergent: true,
                };
            }
        }

        let was_ready = window.ready_to_gc();
        let supporters = window.values.entry(value.clone()).or_default();
        supporters.insert(source);

        if window.stable_value.is_none() && supporters.len() >= quorum {
            debug!(seq_no, supporters = supporters.len(), "checkpoint stable");
            window.stable_value = Some(value.clone());
            if seq_no > self.highest_stable.seq_no {
                self.highest_stable = Checkpoint { seq_no, value };
            }
        }

        CheckpointOutcome {
            ready_to_gc: !was_ready && window.ready_to_gc(),
            divergent: false,
        }
    }

    /// Absorb our own application's snapshot for `seq_no`: broadcast it
    /// and note local application.
    ///
    /// Returns the broadcast batch and whether the window just became
    /// eligible for garbage collection.
    pub(crate) fn apply_checkpoint_result(
        &mut self,
        seq_no: u64,
        value: Vec<u8>,
    ) -> (Actions, bool) {
        if self.is_past(seq_no) {
            return (Actions::new(), false);
        }

        let window = self
            .windows
            .entry(seq_no)
            .or_insert_with(|| CheckpointWindow::new(seq_no));
        let was_ready = window.ready_to_gc();
        window.locally_applied = true;

        let actions = Actions::broadcast(Msg::Checkpoint(Checkpoint {
            seq_no,
            value: value.clone(),
        }));

        (actions, !was_ready && window.ready_to_gc())
    }

    /// Retire every window at or below `seq_no` after watermarks moved.
    pub(crate) fn garbage_collect(&mut self, seq_no: u64) {
        self.base_seq_no = self.base_seq_no.max(seq_no);
        self.windows.retain(|&s, _| s > seq_no);
    }

    /// Align the tracker to an epoch change's starting checkpoint: treat
    /// it as stable, keep only newer windows.
    pub(crate) fn install_base(&mut self, checkpoint: Checkpoint) {
        if checkpoint.seq_no > self.highest_stable.seq_no {
            self.highest_stable = checkpoint.clone();
        }
        if checkpoint.seq_no > self.base_seq_no {
            self.garbage_collect(checkpoint.seq_no);
        }
    }

    /// Diagnostic view: `(seq_no, stable, locally_applied, max support)`.
    pub(crate) fn status(&self) -> Vec<(u64, bool, bool, usize)> {
        self.windows
            .values()
            .map(|w| {
                (
                    w.seq_no,
                    w.stable_value.is_some(),
                    w.locally_applied,
                    w.values.values().map(BTreeSet::len).max().unwrap_or(0),
                )
            })
            .collect()
    }
}
