//! Per-peer message admission and buffering.
//!
//! Every inbound message is classified against the current protocol state
//! as past, current, or future. Past messages are dropped, current ones
//! applied, future ones buffered here per peer. Whenever the state moves
//! in a way that could turn future into current (watermark movement,
//! epoch install or abandon, request verification, a new client window),
//! the driver re-drains every buffer through the classifier.
//!
//! Buffers are capped per peer so no single peer can monopolize memory;
//! overflow drops the oldest buffered message and counts it.

use std::collections::VecDeque;
use tracing::{trace, warn};
use weft_messages::Msg;
use weft_types::NodeId;

/// Admission classification of a message against current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applyable {
    /// Already handled or obsolete; discard silently.
    Past,

    /// Applicable now.
    Current,

    /// May become applicable later; buffer.
    Future,
}

/// Diagnostic counters for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounters {
    /// Messages ingested from this peer.
    pub received: u64,

    /// Messages applied as current.
    pub applied: u64,

    /// Messages discarded as past.
    pub dropped_past: u64,

    /// Messages dropped because the buffer was full.
    pub dropped_overflow: u64,

    /// Byzantine-attributable drops (bad digests, equivocation, spam).
    pub byzantine: u64,
}

/// Admission state for one peer: a capped FIFO of future-classified
/// messages plus counters.
#[derive(Debug)]
pub(crate) struct NodeMsgs {
    id: NodeId,
    buffer: VecDeque<Msg>,
    cap: usize,
    counters: PeerCounters,
}

impl NodeMsgs {
    pub(crate) fn new(id: NodeId, cap: usize) -> Self {
        Self {
            id,
            buffer: VecDeque::new(),
            cap,
            counters: PeerCounters::default(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn counters(&self) -> PeerCounters {
        self.counters
    }

    /// Count a freshly ingested message.
    pub(crate) fn note_received(&mut self) {
        self.counters.received += 1;
    }

    /// Count an applied message.
    pub(crate) fn note_applied(&mut self) {
        self.counters.applied += 1;
    }

    /// Count a Byzantine-attributable drop.
    pub(crate) fn note_byzantine(&mut self) {
        self.counters.byzantine += 1;
    }

    /// Buffer a future-classified message, evicting the oldest on
    /// overflow.
    pub(crate) fn buffer(&mut self, msg: Msg) {
        if self.buffer.len() >= self.cap {
            let evicted = self.buffer.pop_front();
            self.counters.dropped_overflow += 1;
            warn!(
                peer = %self.id,
                evicted = evicted.as_ref().map(|m| m.type_name()).unwrap_or(""),
                "peer buffer full, evicting oldest"
            );
        }
        trace!(peer = %self.id, msg = msg.type_name(), "buffering future message");
        self.buffer.push_back(msg);
    }

    /// Pull the first buffered message that now classifies as current.
    ///
    /// Past messages encountered on the way are discarded; future ones
    /// are retained in order.
    pub(crate) fn next(&mut self, mut classify: impl FnMut(&Msg) -> Applyable) -> Option<Msg> {
        let mut retained = VecDeque::with_capacity(self.buffer.len());
        let mut found = None;

        while let Some(msg) = self.buffer.pop_front() {
            match classify(&msg) {
                Applyable::Past => {
                    self.counters.dropped_past += 1;
                }
                Applyable::Current => {
                    found = Some(msg);
                    break;
                }
                Applyable::Future => retained.push_back(msg),
            }
        }

        // Put the untouched tail back behind the retained prefix.
        while let Some(msg) = self.buffer.pop_front() {
            retained.push_back(msg);
        }
        self.buffer = retained;

        found
    }

    /// Number of buffered messages.
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Iterate the buffered messages without disturbing them.
    pub(crate) fn buffered_msgs(&self) -> impl Iterator<Item = &Msg> {
        self.buffer.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::{Prepare, Suspect};

    fn prepare(seq_no: u64) -> Msg {
        Msg::Prepare(Prepare {
            epoch: 0,
            seq_no,
            digest: weft_types::Hash::ZERO,
        })
    }

    #[test]
    fn test_next_pulls_first_current_and_drops_past() {
        let mut msgs = NodeMsgs::new(NodeId(1), 8);
        msgs.buffer(prepare(1));
        msgs.buffer(prepare(5));
        msgs.buffer(prepare(9));

        // seq 1 is now past, seq 5 current, seq 9 still future.
        let pulled = msgs.next(|m| match m {
            Msg::Prepare(p) if p.seq_no <= 1 => Applyable::Past,
            Msg::Prepare(p) if p.seq_no <= 5 => Applyable::Current,
            _ => Applyable::Future,
        });

        assert!(matches!(pulled, Some(Msg::Prepare(p)) if p.seq_no == 5));
        assert_eq!(msgs.buffered(), 1);
        assert_eq!(msgs.counters().dropped_past, 1);
    }

    #[test]
    fn test_next_preserves_future_order() {
        let mut msgs = NodeMsgs::new(NodeId(1), 8);
        msgs.buffer(prepare(3));
        msgs.buffer(prepare(4));
        assert!(msgs.next(|_| Applyable::Future).is_none());

        let first = msgs.next(|_| Applyable::Current);
        assert!(matches!(first, Some(Msg::Prepare(p)) if p.seq_no == 3));
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut msgs = NodeMsgs::new(NodeId(1), 2);
        msgs.buffer(prepare(1));
        msgs.buffer(prepare(2));
        msgs.buffer(prepare(3));

        assert_eq!(msgs.buffered(), 2);
        assert_eq!(msgs.counters().dropped_overflow, 1);
        let first = msgs.next(|_| Applyable::Current);
        assert!(matches!(first, Some(Msg::Prepare(p)) if p.seq_no == 2));
    }

    #[test]
    fn test_counters_accumulate() {
        let mut msgs = NodeMsgs::new(NodeId(2), 8);
        msgs.note_received();
        msgs.note_received();
        msgs.note_applied();
        msgs.note_byzantine();
        msgs.buffer(Msg::Suspect(Suspect { epoch: 0 }));

        let c = msgs.counters();
        assert_eq!(c.received, 2);
        assert_eq!(c.applied, 1);
        assert_eq!(c.byzantine, 1);
    }
}
