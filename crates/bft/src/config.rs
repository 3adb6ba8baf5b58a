//! Replica configuration.

use weft_types::NodeId;

/// Per-replica protocol configuration.
///
/// Time is measured in ticks: the host calls `StateMachine::tick` at its
/// chosen cadence, and every timeout here counts those calls.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our node id.
    pub id: NodeId,

    /// Maximum requests per preprepared batch.
    pub batch_size: usize,

    /// Cut an undersized batch after a bucket queue has waited this many
    /// ticks with pending requests.
    pub batch_delay_ticks: u64,

    /// Ticks without a commit before we suspect the epoch's leaders and
    /// abandon the epoch.
    pub suspect_ticks: u64,

    /// Ticks a pending epoch target may stall before we suspect it too,
    /// escalating the change to the next epoch.
    pub new_epoch_ticks: u64,

    /// Checkpoint intervals kept in flight; the active sequence window
    /// spans `checkpoint_windows * checkpoint_interval` sequences.
    pub checkpoint_windows: u64,

    /// Width of each client's request window.
    pub client_window_width: u64,

    /// Maximum future-classified messages buffered per peer. Overflow
    /// drops the oldest buffered message.
    pub buffered_messages_per_peer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: NodeId(0),
            batch_size: 32,
            batch_delay_ticks: 2,
            suspect_ticks: 8,
            new_epoch_ticks: 16,
            checkpoint_windows: 2,
            client_window_width: 100,
            buffered_messages_per_peer: 1024,
        }
    }
}

impl Config {
    /// Create a configuration for a replica.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Set the maximum batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the batch delay in ticks.
    pub fn with_batch_delay_ticks(mut self, ticks: u64) -> Self {
        self.batch_delay_ticks = ticks;
        self
    }

    /// Set the epoch suspicion timeout in ticks.
    pub fn with_suspect_ticks(mut self, ticks: u64) -> Self {
        self.suspect_ticks = ticks;
        self
    }

    /// Set the pending-epoch stall timeout in ticks.
    pub fn with_new_epoch_ticks(mut self, ticks: u64) -> Self {
        self.new_epoch_ticks = ticks;
        self
    }

    /// Set the number of checkpoint intervals kept in flight.
    pub fn with_checkpoint_windows(mut self, windows: u64) -> Self {
        self.checkpoint_windows = windows;
        self
    }

    /// Set the client request window width.
    pub fn with_client_window_width(mut self, width: u64) -> Self {
        self.client_window_width = width;
        self
    }

    /// Set the per-peer buffer cap.
    pub fn with_buffered_messages_per_peer(mut self, cap: usize) -> Self {
        self.buffered_messages_per_peer = cap;
        self
    }
}
