//! Wire message envelope for the weft consensus protocol.
//!
//! [`Msg`] is the single tagged union carried by the transport. The
//! message bodies live in `weft-types`; this crate adds the envelope and
//! telemetry names. Dispatch over `Msg` is always an exhaustive match —
//! there is no open-world message hierarchy.

use sbor::prelude::*;
use weft_types::{
    Checkpoint, Commit, EpochChange, EpochChangeAck, FetchRequest, ForwardRequest, NewEpoch,
    NewEpochEcho, NewEpochReady, Prepare, Preprepare, RequestAck, Suspect,
};

/// All messages a replica can send or receive.
///
/// Large variants are boxed to keep the envelope small on the common
/// paths (acks, prepares, commits).
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Msg {
    // ═══════════════════════════════════════════════════════════════════
    // Client request dissemination
    // ═══════════════════════════════════════════════════════════════════
    /// A replica acknowledges holding a request digest.
    RequestAck(RequestAck),

    /// A request forwarded with its payload.
    ForwardRequest(Box<ForwardRequest>),

    /// A replica asks a peer for a request payload it is missing.
    FetchRequest(FetchRequest),

    // ═══════════════════════════════════════════════════════════════════
    // Ordering pipeline
    // ═══════════════════════════════════════════════════════════════════
    /// Leader proposal of a batch for one sequence.
    Preprepare(Box<Preprepare>),

    /// Prepare vote.
    Prepare(Prepare),

    /// Commit vote.
    Commit(Commit),

    /// Checkpoint snapshot value.
    Checkpoint(Checkpoint),

    // ═══════════════════════════════════════════════════════════════════
    // Epoch change
    // ═══════════════════════════════════════════════════════════════════
    /// Suspicion of an epoch's leaders.
    Suspect(Suspect),

    /// A replica's certified state offered to the next epoch.
    EpochChange(Box<EpochChange>),

    /// Acknowledgement of a peer's epoch change.
    EpochChangeAck(EpochChangeAck),

    /// The new epoch's derived configuration and certificate.
    NewEpoch(Box<NewEpoch>),

    /// Echo of a new-epoch configuration.
    NewEpochEcho(NewEpochEcho),

    /// Readiness for a new-epoch configuration.
    NewEpochReady(NewEpochReady),
}

impl Msg {
    /// Message type name for telemetry and per-peer counters.
    pub fn type_name(&self) -> &'static str {
        match self {
            Msg::RequestAck(_) => "RequestAck",
            Msg::ForwardRequest(_) => "ForwardRequest",
            Msg::FetchRequest(_) => "FetchRequest",
            Msg::Preprepare(_) => "Preprepare",
            Msg::Prepare(_) => "Prepare",
            Msg::Commit(_) => "Commit",
            Msg::Checkpoint(_) => "Checkpoint",
            Msg::Suspect(_) => "Suspect",
            Msg::EpochChange(_) => "EpochChange",
            Msg::EpochChangeAck(_) => "EpochChangeAck",
            Msg::NewEpoch(_) => "NewEpoch",
            Msg::NewEpochEcho(_) => "NewEpochEcho",
            Msg::NewEpochReady(_) => "NewEpochReady",
        }
    }

    /// Whether this message is part of the client request sub-protocol
    /// (admission classifies these against client windows).
    pub fn is_client_msg(&self) -> bool {
        matches!(
            self,
            Msg::RequestAck(_) | Msg::ForwardRequest(_) | Msg::FetchRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::{
        CEntry, ClientId, ClientState, EpochConfig, Hash, NetworkConfig, NetworkState,
        NewEpochConfig, NodeId, PEntry, Persistent, QEntry, RemoteEpochChange, SetEntry,
    };

    fn sample_ack() -> RequestAck {
        RequestAck {
            client_id: ClientId(9),
            req_no: 42,
            digest: Hash::from_bytes(b"payload"),
        }
    }

    fn sample_forward() -> ForwardRequest {
        ForwardRequest {
            ack: sample_ack(),
            data: b"payload".to_vec(),
        }
    }

    fn round_trip(msg: &Msg) {
        let bytes = basic_encode(msg).unwrap();
        let decoded: Msg = basic_decode(&bytes).unwrap();
        assert_eq!(*msg, decoded, "{} did not round-trip", msg.type_name());
    }

    #[test]
    fn test_client_msgs_round_trip() {
        round_trip(&Msg::RequestAck(sample_ack()));
        round_trip(&Msg::ForwardRequest(Box::new(sample_forward())));
        round_trip(&Msg::FetchRequest(FetchRequest {
            client_id: ClientId(9),
            req_no: 42,
            digest: Hash::from_bytes(b"payload"),
        }));
    }

    #[test]
    fn test_pipeline_msgs_round_trip() {
        round_trip(&Msg::Preprepare(Box::new(Preprepare {
            epoch: 0,
            seq_no: 1,
            batch: vec![sample_forward()],
        })));
        round_trip(&Msg::Prepare(Prepare {
            epoch: 0,
            seq_no: 1,
            digest: Hash::from_bytes(b"batch"),
        }));
        round_trip(&Msg::Commit(Commit {
            epoch: 0,
            seq_no: 1,
            digest: Hash::from_bytes(b"batch"),
        }));
        round_trip(&Msg::Checkpoint(Checkpoint {
            seq_no: 5,
            value: b"snap".to_vec(),
        }));
    }

    #[test]
    fn test_epoch_change_msgs_round_trip() {
        let change = EpochChange {
            new_epoch: 3,
            checkpoints: vec![Checkpoint {
                seq_no: 10,
                value: b"snap".to_vec(),
            }],
            p_set: vec![SetEntry {
                epoch: 2,
                seq_no: 11,
                digest: Hash::from_bytes(b"p"),
            }],
            q_set: vec![SetEntry {
                epoch: 2,
                seq_no: 12,
                digest: Hash::from_bytes(b"q"),
            }],
        };
        round_trip(&Msg::Suspect(Suspect { epoch: 2 }));
        round_trip(&Msg::EpochChange(Box::new(change)));
        round_trip(&Msg::EpochChangeAck(EpochChangeAck {
            originator: NodeId(1),
            digest: Hash::from_bytes(b"ec"),
        }));
        round_trip(&Msg::NewEpoch(Box::new(NewEpoch {
            config: NewEpochConfig {
                config: EpochConfig {
                    number: 3,
                    leaders: vec![NodeId(0), NodeId(2)],
                },
                starting_checkpoint: Checkpoint {
                    seq_no: 10,
                    value: b"snap".to_vec(),
                },
                final_preprepares: vec![Some(Hash::from_bytes(b"q")), None],
            },
            epoch_changes: vec![RemoteEpochChange {
                node_id: NodeId(0),
                digest: Hash::from_bytes(b"ec"),
            }],
        })));
        round_trip(&Msg::NewEpochEcho(NewEpochEcho {
            digest: Hash::from_bytes(b"cfg"),
        }));
        round_trip(&Msg::NewEpochReady(NewEpochReady {
            digest: Hash::from_bytes(b"cfg"),
        }));
    }

    #[test]
    fn test_persistent_entries_round_trip() {
        let network_state = NetworkState {
            config: NetworkConfig {
                nodes: (0..4).map(NodeId).collect(),
                num_buckets: 2,
                checkpoint_interval: 5,
                max_epoch_length: 200,
            },
            clients: vec![ClientState {
                id: ClientId(9),
                bucket_low_watermarks: vec![43, 44],
            }],
        };
        let entries = vec![
            Persistent::C(CEntry {
                seq_no: 0,
                value: b"genesis".to_vec(),
                network_state,
                epoch_config: EpochConfig {
                    number: 0,
                    leaders: (0..4).map(NodeId).collect(),
                },
            }),
            Persistent::Q(QEntry {
                seq_no: 1,
                epoch: 0,
                digest: Hash::from_bytes(b"batch"),
                requests: vec![sample_forward()],
            }),
            Persistent::P(PEntry {
                seq_no: 1,
                epoch: 0,
                digest: Hash::from_bytes(b"batch"),
            }),
        ];
        for entry in &entries {
            let bytes = basic_encode(entry).unwrap();
            let decoded: Persistent = basic_decode(&bytes).unwrap();
            assert_eq!(*entry, decoded);
        }
    }
}
