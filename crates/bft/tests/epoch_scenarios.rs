//! Epoch-change scenarios: leader failure, installation, and Byzantine
//! equivocation.

use weft_bft::{bootstrap_log, Config, StateMachine};
use weft_core::{ActionResults, Actions, HashProvider, HashResult, PreprocessResult};
use weft_messages::Msg;
use weft_test_helpers::{four_node_cluster, test_net, test_request, Blake3HashProvider, Cluster};
use weft_types::{
    Checkpoint, EpochChangeAck, EpochConfig, ForwardRequest, NewEpoch, NewEpochConfig,
    NewEpochEcho, NewEpochReady, NodeId, Prepare, Preprepare, RemoteEpochChange, RequestAck,
};

/// Tick the whole cluster until every node in `nodes` reports at least
/// `epoch`, settling the network between ticks.
fn tick_until_epoch(cluster: &mut Cluster, nodes: &[u64], epoch: u64) {
    for _ in 0..16 {
        cluster.tick_all();
        cluster.run_until_quiet(50_000);
        if nodes
            .iter()
            .all(|&n| cluster.nodes[n as usize].sm.status().epoch >= epoch)
        {
            return;
        }
    }
    panic!("epoch {epoch} never installed");
}

/// A silent leader is suspected; the survivors change epochs, rotate
/// its buckets away, and order the stalled request.
#[test]
fn silent_leader_is_rotated_out() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut cluster = four_node_cluster(1);
    // Node 0 leads every bucket and goes dark.
    for to in 0..4 {
        cluster.block_link(0, to);
    }

    for node in 1..4 {
        cluster.propose(node, test_request(9, 1));
    }
    cluster.run_until_quiet(20_000);
    assert!(cluster.committed(1).is_empty(), "nothing can commit yet");

    tick_until_epoch(&mut cluster, &[1, 2, 3], 1);
    cluster.run_until_quiet(50_000);

    for node in 1..4 {
        let status = cluster.nodes[node as usize].sm.status();
        assert_eq!(status.epoch, 1, "node {node} installed epoch 1");
        let committed = cluster.committed(node);
        assert_eq!(committed.len(), 1, "node {node} ordered the request");
        assert_eq!(committed[0].0, 1);
    }
    cluster.assert_agreement();
}

/// An equivocating leader cannot split the cluster: the slot stalls,
/// the epoch advances, and nobody commits conflicting digests.
#[test]
fn equivocating_leader_cannot_split_commits() {
    let provider = Blake3HashProvider;
    let mut cluster = four_node_cluster(1);

    let make_fwd = |client: u64, req_no: u64| {
        let request = test_request(client, req_no);
        let digest = provider.digest(&[
            request.client_id.0.to_le_bytes().to_vec(),
            request.req_no.to_le_bytes().to_vec(),
            request.data.clone(),
        ]);
        ForwardRequest {
            ack: RequestAck {
                client_id: request.client_id,
                req_no: request.req_no,
                digest,
            },
            data: request.data,
        }
    };

    // Leader 0 equivocates sequence 1: batch A to node 1, batch B to
    // nodes 2 and 3.
    let batch_a = vec![make_fwd(1, 1)];
    let batch_b = vec![make_fwd(2, 1)];
    let preprepare = |batch: Vec<ForwardRequest>| {
        Msg::Preprepare(Box::new(Preprepare {
            epoch: 0,
            seq_no: 1,
            batch,
        }))
    };
    cluster.inject(1, 0, preprepare(batch_a));
    cluster.inject(2, 0, preprepare(batch_b.clone()));
    cluster.inject(3, 0, preprepare(batch_b));

    cluster.run_until_quiet(50_000);

    // Neither digest can reach a prepare quorum.
    for node in 0..4 {
        assert!(
            cluster.committed(node).is_empty(),
            "node {node} must not commit under equivocation"
        );
    }

    // The stall is suspected and the epoch advances past the liar.
    tick_until_epoch(&mut cluster, &[0, 1, 2, 3], 1);
    cluster.run_until_quiet(50_000);

    cluster.assert_agreement();
    for node in 0..4 {
        let commits = cluster.committed(node);
        // Any commit of sequence 1 must agree with every other node's.
        for (seq, digest) in commits {
            for other in 0..4 {
                for (other_seq, other_digest) in cluster.committed(other) {
                    if seq == other_seq {
                        assert_eq!(digest, other_digest);
                    }
                }
            }
        }
    }
}

/// Answer every hash and preprocess request until the state machine
/// stops asking, collecting all emitted actions.
fn drive(sm: &mut StateMachine, first: Actions, provider: &Blake3HashProvider) -> Actions {
    let mut total = Actions::new();
    let mut current = first;
    loop {
        let mut results = ActionResults::default();
        for hash_request in &current.hash {
            results.digests.push(HashResult {
                digest: provider.digest(&hash_request.data),
                origin: hash_request.origin.clone(),
            });
        }
        for request in &current.preprocess {
            results.preprocessed.push(PreprocessResult {
                digest: provider.digest(&[
                    request.request.client_id.0.to_le_bytes().to_vec(),
                    request.request.req_no.to_le_bytes().to_vec(),
                    request.request.data.clone(),
                ]),
                request: request.clone(),
                invalid: false,
            });
        }
        total.append(current);
        if results.digests.is_empty() && results.preprocessed.is_empty() {
            return total;
        }
        current = sm.process_results(results);
    }
}

/// Close-up on one replica: a sequence prepared in epoch 0 is
/// re-proposed by the new-epoch certificate and re-committed in epoch 1
/// with the same digest.
#[test]
fn prepared_sequence_recommits_in_new_epoch() {
    let provider = Blake3HashProvider;
    let mut sm = StateMachine::new(
        Config::new(NodeId(3)).with_batch_size(1),
        bootstrap_log(test_net(4, 1), b"genesis".to_vec()),
    );

    let request = test_request(9, 1);
    let req_digest = provider.digest(&[
        request.client_id.0.to_le_bytes().to_vec(),
        request.req_no.to_le_bytes().to_vec(),
        request.data.clone(),
    ]);
    let fwd = ForwardRequest {
        ack: RequestAck {
            client_id: request.client_id,
            req_no: request.req_no,
            digest: req_digest,
        },
        data: request.data.clone(),
    };
    let batch_digest = provider.digest(&[
        request.client_id.0.to_le_bytes().to_vec(),
        request.req_no.to_le_bytes().to_vec(),
        req_digest.to_bytes().to_vec(),
    ]);

    // Leader 0 proposes; resolving the embedded payload leads to our
    // prepare vote.
    let step = sm.step(
        NodeId(0),
        Msg::Preprepare(Box::new(Preprepare {
            epoch: 0,
            seq_no: 1,
            batch: vec![fwd],
        })),
    );
    let actions = drive(&mut sm, step, &provider);
    assert!(actions
        .broadcast
        .iter()
        .any(|m| matches!(m, Msg::Prepare(p) if p.digest == batch_digest)));

    // A prepare quorum forms; we persist the PEntry and vote to commit,
    // but no commits ever arrive.
    for node in 0..3 {
        let step = sm.step(
            NodeId(node),
            Msg::Prepare(Prepare {
                epoch: 0,
                seq_no: 1,
                digest: batch_digest,
            }),
        );
        drive(&mut sm, step, &provider);
    }

    // The stalled epoch is abandoned; our epoch change carries the
    // prepared sequence.
    let mut ticks = Actions::new();
    for _ in 0..8 {
        ticks.append(sm.tick());
    }
    let my_change = ticks
        .broadcast
        .iter()
        .find_map(|m| match m {
            Msg::EpochChange(c) => Some((**c).clone()),
            _ => None,
        })
        .expect("joined the change");
    assert!(my_change.p_set.iter().any(|e| e.seq_no == 1 && e.digest == batch_digest));
    assert!(my_change.q_set.iter().any(|e| e.seq_no == 1 && e.digest == batch_digest));

    // Nodes 1 and 2 offer the same certified state; everyone acks.
    let mut cert = Vec::new();
    for originator in [1u64, 2, 3] {
        let change = my_change.clone();
        let step = sm.step(NodeId(originator), Msg::EpochChange(Box::new(change.clone())));
        let actions = drive(&mut sm, step, &provider);
        let digest = actions
            .broadcast
            .iter()
            .find_map(|m| match m {
                Msg::EpochChangeAck(a) if a.originator == NodeId(originator) => Some(a.digest),
                _ => None,
            })
            .expect("acked the change");
        for acker in 0..4u64 {
            let step = sm.step(
                NodeId(acker),
                Msg::EpochChangeAck(EpochChangeAck {
                    originator: NodeId(originator),
                    digest,
                }),
            );
            drive(&mut sm, step, &provider);
        }
        cert.push(RemoteEpochChange {
            node_id: NodeId(originator),
            digest,
        });
    }

    // Node 1 leads epoch 1; its proposal re-proposes our prepared
    // sequence.
    let config = NewEpochConfig {
        config: EpochConfig {
            number: 1,
            leaders: vec![NodeId(1), NodeId(2), NodeId(3)],
        },
        starting_checkpoint: Checkpoint {
            seq_no: 0,
            value: b"genesis".to_vec(),
        },
        final_preprepares: vec![Some(batch_digest)],
    };
    let step = sm.step(
        NodeId(1),
        Msg::NewEpoch(Box::new(NewEpoch {
            config: config.clone(),
            epoch_changes: cert,
        })),
    );
    let actions = drive(&mut sm, step, &provider);
    let config_digest = actions
        .broadcast
        .iter()
        .find_map(|m| match m {
            Msg::NewEpochEcho(e) => Some(e.digest),
            _ => None,
        })
        .expect("echoed the proposal");

    for node in [1u64, 2, 3] {
        let step = sm.step(NodeId(node), Msg::NewEpochEcho(NewEpochEcho { digest: config_digest }));
        drive(&mut sm, step, &provider);
    }
    let mut install = Actions::new();
    for node in [1u64, 2, 3] {
        let step = sm.step(
            NodeId(node),
            Msg::NewEpochReady(NewEpochReady { digest: config_digest }),
        );
        install.append(drive(&mut sm, step, &provider));
    }

    // The inherited sequence is re-announced as a commit in epoch 1 with
    // the unchanged digest.
    assert!(install
        .broadcast
        .iter()
        .any(|m| matches!(m, Msg::Commit(c) if c.epoch == 1 && c.seq_no == 1 && c.digest == batch_digest)));
    assert!(install
        .q_entries
        .iter()
        .any(|q| q.epoch == 1 && q.seq_no == 1 && q.digest == batch_digest));
    assert_eq!(sm.status().epoch, 1);

    // Commits from the survivors finish it.
    let commit = Msg::Commit(weft_types::Commit {
        epoch: 1,
        seq_no: 1,
        digest: batch_digest,
    });
    let step = sm.step(NodeId(1), commit.clone());
    drive(&mut sm, step, &provider);
    let step = sm.step(NodeId(2), commit.clone());
    drive(&mut sm, step, &provider);
    let step = sm.step(NodeId(3), commit);
    let actions = drive(&mut sm, step, &provider);

    assert_eq!(actions.commits.len(), 1);
    assert_eq!(actions.commits[0].q_entry.digest, batch_digest);
    assert_eq!(actions.commits[0].q_entry.requests.len(), 1);
}
