//! Retained persistent entries and startup replay.
//!
//! The driver mirrors every entry it asks the host to persist, so the
//! epoch changer can assemble its certificates from exactly the records a
//! crash-recovered replica would replay. Retention follows the WAL rules:
//! QEntries are kept per `(seq_no, epoch)` — the same sequence may carry
//! batches from several epochs — while a PEntry for a newer epoch
//! supersedes an older one at the same sequence. A stable checkpoint
//! prunes everything at or below it.

use std::collections::BTreeMap;
use weft_types::{CEntry, Hash, PEntry, Persistent, QEntry, SetEntry};

/// The replica's retained durable state.
#[derive(Debug)]
pub(crate) struct PersistedLog {
    last_c_entry: CEntry,
    q_entries: BTreeMap<(u64, u64), QEntry>,
    p_entries: BTreeMap<u64, PEntry>,
}

impl PersistedLog {
    /// Rebuild from a WAL replay.
    ///
    /// # Panics
    ///
    /// Panics when the log does not begin with a CEntry, or when a
    /// PEntry references a digest no retained QEntry carries; both are
    /// corruption, not recoverable states.
    pub(crate) fn replay(entries: Vec<Persistent>) -> Self {
        let mut iter = entries.into_iter();

        let first = iter.next().expect("replayed an empty log");
        let Persistent::C(c_entry) = first else {
            panic!("log must begin with a CEntry, got {}", first.type_name());
        };

        let mut log = Self {
            last_c_entry: c_entry,
            q_entries: BTreeMap::new(),
            p_entries: BTreeMap::new(),
        };

        for entry in iter {
            match entry {
                Persistent::C(c_entry) => log.record_c(c_entry),
                Persistent::Q(q_entry) => log.record_q(q_entry),
                Persistent::P(p_entry) => {
                    assert!(
                        log.find_q_by_digest(p_entry.digest).is_some(),
                        "PEntry at seq {} references an unknown batch digest",
                        p_entry.seq_no
                    );
                    log.record_p(p_entry);
                }
            }
        }

        log
    }

    pub(crate) fn last_c_entry(&self) -> &CEntry {
        &self.last_c_entry
    }

    /// Mirror a checkpoint entry; it supersedes retained history below
    /// its sequence.
    pub(crate) fn record_c(&mut self, c_entry: CEntry) {
        self.garbage_collect(c_entry.seq_no);
        self.last_c_entry = c_entry;
    }

    /// Mirror a preprepare record.
    pub(crate) fn record_q(&mut self, q_entry: QEntry) {
        self.q_entries
            .insert((q_entry.seq_no, q_entry.epoch), q_entry);
    }

    /// Mirror a prepare record; a newer epoch supersedes.
    pub(crate) fn record_p(&mut self, p_entry: PEntry) {
        match self.p_entries.get(&p_entry.seq_no) {
            Some(existing) if existing.epoch > p_entry.epoch => {}
            _ => {
                self.p_entries.insert(p_entry.seq_no, p_entry);
            }
        }
    }

    /// Prune everything at or below a stable checkpoint.
    pub(crate) fn garbage_collect(&mut self, seq_no: u64) {
        self.q_entries.retain(|&(s, _), _| s > seq_no);
        self.p_entries.retain(|&s, _| s > seq_no);
    }

    /// Look up a retained batch by digest, preferring the newest epoch.
    pub(crate) fn find_q_by_digest(&self, digest: Hash) -> Option<&QEntry> {
        self.q_entries
            .values()
            .rev()
            .find(|q| q.digest == digest)
    }

    /// Retained QEntries above `base`, ascending by `(seq_no, epoch)`.
    pub(crate) fn q_entries_above(&self, base: u64) -> impl Iterator<Item = &QEntry> {
        self.q_entries
            .values()
            .filter(move |q| q.seq_no > base)
    }

    /// Retained PEntries above `base`, ascending by sequence.
    pub(crate) fn p_entries_above(&self, base: u64) -> impl Iterator<Item = &PEntry> {
        self.p_entries
            .values()
            .filter(move |p| p.seq_no > base)
    }

    /// The Q certificate set offered in an epoch change.
    pub(crate) fn q_set(&self, base: u64) -> Vec<SetEntry> {
        self.q_entries_above(base)
            .map(|q| SetEntry {
                epoch: q.epoch,
                seq_no: q.seq_no,
                digest: q.digest,
            })
            .collect()
    }

    /// The P certificate set offered in an epoch change.
    pub(crate) fn p_set(&self, base: u64) -> Vec<SetEntry> {
        self.p_entries_above(base)
            .map(|p| SetEntry {
                epoch: p.epoch,
                seq_no: p.seq_no,
                digest: p.digest,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::{
        ClientId, ClientState, EpochConfig, NetworkConfig, NetworkState, NodeId,
    };

    fn c_entry(seq_no: u64) -> CEntry {
        CEntry {
            seq_no,
            value: b"snap".to_vec(),
            network_state: NetworkState {
                config: NetworkConfig {
                    nodes: (0..4).map(NodeId).collect(),
                    num_buckets: 2,
                    checkpoint_interval: 5,
                    max_epoch_length: 200,
                },
                clients: vec![ClientState {
                    id: ClientId(1),
                    bucket_low_watermarks: vec![1, 2],
                }],
            },
            epoch_config: EpochConfig {
                number: 0,
                leaders: (0..4).map(NodeId).collect(),
            },
        }
    }

    fn q_entry(seq_no: u64, epoch: u64, tag: &str) -> QEntry {
        QEntry {
            seq_no,
            epoch,
            digest: Hash::from_bytes(tag.as_bytes()),
            requests: vec![],
        }
    }

    #[test]
    fn test_replay_installs_c_entry() {
        let log = PersistedLog::replay(vec![Persistent::C(c_entry(0))]);
        assert_eq!(log.last_c_entry().seq_no, 0);
    }

    #[test]
    #[should_panic(expected = "must begin with a CEntry")]
    fn test_replay_rejects_q_first() {
        PersistedLog::replay(vec![Persistent::Q(q_entry(1, 0, "a"))]);
    }

    #[test]
    #[should_panic(expected = "unknown batch digest")]
    fn test_replay_rejects_orphan_p_entry() {
        PersistedLog::replay(vec![
            Persistent::C(c_entry(0)),
            Persistent::P(PEntry {
                seq_no: 1,
                epoch: 0,
                digest: Hash::from_bytes(b"missing"),
            }),
        ]);
    }

    #[test]
    fn test_q_entries_retained_across_epochs() {
        let mut log = PersistedLog::replay(vec![Persistent::C(c_entry(0))]);
        log.record_q(q_entry(1, 0, "old"));
        log.record_q(q_entry(1, 1, "new"));

        assert_eq!(log.q_set(0).len(), 2);
        assert!(log.find_q_by_digest(Hash::from_bytes(b"old")).is_some());
    }

    #[test]
    fn test_p_entries_superseded_by_newer_epoch() {
        let mut log = PersistedLog::replay(vec![Persistent::C(c_entry(0))]);
        log.record_p(PEntry {
            seq_no: 1,
            epoch: 1,
            digest: Hash::from_bytes(b"new"),
        });
        log.record_p(PEntry {
            seq_no: 1,
            epoch: 0,
            digest: Hash::from_bytes(b"old"),
        });

        let p_set = log.p_set(0);
        assert_eq!(p_set.len(), 1);
        assert_eq!(p_set[0].epoch, 1);
    }

    #[test]
    fn test_checkpoint_prunes_history() {
        let mut log = PersistedLog::replay(vec![Persistent::C(c_entry(0))]);
        log.record_q(q_entry(3, 0, "a"));
        log.record_q(q_entry(7, 0, "b"));
        log.record_c(c_entry(5));

        let q_set = log.q_set(0);
        assert!(q_set.iter().all(|e| e.seq_no > 5));
        assert_eq!(q_set.len(), 1);
    }
}
