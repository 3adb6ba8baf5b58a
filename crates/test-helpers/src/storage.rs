//! In-memory collaborator implementations.
//!
//! Faithful to the collaborator contracts but held entirely in memory:
//! suitable for unit and cluster tests, useless for production. I/O can
//! never fail here, so the fatal-on-error host behavior has nothing to
//! panic about.

use std::collections::BTreeMap;
use std::io;
use weft_core::{AppLog, DigestHasher, HashProvider, RequestStore, Wal};
use weft_types::{Hash, Persistent, QEntry, RequestAck};

/// In-memory write-ahead log.
#[derive(Debug, Default, Clone)]
pub struct MemWal {
    entries: Vec<Persistent>,
}

impl MemWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full log, for replay tests.
    pub fn entries(&self) -> Vec<Persistent> {
        self.entries.clone()
    }
}

impl Wal for MemWal {
    fn append(&mut self, entry: &Persistent) -> io::Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory request store keyed by `(client, req_no, digest)`.
#[derive(Debug, Default, Clone)]
pub struct MemRequestStore {
    requests: BTreeMap<(u64, u64, Hash), Vec<u8>>,
}

impl MemRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl RequestStore for MemRequestStore {
    fn store(&mut self, ack: &RequestAck, data: &[u8]) -> io::Result<()> {
        self.requests
            .insert((ack.client_id.0, ack.req_no, ack.digest), data.to_vec());
        Ok(())
    }

    fn get(&self, ack: &RequestAck) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .requests
            .get(&(ack.client_id.0, ack.req_no, ack.digest))
            .cloned())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory application log whose snapshot value is a digest over the
/// applied history, so replicas that applied the same commits in the
/// same order report identical checkpoint values.
#[derive(Debug, Default, Clone)]
pub struct MemAppLog {
    applied: Vec<QEntry>,
}

impl MemAppLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied entries, for agreement assertions.
    pub fn applied(&self) -> &[QEntry] {
        &self.applied
    }
}

impl AppLog for MemAppLog {
    fn apply(&mut self, entry: &QEntry) {
        self.applied.push(entry.clone());
    }

    fn snap(&mut self) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        for entry in &self.applied {
            hasher.update(&entry.seq_no.to_le_bytes());
            hasher.update(entry.digest.as_bytes());
        }
        hasher.finalize().as_bytes().to_vec()
    }
}

/// Blake3-backed digest provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3HashProvider;

/// An accumulating Blake3 hasher.
pub struct Blake3DigestHasher(blake3::Hasher);

impl DigestHasher for Blake3DigestHasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> Hash {
        Hash::from_hash_bytes(self.0.finalize().as_bytes())
    }
}

impl HashProvider for Blake3HashProvider {
    type Hasher = Blake3DigestHasher;

    fn hasher(&self) -> Self::Hasher {
        Blake3DigestHasher(blake3::Hasher::new())
    }
}
