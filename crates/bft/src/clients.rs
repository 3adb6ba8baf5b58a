//! Per-client request windows and the global ready list.
//!
//! Each client gets a fixed-width sliding window of request numbers.
//! Replicas acknowledge request digests; `f + 1` matching acks make a
//! request *correct* (at least one honest holder), `2f + 1` make it
//! *strong* (orderable). Strong requests with known payloads are released
//! to the ordering pipeline strictly in ascending request order per
//! client, through a single global FIFO ready list.
//!
//! An honest replica acknowledges at most one digest per request number;
//! equivocating clients can waste a slot but never get two digests strong.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};
use weft_core::{Actions, HashOrigin};
use weft_messages::Msg;
use weft_types::{
    ClientId, ClientState, FetchRequest, ForwardRequest, Hash, NetworkConfig, NodeId, RequestAck,
    RequestData,
};

use crate::admission::Applyable;

/// One digest claimed for a request number.
#[derive(Debug)]
pub(crate) struct ClientRequest {
    digest: Hash,

    /// The payload, once known. `None` means known by acknowledgement
    /// only.
    data: Option<RequestData>,

    /// Replicas that acknowledged this digest.
    agreements: BTreeSet<NodeId>,
}


/// One request-number slot in a client's window.
#[derive(Debug)]
pub(crate) struct ClientReqNo {
    client_id: ClientId,
    req_no: u64,

    /// Claimed digests. Honest clients produce one; equivocating clients
    /// may produce several, of which at most one can ever become strong.
    requests: BTreeMap<Hash, ClientRequest>,

    /// The sequence this request committed at, once final. Never cleared
    /// or changed after being set.
    committed: Option<u64>,

    /// The digest that reached `2f + 1` acknowledgements, if any.
    strong_digest: Option<Hash>,

    /// The digest we ourselves acknowledged, if any. Guards the
    /// one-ack-per-reqno invariant.
    my_ack: Option<Hash>,

    /// The `(epoch, seq_no)` this request is currently proposed under.
    /// Cleared when an epoch is superseded without committing it.
    allocated_to: Option<(u64, u64)>,
}

impl ClientReqNo {
    fn new(client_id: ClientId, req_no: u64) -> Self {
        Self {
            client_id,
            req_no,
            requests: BTreeMap::new(),
            committed: None,
            strong_digest: None,
            my_ack: None,
            allocated_to: None,
        }
    }

    pub(crate) fn strong_request(&self) -> Option<&ClientRequest> {
        self.strong_digest.and_then(|d| self.requests.get(&d))
    }

    /// Whether this request is ready for ordering: strong with a known
    /// payload.
    fn is_ready(&self) -> bool {
        self.strong_request().is_some_and(|r| r.data.is_some())
    }
}

/// A fixed-width sliding window of request numbers for one client.
#[derive(Debug)]
pub(crate) struct ClientWindow {
    client_id: ClientId,
    low_watermark: u64,
    high_watermark: u64,

    /// Requests below this mark have been released to the ready list.
    /// Always within `[low_watermark, high_watermark + 1]`.
    next_ready_mark: u64,

    req_nos: BTreeMap<u64, ClientReqNo>,

    /// Bumped whenever the watermarks move; hosts watching for
    /// backpressure relief compare generations.
    generation: u64,
}

impl ClientWindow {
    fn new(client_id: ClientId, low_watermark: u64, width: u64) -> Self {
        let high_watermark = low_watermark + width - 1;
        let req_nos = (low_watermark..=high_watermark)
            .map(|req_no| (req_no, ClientReqNo::new(client_id, req_no)))
            .collect();
        Self {
            client_id,
            low_watermark,
            high_watermark,
            next_ready_mark: low_watermark,
            req_nos,
            generation: 0,
        }
    }

    pub(crate) fn low_watermark(&self) -> u64 {
        self.low_watermark
    }

    pub(crate) fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    pub(crate) fn next_ready_mark(&self) -> u64 {
        self.next_ready_mark
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn in_watermarks(&self, req_no: u64) -> bool {
        req_no >= self.low_watermark && req_no <= self.high_watermark
    }

    pub(crate) fn request(&self, req_no: u64) -> Option<&ClientReqNo> {
        self.req_nos.get(&req_no)
    }

    fn request_mut(&mut self, req_no: u64) -> &mut ClientReqNo {
        assert!(
            self.in_watermarks(req_no),
            "request {} outside watermarks [{}, {}]",
            req_no,
            self.low_watermark,
            self.high_watermark
        );
        self.req_nos.get_mut(&req_no).expect("windowed reqno exists")
    }

    /// Record an acknowledgement. Returns the slot and whether this ack
    /// crossed the correctness threshold without a known payload (the
    /// caller fetches the data in that case).
    ///
    /// # Panics
    ///
    /// Panics when `req_no` is outside the watermarks; admission
    /// guarantees it is not.
    fn ack(
        &mut self,
        source: NodeId,
        req_no: u64,
        digest: Hash,
        some_correct: usize,
        intersection: usize,
    ) -> bool {
        let crn = self.request_mut(req_no);
        let cr = crn.requests.entry(digest).or_insert_with(|| ClientRequest {
            digest,
            data: None,
            agreements: BTreeSet::new(),
        });

        cr.agreements.insert(source);

        let newly_correct_without_data =
            cr.agreements.len() == some_correct && cr.data.is_none();

        if cr.agreements.len() >= intersection {
            crn.strong_digest = Some(digest);
        }

        newly_correct_without_data
    }

    /// Record a request payload under a digest, creating the claim if
    /// this is its first appearance.
    fn allocate(&mut self, request: RequestData, digest: Hash, intersection: usize) {
        let req_no = request.req_no;
        let crn = self.request_mut(req_no);
        let cr = crn.requests.entry(digest).or_insert_with(|| ClientRequest {
            digest,
            data: None,
            agreements: BTreeSet::new(),
        });
        cr.data = Some(request);

        if cr.agreements.len() >= intersection {
            crn.strong_digest = Some(digest);
        }
    }

    /// Slide the window past committed requests with sequence at or
    /// below `seq_no`, preserving width.
    fn garbage_collect(&mut self, seq_no: u64) {
        let mut removed = 0u64;

        loop {
            let front = self.req_nos.iter().next().and_then(|(&req_no, crn)| {
                match crn.committed {
                    Some(committed) if committed <= seq_no => Some(req_no),
                    _ => None,
                }
            });
            let Some(req_no) = front else { break };

            // A correct request can commit without ever passing through
            // our ready list; keep the mark ahead of it.
            if req_no >= self.next_ready_mark {
                self.next_ready_mark = req_no + 1;
            }
            self.req_nos.remove(&req_no);
            removed += 1;
        }

        for i in 1..=removed {
            let req_no = self.high_watermark + i;
            self.req_nos
                .insert(req_no, ClientReqNo::new(self.client_id, req_no));
        }

        self.low_watermark += removed;
        self.high_watermark += removed;
        if removed > 0 {
            self.generation += 1;
        }
    }
}

/// A ready-list entry: a stable `(client, req_no)` id, never a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub(crate) client_id: ClientId,
    pub(crate) req_no: u64,
}

/// All client windows plus the global ready FIFO.
#[derive(Debug)]
pub(crate) struct ClientWindows {
    net: NetworkConfig,
    my_id: NodeId,
    window_width: u64,
    windows: BTreeMap<ClientId, ClientWindow>,
    ready: VecDeque<ReadyEntry>,

    /// Entries released since the driver last fed the proposer.
    newly_ready: VecDeque<ReadyEntry>,

    /// Forwarded payloads currently being digest-checked, to avoid
    /// issuing duplicate hash requests across buffer re-drains.
    pending_verifications: BTreeSet<(ClientId, u64, Hash)>,
}

impl ClientWindows {
    pub(crate) fn new(net: NetworkConfig, my_id: NodeId, window_width: u64) -> Self {
        Self {
            net,
            my_id,
            window_width,
            windows: BTreeMap::new(),
            ready: VecDeque::new(),
            newly_ready: VecDeque::new(),
            pending_verifications: BTreeSet::new(),
        }
    }

    pub(crate) fn window(&self, client_id: ClientId) -> Option<&ClientWindow> {
        self.windows.get(&client_id)
    }

    pub(crate) fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.windows.keys().copied()
    }

    /// Create a window at first contact with a client.
    fn window_mut_or_create(&mut self, client_id: ClientId) -> &mut ClientWindow {
        let width = self.window_width;
        self.windows.entry(client_id).or_insert_with(|| {
            debug!(client = %client_id, "creating client window");
            ClientWindow::new(client_id, 1, width)
        })
    }

    /// Create a window from replayed durable state.
    pub(crate) fn restore_window(&mut self, client_id: ClientId, low_watermark: u64) {
        let width = self.window_width;
        self.windows
            .entry(client_id)
            .or_insert_with(|| ClientWindow::new(client_id, low_watermark, width));
    }

    /// Admission classification for client sub-protocol messages.
    ///
    /// # Panics
    ///
    /// Panics on a non-client message; the driver routes only
    /// `RequestAck` / `ForwardRequest` / `FetchRequest` here.
    pub(crate) fn filter(&self, msg: &Msg) -> Applyable {
        let (client_id, req_no) = match msg {
            Msg::RequestAck(ack) => (ack.client_id, ack.req_no),
            Msg::ForwardRequest(fwd) => (fwd.ack.client_id, fwd.ack.req_no),
            // TODO decide whether fetches should classify against the
            // window like the others.
            Msg::FetchRequest(_) => return Applyable::Current,
            other => panic!("non-client message {} routed to client windows", other.type_name()),
        };

        // First contact creates a client's window, so an unknown client
        // classifies against the window it would get.
        let (low, high) = match self.windows.get(&client_id) {
            Some(window) => (window.low_watermark, window.high_watermark),
            None => (1, self.window_width),
        };
        if req_no < low {
            Applyable::Past
        } else if req_no > high {
            Applyable::Future
        } else {
            Applyable::Current
        }
    }

    /// Apply a current-classified client message.
    pub(crate) fn apply_msg(&mut self, source: NodeId, msg: &Msg) -> Actions {
        match msg {
            Msg::RequestAck(ack) => self.ack(source, ack),
            Msg::FetchRequest(fetch) => self.reply_fetch(source, fetch),
            Msg::ForwardRequest(fwd) => {
                if source == self.my_id {
                    // Our own forward looped back; we preprocessed it.
                    Actions::new()
                } else {
                    self.apply_forward(source, fwd)
                }
            }
            other => panic!("non-client message {} routed to client windows", other.type_name()),
        }
    }

    /// Record a peer's acknowledgement. First contact with a client
    /// creates its window.
    pub(crate) fn ack(&mut self, source: NodeId, ack: &RequestAck) -> Actions {
        let some_correct = self.net.some_correct_quorum();
        let intersection = self.net.intersection_quorum();

        let window = self.window_mut_or_create(ack.client_id);
        let fetch = window.ack(source, ack.req_no, ack.digest, some_correct, intersection);

        let mut actions = Actions::new();
        if fetch {
            // Correct but we lack the payload: ask the peer that
            // completed the quorum.
            trace!(client = %ack.client_id, req_no = ack.req_no, from = %source, "fetching correct request payload");
            actions.append(Actions::unicast(
                source,
                Msg::FetchRequest(FetchRequest {
                    client_id: ack.client_id,
                    req_no: ack.req_no,
                    digest: ack.digest,
                }),
            ));
        }

        self.advance_ready_from(ack.client_id, ack.req_no);
        actions
    }

    /// Record a preprocessed or verified payload, acknowledging it if we
    /// have not yet acknowledged any digest for this request number.
    pub(crate) fn allocate(&mut self, request: RequestData, digest: Hash) -> Actions {
        let intersection = self.net.intersection_quorum();
        let client_id = request.client_id;
        let req_no = request.req_no;

        let window = self.window_mut_or_create(client_id);
        if !window.in_watermarks(req_no) {
            warn!(client = %client_id, req_no, "request outside window, dropping");
            return Actions::new();
        }

        window.allocate(request, digest, intersection);

        let mut actions = Actions::new();
        let crn = window.request_mut(req_no);
        if crn.my_ack.is_none() {
            crn.my_ack = Some(digest);
            actions.append(Actions::broadcast(Msg::RequestAck(RequestAck {
                client_id,
                req_no,
                digest,
            })));
        }

        self.advance_ready_from(client_id, req_no);
        actions
    }

    /// Restore a replayed payload without acknowledging it again, and
    /// force its digest strong: it appeared in a locally persisted
    /// prepare certificate.
    pub(crate) fn restore_strong(&mut self, request: RequestData, digest: Hash) {
        let client_id = request.client_id;
        let req_no = request.req_no;
        // A client may have first appeared after the checkpoint the
        // replay booted from; its window is created here like at any
        // other first contact.
        let window = self.window_mut_or_create(client_id);

        if !window.in_watermarks(req_no) {
            // Already garbage collected by the checkpoint we booted from.
            return;
        }

        window.allocate(request, digest, usize::MAX);
        let crn = window.request_mut(req_no);
        crn.strong_digest = Some(digest);
        crn.my_ack.get_or_insert(digest);
    }

    /// Mark a request committed at `seq_no`.
    pub(crate) fn mark_committed(&mut self, client_id: ClientId, req_no: u64, seq_no: u64) {
        let Some(window) = self.windows.get_mut(&client_id) else {
            return;
        };
        if !window.in_watermarks(req_no) {
            return;
        }
        let crn = window.request_mut(req_no);
        match crn.committed {
            None => crn.committed = Some(seq_no),
            // Re-delivery of the same final order is fine; a different
            // sequence would break agreement.
            Some(existing) => assert_eq!(
                existing, seq_no,
                "request {client_id}/{req_no} committed twice at different sequences"
            ),
        }
    }

    /// Record that a request is being ordered under `(epoch, seq_no)`.
    pub(crate) fn mark_allocated(
        &mut self,
        client_id: ClientId,
        req_no: u64,
        epoch: u64,
        seq_no: u64,
    ) {
        if let Some(window) = self.windows.get_mut(&client_id) {
            if window.in_watermarks(req_no) {
                window.request_mut(req_no).allocated_to = Some((epoch, seq_no));
            }
        }
    }

    /// Drop allocations made under epochs older than `epoch`, so their
    /// requests become proposable again.
    pub(crate) fn clear_stale_allocations(&mut self, epoch: u64) {
        for window in self.windows.values_mut() {
            for crn in window.req_nos.values_mut() {
                if matches!(crn.allocated_to, Some((e, _)) if e < epoch) {
                    crn.allocated_to = None;
                }
            }
        }
    }

    /// Handle a peer's fetch: answer with the payload if we hold it.
    pub(crate) fn reply_fetch(&self, source: NodeId, fetch: &FetchRequest) -> Actions {
        let Some(window) = self.windows.get(&fetch.client_id) else {
            return Actions::new();
        };
        if !window.in_watermarks(fetch.req_no) {
            return Actions::new();
        }
        let Some(crn) = window.request(fetch.req_no) else {
            return Actions::new();
        };
        let Some(cr) = crn.requests.get(&fetch.digest) else {
            return Actions::new();
        };
        let Some(data) = &cr.data else {
            return Actions::new();
        };

        Actions::unicast(
            source,
            Msg::ForwardRequest(Box::new(ForwardRequest {
                ack: RequestAck {
                    client_id: fetch.client_id,
                    req_no: fetch.req_no,
                    digest: fetch.digest,
                },
                data: data.data.clone(),
            })),
        )
    }

    /// Handle a forwarded payload: record the forwarder's agreement and
    /// digest-check the payload before adopting it.
    pub(crate) fn apply_forward(&mut self, source: NodeId, fwd: &ForwardRequest) -> Actions {
        let some_correct = self.net.some_correct_quorum();
        let intersection = self.net.intersection_quorum();
        let client_id = fwd.ack.client_id;
        let req_no = fwd.ack.req_no;

        let window = self.window_mut_or_create(client_id);
        if !window.in_watermarks(req_no) {
            return Actions::new();
        }

        if window
            .request(req_no)
            .and_then(|crn| crn.requests.get(&fwd.ack.digest))
            .is_some_and(|cr| cr.data.is_some())
        {
            // Already known with data.
            return Actions::new();
        }

        // Forwarding implies the forwarder vouches for the digest.
        window.ack(source, req_no, fwd.ack.digest, some_correct, intersection);

        self.request_verification(source, fwd.request_data(), fwd.ack.digest)
    }

    /// Issue a digest check for a forwarded payload, once per
    /// `(client, req_no, digest)` at a time.
    pub(crate) fn request_verification(
        &mut self,
        source: NodeId,
        request: RequestData,
        expected_digest: Hash,
    ) -> Actions {
        let key = (request.client_id, request.req_no, expected_digest);
        if !self.pending_verifications.insert(key) {
            return Actions::new();
        }

        Actions::hash(
            vec![
                request.client_id.0.to_le_bytes().to_vec(),
                request.req_no.to_le_bytes().to_vec(),
                request.data.clone(),
            ],
            HashOrigin::VerifyRequest {
                source,
                request,
                expected_digest,
            },
        )
    }

    /// A verification completed (either way); allow re-requests.
    pub(crate) fn verification_done(&mut self, client_id: ClientId, req_no: u64, digest: Hash) {
        self.pending_verifications.remove(&(client_id, req_no, digest));
    }

    /// Whether a request is allocated with a payload under this digest.
    pub(crate) fn is_resolved(&self, ack: &RequestAck) -> bool {
        self.windows
            .get(&ack.client_id)
            .and_then(|w| w.request(ack.req_no))
            .and_then(|crn| crn.requests.get(&ack.digest))
            .is_some_and(|cr| cr.data.is_some())
    }

    /// Release newly ready requests for `client_id` in ascending order,
    /// starting at the ready mark. Stops at the first gap.
    fn advance_ready_from(&mut self, client_id: ClientId, touched_req_no: u64) {
        let Some(window) = self.windows.get_mut(&client_id) else {
            return;
        };
        if touched_req_no != window.next_ready_mark {
            return;
        }

        let mut mark = window.next_ready_mark;
        while mark <= window.high_watermark {
            let crn = window
                .req_nos
                .get(&mark)
                .expect("windowed reqno exists");
            if !crn.is_ready() {
                break;
            }
            trace!(client = %client_id, req_no = mark, "request ready for ordering");
            let entry = ReadyEntry {
                client_id,
                req_no: mark,
            };
            self.ready.push_back(entry);
            self.newly_ready.push_back(entry);
            mark += 1;
        }
        window.next_ready_mark = mark;
    }

    /// Advance the ready mark of every client; used after replay.
    pub(crate) fn advance_all_ready(&mut self) {
        let clients: Vec<ClientId> = self.windows.keys().copied().collect();
        for client_id in clients {
            let mark = self.windows[&client_id].next_ready_mark;
            self.advance_ready_from(client_id, mark);
        }
    }

    /// Drain the requests released since the last call, with their
    /// strong payloads. Requests that committed or slid out of their
    /// window in the meantime are skipped.
    pub(crate) fn take_newly_ready(&mut self) -> Vec<ForwardRequest> {
        let mut requests = Vec::new();
        while let Some(entry) = self.newly_ready.pop_front() {
            let committed = self
                .windows
                .get(&entry.client_id)
                .and_then(|w| w.request(entry.req_no))
                .is_none_or(|crn| crn.committed.is_some());
            if committed {
                continue;
            }
            if let Some(fwd) = self.ready_forward(entry.client_id, entry.req_no) {
                requests.push(fwd);
            }
        }
        requests
    }

    /// Whether any ready request still awaits ordering under `epoch`.
    pub(crate) fn has_unordered_ready(&self, epoch: u64) -> bool {
        self.ready.iter().any(|entry| {
            self.windows
                .get(&entry.client_id)
                .and_then(|w| w.request(entry.req_no))
                .is_some_and(|crn| {
                    crn.committed.is_none()
                        && !matches!(crn.allocated_to, Some((e, _)) if e == epoch)
                })
        })
    }

    /// Ready requests not yet ordered under `epoch`, in release order,
    /// with their strong payloads.
    pub(crate) fn unordered_ready_requests(&self, epoch: u64) -> Vec<ForwardRequest> {
        let mut requests = Vec::new();
        for entry in &self.ready {
            let Some(window) = self.windows.get(&entry.client_id) else {
                continue;
            };
            let Some(crn) = window.request(entry.req_no) else {
                continue;
            };
            if crn.committed.is_some() {
                continue;
            }
            if matches!(crn.allocated_to, Some((e, _)) if e == epoch) {
                continue;
            }
            if let Some(fwd) = Self::strong_forward(crn) {
                requests.push(fwd);
            }
        }
        requests
    }

    /// The strong payload of one ready request, if still windowed.
    pub(crate) fn ready_forward(&self, client_id: ClientId, req_no: u64) -> Option<ForwardRequest> {
        let crn = self.windows.get(&client_id)?.request(req_no)?;
        Self::strong_forward(crn)
    }

    fn strong_forward(crn: &ClientReqNo) -> Option<ForwardRequest> {
        let digest = crn.strong_digest?;
        let cr = crn.requests.get(&digest)?;
        let data = cr.data.as_ref()?;
        Some(ForwardRequest {
            ack: RequestAck {
                client_id: crn.client_id,
                req_no: crn.req_no,
                digest,
            },
            data: data.data.clone(),
        })
    }

    /// Slide every window past requests committed at or below `seq_no`
    /// and retire their ready-list entries.
    pub(crate) fn garbage_collect(&mut self, seq_no: u64) {
        for window in self.windows.values_mut() {
            window.garbage_collect(seq_no);
        }

        let windows = &self.windows;
        self.ready.retain(|entry| {
            windows
                .get(&entry.client_id)
                .and_then(|w| w.request(entry.req_no))
                .map_or(false, |crn| match crn.committed {
                    Some(committed) => committed > seq_no,
                    None => true,
                })
        });
    }

    /// Durable per-client window state for a checkpoint entry: the lowest
    /// uncommitted request number per bucket.
    pub(crate) fn client_configs(&self) -> Vec<ClientState> {
        let num_buckets = self.net.num_buckets;
        self.windows
            .iter()
            .map(|(&client_id, window)| {
                let mut blws = vec![0u64; num_buckets as usize];
                for i in 0..num_buckets {
                    let req_no = window.high_watermark + 1 + i;
                    let bucket = (req_no + client_id.0) % num_buckets;
                    blws[bucket as usize] = req_no;
                }
                for (&req_no, crn) in &window.req_nos {
                    if crn.committed.is_some() {
                        continue;
                    }
                    let bucket = ((req_no + client_id.0) % num_buckets) as usize;
                    if blws[bucket] > req_no {
                        blws[bucket] = req_no;
                    }
                }
                ClientState {
                    id: client_id,
                    bucket_low_watermarks: blws,
                }
            })
            .collect()
    }
}
