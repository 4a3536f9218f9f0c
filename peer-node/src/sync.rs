//! Synchronization engine.
//!
//! Every known peer gets one worker task that owns the peer's outbound
//! [`SyncQueue`] and inbound [`InboundLedger`]. Sessions never touch that
//! state directly; they report [`SessionEvent`]s over a channel and receive
//! [`Outbound`] commands through a [`SessionLink`].
//!
//! ```text
//! enqueue_local ──► outbox ──► worker(B) queue ──► SessionLink ──► session(B)
//! session(B) ──► SessionEvent ──► router ──► worker(B) ledger ──► ContentStore
//! ```
//!
//! Deltas authored locally are kept in an outbox of `(sequence, hash)` so a
//! worker created later (a peer seen for the first time) is backfilled from
//! the content store.
//!
//! Nothing here waits on a peer. Worker channels are unbounded and a worker
//! hands a command to its session only once the session channel has room, so
//! a stalled session backs up its own queue and nobody else's. Inbound deltas
//! are applied only from the currently attached session; a session that lost
//! a delta is torn down and the sender resends from its queue.

use crate::crypto::{ContentCipher, CryptoError};
use crate::store::{ContentStore, StoreError};
use dashmap::DashMap;
use peer_core::{Admission, InboundLedger, PushOutcome, SyncQueue};
use peer_types::{ContentHash, Delta, PeerId, Sequence};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// At-rest sealing or opening failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The content store refused an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The session behind a link is gone.
    #[error("session closed")]
    SessionClosed,

    /// A worker task has exited.
    #[error("sync worker for {0} stopped")]
    WorkerStopped(PeerId),
}

/// Command from a worker to the session task that owns the wire.
#[derive(Debug)]
pub enum Outbound {
    /// Seal and send one delta.
    Delta {
        /// Authoring peer.
        origin: PeerId,
        /// Per-origin sequence.
        sequence: Sequence,
        /// Content hash bound into the session MAC.
        content_hash: ContentHash,
        /// Plaintext content, sealed by the session.
        plaintext: Vec<u8>,
    },
    /// Acknowledge everything of `origin` up to `sequence`.
    Ack {
        /// Origin being acknowledged.
        origin: PeerId,
        /// Cumulative cursor.
        sequence: Sequence,
    },
}

/// A delta that arrived on a session and passed MAC and hash checks.
#[derive(Debug, Clone)]
pub struct InboundDelta {
    /// Authoring peer.
    pub origin: PeerId,
    /// Per-origin sequence.
    pub sequence: Sequence,
    /// Verified content hash.
    pub content_hash: ContentHash,
    /// Decrypted content.
    pub plaintext: Vec<u8>,
}

/// What sessions report to the engine.
#[derive(Debug)]
pub enum SessionEvent {
    /// A session to `link.peer()` is established.
    Attached(SessionLink),
    /// A session ended.
    Detached {
        /// Remote peer.
        peer: PeerId,
        /// Which session.
        session_id: u64,
    },
    /// A verified delta arrived.
    Delta {
        /// Sending peer.
        from: PeerId,
        /// Session it arrived on.
        session_id: u64,
        /// The delta.
        delta: InboundDelta,
    },
    /// A verified acknowledgement arrived.
    Ack {
        /// Acknowledging peer.
        from: PeerId,
        /// Origin acknowledged.
        origin: PeerId,
        /// Cumulative cursor.
        sequence: Sequence,
    },
}

/// Sending side of one established session.
#[derive(Debug, Clone)]
pub struct SessionLink {
    id: u64,
    peer: PeerId,
    tx: mpsc::Sender<Outbound>,
}

impl SessionLink {
    /// Wrap a session's command channel.
    pub fn new(id: u64, peer: PeerId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, peer, tx }
    }

    /// Session id, unique per connection manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Queue a command for the session.
    pub async fn send(&self, command: Outbound) -> Result<(), SyncError> {
        self.tx.send(command).await.map_err(|_| SyncError::SessionClosed)
    }
}

enum Command {
    Enqueue(Delta),
    Attach(SessionLink),
    Detach(u64),
    Inbound { session_id: u64, delta: InboundDelta },
    Ack { origin: PeerId, sequence: Sequence },
}

#[derive(Clone)]
struct WorkerHandle {
    tx: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct Outbox {
    last: Sequence,
    entries: Vec<(Sequence, ContentHash)>,
}

struct Inner {
    local: PeerId,
    cipher: Arc<dyn ContentCipher>,
    store: Arc<dyn ContentStore>,
    capacity: usize,
    workers: DashMap<PeerId, WorkerHandle>,
    outbox: Mutex<Outbox>,
}

/// Queues local deltas per destination and applies inbound ones.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Create an engine for `local`, with at most `capacity` deltas queued per peer.
    pub fn new(
        local: PeerId,
        cipher: Arc<dyn ContentCipher>,
        store: Arc<dyn ContentStore>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                cipher,
                store,
                capacity,
                workers: DashMap::new(),
                outbox: Mutex::new(Outbox::default()),
            }),
        }
    }

    /// Reload the outbox from deltas this node authored earlier.
    ///
    /// New local deltas continue after the highest stored sequence.
    pub async fn restore(&self) -> Result<usize, SyncError> {
        let entries = self.inner.store.sequences(&self.inner.local).await?;
        let mut outbox = self.inner.outbox.lock().await;
        outbox.last = entries.last().map(|(seq, _)| *seq).unwrap_or_default();
        outbox.entries = entries;
        if !outbox.entries.is_empty() {
            info!(
                count = outbox.entries.len(),
                last = outbox.last.value(),
                "restored authored deltas"
            );
        }
        Ok(outbox.entries.len())
    }

    /// Author a delta and queue it for every known peer.
    pub async fn enqueue_local(&self, content: &[u8]) -> Result<Delta, SyncError> {
        let inner = &self.inner;
        let mut outbox = inner.outbox.lock().await;

        let sequence = outbox.last.next();
        let content_hash = ContentHash::compute(&inner.local, sequence, content);
        let delta = Delta::new(inner.local, sequence, content_hash, inner.cipher.seal(content)?);
        inner.store.put_content(delta.clone()).await?;
        outbox.last = sequence;
        outbox.entries.push((sequence, content_hash));

        // Still under the outbox lock, so every worker sees local deltas in order.
        for worker in inner.workers.iter() {
            if worker.value().tx.send(Command::Enqueue(delta.clone())).is_err() {
                warn!(peer = %worker.key(), "sync worker gone, delta not queued");
            }
        }

        debug!(sequence = sequence.value(), "queued local delta");
        Ok(delta)
    }

    /// Make sure `peer` has a worker, backfilled with every authored delta.
    pub async fn track_peer(&self, peer: PeerId) -> Result<(), SyncError> {
        if peer == self.inner.local {
            return Ok(());
        }
        self.worker(peer).await.map(|_| ())
    }

    /// Route session events to workers until the channel closes.
    pub fn spawn(&self, mut events: mpsc::Receiver<SessionEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = engine.route(event).await {
                    error!(error = %e, "failed to route session event");
                }
            }
            debug!("session event channel closed");
        })
    }

    /// Queue depth per tracked peer.
    pub fn queue_depths(&self) -> Vec<(PeerId, usize)> {
        let mut out: Vec<_> = self
            .inner
            .workers
            .iter()
            .map(|w| (*w.key(), w.value().depth.load(Ordering::Relaxed)))
            .collect();
        out.sort_by_key(|(peer, _)| *peer);
        out
    }

    /// Queue depth for one peer, if tracked.
    pub fn queue_depth(&self, peer: &PeerId) -> Option<usize> {
        self.inner
            .workers
            .get(peer)
            .map(|w| w.depth.load(Ordering::Relaxed))
    }

    /// Peers with undelivered deltas and no attached session.
    pub fn pending_peers(&self) -> Vec<PeerId> {
        self.inner
            .workers
            .iter()
            .filter(|w| {
                w.value().depth.load(Ordering::Relaxed) > 0
                    && !w.value().connected.load(Ordering::Relaxed)
            })
            .map(|w| *w.key())
            .collect()
    }

    async fn route(&self, event: SessionEvent) -> Result<(), SyncError> {
        match event {
            SessionEvent::Attached(link) => {
                let peer = link.peer();
                self.send(peer, Command::Attach(link)).await
            }
            SessionEvent::Detached { peer, session_id } => {
                let Some(handle) = self.existing(&peer) else {
                    return Ok(());
                };
                handle
                    .tx
                    .send(Command::Detach(session_id))
                    .map_err(|_| SyncError::WorkerStopped(peer))
            }
            SessionEvent::Delta {
                from,
                session_id,
                delta,
            } => self.send(from, Command::Inbound { session_id, delta }).await,
            SessionEvent::Ack {
                from,
                origin,
                sequence,
            } => self.send(from, Command::Ack { origin, sequence }).await,
        }
    }

    async fn send(&self, peer: PeerId, command: Command) -> Result<(), SyncError> {
        let handle = self.worker(peer).await?;
        handle.tx.send(command).map_err(|_| SyncError::WorkerStopped(peer))
    }

    fn existing(&self, peer: &PeerId) -> Option<WorkerHandle> {
        self.inner.workers.get(peer).map(|w| w.value().clone())
    }

    async fn worker(&self, peer: PeerId) -> Result<WorkerHandle, SyncError> {
        if let Some(handle) = self.existing(&peer) {
            return Ok(handle);
        }

        let inner = &self.inner;
        let outbox = inner.outbox.lock().await;
        if let Some(handle) = self.existing(&peer) {
            return Ok(handle);
        }

        let mut queue = SyncQueue::new(inner.capacity);
        for (_, hash) in &outbox.entries {
            match inner.store.get_content(hash).await {
                Ok(delta) => {
                    queue.push(delta);
                }
                Err(StoreError::NotFound { hash }) => {
                    warn!(peer = %peer, hash = %hash, "authored delta missing from store, not backfilled");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            tx,
            depth: Arc::new(AtomicUsize::new(queue.len())),
            connected: Arc::new(AtomicBool::new(false)),
        };
        let worker = PeerWorker {
            peer,
            queue,
            ledger: InboundLedger::new(),
            acks: HashMap::new(),
            link: None,
            cipher: inner.cipher.clone(),
            store: inner.store.clone(),
            depth: handle.depth.clone(),
            connected: handle.connected.clone(),
        };
        debug!(peer = %peer, backlog = worker.queue.len(), "started sync worker");
        tokio::spawn(worker.run(rx));
        inner.workers.insert(peer, handle.clone());
        drop(outbox);
        Ok(handle)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("local", &self.inner.local)
            .field("peers", &self.inner.workers.len())
            .finish()
    }
}

struct PeerWorker {
    peer: PeerId,
    queue: SyncQueue,
    ledger: InboundLedger,
    acks: HashMap<PeerId, Sequence>,
    link: Option<SessionLink>,
    cipher: Arc<dyn ContentCipher>,
    store: Arc<dyn ContentStore>,
    depth: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

impl PeerWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let writable = self.link.clone().filter(|_| self.has_work());
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                permit = reserve(writable.clone()), if writable.is_some() => match permit {
                    Some(permit) => self.send_next(permit),
                    None => {
                        if let Some(link) = writable {
                            self.detach(link.id());
                        }
                    }
                },
            }
            self.depth.store(self.queue.len(), Ordering::Relaxed);
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(delta) => self.push(delta),
            Command::Attach(link) => {
                if self.link.replace(link).is_some() {
                    self.queue.requeue_in_flight();
                }
                self.connected.store(true, Ordering::Relaxed);
            }
            Command::Detach(session_id) => self.detach(session_id),
            Command::Inbound { session_id, delta } => {
                if self.link.as_ref().is_some_and(|l| l.id() == session_id) {
                    self.accept(delta).await;
                } else {
                    trace!(peer = %self.peer, session = session_id, "delta from a replaced session ignored");
                }
            }
            Command::Ack { origin, sequence } => {
                let trimmed = self.queue.ack(&origin, sequence);
                trace!(peer = %self.peer, sequence = sequence.value(), trimmed, "ack");
            }
        }
    }

    fn push(&mut self, delta: Delta) {
        if let PushOutcome::Queued {
            evicted: Some(dropped),
        } = self.queue.push(delta)
        {
            warn!(
                peer = %self.peer,
                origin = %dropped.origin,
                sequence = dropped.sequence.value(),
                capacity = self.queue.capacity(),
                "sync queue full, dropped oldest undelivered delta"
            );
        }
    }

    fn has_work(&self) -> bool {
        !self.acks.is_empty() || self.queue.has_unsent()
    }

    fn detach(&mut self, session_id: u64) {
        if !self.link.as_ref().is_some_and(|l| l.id() == session_id) {
            return;
        }
        self.link = None;
        self.connected.store(false, Ordering::Relaxed);
        let requeued = self.queue.requeue_in_flight();
        debug!(peer = %self.peer, session = session_id, requeued, "session detached");
    }

    /// Drop the current session so the sender resends from its queue.
    fn reset(&mut self, reason: &str) {
        let Some(session_id) = self.link.as_ref().map(SessionLink::id) else {
            return;
        };
        warn!(peer = %self.peer, session = session_id, reason, "resetting session");
        self.detach(session_id);
    }

    /// Hand one pending ack or delta to the session. Acks go first.
    fn send_next(&mut self, permit: OwnedPermit<Outbound>) {
        if let Some(origin) = self.acks.keys().next().copied() {
            if let Some(sequence) = self.acks.remove(&origin) {
                permit.send(Outbound::Ack { origin, sequence });
                return;
            }
        }
        while let Some(delta) = self.queue.next_unsent() {
            match self.cipher.open(&delta.payload) {
                Ok(plaintext) => {
                    permit.send(Outbound::Delta {
                        origin: delta.origin,
                        sequence: delta.sequence,
                        content_hash: delta.content_hash,
                        plaintext,
                    });
                    return;
                }
                Err(e) => error!(
                    peer = %self.peer,
                    sequence = delta.sequence.value(),
                    error = %e,
                    "cannot open stored delta, skipping"
                ),
            }
        }
    }

    async fn accept(&mut self, inbound: InboundDelta) {
        let InboundDelta {
            origin,
            sequence,
            content_hash,
            plaintext,
        } = inbound;

        match self.ledger.admit(&origin, sequence, &content_hash) {
            Admission::Apply => {
                let payload = match self.cipher.seal(&plaintext) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(peer = %self.peer, error = %e, "failed to seal inbound delta");
                        self.reset("inbound delta not stored");
                        return;
                    }
                };
                let delta = Delta::new(origin, sequence, content_hash, payload);
                if let Err(e) = self.store.put_content(delta).await {
                    error!(peer = %self.peer, error = %e, "store rejected inbound delta");
                    self.reset("inbound delta not stored");
                    return;
                }
                self.ledger.commit(origin, sequence, content_hash);
                debug!(peer = %self.peer, origin = %origin, sequence = sequence.value(), "applied delta");
            }
            Admission::Duplicate => {
                trace!(peer = %self.peer, sequence = sequence.value(), "duplicate delta");
            }
            Admission::Stale => {
                warn!(peer = %self.peer, origin = %origin, sequence = sequence.value(), "stale delta dropped");
            }
        }

        if let Some(cursor) = self.ledger.ack_cursor(&origin) {
            self.acks.insert(origin, cursor);
        }
    }
}

/// Wait for room on a session's channel. `None` once the session is gone.
async fn reserve(link: Option<SessionLink>) -> Option<OwnedPermit<Outbound>> {
    link?.tx.reserve_owned().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StorageKey;
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Harness {
        engine: SyncEngine,
        store: MemoryStore,
        events: mpsc::Sender<SessionEvent>,
    }

    fn harness(local: PeerId, capacity: usize) -> Harness {
        let store = MemoryStore::new();
        let engine = SyncEngine::new(
            local,
            Arc::new(StorageKey::from_bytes([5; 32])),
            Arc::new(store.clone()),
            capacity,
        );
        let (events, rx) = mpsc::channel(64);
        engine.spawn(rx);
        Harness {
            engine,
            store,
            events,
        }
    }

    async fn attach(h: &Harness, peer: PeerId, id: u64) -> mpsc::Receiver<Outbound> {
        attach_with(h, peer, id, 64).await
    }

    async fn attach_with(h: &Harness, peer: PeerId, id: u64, room: usize) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(room);
        h.events
            .send(SessionEvent::Attached(SessionLink::new(id, peer, tx)))
            .await
            .unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound command")
            .expect("link closed")
    }

    async fn next_delta(rx: &mut mpsc::Receiver<Outbound>) -> InboundDelta {
        match next(rx).await {
            Outbound::Delta {
                origin,
                sequence,
                content_hash,
                plaintext,
            } => InboundDelta {
                origin,
                sequence,
                content_hash,
                plaintext,
            },
            other => panic!("expected delta, got {other:?}"),
        }
    }

    async fn deliver(h: &Harness, from: PeerId, session_id: u64, delta: InboundDelta) {
        h.events
            .send(SessionEvent::Delta {
                from,
                session_id,
                delta,
            })
            .await
            .unwrap();
    }

    fn inbound(origin: PeerId, seq: u64, body: &[u8]) -> InboundDelta {
        let sequence = Sequence::new(seq);
        InboundDelta {
            origin,
            sequence,
            content_hash: ContentHash::compute(&origin, sequence, body),
            plaintext: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn local_deltas_get_increasing_sequences_and_sealed_payloads() {
        let me = PeerId::new([1; 32]);
        let h = harness(me, 10);

        let first = h.engine.enqueue_local(b"one").await.unwrap();
        let second = h.engine.enqueue_local(b"two").await.unwrap();

        assert_eq!(first.sequence, Sequence::new(1));
        assert_eq!(second.sequence, Sequence::new(2));
        assert_ne!(first.payload, b"one".to_vec());
        assert_eq!(first.content_hash, ContentHash::compute(&me, Sequence::new(1), b"one"));
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn offline_peer_receives_backlog_in_order_on_attach() {
        let me = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let h = harness(me, 10);
        h.engine.track_peer(bob).await.unwrap();

        for body in [b"a", b"b", b"c"] {
            h.engine.enqueue_local(body).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.queue_depth(&bob), Some(3));
        assert_eq!(h.engine.pending_peers(), vec![bob]);

        let mut rx = attach(&h, bob, 1).await;
        for (expected, body) in [(1, b"a"), (2, b"b"), (3, b"c")] {
            match next(&mut rx).await {
                Outbound::Delta {
                    sequence, plaintext, ..
                } => {
                    assert_eq!(sequence.value(), expected);
                    assert_eq!(plaintext, body.to_vec());
                }
                other => panic!("expected delta, got {other:?}"),
            }
        }

        h.events
            .send(SessionEvent::Ack {
                from: bob,
                origin: me,
                sequence: Sequence::new(3),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.queue_depth(&bob), Some(0));
    }

    #[tokio::test]
    async fn first_contact_is_backfilled_from_the_store() {
        let me = PeerId::new([1; 32]);
        let carol = PeerId::new([3; 32]);
        let h = harness(me, 10);
        h.engine.enqueue_local(b"before we met").await.unwrap();

        let mut rx = attach(&h, carol, 7).await;
        match next(&mut rx).await {
            Outbound::Delta { plaintext, .. } => assert_eq!(plaintext, b"before we met".to_vec()),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_session_requeues_in_flight_deltas() {
        let me = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let h = harness(me, 10);
        h.engine.track_peer(bob).await.unwrap();

        let mut first = attach(&h, bob, 1).await;
        h.engine.enqueue_local(b"x").await.unwrap();
        assert!(matches!(next(&mut first).await, Outbound::Delta { .. }));

        h.events
            .send(SessionEvent::Detached {
                peer: bob,
                session_id: 1,
            })
            .await
            .unwrap();
        let mut second = attach(&h, bob, 2).await;
        match next(&mut second).await {
            Outbound::Delta { sequence, .. } => assert_eq!(sequence, Sequence::new(1)),
            other => panic!("expected resend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_delta_is_stored_once_and_acknowledged() {
        let me = PeerId::new([1; 32]);
        let alice = PeerId::new([9; 32]);
        let h = harness(me, 10);
        let mut rx = attach(&h, alice, 1).await;

        for _ in 0..2 {
            h.events
                .send(SessionEvent::Delta {
                    from: alice,
                    session_id: 1,
                    delta: inbound(alice, 1, b"hello"),
                })
                .await
                .unwrap();
            match next(&mut rx).await {
                Outbound::Ack { origin, sequence } => {
                    assert_eq!(origin, alice);
                    assert_eq!(sequence, Sequence::new(1));
                }
                other => panic!("expected ack, got {other:?}"),
            }
        }

        let stored = h.store.arrivals();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].origin, alice);
        assert_ne!(stored[0].payload, b"hello".to_vec());
    }

    #[tokio::test]
    async fn delta_lost_in_transit_is_resent_after_reconnect() {
        let alice = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let sender = harness(alice, 10);
        let receiver = harness(bob, 10);
        sender.engine.track_peer(bob).await.unwrap();

        let mut to_bob = attach(&sender, bob, 1).await;
        let mut to_alice = attach(&receiver, alice, 1).await;
        for body in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            sender.engine.enqueue_local(body).await.unwrap();
        }
        let first = next_delta(&mut to_bob).await;
        let _lost = next_delta(&mut to_bob).await;
        let _unseen = next_delta(&mut to_bob).await;

        deliver(&receiver, alice, 1, first).await;
        match next(&mut to_alice).await {
            Outbound::Ack { sequence, .. } => {
                sender
                    .events
                    .send(SessionEvent::Ack {
                        from: bob,
                        origin: alice,
                        sequence,
                    })
                    .await
                    .unwrap();
            }
            other => panic!("expected ack, got {other:?}"),
        }

        // The receiving session tore down when the second delta failed to open.
        for (h, peer) in [(&sender, bob), (&receiver, alice)] {
            h.events
                .send(SessionEvent::Detached { peer, session_id: 1 })
                .await
                .unwrap();
        }
        let mut to_bob = attach(&sender, bob, 2).await;
        let _to_alice = attach(&receiver, alice, 2).await;
        for expected in [2, 3] {
            let resent = next_delta(&mut to_bob).await;
            assert_eq!(resent.sequence, Sequence::new(expected));
            deliver(&receiver, alice, 2, resent).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored: Vec<u64> = receiver
            .store
            .arrivals()
            .iter()
            .map(|d| d.sequence.value())
            .collect();
        assert_eq!(stored, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn deltas_from_a_replaced_session_are_not_applied() {
        let me = PeerId::new([1; 32]);
        let alice = PeerId::new([9; 32]);
        let h = harness(me, 10);
        let _old = attach(&h, alice, 1).await;
        let mut current = attach(&h, alice, 2).await;

        deliver(&h, alice, 1, inbound(alice, 1, b"late")).await;
        deliver(&h, alice, 2, inbound(alice, 1, b"fresh")).await;
        assert!(matches!(next(&mut current).await, Outbound::Ack { .. }));

        let stored = h.store.arrivals();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].content_hash,
            ContentHash::compute(&alice, Sequence::new(1), b"fresh")
        );
    }

    #[tokio::test]
    async fn stalled_session_does_not_block_authoring_or_other_peers() {
        let me = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let carol = PeerId::new([3; 32]);
        let h = harness(me, 1000);
        h.engine.track_peer(bob).await.unwrap();
        h.engine.track_peer(carol).await.unwrap();

        // Bob's session accepts one command and is never read.
        let mut stalled = attach_with(&h, bob, 1, 1).await;
        let mut healthy = attach(&h, carol, 2).await;

        let authored = tokio::time::timeout(Duration::from_secs(5), async {
            for i in 0..400u32 {
                h.engine.enqueue_local(&i.to_be_bytes()).await.unwrap();
            }
        })
        .await;
        assert!(authored.is_ok(), "authoring blocked behind a stalled session");

        for expected in 1..=400 {
            assert_eq!(next_delta(&mut healthy).await.sequence, Sequence::new(expected));
        }
        for _ in 0..200 {
            if h.engine.queue_depth(&bob) == Some(400) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.engine.queue_depth(&bob), Some(400));

        // Draining the stalled session resumes delivery where it stopped.
        for expected in 1..=5 {
            assert_eq!(next_delta(&mut stalled).await.sequence, Sequence::new(expected));
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_delta() {
        let me = PeerId::new([1; 32]);
        let bob = PeerId::new([2; 32]);
        let h = harness(me, 2);
        h.engine.track_peer(bob).await.unwrap();

        for body in [b"1", b"2", b"3"] {
            h.engine.enqueue_local(body).await.unwrap();
        }
        let mut rx = attach(&h, bob, 1).await;
        match next(&mut rx).await {
            Outbound::Delta { sequence, .. } => assert_eq!(sequence, Sequence::new(2)),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restore_continues_sequence_numbering() {
        let me = PeerId::new([1; 32]);
        let store = MemoryStore::new();
        let cipher: Arc<dyn ContentCipher> = Arc::new(StorageKey::from_bytes([5; 32]));

        let engine = SyncEngine::new(me, cipher.clone(), Arc::new(store.clone()), 10);
        engine.enqueue_local(b"a").await.unwrap();
        engine.enqueue_local(b"b").await.unwrap();

        let restarted = SyncEngine::new(me, cipher, Arc::new(store), 10);
        assert_eq!(restarted.restore().await.unwrap(), 2);
        let next = restarted.enqueue_local(b"c").await.unwrap();
        assert_eq!(next.sequence, Sequence::new(3));
    }
}
