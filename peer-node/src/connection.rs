//! Connection manager: dialing, session pool and per-session tasks.
//!
//! ## Dialing
//!
//! Candidates come from the address book, filtered by the NAT engine's
//! candidate policy and the address blacklist. They are raced: attempt `i`
//! starts `i * stagger` after the first, each bounded by the attempt timeout.
//! The first authenticated session wins and the rest are aborted. A failed
//! round is retried with backoff up to `dial_rounds` times.
//!
//! ## Sessions
//!
//! One task per session owns the wire. A reader task feeds it frames; the
//! sync engine feeds it [`Outbound`] commands. Verified deltas and acks go
//! back to the engine as [`SessionEvent`]s. Malformed input is a strike; a
//! second strike inside the window penalizes the peer. A frame that may have
//! carried a delta also ends the session, so the sender requeues it instead
//! of the receiver acknowledging past the hole. Every write is bounded by the
//! write timeout and raced against a local close.
//!
//! At most one session per peer survives. When both sides dial at once, the
//! session initiated by the lower peer id is kept on both ends.

use crate::config::NodeConfig;
use crate::crypto::{IdentityKeypair, SessionCipher};
use crate::handshake::{self, HandshakeError};
use crate::sync::{InboundDelta, Outbound, SessionEvent, SessionLink};
use crate::transport::{read_frame, write_frame, BoxStream, Dialer, FramedStream, TransportError};
use crate::unix_now;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peer_core::{
    direct_source, AddressBlacklist, AddressBook, Backoff, NatState, PeerPenalties, PoolPolicy,
    SessionState, SessionUsage, Strike,
};
use peer_types::{AddressRecord, ContentHash, Endpoint, PeerId, SyncMessage, WireMessage};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const OUTBOUND_CHANNEL: usize = 128;
const FRAME_CHANNEL: usize = 64;

/// Connection errors surfaced to callers.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Every candidate failed in every round.
    #[error("peer {peer} unreachable after {attempts} dial attempts")]
    NetworkUnreachable {
        /// Target peer.
        peer: PeerId,
        /// Dial attempts made across all rounds.
        attempts: usize,
    },

    /// An address answered but could not prove the peer's identity.
    #[error("authentication failed for {peer} at {endpoint}: {reason}")]
    Authentication {
        /// Target peer.
        peer: PeerId,
        /// Offending address, now blacklisted.
        endpoint: Endpoint,
        /// Handshake failure.
        reason: String,
    },

    /// The peer is serving a penalty for malformed messages.
    #[error("peer {0} is penalized")]
    Penalized(PeerId),

    /// Dialing our own identity.
    #[error("refusing to connect to self")]
    SelfConnection,
}

/// Tunables for dialing and the session pool.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Per-attempt bound covering dial and handshake.
    pub attempt_timeout: Duration,
    /// Delay between consecutive candidate starts within a round.
    pub stagger: Duration,
    /// Rounds before giving up.
    pub dial_rounds: u32,
    /// Delay between rounds.
    pub retry: Backoff,
    /// Capacity and idle timeout.
    pub pool: PoolPolicy,
    /// How long an address that failed authentication is skipped.
    pub blacklist: Duration,
    /// Two malformed messages inside this window penalize a peer.
    pub penalty_window: Duration,
    /// Penalty length.
    pub penalty: Duration,
    /// TTL stamped on addresses gossiped at session start.
    pub gossip_ttl: u32,
    /// Bound on writing one frame to a session.
    pub write_timeout: Duration,
}

impl ConnectionSettings {
    /// Settings from the node configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        let c = &config.connection;
        let retry_base = Duration::from_secs(c.retry_base_secs);
        Self {
            attempt_timeout: config.attempt_timeout(),
            stagger: Duration::from_millis(c.stagger_ms),
            dial_rounds: c.dial_rounds,
            retry: Backoff::new(retry_base, retry_base * 8, retry_base / 2),
            pool: PoolPolicy::new(config.max_connections, Duration::from_secs(c.idle_timeout_secs)),
            blacklist: Duration::from_secs(c.blacklist_secs),
            penalty_window: Duration::from_secs(c.penalty_window_secs),
            penalty: Duration::from_secs(c.penalty_secs),
            gossip_ttl: config.sync.record_ttl_secs,
            write_timeout: Duration::from_secs(c.write_timeout_secs),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

/// One row of session status.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Remote peer.
    pub peer_id: PeerId,
    /// Lifecycle label.
    pub state: &'static str,
    /// Whether this node dialed.
    pub initiated_locally: bool,
    /// Address dialed or accepted from, if known.
    pub remote: Option<String>,
    /// Unix seconds at establishment.
    pub established_at: u64,
    /// Seconds since the last frame in either direction.
    pub idle_secs: u64,
}

#[derive(Clone)]
struct SessionHandle {
    id: u64,
    initiator: PeerId,
    remote: Option<String>,
    established_at: u64,
    last_used: Arc<AtomicU64>,
    state: SessionState,
    close: Arc<Notify>,
}

struct Inner {
    local: PeerId,
    identity: Arc<IdentityKeypair>,
    dialer: Arc<dyn Dialer>,
    book: Arc<Mutex<AddressBook>>,
    policy: watch::Receiver<NatState>,
    settings: ConnectionSettings,
    sessions: DashMap<PeerId, SessionHandle>,
    blacklist: StdMutex<AddressBlacklist>,
    penalties: StdMutex<PeerPenalties>,
    events: mpsc::Sender<SessionEvent>,
    next_id: AtomicU64,
    epoch: Instant,
}

/// Owns every live session of this node.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

enum RaceFailure {
    Unreachable,
    Authentication { endpoint: Endpoint, reason: String },
}

enum Flow {
    Continue,
    Close(String),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ConnectionManager {
    /// Create a manager. Session events are delivered on `events`.
    pub fn new(
        identity: Arc<IdentityKeypair>,
        dialer: Arc<dyn Dialer>,
        book: Arc<Mutex<AddressBook>>,
        policy: watch::Receiver<NatState>,
        settings: ConnectionSettings,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local: identity.peer_id(),
                blacklist: StdMutex::new(AddressBlacklist::new(settings.blacklist)),
                penalties: StdMutex::new(PeerPenalties::new(settings.penalty_window, settings.penalty)),
                identity,
                dialer,
                book,
                policy,
                settings,
                sessions: DashMap::new(),
                events,
                next_id: AtomicU64::new(1),
                epoch: Instant::now(),
            }),
        }
    }

    /// Ensure an authenticated session to `peer`, dialing if needed.
    pub async fn connect(&self, peer: PeerId) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if peer == inner.local {
            return Err(ConnectError::SelfConnection);
        }
        if self.is_connected(&peer) {
            return Ok(());
        }
        if self.is_penalized(&peer) {
            return Err(ConnectError::Penalized(peer));
        }

        let rounds = inner.settings.dial_rounds.max(1);
        let mut attempts = 0;
        for round in 1..=rounds {
            let candidates = inner.candidates(&peer).await;
            if !candidates.is_empty() {
                attempts += candidates.len();
                debug!(peer = %peer, round, candidates = candidates.len(), "dialing");
                match inner.race(peer, candidates).await {
                    Ok(()) => return Ok(()),
                    Err(RaceFailure::Authentication { endpoint, reason }) => {
                        return Err(ConnectError::Authentication {
                            peer,
                            endpoint,
                            reason,
                        });
                    }
                    Err(RaceFailure::Unreachable) => {}
                }
            }
            if self.is_connected(&peer) {
                return Ok(());
            }
            if round < rounds {
                tokio::time::sleep(inner.settings.retry.delay(round)).await;
            }
        }

        warn!(peer = %peer, attempts, "peer unreachable");
        Err(ConnectError::NetworkUnreachable { peer, attempts })
    }

    /// Run the responder handshake on an accepted stream in the background.
    pub fn accept(&self, stream: BoxStream, remote: Option<SocketAddr>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut framed = FramedStream::new(stream);
            let outcome = match tokio::time::timeout(
                inner.settings.attempt_timeout,
                handshake::respond(&mut framed, &inner.identity),
            )
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    debug!(remote = ?remote, error = %e, "inbound handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(remote = ?remote, "inbound handshake timed out");
                    return;
                }
            };

            let peer = outcome.peer_id;
            if inner.is_penalized(&peer) {
                debug!(peer = %peer, "refusing penalized peer");
                return;
            }
            if inner.book.lock().await.observe(peer, std::iter::empty(), unix_now()) {
                info!(peer = %peer, "first contact from new peer");
            }
            inner
                .install(peer, framed, outcome.cipher, peer, remote.map(|a| a.to_string()))
                .await;
        });
    }

    /// Close the session to `peer`, if any. Returns whether one was open.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        self.inner.disconnect(peer)
    }

    /// Close every session.
    pub fn disconnect_all(&self) {
        let peers: Vec<PeerId> = self.inner.sessions.iter().map(|s| *s.key()).collect();
        for peer in peers {
            self.inner.disconnect(&peer);
        }
    }

    /// Housekeeping: close idle sessions and expire blacklist and penalty entries.
    ///
    /// Returns the peers whose sessions were closed.
    pub fn sweep(&self) -> Vec<PeerId> {
        let now = Instant::now();
        self.inner.blacklist().purge(now);
        self.inner.penalties().purge(now);

        let expired = self.inner.settings.pool.expired(&self.inner.usage(), now);
        for peer in &expired {
            debug!(peer = %peer, "closing idle session");
            self.inner.disconnect(peer);
        }
        expired
    }

    /// Whether an established session to `peer` exists.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .sessions
            .get(peer)
            .is_some_and(|s| s.state == SessionState::Established)
    }

    /// Whether `peer` is currently refused.
    pub fn is_penalized(&self, peer: &PeerId) -> bool {
        self.inner.is_penalized(peer)
    }

    /// Peers with a live session.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .inner
            .sessions
            .iter()
            .filter(|s| s.state == SessionState::Established)
            .map(|s| *s.key())
            .collect();
        peers.sort();
        peers
    }

    /// Status of every session, ordered by peer id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut out: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|s| SessionInfo {
                peer_id: *s.key(),
                state: s.state.label(),
                initiated_locally: s.initiator == self.inner.local,
                remote: s.remote.clone(),
                established_at: s.established_at,
                idle_secs: now
                    .saturating_duration_since(self.inner.last_used(&s.last_used))
                    .as_secs(),
            })
            .collect();
        out.sort_by_key(|s| s.peer_id);
        out
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.inner.local)
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl Inner {
    fn blacklist(&self) -> MutexGuard<'_, AddressBlacklist> {
        self.blacklist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn penalties(&self) -> MutexGuard<'_, PeerPenalties> {
        self.penalties.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_penalized(&self, peer: &PeerId) -> bool {
        self.penalties().is_penalized(peer, Instant::now())
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn last_used(&self, stamp: &AtomicU64) -> Instant {
        self.epoch + Duration::from_millis(stamp.load(Ordering::Relaxed))
    }

    fn usage(&self) -> Vec<SessionUsage> {
        self.sessions
            .iter()
            .map(|s| SessionUsage {
                peer: *s.key(),
                last_used: self.last_used(&s.last_used),
                state: s.state,
            })
            .collect()
    }

    async fn candidates(&self, peer: &PeerId) -> Vec<AddressRecord> {
        let policy = self.policy.borrow().candidate_policy();
        let resolved = self.book.lock().await.resolve_with(peer, unix_now(), policy);
        let now = Instant::now();
        let blacklist = self.blacklist();
        resolved
            .into_iter()
            .filter(|r| !blacklist.is_blocked(&r.endpoint, now))
            .collect()
    }

    async fn race(self: &Arc<Self>, peer: PeerId, candidates: Vec<AddressRecord>) -> Result<(), RaceFailure> {
        let mut attempts = JoinSet::new();
        for (i, candidate) in candidates.into_iter().enumerate() {
            let dialer = self.dialer.clone();
            let identity = self.identity.clone();
            let delay = self.settings.stagger * i as u32;
            let timeout = self.settings.attempt_timeout;
            attempts.spawn(async move {
                tokio::time::sleep(delay).await;
                let endpoint = candidate.endpoint;
                let result = tokio::time::timeout(timeout, async {
                    let stream = dialer.dial(&endpoint).await?;
                    let mut framed = FramedStream::new(stream);
                    let outcome = handshake::initiate(&mut framed, &identity, Some(peer)).await?;
                    Ok::<_, HandshakeError>((framed, outcome))
                })
                .await
                .unwrap_or_else(|_| Err(HandshakeError::Transport(TransportError::Timeout)));
                (endpoint, result)
            });
        }

        let mut auth_failure = None;
        while let Some(joined) = attempts.join_next().await {
            let Ok((endpoint, result)) = joined else {
                continue;
            };
            match result {
                Ok((framed, outcome)) => {
                    attempts.abort_all();
                    debug!(peer = %peer, endpoint = %endpoint, "dial succeeded");
                    self.install(peer, framed, outcome.cipher, self.local, Some(endpoint.to_string()))
                        .await;
                    return Ok(());
                }
                Err(e) if e.is_authentication_failure() => {
                    warn!(peer = %peer, endpoint = %endpoint, error = %e, "authentication failed, blacklisting address");
                    self.blacklist().block(endpoint.clone(), Instant::now());
                    auth_failure.get_or_insert((endpoint, e.to_string()));
                }
                Err(e) => {
                    debug!(peer = %peer, endpoint = %endpoint, error = %e, "dial attempt failed");
                }
            }
        }

        match auth_failure {
            Some((endpoint, reason)) => Err(RaceFailure::Authentication { endpoint, reason }),
            None => Err(RaceFailure::Unreachable),
        }
    }

    /// Register an authenticated stream and start its session task.
    async fn install(
        self: &Arc<Self>,
        peer: PeerId,
        framed: FramedStream,
        cipher: SessionCipher,
        initiator: PeerId,
        remote: Option<String>,
    ) {
        if !self.sessions.contains_key(&peer) {
            if let Some(victim) = self.settings.pool.eviction_candidate(&self.usage()) {
                info!(peer = %victim, "session pool full, evicting least recently used");
                self.disconnect(&victim);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle {
            id,
            initiator,
            remote,
            established_at: unix_now(),
            last_used: Arc::new(AtomicU64::new(self.elapsed_ms())),
            state: SessionState::Established,
            close: Arc::new(Notify::new()),
        };

        let displaced = match self.sessions.entry(peer) {
            Entry::Occupied(mut existing) => {
                if initiator > existing.get().initiator {
                    debug!(peer = %peer, "duplicate session lost the tie-break, dropping it");
                    return;
                }
                Some(existing.insert(handle.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                None
            }
        };
        if let Some(old) = displaced {
            debug!(peer = %peer, old = old.id, new = id, "replacing duplicate session");
            old.close.notify_one();
            let _ = self
                .events
                .send(SessionEvent::Detached {
                    peer,
                    session_id: old.id,
                })
                .await;
        }

        let greeting = {
            let mut book = self.book.lock().await;
            book.touch(&peer, unix_now());
            let addresses = book.local_record_addresses(unix_now(), self.settings.gossip_ttl);
            if addresses.is_empty() {
                None
            } else {
                match self.identity.sign_record(addresses) {
                    Ok(record) => Some(WireMessage::AddressRecord(record)),
                    Err(e) => {
                        warn!(error = %e, "cannot sign address greeting");
                        None
                    }
                }
            }
        };

        let (tx, commands) = mpsc::channel(OUTBOUND_CHANNEL);
        if self
            .events
            .send(SessionEvent::Attached(SessionLink::new(id, peer, tx)))
            .await
            .is_err()
        {
            warn!(peer = %peer, "sync engine stopped, dropping session");
            self.sessions.remove_if(&peer, |_, h| h.id == id);
            return;
        }

        info!(
            peer = %peer,
            session = id,
            initiated_locally = initiator == self.local,
            "session established"
        );
        let inner = self.clone();
        tokio::spawn(async move {
            inner
                .run_session(peer, handle, framed, cipher, commands, greeting)
                .await;
        });
    }

    fn disconnect(&self, peer: &PeerId) -> bool {
        match self.sessions.get_mut(peer) {
            Some(mut session) => {
                session.state = SessionState::Closing;
                session.close.notify_one();
                true
            }
            None => false,
        }
    }

    async fn run_session(
        self: Arc<Self>,
        peer: PeerId,
        handle: SessionHandle,
        framed: FramedStream,
        cipher: SessionCipher,
        mut commands: mpsc::Receiver<Outbound>,
        greeting: Option<WireMessage>,
    ) {
        let (mut reader, mut writer) = framed.into_split();
        let (frame_tx, mut frames) = mpsc::channel(FRAME_CHANNEL);
        let _reader = AbortOnDrop(tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let done = !matches!(frame, Ok(Some(_)));
                if frame_tx.send(frame).await.is_err() || done {
                    break;
                }
            }
        }));

        let touch = || handle.last_used.store(self.elapsed_ms(), Ordering::Relaxed);

        let reason = 'session: {
            if let Some(greeting) = greeting {
                let write = send_message(&mut writer, &greeting);
                if let Err(reason) = self.bounded_write(&handle.close, write).await {
                    break 'session format!("greeting: {reason}");
                }
            }
            loop {
                tokio::select! {
                    _ = handle.close.notified() => break 'session "closed locally".to_string(),
                    frame = frames.recv() => match frame {
                        Some(Ok(Some(bytes))) => {
                            touch();
                            if let Flow::Close(reason) = self.handle_frame(peer, handle.id, &cipher, &bytes).await {
                                break 'session reason;
                            }
                        }
                        Some(Ok(None)) | None => break 'session "closed by peer".to_string(),
                        Some(Err(e)) => break 'session format!("read failed: {e}"),
                    },
                    command = commands.recv() => match command {
                        Some(command) => {
                            touch();
                            let write = write_command(&mut writer, &cipher, command);
                            if let Err(reason) = self.bounded_write(&handle.close, write).await {
                                break 'session reason;
                            }
                        }
                        None => break 'session "sync link dropped".to_string(),
                    },
                }
            }
        };

        debug!(peer = %peer, session = handle.id, reason = %reason, "session ended");
        if self.sessions.remove_if(&peer, |_, h| h.id == handle.id).is_some() {
            info!(peer = %peer, session = handle.id, "session closed");
            let _ = self
                .events
                .send(SessionEvent::Detached {
                    peer,
                    session_id: handle.id,
                })
                .await;
        }
    }

    /// Run one write, giving up on timeout or when the session is closed locally.
    async fn bounded_write<F>(&self, close: &Notify, write: F) -> Result<(), String>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let limit = self.settings.write_timeout;
        tokio::select! {
            _ = close.notified() => Err("closed locally".to_string()),
            written = tokio::time::timeout(limit, write) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("write failed: {e}")),
                Err(_) => Err(format!("write timed out after {}ms", limit.as_millis())),
            },
        }
    }

    async fn handle_frame(&self, peer: PeerId, session_id: u64, cipher: &SessionCipher, bytes: &[u8]) -> Flow {
        let message = match WireMessage::from_bytes(bytes) {
            Ok(m) => m,
            Err(e) => return self.drop_delta(peer, &format!("undecodable frame: {e}")),
        };

        match message {
            WireMessage::SyncMessage(m) => {
                let plaintext = match cipher.open_delta(
                    &m.origin_peer,
                    m.sequence,
                    &m.content_hash,
                    &m.ciphertext,
                    &m.mac,
                ) {
                    Ok(p) => p,
                    Err(_) => return self.drop_delta(peer, "delta failed authentication"),
                };
                if ContentHash::compute(&m.origin_peer, m.sequence, &plaintext) != m.content_hash {
                    return self.drop_delta(peer, "content hash mismatch");
                }
                self.emit(SessionEvent::Delta {
                    from: peer,
                    session_id,
                    delta: InboundDelta {
                        origin: m.origin_peer,
                        sequence: m.sequence,
                        content_hash: m.content_hash,
                        plaintext,
                    },
                })
                .await
            }
            WireMessage::Ack(ack) => {
                if !cipher.verify_ack(&ack.origin_peer, ack.sequence, &ack.mac) {
                    return self.strike(peer, "ack failed authentication");
                }
                self.emit(SessionEvent::Ack {
                    from: peer,
                    origin: ack.origin_peer,
                    sequence: ack.sequence,
                })
                .await
            }
            WireMessage::AddressRecord(record) => {
                if record.verify().is_err() {
                    return self.strike(peer, "address record signature invalid");
                }
                if record.peer_id != self.local {
                    let now = unix_now();
                    let addresses: Vec<AddressRecord> = record
                        .addresses
                        .iter()
                        .map(|a| {
                            AddressRecord::new(
                                a.endpoint(),
                                direct_source(&a.host),
                                Some(now.saturating_add(a.ttl as u64)),
                            )
                        })
                        .collect();
                    debug!(peer = %record.peer_id, count = addresses.len(), "learned gossiped addresses");
                    self.book.lock().await.observe(record.peer_id, addresses, now);
                }
                Flow::Continue
            }
            WireMessage::Handshake(_) => self.strike(peer, "handshake frame on established session"),
        }
    }

    async fn emit(&self, event: SessionEvent) -> Flow {
        match self.events.send(event).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close("sync engine stopped".to_string()),
        }
    }

    /// Strike, then end the session even if tolerated: later deltas on it
    /// would be acknowledged past the dropped one.
    fn drop_delta(&self, peer: PeerId, reason: &str) -> Flow {
        match self.strike(peer, reason) {
            Flow::Continue => Flow::Close(format!("resync after dropped frame: {reason}")),
            close => close,
        }
    }

    fn strike(&self, peer: PeerId, reason: &str) -> Flow {
        match self.penalties().strike(peer, Instant::now()) {
            Strike::Tolerated => {
                warn!(peer = %peer, reason, "dropped malformed message");
                Flow::Continue
            }
            Strike::Penalize { .. } => {
                warn!(
                    peer = %peer,
                    reason,
                    penalty_secs = self.settings.penalty.as_secs(),
                    "repeated malformed messages, penalizing peer"
                );
                Flow::Close(format!("penalized: {reason}"))
            }
        }
    }
}

async fn send_message(writer: &mut WriteHalf<BoxStream>, message: &WireMessage) -> Result<(), TransportError> {
    write_frame(writer, &message.to_bytes()?).await
}

async fn write_command(
    writer: &mut WriteHalf<BoxStream>,
    cipher: &SessionCipher,
    command: Outbound,
) -> Result<(), TransportError> {
    let message = match command {
        Outbound::Delta {
            origin,
            sequence,
            content_hash,
            plaintext,
        } => {
            // Skipping a delta would leave a hole the receiver acknowledges past.
            let (ciphertext, mac) = cipher
                .seal_delta(&origin, sequence, &content_hash, &plaintext)
                .map_err(|e| TransportError::ConnectionFailed(format!("cannot seal delta: {e}")))?;
            WireMessage::SyncMessage(SyncMessage {
                origin_peer: origin,
                sequence,
                content_hash,
                ciphertext,
                mac,
            })
        }
        Outbound::Ack { origin, sequence } => {
            let mac = match cipher.ack_tag(&origin, sequence) {
                Ok(mac) => mac,
                Err(e) => {
                    warn!(error = %e, "failed to tag ack");
                    return Ok(());
                }
            };
            WireMessage::Ack(peer_types::Ack {
                origin_peer: origin,
                sequence,
                mac,
            })
        }
    };
    send_message(writer, &message).await
}
