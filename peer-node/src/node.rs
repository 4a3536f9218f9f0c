//! The node context: wires identity, address book, NAT driver, registry
//! client, LAN discovery, connection manager and sync engine together and
//! runs the listener and maintenance loops.
//!
//! ```text
//!            ┌──────────── AddressBook ◄──── NatTraversal
//!            │                  ▲
//! connect ──► ConnectionManager │ gossip      RegistryClient ──► discover / publish
//!            │    ▲             │
//!            ▼    │ SessionLink │
//!        SessionEvent ──► SyncEngine ──► ContentStore
//! ```

use crate::config::NodeConfig;
use crate::connection::{ConnectionManager, ConnectionSettings, SessionInfo};
use crate::crypto::{IdentityKeypair, StorageKey};
use crate::error::NodeError;
use crate::lan::{self, LanDiscovery, LanSettings};
use crate::nat::{
    DisabledMapper, NatHandle, NatPmpMapper, NatSettings, NatTraversal, PortMapper, ReachabilityCheck,
};
use crate::registry::{RegistryClient, RegistryEndpointInfo};
use crate::store::{ContentStore, MemoryStore};
use crate::sync::SyncEngine;
use crate::transport::{Dialer, TcpDialer};
use crate::unix_now;
use peer_core::{direct_source, AddressBook, NatState};
use peer_types::{AddressRecord, AddressSource, Delta, Endpoint, PeerId};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL: usize = 1024;

/// Pluggable pieces of a node. Defaults are the production ones.
pub struct NodeParts {
    /// Where deltas are persisted.
    pub store: Arc<dyn ContentStore>,
    /// How outbound streams are opened.
    pub dialer: Arc<dyn Dialer>,
    /// Port mapper; chosen from config when `None`.
    pub mapper: Option<Arc<dyn PortMapper>>,
    /// Pre-bound listener; bound from config when `None`.
    pub listener: Option<TcpListener>,
}

impl NodeParts {
    /// Production parts around `store`.
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            dialer: Arc::new(TcpDialer),
            mapper: None,
            listener: None,
        }
    }

    /// Use a specific port mapper.
    pub fn with_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Use an already bound listener.
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Use a specific dialer.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }
}

/// Queue depth toward one peer.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    /// Destination peer.
    pub peer_id: PeerId,
    /// Undelivered deltas.
    pub depth: usize,
}

/// Snapshot for the web and CLI layers.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    /// This node's id.
    pub peer_id: PeerId,
    /// Bound listener address.
    pub listen_addr: String,
    /// NAT traversal state label.
    pub nat: &'static str,
    /// Addresses this node publishes.
    pub addresses: Vec<String>,
    /// Live sessions.
    pub sessions: Vec<SessionInfo>,
    /// Outbound queues.
    pub queues: Vec<QueueInfo>,
    /// Registry health.
    pub registries: Vec<RegistryEndpointInfo>,
    /// Peers in the address book.
    pub known_peers: usize,
}

#[derive(Clone)]
struct Shared {
    config: Arc<NodeConfig>,
    identity: Arc<IdentityKeypair>,
    book: Arc<Mutex<AddressBook>>,
    connections: ConnectionManager,
    sync: SyncEngine,
    registry: Option<RegistryClient>,
    nat_state: watch::Receiver<NatState>,
}

/// A running hearth node.
pub struct Node {
    shared: Shared,
    local_addr: SocketAddr,
    nat: Mutex<Option<NatHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node with an in-memory content store.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        Self::start_with(config, NodeParts::new(Arc::new(MemoryStore::new()))).await
    }

    /// Start a node with explicit parts.
    pub async fn start_with(config: NodeConfig, parts: NodeParts) -> Result<Self, NodeError> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_path)?;
        let identity = Arc::new(IdentityKeypair::load_or_create(&config.storage_path)?);
        let storage_key = StorageKey::load_or_create(&config.storage_path)?;
        let local = identity.peer_id();

        let listener = match parts.listener {
            Some(listener) => listener,
            None => TcpListener::bind((config.bind_host.as_str(), config.p2p_port)).await?,
        };
        let local_addr = listener.local_addr()?;
        let advertised = advertise_host(&config, local_addr.ip());

        let book = Arc::new(Mutex::new(AddressBook::new()));
        {
            let mut book = book.lock().await;
            book.register_local(Endpoint::tcp(advertised.to_string(), local_addr.port()));
            // A wildcard listener is reachable on every interface of its family.
            if local_addr.ip().is_unspecified() {
                for ip in lan::interface_ips(&lan::local_interfaces()) {
                    if ip.is_ipv4() || local_addr.is_ipv6() {
                        book.register_local(Endpoint::tcp(ip.to_string(), local_addr.port()));
                    }
                }
            }
        }

        let sync = SyncEngine::new(
            local,
            Arc::new(storage_key),
            parts.store,
            config.sync.queue_capacity,
        );
        sync.restore().await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL);
        let mut tasks = vec![sync.spawn(events_rx)];

        let (nat_tx, nat_state) = watch::channel(NatState::Idle);
        let connections = ConnectionManager::new(
            identity.clone(),
            parts.dialer,
            book.clone(),
            nat_state.clone(),
            ConnectionSettings::from_config(&config),
            events_tx,
        );

        let registry = if config.registries.is_empty() {
            None
        } else {
            let (client, monitor) = RegistryClient::new(&config.registries, &config.registry_client)?;
            tasks.push(monitor.spawn());
            Some(client)
        };

        let nat = if config.enable_upnp {
            let mapper = match parts.mapper {
                Some(mapper) => mapper,
                None => match NatPmpMapper::from_config(&config.nat, Some(advertised)) {
                    Ok(mapper) => Arc::new(mapper) as Arc<dyn PortMapper>,
                    Err(e) => {
                        warn!(error = %e, "no NAT-PMP gateway, port mapping disabled");
                        Arc::new(DisabledMapper)
                    }
                },
            };
            let check = registry
                .clone()
                .map(|r| Arc::new(r) as Arc<dyn ReachabilityCheck>);
            let settings = NatSettings::from_config(&config.nat, local_addr.port());
            Some(NatTraversal::new(mapper, check, book.clone(), settings, nat_tx).spawn())
        } else {
            None
        };

        let shared = Shared {
            config: Arc::new(config),
            identity,
            book,
            connections,
            sync,
            registry,
            nat_state,
        };

        for seed in &shared.config.peers {
            shared
                .add_peer(seed.peer_id, Endpoint::tcp(seed.host.clone(), seed.port))
                .await?;
        }

        tasks.push(tokio::spawn(accept_loop(listener, shared.connections.clone())));
        tasks.push(tokio::spawn(maintenance_loop(shared.clone())));
        if shared.config.lan.enabled {
            let bind = SocketAddr::new(local_addr.ip(), shared.config.lan_port());
            let settings = LanSettings::from_config(&shared.config);
            match LanDiscovery::bind(bind, shared.identity.clone(), shared.book.clone(), settings).await {
                Ok(discovery) => tasks.push(discovery.spawn()),
                Err(e) => warn!(addr = %bind, error = %e, "LAN discovery not started"),
            }
        }
        for seed in &shared.config.peers {
            let dialer = shared.clone();
            let peer = seed.peer_id;
            tokio::spawn(async move {
                if let Err(e) = dialer.connect(peer).await {
                    debug!(peer = %peer, error = %e, "seed peer not reachable yet");
                }
            });
        }

        info!(
            peer_id = %local,
            listen = %local_addr,
            advertised = %advertised,
            upnp = shared.config.enable_upnp,
            registries = shared.config.registries.len(),
            "node started"
        );

        Ok(Self {
            shared,
            local_addr,
            nat: Mutex::new(nat),
            tasks: Mutex::new(tasks),
        })
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> PeerId {
        self.shared.identity.peer_id()
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Effective configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Connection manager handle.
    pub fn connections(&self) -> &ConnectionManager {
        &self.shared.connections
    }

    /// Registry client, if registries are configured.
    pub fn registry(&self) -> Option<&RegistryClient> {
        self.shared.registry.as_ref()
    }

    /// Current NAT state.
    pub fn nat_state(&self) -> NatState {
        self.shared.nat_state.borrow().clone()
    }

    /// Remember a peer at a known address and start queueing for it.
    pub async fn add_peer(&self, peer: PeerId, endpoint: Endpoint) -> Result<(), NodeError> {
        self.shared.add_peer(peer, endpoint).await
    }

    /// Ensure a session to `peer`, looking it up in the registries if no address is known.
    pub async fn connect(&self, peer: PeerId) -> Result<(), NodeError> {
        self.shared.connect(peer).await
    }

    /// Author a delta and queue it for every known peer.
    pub async fn enqueue_local(&self, content: &[u8]) -> Result<Delta, NodeError> {
        Ok(self.shared.sync.enqueue_local(content).await?)
    }

    /// Sign and publish this node's current addresses to every registry.
    pub async fn publish_record(&self) -> Result<usize, NodeError> {
        self.shared.publish_record().await
    }

    /// Status snapshot.
    pub async fn status(&self) -> NodeStatus {
        let shared = &self.shared;
        let (addresses, known_peers) = {
            let mut book = shared.book.lock().await;
            let addresses = book
                .own_addresses(unix_now())
                .into_iter()
                .map(|r| r.endpoint.to_string())
                .collect();
            (addresses, book.len())
        };
        NodeStatus {
            peer_id: self.peer_id(),
            listen_addr: self.local_addr.to_string(),
            nat: shared.nat_state.borrow().label(),
            addresses,
            sessions: shared.connections.sessions(),
            queues: shared
                .sync
                .queue_depths()
                .into_iter()
                .map(|(peer_id, depth)| QueueInfo { peer_id, depth })
                .collect(),
            registries: shared
                .registry
                .as_ref()
                .map(RegistryClient::status)
                .unwrap_or_default(),
            known_peers,
        }
    }

    /// Withdraw mappings, close sessions and stop background tasks.
    pub async fn shutdown(&self) {
        if let Some(nat) = self.nat.lock().await.take() {
            nat.stop().await;
        }
        self.shared.connections.disconnect_all();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(peer_id = %self.peer_id(), "node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.peer_id())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Shared {
    async fn add_peer(&self, peer: PeerId, endpoint: Endpoint) -> Result<(), NodeError> {
        let source = direct_source(&endpoint.host);
        self.book
            .lock()
            .await
            .observe(peer, [AddressRecord::new(endpoint, source, None)], unix_now());
        self.sync.track_peer(peer).await?;
        Ok(())
    }

    async fn connect(&self, peer: PeerId) -> Result<(), NodeError> {
        self.sync.track_peer(peer).await?;
        if self.connections.is_connected(&peer) {
            return Ok(());
        }

        let policy = self.nat_state.borrow().candidate_policy();
        let known = !self
            .book
            .lock()
            .await
            .resolve_with(&peer, unix_now(), policy)
            .is_empty();
        if !known {
            if let Some(registry) = &self.registry {
                match registry.discover(&peer).await {
                    Ok(Some(record)) => {
                        info!(peer = %peer, addresses = record.addresses.len(), "discovered peer via registry");
                        self.book
                            .lock()
                            .await
                            .observe_record(&record, AddressSource::RegistryRelay, unix_now());
                    }
                    Ok(None) => debug!(peer = %peer, "no registry knows this peer"),
                    Err(e) => warn!(peer = %peer, error = %e, "registry lookup failed"),
                }
            }
        }

        self.connections.connect(peer).await?;
        Ok(())
    }

    async fn publish_record(&self) -> Result<usize, NodeError> {
        let registry = self.registry.as_ref().ok_or(NodeError::NoRegistry)?;
        let addresses = self
            .book
            .lock()
            .await
            .local_record_addresses(unix_now(), self.config.sync.record_ttl_secs);
        let record = self.identity.sign_record(addresses)?;
        let accepted = registry.publish(&record).await?;
        debug!(accepted, addresses = record.addresses.len(), "published address record");
        Ok(accepted)
    }
}

async fn accept_loop(listener: TcpListener, connections: ConnectionManager) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "set_nodelay failed");
                }
                connections.accept(Box::new(stream), Some(remote));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn maintenance_loop(shared: Shared) {
    let config = &shared.config;
    let mut tick = tokio::time::interval(Duration::from_secs(config.sync.maintenance_interval_secs));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let republish_every = Duration::from_secs(u64::from(config.sync.record_ttl_secs / 2).max(1));
    let mut last_publish: Option<tokio::time::Instant> = None;

    loop {
        tick.tick().await;

        let closed = shared.connections.sweep();
        if !closed.is_empty() {
            debug!(count = closed.len(), "closed idle sessions");
        }

        let evicted = forget_inactive(
            &mut *shared.book.lock().await,
            &shared.connections.connected_peers(),
            unix_now(),
            config.connection.peer_inactivity_secs,
        );
        if !evicted.is_empty() {
            info!(count = evicted.len(), "forgot inactive peers");
        }

        for peer in shared.sync.pending_peers() {
            if shared.connections.is_connected(&peer) || shared.connections.is_penalized(&peer) {
                continue;
            }
            let dialer = shared.clone();
            tokio::spawn(async move {
                if let Err(e) = dialer.connect(peer).await {
                    debug!(peer = %peer, error = %e, "reconnect for pending deltas failed");
                }
            });
        }

        if shared.registry.is_some()
            && last_publish.map_or(true, |at| at.elapsed() >= republish_every)
        {
            match shared.publish_record().await {
                Ok(_) => last_publish = Some(tokio::time::Instant::now()),
                Err(e) => warn!(error = %e, "address record publish failed"),
            }
        }
    }
}

/// Forget peers not seen for `timeout_secs`. A live session counts as seen.
fn forget_inactive(book: &mut AddressBook, connected: &[PeerId], now: u64, timeout_secs: u64) -> Vec<PeerId> {
    for peer in connected {
        book.touch(peer, now);
    }
    book.evict_inactive(now, timeout_secs)
}

/// Host to advertise for the listener.
fn advertise_host(config: &NodeConfig, bound: IpAddr) -> IpAddr {
    if let Some(host) = &config.advertise_host {
        if let Ok(ip) = host.parse() {
            return ip;
        }
        warn!(host = %host, "advertise_host is not an IP address, ignoring");
    }
    if !bound.is_unspecified() {
        return bound;
    }
    detect_local_ip().unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Local address of the interface that routes to the internet. Sends no packets.
fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
