//! LAN discovery over UDP broadcast.
//!
//! Every `interval` the node sends its signed address record to the broadcast
//! address of each local IPv4 network (and to any configured targets) on the
//! discovery port. Announcements heard from other nodes are verified and their
//! sender is recorded in the address book as a local-network candidate at the
//! packet's source IP, expiring after `expiry` unless heard again.
//!
//! Packet: `MAGIC || msgpack(WireMessage::AddressRecord)`.

use crate::config::NodeConfig;
use crate::crypto::IdentityKeypair;
use crate::unix_now;
use get_if_addrs::{IfAddr, Interface};
use peer_core::AddressBook;
use peer_types::{AddressRecord, AddressSource, Endpoint, PeerId, Protocol, RegistryRecord, WireError, WireMessage};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Marks hearth discovery datagrams.
pub const MAGIC: &[u8; 4] = b"HRTH";

/// Largest datagram sent or accepted.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Tunables for LAN discovery.
#[derive(Debug, Clone)]
pub struct LanSettings {
    /// UDP port announcements are sent to.
    pub port: u16,
    /// Announcement period.
    pub interval: Duration,
    /// Lifetime of an address heard on the LAN.
    pub expiry: Duration,
    /// Send to every local IPv4 broadcast address.
    pub broadcast: bool,
    /// Extra unicast targets.
    pub targets: Vec<SocketAddr>,
}

impl LanSettings {
    /// Settings from the node configuration. Unparseable targets are skipped.
    pub fn from_config(config: &NodeConfig) -> Self {
        let lan = &config.lan;
        Self {
            port: config.lan_port(),
            interval: Duration::from_secs(lan.interval_secs.max(1)),
            expiry: Duration::from_secs(lan.expiry_secs.max(1)),
            broadcast: lan.broadcast,
            targets: lan.targets.iter().filter_map(|t| t.parse().ok()).collect(),
        }
    }
}

/// Frame a signed record for the wire.
pub fn encode_announcement(record: &RegistryRecord) -> Result<Vec<u8>, WireError> {
    let body = WireMessage::AddressRecord(record.clone()).to_bytes()?;
    let mut packet = Vec::with_capacity(MAGIC.len() + body.len());
    packet.extend_from_slice(MAGIC);
    packet.extend(body);
    if packet.len() > MAX_PACKET_SIZE {
        return Err(WireError::InvalidData(format!(
            "announcement is {} bytes (max {MAX_PACKET_SIZE})",
            packet.len()
        )));
    }
    Ok(packet)
}

/// Parse a datagram. `None` for anything that is not a hearth announcement.
/// The signature is not checked here.
pub fn decode_announcement(packet: &[u8]) -> Option<RegistryRecord> {
    let body = packet.strip_prefix(MAGIC.as_slice())?;
    match WireMessage::from_bytes(body).ok()? {
        WireMessage::AddressRecord(record) => Some(record),
        _ => None,
    }
}

/// Interfaces of this host. Empty if they cannot be listed.
pub fn local_interfaces() -> Vec<Interface> {
    get_if_addrs::get_if_addrs().unwrap_or_else(|e| {
        warn!(error = %e, "cannot list network interfaces");
        Vec::new()
    })
}

/// Addresses other hosts could dial us at: no loopback, no IPv6 link-local.
pub fn interface_ips(interfaces: &[Interface]) -> Vec<IpAddr> {
    let ips: BTreeSet<IpAddr> = interfaces
        .iter()
        .filter(|i| !i.is_loopback())
        .map(Interface::ip)
        .filter(|ip| match ip {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_unspecified(),
            IpAddr::V6(v6) => !v6.is_loopback() && (v6.segments()[0] & 0xffc0) != 0xfe80,
        })
        .collect();
    ips.into_iter().collect()
}

/// Broadcast address of every IPv4 network, plus the limited broadcast address.
pub fn broadcast_targets(interfaces: &[Interface], port: u16) -> Vec<SocketAddr> {
    let mut targets: BTreeSet<Ipv4Addr> = interfaces
        .iter()
        .filter(|i| !i.is_loopback())
        .filter_map(|i| match &i.addr {
            IfAddr::V4(v4) => v4.broadcast,
            IfAddr::V6(_) => None,
        })
        .collect();
    targets.insert(Ipv4Addr::BROADCAST);
    targets
        .into_iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
        .collect()
}

/// Announces this node on the LAN and records the nodes it hears.
pub struct LanDiscovery {
    socket: UdpSocket,
    identity: Arc<IdentityKeypair>,
    book: Arc<Mutex<AddressBook>>,
    settings: LanSettings,
}

impl LanDiscovery {
    /// Bind the discovery socket on `bind` with broadcast enabled.
    pub async fn bind(
        bind: SocketAddr,
        identity: Arc<IdentityKeypair>,
        book: Arc<Mutex<AddressBook>>,
        settings: LanSettings,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            identity,
            book,
            settings,
        })
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one announcement to every target. Returns how many sends succeeded.
    pub async fn announce(&self) -> usize {
        let ttl = u32::try_from(self.settings.expiry.as_secs()).unwrap_or(u32::MAX);
        let addresses = self.book.lock().await.local_record_addresses(unix_now(), ttl);
        if addresses.is_empty() {
            return 0;
        }
        let packet = match self
            .identity
            .sign_record(addresses)
            .map_err(|e| e.to_string())
            .and_then(|record| encode_announcement(&record).map_err(|e| e.to_string()))
        {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "cannot build LAN announcement");
                return 0;
            }
        };

        let mut targets = self.settings.targets.clone();
        if self.settings.broadcast {
            targets.extend(broadcast_targets(&local_interfaces(), self.settings.port));
        }
        let mut sent = 0;
        for target in targets {
            match self.socket.send_to(&packet, target).await {
                Ok(_) => sent += 1,
                Err(e) => trace!(target = %target, error = %e, "announcement not sent"),
            }
        }
        sent
    }

    /// Receive one datagram and apply it. Returns the peer it announced, if
    /// it was a valid announcement from another node.
    pub async fn receive(&self) -> std::io::Result<Option<PeerId>> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok(self.apply(&buf[..len], from).await)
    }

    async fn apply(&self, packet: &[u8], from: SocketAddr) -> Option<PeerId> {
        let record = decode_announcement(packet)?;
        if record.peer_id == self.identity.peer_id() {
            return None;
        }
        if let Err(e) = record.verify() {
            debug!(from = %from, error = %e, "dropping unverifiable LAN announcement");
            return None;
        }

        let now = unix_now();
        let expires_at = now.saturating_add(self.settings.expiry.as_secs());
        let host = from.ip().to_string();
        let ports: BTreeSet<u16> = record
            .addresses
            .iter()
            .filter(|a| a.proto == Protocol::Tcp)
            .map(|a| a.port)
            .collect();
        let addresses = ports.into_iter().map(|port| {
            AddressRecord::new(Endpoint::tcp(host.clone(), port), AddressSource::Local, Some(expires_at))
        });
        if self.book.lock().await.observe(record.peer_id, addresses, now) {
            info!(peer = %record.peer_id, from = %from, "discovered peer on LAN");
        }
        Some(record.peer_id)
    }

    /// Announce every interval and listen in between, until aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.settings.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let sent = self.announce().await;
                        trace!(sent, "LAN announcement");
                    }
                    received = self.receive() => {
                        if let Err(e) = received {
                            debug!(error = %e, "LAN discovery receive failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for LanDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanDiscovery")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("port", &self.settings.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use get_if_addrs::{Ifv4Addr, Ifv6Addr};
    use std::net::Ipv6Addr;

    fn settings(targets: Vec<SocketAddr>) -> LanSettings {
        LanSettings {
            port: 0,
            interval: Duration::from_millis(50),
            expiry: Duration::from_secs(300),
            broadcast: false,
            targets,
        }
    }

    async fn node(listen_port: u16) -> (Arc<IdentityKeypair>, Arc<Mutex<AddressBook>>) {
        let identity = Arc::new(IdentityKeypair::generate().unwrap());
        let book = Arc::new(Mutex::new(AddressBook::new()));
        book.lock()
            .await
            .register_local(Endpoint::tcp("192.168.1.20", listen_port));
        (identity, book)
    }

    async fn discovery(
        identity: Arc<IdentityKeypair>,
        book: Arc<Mutex<AddressBook>>,
        targets: Vec<SocketAddr>,
    ) -> LanDiscovery {
        LanDiscovery::bind("127.0.0.1:0".parse().unwrap(), identity, book, settings(targets))
            .await
            .unwrap()
    }

    fn wire(host: &str, port: u16) -> peer_types::WireAddress {
        peer_types::WireAddress::from_endpoint(&Endpoint::tcp(host, port), 300)
    }

    fn v4(name: &str, ip: [u8; 4], broadcast: Option<[u8; 4]>) -> Interface {
        Interface {
            name: name.into(),
            addr: IfAddr::V4(Ifv4Addr {
                ip: Ipv4Addr::from(ip),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                broadcast: broadcast.map(Ipv4Addr::from),
            }),
        }
    }

    fn v6(name: &str, ip: Ipv6Addr) -> Interface {
        Interface {
            name: name.into(),
            addr: IfAddr::V6(Ifv6Addr {
                ip,
                netmask: Ipv6Addr::UNSPECIFIED,
                broadcast: None,
            }),
        }
    }

    #[test]
    fn interface_selection_skips_loopback_and_link_local() {
        let interfaces = vec![
            v4("lo", [127, 0, 0, 1], None),
            v4("eth0", [192, 168, 1, 20], Some([192, 168, 1, 255])),
            v4("wg0", [10, 8, 0, 2], None),
            v6("eth0", "fe80::1".parse().unwrap()),
            v6("eth0", "2001:db8::20".parse().unwrap()),
        ];

        let ips = interface_ips(&interfaces);
        assert_eq!(
            ips,
            vec![
                "10.8.0.2".parse::<IpAddr>().unwrap(),
                "192.168.1.20".parse().unwrap(),
                "2001:db8::20".parse().unwrap(),
            ]
        );

        let targets = broadcast_targets(&interfaces, 10099);
        assert_eq!(
            targets,
            vec![
                "192.168.1.255:10099".parse::<SocketAddr>().unwrap(),
                "255.255.255.255:10099".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn foreign_datagrams_are_ignored() {
        assert!(decode_announcement(b"").is_none());
        assert!(decode_announcement(b"{\"type\":\"discovery\",\"port\":9999}").is_none());
        assert!(decode_announcement(b"HRTH\xc1").is_none());
    }

    #[tokio::test]
    async fn announcement_is_recorded_as_an_expiring_local_address() {
        let (a_id, a_book) = node(9001).await;
        let (b_id, b_book) = node(9002).await;
        let b = discovery(b_id, b_book.clone(), vec![]).await;
        let a = discovery(a_id.clone(), a_book, vec![b.local_addr().unwrap()]).await;

        assert_eq!(a.announce().await, 1);
        assert_eq!(b.receive().await.unwrap(), Some(a_id.peer_id()));

        let now = unix_now();
        let known = b_book.lock().await.resolve(&a_id.peer_id(), now);
        assert_eq!(known.len(), 1);
        // Dialed at the datagram's source, not at the address the sender claims.
        assert_eq!(known[0].endpoint, Endpoint::tcp("127.0.0.1", 9001));
        assert_eq!(known[0].source, AddressSource::Local);
        assert!(known[0].expires_at.is_some_and(|at| at >= now + 299 && at <= now + 301));

        // Gone once the discovery lifetime has passed without a new announcement.
        assert!(b_book.lock().await.resolve(&a_id.peer_id(), now + 301).is_empty());
    }

    #[tokio::test]
    async fn own_and_forged_announcements_are_dropped() {
        let (me, book) = node(9001).await;
        let listen = discovery(me.clone(), book.clone(), vec![]).await;
        let to = listen.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let own = me.sign_record(vec![wire("192.168.1.20", 9001)]).unwrap();
        let mut forged = IdentityKeypair::generate()
            .unwrap()
            .sign_record(vec![wire("192.168.1.30", 9003)])
            .unwrap();
        forged.addresses[0].port = 9004;

        for record in [&own, &forged] {
            sender.send_to(&encode_announcement(record).unwrap(), to).await.unwrap();
            assert_eq!(listen.receive().await.unwrap(), None);
        }
        assert!(book.lock().await.is_empty());
    }

    #[tokio::test]
    async fn spawned_nodes_find_each_other() {
        let (a_id, a_book) = node(9001).await;
        let (b_id, b_book) = node(9002).await;
        let a_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (a_addr, b_addr) = (a_socket.local_addr().unwrap(), b_socket.local_addr().unwrap());
        drop((a_socket, b_socket));

        let a = LanDiscovery::bind(a_addr, a_id.clone(), a_book.clone(), settings(vec![b_addr]))
            .await
            .unwrap()
            .spawn();
        let b = LanDiscovery::bind(b_addr, b_id.clone(), b_book.clone(), settings(vec![a_addr]))
            .await
            .unwrap()
            .spawn();

        let met = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let now = unix_now();
                let a_knows = !a_book.lock().await.resolve(&b_id.peer_id(), now).is_empty();
                let b_knows = !b_book.lock().await.resolve(&a_id.peer_id(), now).is_empty();
                if a_knows && b_knows {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        a.abort();
        b.abort();
        assert!(met.is_ok(), "nodes never heard each other");
    }
}
