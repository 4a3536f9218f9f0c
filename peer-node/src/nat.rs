//! NAT traversal driver.
//!
//! Runs the [`NatState`] machine from `peer-core` against real effects: a
//! [`PortMapper`] asks the gateway for a TCP mapping, a [`ReachabilityCheck`]
//! asks a registry what address we appear from, and every outcome lands in
//! the shared address book. The current state is published on a watch
//! channel that the connection manager reads its candidate policy from.
//!
//! Renewal happens at half the granted lease. A node left in `RelayOnly`
//! retries traversal every `retry_interval`.

use crate::config::NatConfig;
use crate::unix_now;
use async_trait::async_trait;
use peer_core::{AddressBook, NatAction, NatEvent, NatState};
use peer_types::{AddressSource, Endpoint};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// NAT-PMP server port on the gateway (RFC 6886).
pub const NAT_PMP_PORT: u16 = 5351;

/// Port mapping errors.
#[derive(Debug, Error)]
pub enum NatError {
    /// Automatic port mapping is turned off.
    #[error("port mapping disabled")]
    Disabled,

    /// No gateway could be determined.
    #[error("no gateway found")]
    NoGateway,

    /// The gateway answered with a non-zero result code.
    #[error("gateway refused mapping: result code {0}")]
    Refused(u16),

    /// The gateway's reply did not parse.
    #[error("malformed gateway reply: {0}")]
    Protocol(String),

    /// The gateway never answered.
    #[error("gateway did not answer")]
    NoReply,

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A granted mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Externally reachable endpoint.
    pub external: Endpoint,
    /// Lease the gateway granted.
    pub lease: Duration,
}

/// Requests TCP port mappings from the local gateway.
#[async_trait]
pub trait PortMapper: Send + Sync + 'static {
    /// Map `internal_port` for `lease`. Renewal is the same call.
    async fn map_tcp(&self, internal_port: u16, lease: Duration) -> Result<PortMapping, NatError>;

    /// Remove the mapping for `internal_port`.
    async fn unmap_tcp(&self, internal_port: u16) -> Result<(), NatError>;
}

/// Learns the address this node appears from on the public internet.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync + 'static {
    /// The observed external endpoint for `port`, or `None` if unknown.
    async fn observe(&self, port: u16) -> Option<Endpoint>;
}

/// Mapper used when `enable_upnp` is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMapper;

#[async_trait]
impl PortMapper for DisabledMapper {
    async fn map_tcp(&self, _internal_port: u16, _lease: Duration) -> Result<PortMapping, NatError> {
        Err(NatError::Disabled)
    }

    async fn unmap_tcp(&self, _internal_port: u16) -> Result<(), NatError> {
        Ok(())
    }
}

/// NAT-PMP (RFC 6886) client.
#[derive(Debug, Clone)]
pub struct NatPmpMapper {
    gateway: SocketAddr,
}

const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_TCP: u8 = 2;
const RESPONSE_BIT: u8 = 128;
const RETRY_SCHEDULE_MS: [u64; 4] = [250, 500, 1000, 2000];

impl NatPmpMapper {
    /// Talk to `gateway` on the standard NAT-PMP port.
    pub fn new(gateway: IpAddr) -> Self {
        Self::with_address(SocketAddr::new(gateway, NAT_PMP_PORT))
    }

    /// Talk to an explicit gateway socket address.
    pub fn with_address(gateway: SocketAddr) -> Self {
        Self { gateway }
    }

    /// Gateway from config, or the `.1` address of the local IPv4 subnet.
    pub fn from_config(config: &NatConfig, local_ip: Option<IpAddr>) -> Result<Self, NatError> {
        if let Some(gateway) = &config.gateway {
            let ip = gateway
                .parse::<IpAddr>()
                .map_err(|e| NatError::Protocol(format!("bad gateway address {gateway}: {e}")))?;
            return Ok(Self::new(ip));
        }
        match local_ip {
            Some(IpAddr::V4(v4)) if !v4.is_loopback() && !v4.is_unspecified() => {
                let [a, b, c, _] = v4.octets();
                Ok(Self::new(IpAddr::V4(Ipv4Addr::new(a, b, c, 1))))
            }
            _ => Err(NatError::NoGateway),
        }
    }

    async fn request(&self, packet: &[u8], opcode: u8, reply_len: usize) -> Result<Vec<u8>, NatError> {
        let bind: SocketAddr = if self.gateway.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.gateway).await?;

        let mut buf = [0u8; 16];
        for wait in RETRY_SCHEDULE_MS {
            socket.send(packet).await?;
            match tokio::time::timeout(Duration::from_millis(wait), socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let reply = &buf[..n];
                    if n < 4 || reply[0] != 0 || reply[1] != (RESPONSE_BIT | opcode) {
                        return Err(NatError::Protocol(format!("unexpected reply header {:02x?}", &reply[..n.min(4)])));
                    }
                    let result = u16::from_be_bytes([reply[2], reply[3]]);
                    if result != 0 {
                        return Err(NatError::Refused(result));
                    }
                    if n < reply_len {
                        return Err(NatError::Protocol(format!("short reply: {n} bytes")));
                    }
                    return Ok(reply.to_vec());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            }
        }
        Err(NatError::NoReply)
    }

    async fn external_ip(&self) -> Result<Ipv4Addr, NatError> {
        let reply = self.request(&[0, OP_EXTERNAL_ADDRESS], OP_EXTERNAL_ADDRESS, 12).await?;
        Ok(Ipv4Addr::new(reply[8], reply[9], reply[10], reply[11]))
    }

    async fn map(&self, internal_port: u16, lifetime_secs: u32) -> Result<(u16, u32), NatError> {
        let mut packet = [0u8; 12];
        packet[1] = OP_MAP_TCP;
        packet[4..6].copy_from_slice(&internal_port.to_be_bytes());
        let suggested = if lifetime_secs == 0 { 0 } else { internal_port };
        packet[6..8].copy_from_slice(&suggested.to_be_bytes());
        packet[8..12].copy_from_slice(&lifetime_secs.to_be_bytes());

        let reply = self.request(&packet, OP_MAP_TCP, 16).await?;
        let external_port = u16::from_be_bytes([reply[10], reply[11]]);
        let lifetime = u32::from_be_bytes([reply[12], reply[13], reply[14], reply[15]]);
        Ok((external_port, lifetime))
    }
}

#[async_trait]
impl PortMapper for NatPmpMapper {
    async fn map_tcp(&self, internal_port: u16, lease: Duration) -> Result<PortMapping, NatError> {
        let ip = self.external_ip().await?;
        let requested = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);
        let (port, granted) = self.map(internal_port, requested).await?;
        Ok(PortMapping {
            external: Endpoint::tcp(ip.to_string(), port),
            lease: Duration::from_secs(granted as u64),
        })
    }

    async fn unmap_tcp(&self, internal_port: u16) -> Result<(), NatError> {
        self.map(internal_port, 0).await.map(|_| ())
    }
}

/// Driver timings.
#[derive(Debug, Clone)]
pub struct NatSettings {
    /// Local port to map.
    pub internal_port: u16,
    /// Bound on one mapping request.
    pub mapping_timeout: Duration,
    /// Lease to request.
    pub lease: Duration,
    /// Bound on one reachability check.
    pub reachability_timeout: Duration,
    /// Delay before retrying traversal from `RelayOnly`.
    pub retry_interval: Duration,
}

impl NatSettings {
    /// Timings from config for the given listening port.
    pub fn from_config(config: &NatConfig, internal_port: u16) -> Self {
        Self {
            internal_port,
            mapping_timeout: Duration::from_secs(config.mapping_timeout_secs),
            lease: Duration::from_secs(config.lease_secs),
            reachability_timeout: Duration::from_secs(config.reachability_timeout_secs),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
        }
    }
}

/// Runs the NAT state machine.
pub struct NatTraversal {
    mapper: Arc<dyn PortMapper>,
    check: Option<Arc<dyn ReachabilityCheck>>,
    book: Arc<Mutex<AddressBook>>,
    settings: NatSettings,
    state: watch::Sender<NatState>,
    history: Arc<StdMutex<Vec<NatState>>>,
}

/// Handle to a running [`NatTraversal`].
#[derive(Debug)]
pub struct NatHandle {
    state: watch::Receiver<NatState>,
    history: Arc<StdMutex<Vec<NatState>>>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl NatHandle {
    /// Current state.
    pub fn state(&self) -> NatState {
        self.state.borrow().clone()
    }

    /// A receiver that follows state changes.
    pub fn subscribe(&self) -> watch::Receiver<NatState> {
        self.state.clone()
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> Vec<NatState> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Withdraw mappings and stop the driver.
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "nat driver ended abnormally");
        }
    }
}

impl NatTraversal {
    /// Create a driver publishing into `state`.
    pub fn new(
        mapper: Arc<dyn PortMapper>,
        check: Option<Arc<dyn ReachabilityCheck>>,
        book: Arc<Mutex<AddressBook>>,
        settings: NatSettings,
        state: watch::Sender<NatState>,
    ) -> Self {
        Self {
            mapper,
            check,
            book,
            settings,
            state,
            history: Arc::new(StdMutex::new(vec![NatState::Idle])),
        }
    }

    /// Start traversal in the background.
    pub fn spawn(self) -> NatHandle {
        let state = self.state.subscribe();
        let history = self.history.clone();
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(stop.clone()));
        NatHandle {
            state,
            history,
            stop,
            task,
        }
    }

    async fn run(self, stop: Arc<Notify>) {
        let mut state = NatState::Idle;
        let mut renew_at: Option<Instant> = None;
        let mut pending = VecDeque::from([NatEvent::Start]);

        loop {
            while let Some(event) = pending.pop_front() {
                let (next, actions) = state.clone().on_event(event);
                if next != state {
                    info!(from = state.label(), to = next.label(), "nat state changed");
                    self.history
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(next.clone());
                    self.state.send_replace(next.clone());
                }
                state = next;
                for action in actions {
                    self.execute(action, &mut renew_at, &mut pending).await;
                }
            }

            let retry_at = (state == NatState::RelayOnly).then(|| Instant::now() + self.settings.retry_interval);
            tokio::select! {
                _ = stop.notified() => {
                    let (next, actions) = state.clone().on_event(NatEvent::Stop);
                    for action in actions {
                        self.execute(action, &mut renew_at, &mut pending).await;
                    }
                    if let Err(e) = self.mapper.unmap_tcp(self.settings.internal_port).await {
                        debug!(error = %e, "port unmap failed");
                    }
                    info!(from = state.label(), "nat traversal stopped");
                    self.state.send_replace(next);
                    return;
                }
                _ = sleep_until(renew_at) => {
                    renew_at = None;
                    pending.push_back(NatEvent::RenewalDue);
                }
                _ = sleep_until(retry_at) => {
                    debug!("retrying nat traversal");
                    pending.push_back(NatEvent::Start);
                }
            }
        }
    }

    async fn execute(&self, action: NatAction, renew_at: &mut Option<Instant>, pending: &mut VecDeque<NatEvent>) {
        let now = unix_now();
        match action {
            NatAction::RequestMapping => {
                let port = self.settings.internal_port;
                let event = match tokio::time::timeout(
                    self.settings.mapping_timeout,
                    self.mapper.map_tcp(port, self.settings.lease),
                )
                .await
                {
                    Ok(Ok(mapping)) => NatEvent::MappingSucceeded {
                        external: mapping.external,
                        lease: mapping.lease,
                    },
                    Ok(Err(e)) => NatEvent::MappingFailed { reason: e.to_string() },
                    Err(_) => NatEvent::MappingTimedOut,
                };
                pending.push_back(event);
            }
            NatAction::RegisterExternal { endpoint, ttl } => {
                info!(endpoint = %endpoint, lease_secs = ttl.as_secs(), "registered mapped address");
                self.book
                    .lock()
                    .await
                    .register_external(AddressSource::Upnp, endpoint, ttl.as_secs(), now);
            }
            NatAction::WithdrawExternal => {
                let removed = self.book.lock().await.withdraw_external(AddressSource::Upnp);
                if removed > 0 {
                    info!(removed, "withdrew mapped addresses");
                }
                *renew_at = None;
            }
            NatAction::CheckReachability => {
                let observed = match &self.check {
                    Some(check) => tokio::time::timeout(
                        self.settings.reachability_timeout,
                        check.observe(self.settings.internal_port),
                    )
                    .await
                    .unwrap_or(None),
                    None => None,
                };
                pending.push_back(NatEvent::ReachabilityObserved { observed });
            }
            NatAction::RegisterRelayCandidate { endpoint } => {
                info!(endpoint = %endpoint, "registered relay candidate");
                let ttl = self.settings.retry_interval.as_secs().saturating_mul(2);
                self.book
                    .lock()
                    .await
                    .register_external(AddressSource::RegistryRelay, endpoint, ttl, now);
            }
            NatAction::ScheduleRenewal { after } => {
                debug!(after_secs = after.as_secs(), "scheduled mapping renewal");
                *renew_at = Some(Instant::now() + after);
            }
            NatAction::PreferRelay => {
                *renew_at = None;
                warn!("direct traversal unavailable, preferring relay candidates");
            }
            NatAction::PreferDirect => debug!("direct candidates enabled"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Scripted mapper for tests.
#[derive(Debug, Default)]
pub struct MockPortMapper {
    replies: StdMutex<VecDeque<MockReply>>,
    calls: StdMutex<Vec<u16>>,
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Grant this mapping.
    Grant(PortMapping),
    /// Refuse with `NatError::Refused(code)`.
    Refuse(u16),
    /// Never answer.
    Hang,
}

impl MockPortMapper {
    /// Answer requests with `replies` in order; refuse once exhausted.
    pub fn new(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: StdMutex::new(replies.into_iter().collect()),
            calls: StdMutex::new(Vec::new()),
        }
    }

    /// Number of mapping requests made.
    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl PortMapper for MockPortMapper {
    async fn map_tcp(&self, internal_port: u16, _lease: Duration) -> Result<PortMapping, NatError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(internal_port);
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(MockReply::Refuse(2));
        match reply {
            MockReply::Grant(mapping) => Ok(mapping),
            MockReply::Refuse(code) => Err(NatError::Refused(code)),
            MockReply::Hang => std::future::pending().await,
        }
    }

    async fn unmap_tcp(&self, _internal_port: u16) -> Result<(), NatError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_core::CandidatePolicy;

    struct FixedCheck(Option<Endpoint>);

    #[async_trait]
    impl ReachabilityCheck for FixedCheck {
        async fn observe(&self, _port: u16) -> Option<Endpoint> {
            self.0.clone()
        }
    }

    fn settings() -> NatSettings {
        NatSettings {
            internal_port: 8001,
            mapping_timeout: Duration::from_secs(5),
            lease: Duration::from_secs(7200),
            reachability_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(600),
        }
    }

    fn start(
        mapper: MockPortMapper,
        check: Option<Endpoint>,
    ) -> (NatHandle, Arc<Mutex<AddressBook>>, Arc<MockPortMapper>) {
        let book = Arc::new(Mutex::new(AddressBook::new()));
        let mapper = Arc::new(mapper);
        let (tx, _) = watch::channel(NatState::Idle);
        let check: Option<Arc<dyn ReachabilityCheck>> = Some(Arc::new(FixedCheck(check)));
        let handle = NatTraversal::new(mapper.clone(), check, book.clone(), settings(), tx).spawn();
        (handle, book, mapper)
    }

    async fn wait_for(handle: &NatHandle, target: fn(&NatState) -> bool) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| target(s)))
            .await
            .expect("state not reached")
            .expect("driver gone");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_gateway_falls_back_to_relay_within_timeout() {
        let started = Instant::now();
        let (handle, book, _) = start(
            MockPortMapper::new([MockReply::Hang]),
            Some(Endpoint::tcp("198.51.100.7", 8001)),
        );

        wait_for(&handle, |s| *s == NatState::RelayOnly).await;
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert_eq!(
            handle.history(),
            vec![NatState::Idle, NatState::Probing, NatState::Unmapped, NatState::RelayOnly]
        );
        assert_eq!(handle.state().candidate_policy(), CandidatePolicy::RelayOnly);

        let own = book.lock().await.own_addresses(unix_now());
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].source, AddressSource::RegistryRelay);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn granted_mapping_is_registered_and_renewed() {
        let mapping = PortMapping {
            external: Endpoint::tcp("203.0.113.5", 40001),
            lease: Duration::from_secs(120),
        };
        let (handle, book, mapper) = start(
            MockPortMapper::new([MockReply::Grant(mapping.clone()), MockReply::Grant(mapping.clone())]),
            None,
        );

        wait_for(&handle, |s| matches!(s, NatState::Mapped { .. })).await;
        let own = book.lock().await.own_addresses(unix_now());
        assert_eq!(own[0].endpoint, mapping.external);
        assert_eq!(own[0].source, AddressSource::Upnp);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(mapper.calls(), 2);
        assert!(matches!(handle.state(), NatState::Mapped { .. }));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_demotes_and_withdraws() {
        let mapping = PortMapping {
            external: Endpoint::tcp("203.0.113.5", 40001),
            lease: Duration::from_secs(60),
        };
        let (handle, book, _) = start(
            MockPortMapper::new([MockReply::Grant(mapping), MockReply::Refuse(3)]),
            None,
        );

        wait_for(&handle, |s| matches!(s, NatState::Mapped { .. })).await;
        wait_for(&handle, |s| *s == NatState::RelayOnly).await;
        assert!(book.lock().await.own_addresses(unix_now()).is_empty());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_to_idle() {
        let (handle, _, _) = start(MockPortMapper::new([MockReply::Refuse(2)]), None);
        wait_for(&handle, |s| *s == NatState::RelayOnly).await;
        let rx = handle.subscribe();
        handle.stop().await;
        assert_eq!(*rx.borrow(), NatState::Idle);
    }

    #[tokio::test]
    async fn nat_pmp_round_trip_against_fake_gateway() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            for _ in 0..2 {
                let (n, from) = gateway.recv_from(&mut buf).await.unwrap();
                let reply: Vec<u8> = match buf[1] {
                    OP_EXTERNAL_ADDRESS => {
                        assert_eq!(n, 2);
                        vec![0, 128, 0, 0, 0, 0, 0, 1, 203, 0, 113, 9]
                    }
                    OP_MAP_TCP => {
                        assert_eq!(n, 12);
                        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 8001);
                        let mut r = vec![0, 130, 0, 0, 0, 0, 0, 1];
                        r.extend_from_slice(&8001u16.to_be_bytes());
                        r.extend_from_slice(&40123u16.to_be_bytes());
                        r.extend_from_slice(&3600u32.to_be_bytes());
                        r
                    }
                    other => panic!("unexpected opcode {other}"),
                };
                gateway.send_to(&reply, from).await.unwrap();
            }
        });

        let mapping = NatPmpMapper::with_address(addr)
            .map_tcp(8001, Duration::from_secs(7200))
            .await
            .unwrap();
        assert_eq!(mapping.external, Endpoint::tcp("203.0.113.9", 40123));
        assert_eq!(mapping.lease, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn nat_pmp_error_code_is_refusal() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (_, from) = gateway.recv_from(&mut buf).await.unwrap();
            gateway
                .send_to(&[0, 128, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0], from)
                .await
                .unwrap();
        });

        let err = NatPmpMapper::with_address(addr)
            .map_tcp(8001, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::Refused(3)));
    }

    #[test]
    fn gateway_guess_uses_dot_one() {
        let config = NatConfig::default();
        let mapper = NatPmpMapper::from_config(&config, Some("192.168.4.23".parse().unwrap())).unwrap();
        assert_eq!(mapper.gateway, "192.168.4.1:5351".parse().unwrap());
        assert!(matches!(
            NatPmpMapper::from_config(&config, Some("127.0.0.1".parse().unwrap())),
            Err(NatError::NoGateway)
        ));
    }
}
