//! In-memory network for testing.
//!
//! Listeners bind an [`Endpoint`] on a shared [`MemoryNetwork`]; a
//! [`MockDialer`] connects to them through `tokio::io::duplex` pipes.
//! Endpoints can be made to fail or stall, and every dial is recorded.

use super::{BoxStream, Dialer, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use peer_types::Endpoint;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared switchboard of in-memory listeners.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<Endpoint, mpsc::Sender<BoxStream>>>,
}

/// Accept side of an in-memory endpoint.
#[derive(Debug)]
pub struct MemoryListener {
    endpoint: Endpoint,
    incoming: mpsc::Receiver<BoxStream>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections at `endpoint`.
    pub fn bind(&self, endpoint: Endpoint) -> MemoryListener {
        let (tx, incoming) = mpsc::channel(16);
        self.listeners.insert(endpoint.clone(), tx);
        MemoryListener { endpoint, incoming }
    }

    /// A dialer attached to this network.
    pub fn dialer(&self) -> MockDialer {
        MockDialer {
            network: self.clone(),
            failing: Arc::new(DashMap::new()),
            stalled: Arc::new(DashMap::new()),
            dialed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MemoryListener {
    /// The bound endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for the next inbound stream. `None` once the network is dropped.
    pub async fn accept(&mut self) -> Option<BoxStream> {
        self.incoming.recv().await
    }
}

/// Dialer over a [`MemoryNetwork`] with failure injection.
#[derive(Debug, Clone)]
pub struct MockDialer {
    network: MemoryNetwork,
    failing: Arc<DashMap<Endpoint, String>>,
    stalled: Arc<DashMap<Endpoint, Duration>>,
    dialed: Arc<Mutex<Vec<Endpoint>>>,
}

impl MockDialer {
    /// Make every dial to `endpoint` fail with `error`.
    pub fn fail(&self, endpoint: Endpoint, error: &str) {
        self.failing.insert(endpoint, error.to_string());
    }

    /// Delay every dial to `endpoint` by `delay` before connecting.
    pub fn stall(&self, endpoint: Endpoint, delay: Duration) {
        self.stalled.insert(endpoint, delay);
    }

    /// Endpoints dialed so far, in order.
    pub fn dialed(&self) -> Vec<Endpoint> {
        self.dialed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxStream, TransportError> {
        self.dialed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.clone());

        if let Some(error) = self.failing.get(endpoint).map(|e| e.value().clone()) {
            return Err(TransportError::ConnectionFailed(error));
        }
        if let Some(delay) = self.stalled.get(endpoint).map(|d| *d.value()) {
            tokio::time::sleep(delay).await;
        }

        let listener = self
            .network
            .listeners
            .get(endpoint)
            .map(|l| l.value().clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("{endpoint}: connection refused")))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send(Box::new(remote))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{endpoint}: listener closed")))?;
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{read_frame, write_frame};

    #[tokio::test]
    async fn dial_reaches_bound_listener() {
        let net = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("10.0.0.1", 9999);
        let mut listener = net.bind(endpoint.clone());
        let dialer = net.dialer();

        let mut client = dialer.dial(&endpoint).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        write_frame(&mut client, b"hello").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(dialer.dialed(), vec![endpoint]);
    }

    #[tokio::test]
    async fn unbound_endpoint_is_refused() {
        let net = MemoryNetwork::new();
        let result = net.dialer().dial(&Endpoint::tcp("10.0.0.9", 1)).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn injected_failure_wins_over_listener() {
        let net = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("10.0.0.1", 9999);
        let _listener = net.bind(endpoint.clone());
        let dialer = net.dialer();
        dialer.fail(endpoint.clone(), "unreachable");

        match dialer.dial(&endpoint).await {
            Err(TransportError::ConnectionFailed(msg)) => assert_eq!(msg, "unreachable"),
            other => panic!("expected failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_endpoint_delays_dial() {
        let net = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("10.0.0.1", 9999);
        let _listener = net.bind(endpoint.clone());
        let dialer = net.dialer();
        dialer.stall(endpoint.clone(), Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        dialer.dial(&endpoint).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
