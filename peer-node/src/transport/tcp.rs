//! TCP dialer.

use super::{BoxStream, Dialer, TransportError};
use async_trait::async_trait;
use peer_types::{Endpoint, Protocol};
use tokio::net::TcpStream;

/// Dials peers over plain TCP. Confidentiality comes from the session layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxStream, TransportError> {
        if endpoint.protocol != Protocol::Tcp {
            return Err(TransportError::ConnectionFailed(format!(
                "unsupported protocol {}",
                endpoint.protocol
            )));
        }
        let stream = TcpStream::connect(endpoint.socket_string())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{endpoint}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{read_frame, write_frame};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_frame(&mut socket).await.unwrap()
        });

        let mut stream = TcpDialer.dial(&Endpoint::tcp("127.0.0.1", port)).await.unwrap();
        write_frame(&mut stream, b"ping").await.unwrap();
        assert_eq!(server.await.unwrap(), Some(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn udp_endpoints_are_refused() {
        let endpoint = Endpoint::new(Protocol::Udp, "127.0.0.1", 9);
        assert!(matches!(
            TcpDialer.dial(&endpoint).await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
