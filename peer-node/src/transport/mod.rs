//! Transport abstraction for hearth peers.
//!
//! A [`Dialer`] turns an [`Endpoint`] into a byte stream; everything above it
//! speaks length-prefixed MessagePack frames:
//!
//! ```text
//! [len: u32 big-endian][WireMessage (msgpack, named fields)]
//! ```
//!
//! Implementations: [`TcpDialer`] for real sockets and [`MockDialer`] over an
//! in-memory [`MemoryNetwork`] for tests.

mod mock;
mod tcp;

pub use mock::{MemoryListener, MemoryNetwork, MockDialer};
pub use tcp::TcpDialer;

use async_trait::async_trait;
use peer_types::{Endpoint, WireError, WireMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("connection timeout")]
    Timeout,

    /// Frame length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// Frame did not decode into a wire message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    /// Underlying IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional byte stream to a peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed stream handed out by dialers and listeners.
pub type BoxStream = Box<dyn PeerStream>;

/// Opens outbound streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `endpoint`. Timeouts are applied by the caller.
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxStream, TransportError>;
}

/// Read one frame. `Ok(None)` on clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionClosed
        } else {
            e.into()
        }
    })?;
    Ok(Some(data))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Message-level view of a stream, used during the handshake.
pub struct FramedStream {
    inner: BoxStream,
}

impl FramedStream {
    /// Wrap a stream.
    pub fn new(inner: BoxStream) -> Self {
        Self { inner }
    }

    /// Encode and send one message.
    pub async fn send(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        write_frame(&mut self.inner, &message.to_bytes()?).await
    }

    /// Receive and decode one message.
    pub async fn recv(&mut self) -> Result<WireMessage, TransportError> {
        let frame = read_frame(&mut self.inner)
            .await?
            .ok_or(TransportError::ConnectionClosed)?;
        Ok(WireMessage::from_bytes(&frame)?)
    }

    /// Split into independent read and write halves for the session phase.
    pub fn into_split(self) -> (ReadHalf<BoxStream>, WriteHalf<BoxStream>) {
        tokio::io::split(self.inner)
    }
}

impl std::fmt::Debug for FramedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FramedStream")
    }
}
