//! TCP transport with direct-TCP session framing.
//!
//! Every frame is preceded by a 4-byte header: a type byte (0x00 for a
//! session message) and a 24-bit big-endian length. Keep-alive headers
//! (type 0x85) carry no frame and are skipped.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;
use tokio::sync::Mutex;

use crate::config::TransportConfig;
use crate::connection::{
    AtomicConnectionState, Connection, ConnectionState, Connector, TransportCapabilities,
};
use crate::error::{Result, TransportError};

/// Session message type byte.
pub const SESSION_MESSAGE: u8 = 0x00;
/// Keep-alive type byte.
pub const SESSION_KEEP_ALIVE: u8 = 0x85;
/// Size of the session framing header.
pub const SESSION_HEADER_SIZE: usize = 4;
const MAX_SESSION_LENGTH: usize = 0x00FF_FFFF;

/// Prepends the session framing header to `frame`.
pub fn encode_session_frame(frame: &[u8]) -> Result<Bytes> {
    if frame.len() > MAX_SESSION_LENGTH {
        return Err(TransportError::FrameTooLarge {
            size: frame.len(),
            max_size: MAX_SESSION_LENGTH,
        });
    }
    let mut buf = BytesMut::with_capacity(SESSION_HEADER_SIZE + frame.len());
    buf.put_u8(SESSION_MESSAGE);
    buf.put_uint(frame.len() as u64, 3);
    buf.put_slice(frame);
    Ok(buf.freeze())
}

/// Splits one complete frame off the front of `buf`, skipping keep-alives.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn parse_session_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
    loop {
        if buf.len() < SESSION_HEADER_SIZE {
            return Ok(None);
        }
        let kind = buf[0];
        let len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
        match kind {
            SESSION_KEEP_ALIVE => {
                if buf.len() < SESSION_HEADER_SIZE + len {
                    return Ok(None);
                }
                buf.advance(SESSION_HEADER_SIZE + len);
                tracing::trace!("skipped keep-alive");
            }
            SESSION_MESSAGE => {
                if len > max_frame_size {
                    return Err(TransportError::FrameTooLarge { size: len, max_size: max_frame_size });
                }
                if buf.len() < SESSION_HEADER_SIZE + len {
                    buf.reserve(SESSION_HEADER_SIZE + len - buf.len());
                    return Ok(None);
                }
                buf.advance(SESSION_HEADER_SIZE);
                return Ok(Some(buf.split_to(len).freeze()));
            }
            other => {
                return Err(TransportError::InvalidFrame {
                    reason: format!("unexpected session packet type 0x{:02x}", other),
                });
            }
        }
    }
}

struct ReadHalf<R> {
    stream: R,
    buf: BytesMut,
}

/// A session-framed connection over any split byte stream.
pub struct StreamConnection<R, W> {
    read: Mutex<ReadHalf<R>>,
    write: Mutex<W>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    capabilities: TransportCapabilities,
    state: AtomicConnectionState,
    max_frame_size: usize,
}

/// A TCP connection.
pub type TcpConnection = StreamConnection<OwnedReadHalf, OwnedWriteHalf>;

impl<R, W> std::fmt::Debug for StreamConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state.get())
            .finish()
    }
}

impl<R, W> StreamConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps an already connected stream.
    pub fn new(read: R, write: W, peer_addr: SocketAddr, local_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            read: Mutex::new(ReadHalf { stream: read, buf: BytesMut::with_capacity(8 * 1024) }),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
            capabilities: TransportCapabilities::STREAM,
            state: AtomicConnectionState::new(ConnectionState::Established),
            max_frame_size,
        }
    }

    /// Overrides the reported capabilities.
    pub fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.get() {
            ConnectionState::Established => Ok(()),
            ConnectionState::Error => Err(TransportError::Disconnected {
                reason: "connection failed".into(),
            }),
            _ => Err(TransportError::NotConnected),
        }
    }
}

/// Marks the connection failed if a write is abandoned half way.
struct PartialWriteGuard<'a> {
    state: &'a AtomicConnectionState,
    armed: bool,
}

impl Drop for PartialWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.set(ConnectionState::Error);
        }
    }
}

#[async_trait]
impl<R, W> Connection for StreamConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max_size: self.max_frame_size,
            });
        }
        let encoded = encode_session_frame(frame)?;
        let mut write = self.write.lock().await;
        self.ensure_open()?;
        let mut guard = PartialWriteGuard { state: &self.state, armed: true };
        let result = async {
            write.write_all(&encoded).await?;
            write.flush().await
        }
        .await;
        if let Err(e) = result {
            // Framing may be broken; the guard marks the connection failed.
            return Err(e.into());
        }
        guard.armed = false;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut read = self.read.lock().await;
        let read = &mut *read;
        loop {
            if let Some(frame) = parse_session_frame(&mut read.buf, self.max_frame_size)? {
                return Ok(Some(frame));
            }
            let n = read.stream.read_buf(&mut read.buf).await?;
            if n == 0 {
                if read.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionReset);
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn close(&self) -> Result<()> {
        if !self.state.begin_close() {
            return Ok(());
        }
        let mut write = self.write.lock().await;
        let result = write.shutdown().await;
        self.state.set(ConnectionState::Closed);
        tracing::debug!(peer = %self.peer_addr, "connection closed");
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
    max_frame_size: usize,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl TcpConnector {
    /// Creates a connector using the socket settings in `config`.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            nodelay: config.nodelay,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Connects and returns the concrete connection type.
    pub async fn connect_tcp(
        &self,
        remote: SocketAddr,
        local: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<TcpConnection> {
        let socket = if remote.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        if let Some(ip) = local {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        let stream = tokio::time::timeout(timeout, socket.connect(remote))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: remote.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    TransportError::ConnectionRefused { addr: remote.to_string() }
                }
                _ => TransportError::from(e),
            })?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        tracing::debug!(%peer_addr, %local_addr, "TCP connected");
        let (read, write) = stream.into_split();
        Ok(StreamConnection::new(read, write, peer_addr, local_addr, self.max_frame_size))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        remote: SocketAddr,
        local: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>> {
        let conn = self.connect_tcp(remote, local, timeout).await?;
        Ok(Arc::new(conn))
    }
}
