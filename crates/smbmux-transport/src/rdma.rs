//! SMB Direct (RDMA) transport.
//!
//! No native RDMA provider is linked into this crate, so [`RdmaConnector`]
//! runs the SMB Direct protocol over a reliable stream when the caller allows
//! it. The resulting connection reports
//! `TransportCapabilities { rdma: false, zero_copy: false, emulated: true }`.
//! Without `allow_fallback` the connector refuses with
//! [`TransportError::RdmaNotAvailable`].

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionState, Connector, TransportCapabilities};
use crate::error::{Result, TransportError};
use crate::tcp::TcpConnector;

/// SMB Direct protocol version 1.0.
pub const SMBD_VERSION: u16 = 0x0100;
/// Size of the negotiate request.
pub const NEGOTIATE_REQUEST_SIZE: usize = 20;
/// Size of the negotiate response.
pub const NEGOTIATE_RESPONSE_SIZE: usize = 32;
/// Size of the data transfer header.
pub const DATA_TRANSFER_HEADER_SIZE: usize = 24;
/// Data transfer flag asking the peer to answer promptly (to grant credits).
pub const FLAG_RESPONSE_REQUESTED: u16 = 0x0001;

/// SMB Direct settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    /// RDMA device name (e.g., "mlx5_0").
    pub device: String,
    /// Run SMB Direct over a stream when no provider is present.
    pub allow_fallback: bool,
    /// Send credits asked of the peer.
    pub send_credit_target: u16,
    /// Receive credits granted to the peer.
    pub receive_credit_max: u16,
    /// Largest message this side prefers to send.
    pub preferred_send_size: u32,
    /// Largest message this side accepts.
    pub max_receive_size: u32,
    /// Largest reassembled upper-layer message.
    pub max_fragmented_size: u32,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            device: "mlx5_0".to_string(),
            allow_fallback: false,
            send_credit_target: 255,
            receive_credit_max: 255,
            preferred_send_size: 1364,
            max_receive_size: 8192,
            max_fragmented_size: 1024 * 1024,
        }
    }
}

/// SMB Direct negotiate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateRequest {
    /// Credits requested.
    pub credits_requested: u16,
    /// Preferred send size.
    pub preferred_send_size: u32,
    /// Max receive size.
    pub max_receive_size: u32,
    /// Max fragmented size.
    pub max_fragmented_size: u32,
}

impl NegotiateRequest {
    /// Encodes the 20-byte request.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NEGOTIATE_REQUEST_SIZE);
        buf.put_u16_le(SMBD_VERSION);
        buf.put_u16_le(SMBD_VERSION);
        buf.put_u16_le(0);
        buf.put_u16_le(self.credits_requested);
        buf.put_u32_le(self.preferred_send_size);
        buf.put_u32_le(self.max_receive_size);
        buf.put_u32_le(self.max_fragmented_size);
        buf.freeze()
    }

    /// Decodes a request; `None` if short or the version range excludes 1.0.
    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < NEGOTIATE_REQUEST_SIZE {
            return None;
        }
        let min = data.get_u16_le();
        let max = data.get_u16_le();
        if min > SMBD_VERSION || max < SMBD_VERSION {
            return None;
        }
        data.advance(2);
        Some(Self {
            credits_requested: data.get_u16_le(),
            preferred_send_size: data.get_u32_le(),
            max_receive_size: data.get_u32_le(),
            max_fragmented_size: data.get_u32_le(),
        })
    }
}

/// SMB Direct negotiate response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Negotiated protocol version.
    pub negotiated_version: u16,
    /// Credits the peer wants from us.
    pub credits_requested: u16,
    /// Send credits the peer grants us.
    pub credits_granted: u16,
    /// Zero on success.
    pub status: u32,
    /// Largest RDMA read/write.
    pub max_read_write_size: u32,
    /// Largest message the peer prefers to send.
    pub preferred_send_size: u32,
    /// Largest message the peer accepts.
    pub max_receive_size: u32,
    /// Largest reassembled message the peer accepts.
    pub max_fragmented_size: u32,
}

impl NegotiateResponse {
    /// Encodes the 32-byte response.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NEGOTIATE_RESPONSE_SIZE);
        buf.put_u16_le(SMBD_VERSION);
        buf.put_u16_le(SMBD_VERSION);
        buf.put_u16_le(self.negotiated_version);
        buf.put_u16_le(0);
        buf.put_u16_le(self.credits_requested);
        buf.put_u16_le(self.credits_granted);
        buf.put_u32_le(self.status);
        buf.put_u32_le(self.max_read_write_size);
        buf.put_u32_le(self.preferred_send_size);
        buf.put_u32_le(self.max_receive_size);
        buf.put_u32_le(self.max_fragmented_size);
        buf.freeze()
    }

    /// Decodes a response; `None` if short.
    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < NEGOTIATE_RESPONSE_SIZE {
            return None;
        }
        data.advance(4);
        let negotiated_version = data.get_u16_le();
        data.advance(2);
        Some(Self {
            negotiated_version,
            credits_requested: data.get_u16_le(),
            credits_granted: data.get_u16_le(),
            status: data.get_u32_le(),
            max_read_write_size: data.get_u32_le(),
            preferred_send_size: data.get_u32_le(),
            max_receive_size: data.get_u32_le(),
            max_fragmented_size: data.get_u32_le(),
        })
    }
}

/// Header preceding every SMB Direct data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataTransferHeader {
    /// Credits requested of the peer.
    pub credits_requested: u16,
    /// Credits granted to the peer.
    pub credits_granted: u16,
    /// Flags.
    pub flags: u16,
    /// Bytes of the upper-layer message still to come in later fragments.
    pub remaining_data_length: u32,
    /// Offset of the data from the start of the message.
    pub data_offset: u32,
    /// Length of the data in this message.
    pub data_length: u32,
}

impl DataTransferHeader {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.credits_requested);
        buf.put_u16_le(self.credits_granted);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(0);
        buf.put_u32_le(self.remaining_data_length);
        buf.put_u32_le(self.data_offset);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(0);
    }

    /// Decodes a header and returns it with the data it describes.
    pub fn decode(message: &Bytes) -> Result<(Self, Bytes)> {
        if message.len() < DATA_TRANSFER_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("SMB Direct message of {} bytes", message.len()),
            });
        }
        let mut h = &message[..DATA_TRANSFER_HEADER_SIZE];
        let credits_requested = h.get_u16_le();
        let credits_granted = h.get_u16_le();
        let flags = h.get_u16_le();
        h.advance(2);
        let header = Self {
            credits_requested,
            credits_granted,
            flags,
            remaining_data_length: h.get_u32_le(),
            data_offset: h.get_u32_le(),
            data_length: h.get_u32_le(),
        };
        if header.data_length == 0 {
            return Ok((header, Bytes::new()));
        }
        let start = header.data_offset as usize;
        let end = start.checked_add(header.data_length as usize);
        match end {
            Some(end) if start >= DATA_TRANSFER_HEADER_SIZE && end <= message.len() => {
                Ok((header, message.slice(start..end)))
            }
            _ => Err(TransportError::InvalidFrame {
                reason: "SMB Direct data outside message".into(),
            }),
        }
    }
}

struct Reassembly {
    buf: BytesMut,
}

/// SMB Direct connection over a message-carrying inner connection.
pub struct RdmaConnection {
    inner: Arc<dyn Connection>,
    capabilities: TransportCapabilities,
    send_credits: AtomicU32,
    credit_target: u16,
    receive_credits: u16,
    max_send_size: usize,
    max_fragmented_size: usize,
    send_lock: Mutex<()>,
    reassembly: Mutex<Reassembly>,
}

impl std::fmt::Debug for RdmaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaConnection")
            .field("peer_addr", &self.inner.peer_addr())
            .field("capabilities", &self.capabilities)
            .field("send_credits", &self.send_credits())
            .finish()
    }
}

impl RdmaConnection {
    /// Runs the SMB Direct negotiate exchange over `inner`.
    pub async fn negotiate(
        inner: Arc<dyn Connection>,
        config: &RdmaConfig,
        capabilities: TransportCapabilities,
    ) -> Result<Self> {
        let request = NegotiateRequest {
            credits_requested: config.send_credit_target,
            preferred_send_size: config.preferred_send_size,
            max_receive_size: config.max_receive_size,
            max_fragmented_size: config.max_fragmented_size,
        };
        inner.send(&request.encode()).await?;
        let raw = inner.recv().await?.ok_or(TransportError::ConnectionReset)?;
        let response = NegotiateResponse::decode(&raw).ok_or_else(|| TransportError::Negotiation {
            reason: format!("SMB Direct negotiate response of {} bytes", raw.len()),
        })?;
        if response.status != 0 {
            return Err(TransportError::Negotiation {
                reason: format!("SMB Direct negotiate status 0x{:08x}", response.status),
            });
        }
        if response.negotiated_version != SMBD_VERSION {
            return Err(TransportError::Negotiation {
                reason: format!("SMB Direct version 0x{:04x}", response.negotiated_version),
            });
        }
        if response.credits_granted == 0 {
            return Err(TransportError::Negotiation {
                reason: "SMB Direct peer granted no send credits".into(),
            });
        }
        let max_send_size = (config.preferred_send_size.min(response.max_receive_size) as usize)
            .max(DATA_TRANSFER_HEADER_SIZE + 1);
        debug!(
            credits = response.credits_granted,
            max_send_size,
            max_read_write = response.max_read_write_size,
            "SMB Direct negotiated"
        );
        Ok(Self {
            inner,
            capabilities,
            send_credits: AtomicU32::new(u32::from(response.credits_granted)),
            credit_target: config.send_credit_target,
            receive_credits: config.receive_credit_max.min(response.credits_requested.max(1)),
            max_send_size,
            max_fragmented_size: config.max_fragmented_size as usize,
            send_lock: Mutex::new(()),
            reassembly: Mutex::new(Reassembly { buf: BytesMut::new() }),
        })
    }

    /// Send credits currently granted by the peer.
    pub fn send_credits(&self) -> u32 {
        self.send_credits.load(Ordering::Acquire)
    }

    fn take_send_credit(&self) -> u32 {
        let before = self
            .send_credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if before == 0 {
            // A stream carrier has no posted receive buffers to overrun.
            debug!("sending without SMB Direct send credits");
        }
        before.saturating_sub(1)
    }
}

#[async_trait]
impl Connection for RdmaConnection {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_fragmented_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max_size: self.max_fragmented_size,
            });
        }
        let chunk = self.max_send_size - DATA_TRANSFER_HEADER_SIZE;
        // Fragments of one frame must be contiguous on the wire.
        let _sending = self.send_lock.lock().await;
        let mut offset = 0;
        loop {
            let len = chunk.min(frame.len() - offset);
            let remaining = frame.len() - offset - len;
            let left = self.take_send_credit();
            let header = DataTransferHeader {
                credits_requested: self.credit_target,
                credits_granted: self.receive_credits,
                flags: if left < 2 { FLAG_RESPONSE_REQUESTED } else { 0 },
                remaining_data_length: remaining as u32,
                data_offset: if len == 0 { 0 } else { DATA_TRANSFER_HEADER_SIZE as u32 },
                data_length: len as u32,
            };
            let mut buf = BytesMut::with_capacity(DATA_TRANSFER_HEADER_SIZE + len);
            header.put(&mut buf);
            buf.put_slice(&frame[offset..offset + len]);
            self.inner.send(&buf).await?;
            offset += len;
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut reassembly = self.reassembly.lock().await;
        loop {
            let Some(message) = self.inner.recv().await? else {
                if !reassembly.buf.is_empty() {
                    return Err(TransportError::ConnectionReset);
                }
                return Ok(None);
            };
            let (header, data) = DataTransferHeader::decode(&message)?;
            if header.credits_granted > 0 {
                self.send_credits
                    .fetch_add(u32::from(header.credits_granted), Ordering::AcqRel);
            }
            if data.is_empty() && header.remaining_data_length == 0 && reassembly.buf.is_empty() {
                // Credit-only message.
                continue;
            }
            if reassembly.buf.len() + data.len() > self.max_fragmented_size {
                warn!("SMB Direct reassembly exceeds max fragmented size");
                return Err(TransportError::FrameTooLarge {
                    size: reassembly.buf.len() + data.len(),
                    max_size: self.max_fragmented_size,
                });
            }
            if header.remaining_data_length == 0 {
                if reassembly.buf.is_empty() {
                    return Ok(Some(data));
                }
                reassembly.buf.put_slice(&data);
                return Ok(Some(reassembly.buf.split().freeze()));
            }
            reassembly.buf.put_slice(&data);
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Opens SMB Direct connections.
#[derive(Debug, Clone)]
pub struct RdmaConnector {
    config: RdmaConfig,
    stream: TcpConnector,
}

impl RdmaConnector {
    /// Creates a connector; `stream` carries the emulated transport.
    pub fn new(config: RdmaConfig, stream: TcpConnector) -> Self {
        Self { config, stream }
    }

    /// Whether a native RDMA provider is available on this host.
    pub fn is_available() -> bool {
        false
    }
}

#[async_trait]
impl Connector for RdmaConnector {
    async fn connect(
        &self,
        remote: SocketAddr,
        local: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>> {
        if !Self::is_available() && !self.config.allow_fallback {
            return Err(TransportError::RdmaNotAvailable {
                reason: format!("no RDMA provider for device {}", self.config.device),
            });
        }
        warn!(%remote, "no RDMA provider, running SMB Direct over TCP");
        let started = tokio::time::Instant::now();
        let inner: Arc<dyn Connection> =
            Arc::new(self.stream.connect_tcp(remote, local, timeout).await?);
        let capabilities = TransportCapabilities { rdma: false, zero_copy: false, emulated: true };
        let budget = timeout.saturating_sub(started.elapsed());
        let negotiated = tokio::time::timeout(
            budget,
            RdmaConnection::negotiate(inner.clone(), &self.config, capabilities),
        )
        .await;
        match negotiated {
            Ok(Ok(conn)) => Ok(Arc::new(conn)),
            Ok(Err(e)) => {
                let _ = inner.close().await;
                Err(e)
            }
            Err(_) => {
                let _ = inner.close().await;
                Err(TransportError::ConnectionTimeout {
                    addr: remote.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::StreamConnection;

    fn pair() -> (Arc<dyn Connection>, Arc<dyn Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:5445".parse().unwrap();
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Arc::new(StreamConnection::new(ar, aw, addr, addr, 1 << 20)),
            Arc::new(StreamConnection::new(br, bw, addr, addr, 1 << 20)),
        )
    }

    fn emulated() -> TransportCapabilities {
        TransportCapabilities { rdma: false, zero_copy: false, emulated: true }
    }

    async fn serve_negotiate(server: &Arc<dyn Connection>, status: u32, max_receive_size: u32) {
        let raw = server.recv().await.unwrap().unwrap();
        let request = NegotiateRequest::decode(&raw).unwrap();
        let response = NegotiateResponse {
            negotiated_version: SMBD_VERSION,
            credits_requested: 255,
            credits_granted: request.credits_requested,
            status,
            max_read_write_size: 1 << 20,
            preferred_send_size: 1364,
            max_receive_size,
            max_fragmented_size: 1 << 20,
        };
        server.send(&response.encode()).await.unwrap();
    }

    #[test]
    fn test_negotiate_sizes() {
        let req = NegotiateRequest {
            credits_requested: 10,
            preferred_send_size: 1364,
            max_receive_size: 8192,
            max_fragmented_size: 1 << 20,
        };
        assert_eq!(req.encode().len(), NEGOTIATE_REQUEST_SIZE);
        assert_eq!(NegotiateRequest::decode(&req.encode()), Some(req));
        assert!(NegotiateResponse::decode(&[0u8; 31]).is_none());
    }

    #[tokio::test]
    async fn test_negotiate_and_fragmented_exchange() {
        let (client, server) = pair();
        let negotiate = tokio::spawn({
            let server = server.clone();
            async move { serve_negotiate(&server, 0, 64).await }
        });
        let conn = RdmaConnection::negotiate(client, &RdmaConfig::default(), emulated())
            .await
            .unwrap();
        negotiate.await.unwrap();
        assert_eq!(conn.capabilities(), emulated());
        assert_eq!(conn.send_credits(), 255);

        // 100 bytes at 40 data bytes per message: three fragments.
        let payload: Vec<u8> = (0..100u8).collect();
        conn.send(&payload).await.unwrap();
        let mut got = Vec::new();
        for expected_remaining in [60u32, 20, 0] {
            let msg = server.recv().await.unwrap().unwrap();
            let (header, data) = DataTransferHeader::decode(&msg).unwrap();
            assert_eq!(header.remaining_data_length, expected_remaining);
            got.extend_from_slice(&data);
        }
        assert_eq!(got, payload);
        assert_eq!(conn.send_credits(), 252);
    }

    #[tokio::test]
    async fn test_concurrent_fragmented_sends_stay_contiguous() {
        let (client, server) = pair();
        let negotiate = tokio::spawn({
            let server = server.clone();
            async move { serve_negotiate(&server, 0, 64).await }
        });
        let conn = Arc::new(
            RdmaConnection::negotiate(client, &RdmaConfig::default(), emulated())
                .await
                .unwrap(),
        );
        negotiate.await.unwrap();

        for _ in 0..50 {
            let senders: Vec<_> = [0xAAu8, 0xBB]
                .into_iter()
                .map(|byte| {
                    let conn = conn.clone();
                    tokio::spawn(async move { conn.send(&[byte; 400]).await })
                })
                .collect();
            let mut messages = Vec::new();
            let mut current = Vec::new();
            while messages.len() < 2 {
                let msg = server.recv().await.unwrap().unwrap();
                let (header, data) = DataTransferHeader::decode(&msg).unwrap();
                current.extend_from_slice(&data);
                if header.remaining_data_length == 0 {
                    messages.push(std::mem::take(&mut current));
                }
            }
            for sender in senders {
                sender.await.unwrap().unwrap();
            }
            for message in messages {
                assert_eq!(message.len(), 400);
                assert!(message.iter().all(|b| *b == message[0]));
            }
        }
    }

    #[tokio::test]
    async fn test_recv_reassembles_and_skips_credit_only() {
        let (client, server) = pair();
        let negotiate = tokio::spawn({
            let server = server.clone();
            async move { serve_negotiate(&server, 0, 8192).await }
        });
        let conn = RdmaConnection::negotiate(client, &RdmaConfig::default(), emulated())
            .await
            .unwrap();
        negotiate.await.unwrap();

        let mut credit_only = BytesMut::new();
        DataTransferHeader { credits_granted: 5, ..Default::default() }.put(&mut credit_only);
        server.send(&credit_only).await.unwrap();
        for (part, remaining) in [(&b"hello "[..], 5u32), (&b"world"[..], 0)] {
            let mut msg = BytesMut::new();
            DataTransferHeader {
                remaining_data_length: remaining,
                data_offset: DATA_TRANSFER_HEADER_SIZE as u32,
                data_length: part.len() as u32,
                ..Default::default()
            }
            .put(&mut msg);
            msg.put_slice(part);
            server.send(&msg).await.unwrap();
        }
        assert_eq!(&conn.recv().await.unwrap().unwrap()[..], b"hello world");
        assert_eq!(conn.send_credits(), 260);
    }

    #[tokio::test]
    async fn test_negotiate_failure_status() {
        let (client, server) = pair();
        tokio::spawn(async move { serve_negotiate(&server, 1, 8192).await });
        let err = RdmaConnection::negotiate(client, &RdmaConfig::default(), emulated())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Negotiation { .. }));
    }

    #[tokio::test]
    async fn test_connector_requires_fallback() {
        let connector = RdmaConnector::new(RdmaConfig::default(), TcpConnector::default());
        let err = connector
            .connect("127.0.0.1:5445".parse().unwrap(), None, Duration::from_secs(1))
            .await
            .err()
            .expect("connect must fail without fallback");
        assert!(matches!(err, TransportError::RdmaNotAvailable { .. }));
    }
}
