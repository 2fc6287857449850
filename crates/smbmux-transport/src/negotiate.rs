//! Handshake run on a fresh connection before its receive loop starts.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info};

use crate::codec::{Codec, SigningContext};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::protocol::{command, status, OutgoingRequest};

/// SMB2 dialect revisions.
pub mod dialect {
    /// SMB 2.0.2
    pub const SMB_202: u16 = 0x0202;
    /// SMB 2.1
    pub const SMB_210: u16 = 0x0210;
    /// SMB 3.0
    pub const SMB_300: u16 = 0x0300;
    /// SMB 3.0.2
    pub const SMB_302: u16 = 0x0302;
    /// SMB 3.1.1
    pub const SMB_311: u16 = 0x0311;
}

/// Global capability bits advertised in NEGOTIATE.
pub mod capability {
    /// Distributed file system.
    pub const DFS: u32 = 0x0000_0001;
    /// Leasing.
    pub const LEASING: u32 = 0x0000_0002;
    /// Multi-credit operations.
    pub const LARGE_MTU: u32 = 0x0000_0004;
    /// Multi-channel sessions.
    pub const MULTI_CHANNEL: u32 = 0x0000_0008;
    /// Persistent handles.
    pub const PERSISTENT_HANDLES: u32 = 0x0000_0010;
    /// Directory leasing.
    pub const DIRECTORY_LEASING: u32 = 0x0000_0020;
    /// Encryption.
    pub const ENCRYPTION: u32 = 0x0000_0040;
}

const NEGOTIATE_REQUEST_STRUCTURE_SIZE: u16 = 36;
const NEGOTIATE_RESPONSE_MIN_BODY: usize = 40;
const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;
const HASH_SHA512: u16 = 0x0001;
const SECURITY_SIGNING_ENABLED: u16 = 0x0001;

/// Parameters agreed during the handshake.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NegotiatedSession {
    /// Selected dialect, zero if the negotiator does not pick one.
    pub dialect: u16,
    /// Credits granted by the handshake.
    pub initial_credits: u32,
    /// Server capability bits.
    pub server_capabilities: u32,
    /// Largest transact payload.
    pub max_transact_size: u32,
    /// Largest read.
    pub max_read_size: u32,
    /// Largest write.
    pub max_write_size: u32,
    /// First message id available to regular requests.
    pub next_message_id: u64,
    /// Signing context established by the handshake, if any.
    #[serde(skip)]
    pub signing: Option<SigningContext>,
}

impl NegotiatedSession {
    /// Whether the server supports binding more channels to a session.
    pub fn supports_multi_channel(&self) -> bool {
        self.server_capabilities & capability::MULTI_CHANNEL != 0
    }
}

/// Runs the protocol handshake on a raw connection.
#[async_trait]
pub trait SessionNegotiator: Send + Sync + 'static {
    /// Negotiates over `conn`, which has no receive loop yet.
    async fn negotiate(&self, conn: &dyn Connection, codec: &dyn Codec) -> Result<NegotiatedSession>;
}

/// Skips the handshake and returns a fixed session.
#[derive(Debug, Clone, Default)]
pub struct StaticNegotiator {
    session: NegotiatedSession,
}

impl StaticNegotiator {
    /// Returns `session` for every connection.
    pub fn new(session: NegotiatedSession) -> Self {
        Self { session }
    }

    /// Seeds credits from the configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(NegotiatedSession {
            initial_credits: config.initial_credits,
            ..Default::default()
        })
    }
}

#[async_trait]
impl SessionNegotiator for StaticNegotiator {
    async fn negotiate(&self, _conn: &dyn Connection, _codec: &dyn Codec) -> Result<NegotiatedSession> {
        Ok(self.session.clone())
    }
}

/// Sends an SMB2 NEGOTIATE and reads the server's reply.
#[derive(Debug, Clone)]
pub struct Smb2Negotiator {
    dialects: Vec<u16>,
    capabilities: u32,
    client_guid: [u8; 16],
    credits_requested: u16,
}

impl Default for Smb2Negotiator {
    fn default() -> Self {
        Self::new(vec![
            dialect::SMB_202,
            dialect::SMB_210,
            dialect::SMB_300,
            dialect::SMB_302,
            dialect::SMB_311,
        ])
    }
}

impl Smb2Negotiator {
    /// Offers `dialects` with a random client GUID.
    pub fn new(dialects: Vec<u16>) -> Self {
        Self {
            dialects,
            capabilities: capability::LEASING
                | capability::LARGE_MTU
                | capability::MULTI_CHANNEL
                | capability::DIRECTORY_LEASING,
            client_guid: *uuid::Uuid::new_v4().as_bytes(),
            credits_requested: 512,
        }
    }

    /// Overrides the advertised client capabilities.
    pub fn with_capabilities(mut self, capabilities: u32) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Credits requested with the NEGOTIATE.
    pub fn with_credits_requested(mut self, credits: u16) -> Self {
        self.credits_requested = credits.max(1);
        self
    }

    /// Encodes the NEGOTIATE request body.
    pub fn request_body(&self) -> Bytes {
        let with_contexts = self.dialects.contains(&dialect::SMB_311);
        let mut body = Vec::with_capacity(128);
        body.put_u16_le(NEGOTIATE_REQUEST_STRUCTURE_SIZE);
        body.put_u16_le(self.dialects.len() as u16);
        body.put_u16_le(SECURITY_SIGNING_ENABLED);
        body.put_u16_le(0);
        body.put_u32_le(self.capabilities);
        body.put_slice(&self.client_guid);
        // NegotiateContextOffset/Count, patched below when contexts follow.
        let context_field = body.len();
        body.put_u64_le(0);
        for d in &self.dialects {
            body.put_u16_le(*d);
        }
        if with_contexts {
            // Contexts start 8-byte aligned relative to the SMB2 header.
            while (crate::protocol::SMB2_HEADER_SIZE + body.len()) % 8 != 0 {
                body.put_u8(0);
            }
            let offset = (crate::protocol::SMB2_HEADER_SIZE + body.len()) as u32;
            let mut salt = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut salt);
            body.put_u16_le(PREAUTH_INTEGRITY_CAPABILITIES);
            body.put_u16_le(6 + salt.len() as u16);
            body.put_u32_le(0);
            body.put_u16_le(1);
            body.put_u16_le(salt.len() as u16);
            body.put_u16_le(HASH_SHA512);
            body.put_slice(&salt);
            body[context_field..context_field + 4].copy_from_slice(&offset.to_le_bytes());
            body[context_field + 4..context_field + 6].copy_from_slice(&1u16.to_le_bytes());
        }
        Bytes::from(body)
    }
}

/// Fields of a NEGOTIATE response body the transport needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateResponseBody {
    /// Selected dialect.
    pub dialect: u16,
    /// Server capabilities.
    pub capabilities: u32,
    /// Largest transact payload.
    pub max_transact_size: u32,
    /// Largest read.
    pub max_read_size: u32,
    /// Largest write.
    pub max_write_size: u32,
}

impl NegotiateResponseBody {
    /// Parses the fixed part of a NEGOTIATE response body.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < NEGOTIATE_RESPONSE_MIN_BODY {
            return None;
        }
        let mut b = &body[4..];
        let dialect = b.get_u16_le();
        let mut b = &body[24..];
        Some(Self {
            dialect,
            capabilities: b.get_u32_le(),
            max_transact_size: b.get_u32_le(),
            max_read_size: b.get_u32_le(),
            max_write_size: b.get_u32_le(),
        })
    }
}

#[async_trait]
impl SessionNegotiator for Smb2Negotiator {
    async fn negotiate(&self, conn: &dyn Connection, codec: &dyn Codec) -> Result<NegotiatedSession> {
        if self.dialects.is_empty() {
            return Err(TransportError::Negotiation { reason: "no dialects offered".into() });
        }
        let mut request = OutgoingRequest::new(command::NEGOTIATE, self.request_body()).with_id(0);
        request.credits_requested = self.credits_requested;
        let frame = codec.encode(&request, None)?;
        conn.send(&frame).await?;

        let raw = loop {
            let raw = conn.recv().await?.ok_or_else(|| TransportError::Disconnected {
                reason: "connection closed during negotiate".into(),
            })?;
            match codec.peek_correlation_id(&raw) {
                Some(0) => break raw,
                other => debug!(id = ?other, "ignoring frame during negotiate"),
            }
        };
        let response = codec.decode(&raw)?;
        if response.command != command::NEGOTIATE || response.status != status::SUCCESS {
            return Err(TransportError::Negotiation {
                reason: format!(
                    "command 0x{:04x} status 0x{:08x}",
                    response.command, response.status
                ),
            });
        }
        let body = NegotiateResponseBody::decode(&response.payload).ok_or_else(|| {
            TransportError::Negotiation {
                reason: format!("short negotiate response body ({} bytes)", response.payload.len()),
            }
        })?;
        if !self.dialects.contains(&body.dialect) {
            return Err(TransportError::Negotiation {
                reason: format!("server selected unoffered dialect 0x{:04x}", body.dialect),
            });
        }
        info!(
            dialect = format_args!("0x{:04x}", body.dialect),
            credits = response.credits_granted,
            capabilities = format_args!("0x{:08x}", body.capabilities),
            "negotiated"
        );
        Ok(NegotiatedSession {
            dialect: body.dialect,
            initial_credits: u32::from(response.credits_granted.max(1)),
            server_capabilities: body.capabilities,
            max_transact_size: body.max_transact_size,
            max_read_size: body.max_read_size,
            max_write_size: body.max_write_size,
            next_message_id: 1,
            signing: None,
        })
    }
}

/// Builds a NEGOTIATE response body. Used by tests and loopback servers.
pub fn negotiate_response_body(dialect: u16, capabilities: u32, max_io: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(65);
    body.put_u16_le(65);
    body.put_u16_le(SECURITY_SIGNING_ENABLED);
    body.put_u16_le(dialect);
    body.put_u16_le(0);
    body.put_slice(&[0x11; 16]);
    body.put_u32_le(capabilities);
    body.put_u32_le(max_io);
    body.put_u32_le(max_io);
    body.put_u32_le(max_io);
    body.put_u64_le(0);
    body.put_u64_le(0);
    body.put_u16_le(0);
    body.put_u16_le(0);
    body.put_u32_le(0);
    body.put_u8(0);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_server_frame, Smb2Codec};
    use crate::tcp::StreamConnection;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn pair() -> (Arc<dyn Connection>, Arc<dyn Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:445".parse().unwrap();
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Arc::new(StreamConnection::new(ar, aw, addr, addr, 1 << 20)),
            Arc::new(StreamConnection::new(br, bw, addr, addr, 1 << 20)),
        )
    }

    #[test]
    fn test_request_body_layout() {
        let negotiator = Smb2Negotiator::new(vec![dialect::SMB_210, dialect::SMB_311]);
        let body = negotiator.request_body();
        assert_eq!(u16::from_le_bytes([body[0], body[1]]), 36);
        assert_eq!(u16::from_le_bytes([body[2], body[3]]), 2);
        let offset = u32::from_le_bytes([body[28], body[29], body[30], body[31]]) as usize;
        assert_eq!(offset % 8, 0);
        let ctx = offset - crate::protocol::SMB2_HEADER_SIZE;
        assert_eq!(u16::from_le_bytes([body[ctx], body[ctx + 1]]), PREAUTH_INTEGRITY_CAPABILITIES);
        assert_eq!(body.len(), ctx + 8 + 38);
    }

    #[test]
    fn test_request_body_without_contexts() {
        let body = Smb2Negotiator::new(vec![dialect::SMB_202]).request_body();
        assert_eq!(body.len(), 38);
    }

    #[tokio::test]
    async fn test_negotiate_exchange() {
        let (client, server) = pair();
        let codec = Smb2Codec::new();
        let server_task = tokio::spawn(async move {
            let raw = server.recv().await.unwrap().unwrap();
            assert_eq!(Smb2Codec::new().peek_correlation_id(&raw), Some(0));
            let body = negotiate_response_body(
                dialect::SMB_302,
                capability::MULTI_CHANNEL | capability::LEASING,
                8 << 20,
            );
            let frame = build_server_frame(command::NEGOTIATE, 0, status::SUCCESS, 64, None, &body);
            server.send(&frame).await.unwrap();
        });
        let session = Smb2Negotiator::default().negotiate(client.as_ref(), &codec).await.unwrap();
        server_task.await.unwrap();
        assert_eq!(session.dialect, dialect::SMB_302);
        assert_eq!(session.initial_credits, 64);
        assert_eq!(session.next_message_id, 1);
        assert_eq!(session.max_read_size, 8 << 20);
        assert!(session.supports_multi_channel());
    }

    #[tokio::test]
    async fn test_negotiate_rejects_error_status() {
        let (client, server) = pair();
        tokio::spawn(async move {
            let _ = server.recv().await.unwrap();
            let frame =
                build_server_frame(command::NEGOTIATE, 0, status::NOT_SUPPORTED, 1, None, &[0u8; 8]);
            server.send(&frame).await.unwrap();
        });
        let err = Smb2Negotiator::default()
            .negotiate(client.as_ref(), &Smb2Codec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Negotiation { .. }));
    }

    #[tokio::test]
    async fn test_static_negotiator() {
        let (client, _server) = pair();
        let mut config = TransportConfig::default();
        config.initial_credits = 8;
        let session = StaticNegotiator::from_config(&config)
            .negotiate(client.as_ref(), &Smb2Codec::new())
            .await
            .unwrap();
        assert_eq!(session.initial_credits, 8);
        assert!(!session.supports_multi_channel());
    }
}
