//! Protocol-level types shared by the codec, the engine and the dispatcher.
//!
//! The transport core never interprets message bodies. It needs a correlation id,
//! credit fields, a status code and a classification for each frame, and
//! it routes server-initiated break notifications by their 16-byte key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier linking a request to its response (the SMB2 message id).
pub type CorrelationId = u64;

/// Message id the server uses for unsolicited notifications.
pub const UNSOLICITED_MESSAGE_ID: CorrelationId = u64::MAX;

/// SMB2 header size in bytes.
pub const SMB2_HEADER_SIZE: usize = 64;

/// SMB2 protocol magic: 0xFE 'S' 'M' 'B'.
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// SMB2 command codes the core needs to recognize.
pub mod command {
    /// NEGOTIATE
    pub const NEGOTIATE: u16 = 0x0000;
    /// SESSION_SETUP
    pub const SESSION_SETUP: u16 = 0x0001;
    /// ECHO
    pub const ECHO: u16 = 0x000D;
    /// IOCTL
    pub const IOCTL: u16 = 0x000B;
    /// CHANGE_NOTIFY
    pub const CHANGE_NOTIFY: u16 = 0x000F;
    /// OPLOCK_BREAK (also carries lease breaks)
    pub const OPLOCK_BREAK: u16 = 0x0012;
}

/// NT status codes the core reacts to.
pub mod status {
    /// STATUS_SUCCESS
    pub const SUCCESS: u32 = 0x0000_0000;
    /// STATUS_PENDING, sent in interim async responses.
    pub const PENDING: u32 = 0x0000_0103;
    /// STATUS_NOT_SUPPORTED
    pub const NOT_SUPPORTED: u32 = 0xC000_00BB;
}

/// SMB2 header flag bits.
pub mod flags {
    /// Frame is a server response.
    pub const SERVER_TO_REDIR: u32 = 0x0000_0001;
    /// Header carries an async id instead of a tree id.
    pub const ASYNC_COMMAND: u32 = 0x0000_0002;
    /// Frame is signed.
    pub const SIGNED: u32 = 0x0000_0008;
}

/// Opaque 16-byte key correlating cached resource state with break notifications.
///
/// For lease breaks this is the lease key; for oplock breaks it is the file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(pub [u8; 16]);

impl ResourceKey {
    /// Creates a key from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Reads a key from the first 16 bytes of `buf`.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = buf.get(..16)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// How the receive loop should treat a frame whose id has no pending waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameClass {
    /// Correlated response to a client request.
    Response,
    /// Server-initiated control-plane message (lease/oplock break).
    Notification,
    /// Frame the codec cannot place; discarded with a log line.
    Unrecognized,
}

/// Kind of server-initiated notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Lease break, keyed by lease key.
    LeaseBreak,
    /// Oplock break, keyed by file id.
    OplockBreak,
    /// Any other server-initiated command.
    Other(u16),
}

/// A decoded out-of-band server notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Key of the resource the notification is about.
    pub key: ResourceKey,
    /// Notification kind.
    pub kind: NotificationKind,
    /// Lease epoch for lease breaks, zero otherwise.
    pub new_epoch: u16,
    /// Raw notification body.
    pub payload: Bytes,
}

/// Result of fully decoding one inbound frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Correlation id from the header.
    pub id: CorrelationId,
    /// Command code from the header.
    pub command: u16,
    /// Credits the matching request consumed.
    pub credit_charge: u16,
    /// Credits granted by the server with this frame.
    pub credits_granted: u16,
    /// NT status.
    pub status: u32,
    /// Frame classification.
    pub class: FrameClass,
    /// Interim async response; the final response follows later.
    pub interim: bool,
    /// Async id carried by an interim response.
    pub async_id: Option<u64>,
    /// Decoded notification, for notification frames.
    pub notification: Option<Notification>,
    /// Message body after the header.
    pub payload: Bytes,
}

/// A request ready to be encoded and sent.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// Correlation id; assigned by the engine when left empty.
    pub id: Option<CorrelationId>,
    /// Command code.
    pub command: u16,
    /// Credits this request consumes (at least 1).
    pub credit_charge: u16,
    /// Credits requested from the server; filled in by the engine.
    pub credits_requested: u16,
    /// Session id.
    pub session_id: u64,
    /// Tree id.
    pub tree_id: u32,
    /// Whether the codec should sign the frame.
    pub signed: bool,
    /// Encoded message body.
    pub body: Bytes,
}

impl OutgoingRequest {
    /// Creates a request with a credit charge of one and no session/tree binding.
    pub fn new(command: u16, body: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            command,
            credit_charge: 1,
            credits_requested: 0,
            session_id: 0,
            tree_id: 0,
            signed: false,
            body: body.into(),
        }
    }

    /// Sets an explicit correlation id.
    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the credit charge (clamped to at least one).
    pub fn with_credit_charge(mut self, charge: u16) -> Self {
        self.credit_charge = charge.max(1);
        self
    }

    /// Binds the request to a session.
    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    /// Requests signing.
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }
}

/// A resolved response handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Correlation id.
    pub id: CorrelationId,
    /// Command code.
    pub command: u16,
    /// NT status.
    pub status: u32,
    /// Credits granted with the response.
    pub credits_granted: u16,
    /// Message body.
    pub payload: Bytes,
}

impl Response {
    /// Whether the server reported success.
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }
}

impl From<DecodedFrame> for Response {
    fn from(frame: DecodedFrame) -> Self {
        Self {
            id: frame.id,
            command: frame.command,
            status: frame.status,
            credits_granted: frame.credits_granted,
            payload: frame.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_from_slice() {
        let buf: Vec<u8> = (0u8..20).collect();
        let key = ResourceKey::from_slice(&buf).unwrap();
        assert_eq!(key.as_bytes()[15], 15);
        assert!(ResourceKey::from_slice(&buf[..10]).is_none());
        assert_eq!(key.to_string().len(), 32);
    }

    #[test]
    fn test_request_builder() {
        let req = OutgoingRequest::new(command::ECHO, vec![4, 0, 0, 0])
            .with_id(9)
            .with_credit_charge(0)
            .with_session(0x77)
            .signed();
        assert_eq!(req.id, Some(9));
        assert_eq!(req.credit_charge, 1);
        assert_eq!(req.session_id, 0x77);
        assert!(req.signed);
    }
}
