//! Codec boundary and the SMB2 header codec.
//!
//! The engine only talks to a [`Codec`]: it peeks the correlation id of a raw
//! frame, fully decodes frames that have a waiter (or are notifications), and
//! encodes outgoing requests. Message bodies stay opaque.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, TransportError};
use crate::protocol::{
    command, flags, status, CorrelationId, DecodedFrame, FrameClass, Notification,
    NotificationKind, OutgoingRequest, ResourceKey, SMB2_HEADER_SIZE, SMB2_MAGIC,
    UNSOLICITED_MESSAGE_ID,
};

/// Oplock break notification body size.
const OPLOCK_BREAK_BODY_SIZE: usize = 24;
/// Lease break notification body size.
const LEASE_BREAK_BODY_SIZE: usize = 44;
/// Offset of the 16-byte signature in the SMB2 header.
const SIGNATURE_OFFSET: usize = 48;

/// Opaque per-session signing/encryption material.
///
/// Produced by the authentication layer, passed through to the codec, never
/// inspected by the transport core.
#[derive(Clone)]
pub struct SigningContext {
    key: Bytes,
    session_id: u64,
}

impl SigningContext {
    /// Creates a signing context for a session.
    pub fn new(session_id: u64, key: impl Into<Bytes>) -> Self {
        Self { key: key.into(), session_id }
    }

    /// Session the key belongs to.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Raw key material.
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for SigningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningContext")
            .field("session_id", &self.session_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Encode/decode boundary between the transport core and message bodies.
pub trait Codec: Send + Sync + 'static {
    /// Returns the correlation id of a raw frame without consuming it, or `None`
    /// when the frame carries no recognizable header.
    fn peek_correlation_id(&self, frame: &[u8]) -> Option<CorrelationId>;

    /// Fully decodes a raw frame.
    fn decode(&self, frame: &[u8]) -> Result<DecodedFrame>;

    /// Encodes a request, signing it with `signing` when requested.
    fn encode(&self, request: &OutgoingRequest, signing: Option<&SigningContext>) -> Result<Bytes>;
}

/// Codec for SMB2 message headers (MS-SMB2 2.2.1).
///
/// Bodies pass through untouched, except for OPLOCK_BREAK notifications whose
/// resource key is extracted for routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Smb2Codec;

impl Smb2Codec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }

    fn compute_signature(key: &[u8], frame: &[u8]) -> Result<[u8; 16]> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| TransportError::InvalidFrame {
            reason: format!("bad signing key: {}", e),
        })?;
        mac.update(&frame[..SIGNATURE_OFFSET]);
        mac.update(&[0u8; 16]);
        mac.update(&frame[SMB2_HEADER_SIZE..]);
        let digest = mac.finalize().into_bytes();
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&digest[..16]);
        Ok(signature)
    }

    /// Verifies the signature of a signed frame against `signing`.
    pub fn verify(&self, frame: &[u8], signing: &SigningContext) -> Result<bool> {
        if frame.len() < SMB2_HEADER_SIZE {
            return Ok(false);
        }
        let expected = Self::compute_signature(signing.key(), frame)?;
        Ok(frame[SIGNATURE_OFFSET..SMB2_HEADER_SIZE] == expected)
    }

    fn decode_notification(cmd: u16, body: &Bytes) -> Option<Notification> {
        if cmd != command::OPLOCK_BREAK {
            return None;
        }
        match body.len() {
            OPLOCK_BREAK_BODY_SIZE => Some(Notification {
                key: ResourceKey::from_slice(&body[8..24])?,
                kind: NotificationKind::OplockBreak,
                new_epoch: 0,
                payload: body.clone(),
            }),
            n if n >= LEASE_BREAK_BODY_SIZE => Some(Notification {
                key: ResourceKey::from_slice(&body[8..24])?,
                kind: NotificationKind::LeaseBreak,
                new_epoch: u16::from_le_bytes([body[2], body[3]]),
                payload: body.clone(),
            }),
            _ => None,
        }
    }
}

impl Codec for Smb2Codec {
    fn peek_correlation_id(&self, frame: &[u8]) -> Option<CorrelationId> {
        if frame.len() < SMB2_HEADER_SIZE || frame[..4] != SMB2_MAGIC {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&frame[24..32]);
        Some(u64::from_le_bytes(id))
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedFrame> {
        if frame.len() < SMB2_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("frame of {} bytes is shorter than the SMB2 header", frame.len()),
            });
        }
        if frame[..4] != SMB2_MAGIC {
            return Err(TransportError::InvalidFrame { reason: "bad SMB2 magic".to_string() });
        }
        let mut hdr = &frame[4..SMB2_HEADER_SIZE];
        let structure_size = hdr.get_u16_le();
        if structure_size != SMB2_HEADER_SIZE as u16 {
            return Err(TransportError::InvalidFrame {
                reason: format!("header structure size {}", structure_size),
            });
        }
        let credit_charge = hdr.get_u16_le();
        let nt_status = hdr.get_u32_le();
        let cmd = hdr.get_u16_le();
        let credits_granted = hdr.get_u16_le();
        let header_flags = hdr.get_u32_le();
        let _next_command = hdr.get_u32_le();
        let id = hdr.get_u64_le();
        let async_id = if header_flags & flags::ASYNC_COMMAND != 0 {
            Some(hdr.get_u64_le())
        } else {
            None
        };

        let payload = Bytes::copy_from_slice(&frame[SMB2_HEADER_SIZE..]);
        let interim = async_id.is_some() && nt_status == status::PENDING;

        let (class, notification) = if id == UNSOLICITED_MESSAGE_ID {
            match Self::decode_notification(cmd, &payload) {
                Some(n) => (FrameClass::Notification, Some(n)),
                None => (FrameClass::Unrecognized, None),
            }
        } else if header_flags & flags::SERVER_TO_REDIR != 0 {
            (FrameClass::Response, None)
        } else {
            (FrameClass::Unrecognized, None)
        };

        Ok(DecodedFrame {
            id,
            command: cmd,
            credit_charge,
            credits_granted,
            status: nt_status,
            class,
            interim,
            async_id,
            notification,
            payload,
        })
    }

    fn encode(&self, request: &OutgoingRequest, signing: Option<&SigningContext>) -> Result<Bytes> {
        let id = request.id.ok_or_else(|| TransportError::InvalidFrame {
            reason: "request has no correlation id".to_string(),
        })?;
        let sign = request.signed && signing.is_some();
        let mut header_flags = 0u32;
        if sign {
            header_flags |= flags::SIGNED;
        }

        let mut buf = BytesMut::with_capacity(SMB2_HEADER_SIZE + request.body.len());
        buf.put_slice(&SMB2_MAGIC);
        buf.put_u16_le(SMB2_HEADER_SIZE as u16);
        buf.put_u16_le(request.credit_charge);
        buf.put_u32_le(0);
        buf.put_u16_le(request.command);
        buf.put_u16_le(request.credits_requested.max(1));
        buf.put_u32_le(header_flags);
        buf.put_u32_le(0);
        buf.put_u64_le(id);
        buf.put_u32_le(0xFEFF);
        buf.put_u32_le(request.tree_id);
        buf.put_u64_le(request.session_id);
        buf.put_slice(&[0u8; 16]);
        buf.put_slice(&request.body);

        if let (true, Some(ctx)) = (sign, signing) {
            let signature = Self::compute_signature(ctx.key(), &buf)?;
            buf[SIGNATURE_OFFSET..SMB2_HEADER_SIZE].copy_from_slice(&signature);
        }

        Ok(buf.freeze())
    }
}

/// Builds a raw SMB2 server frame. Used by tests and the loopback tooling.
pub fn build_server_frame(
    cmd: u16,
    id: CorrelationId,
    nt_status: u32,
    credits_granted: u16,
    async_id: Option<u64>,
    body: &[u8],
) -> Bytes {
    let mut header_flags = flags::SERVER_TO_REDIR;
    if async_id.is_some() {
        header_flags |= flags::ASYNC_COMMAND;
    }
    let mut buf = BytesMut::with_capacity(SMB2_HEADER_SIZE + body.len());
    buf.put_slice(&SMB2_MAGIC);
    buf.put_u16_le(SMB2_HEADER_SIZE as u16);
    buf.put_u16_le(1);
    buf.put_u32_le(nt_status);
    buf.put_u16_le(cmd);
    buf.put_u16_le(credits_granted);
    buf.put_u32_le(header_flags);
    buf.put_u32_le(0);
    buf.put_u64_le(id);
    match async_id {
        Some(a) => buf.put_u64_le(a),
        None => {
            buf.put_u32_le(0xFEFF);
            buf.put_u32_le(0);
        }
    }
    buf.put_u64_le(0);
    buf.put_slice(&[0u8; 16]);
    buf.put_slice(body);
    buf.freeze()
}

/// Builds a lease break notification body for `key`.
pub fn lease_break_body(key: ResourceKey, new_epoch: u16, new_state: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(LEASE_BREAK_BODY_SIZE);
    body.put_u16_le(LEASE_BREAK_BODY_SIZE as u16);
    body.put_u16_le(new_epoch);
    body.put_u32_le(0x01);
    body.put_slice(key.as_bytes());
    body.put_u32_le(0x07);
    body.put_u32_le(new_state);
    body.put_u32_le(0);
    body.put_u32_le(0);
    body.put_u32_le(0);
    body
}

/// Builds an oplock break notification body for the file id `key`.
pub fn oplock_break_body(key: ResourceKey, oplock_level: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(OPLOCK_BREAK_BODY_SIZE);
    body.put_u16_le(OPLOCK_BREAK_BODY_SIZE as u16);
    body.put_u8(oplock_level);
    body.put_u8(0);
    body.put_u32_le(0);
    body.put_slice(key.as_bytes());
    body
}
