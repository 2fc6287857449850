//! Physical connection abstraction.
//!
//! A [`Connection`] moves whole protocol frames over one transport. The TCP
//! and SMB Direct variants both implement it, so the engine never knows
//! which one it drives. A [`Connector`] opens connections.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

const STATE_IDLE: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_ESTABLISHED: u8 = 2;
const STATE_CLOSING: u8 = 3;
const STATE_CLOSED: u8 = 4;
const STATE_ERROR: u8 = 5;

/// Lifecycle of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    /// Not yet opened.
    #[default]
    Idle,
    /// Transport handshake in progress.
    Connecting,
    /// Ready to carry frames.
    Established,
    /// Orderly shutdown in progress.
    Closing,
    /// Shut down.
    Closed,
    /// Failed; unusable.
    Error,
}

impl From<u8> for ConnectionState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_CONNECTING => ConnectionState::Connecting,
            STATE_ESTABLISHED => ConnectionState::Established,
            STATE_CLOSING => ConnectionState::Closing,
            STATE_CLOSED => ConnectionState::Closed,
            STATE_ERROR => ConnectionState::Error,
            _ => ConnectionState::Idle,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => STATE_IDLE,
            ConnectionState::Connecting => STATE_CONNECTING,
            ConnectionState::Established => STATE_ESTABLISHED,
            ConnectionState::Closing => STATE_CLOSING,
            ConnectionState::Closed => STATE_CLOSED,
            ConnectionState::Error => STATE_ERROR,
        }
    }
}

/// Atomically updated [`ConnectionState`].
#[derive(Debug, Default)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Creates a cell holding `state`.
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.into()))
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Unconditionally sets the state.
    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.into(), Ordering::Release);
    }

    /// Moves from `from` to `to`; fails if another thread got there first.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Closing` unless already closed or failed. Returns false if
    /// the connection was already past `Established`.
    pub fn begin_close(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match ConnectionState::from(raw) {
                    ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error => None,
                    _ => Some(STATE_CLOSING),
                }
            })
            .is_ok()
    }
}

/// What a transport variant can actually do, reported instead of failing silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TransportCapabilities {
    /// Frames travel over a real RDMA provider.
    pub rdma: bool,
    /// Bulk reads/writes avoid intermediate copies.
    pub zero_copy: bool,
    /// RDMA framing runs over a reliable byte stream.
    pub emulated: bool,
}

impl TransportCapabilities {
    /// Plain stream socket.
    pub const STREAM: Self = Self { rdma: false, zero_copy: false, emulated: false };
}

/// An established connection carrying whole frames.
///
/// `send` and `recv` may run concurrently: the receive loop owns the read
/// side while callers write.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Writes one frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Reads the next frame; `None` on orderly end of stream.
    ///
    /// Must be cancel safe: dropping the future loses no buffered bytes.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Remote address.
    fn peer_addr(&self) -> SocketAddr;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// Capabilities of this transport.
    fn capabilities(&self) -> TransportCapabilities;

    /// Lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Releases the transport. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Opens connections of one transport variant.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to `remote`, optionally from the local address `local`.
    async fn connect(
        &self,
        remote: SocketAddr,
        local: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Established,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Error,
        ] {
            assert_eq!(ConnectionState::from(u8::from(state)), state);
        }
        assert_eq!(ConnectionState::from(200), ConnectionState::Idle);
    }

    #[test]
    fn test_single_transition_wins() {
        let state = AtomicConnectionState::new(ConnectionState::Connecting);
        assert!(state.transition(ConnectionState::Connecting, ConnectionState::Established));
        assert!(!state.transition(ConnectionState::Connecting, ConnectionState::Established));
        assert_eq!(state.get(), ConnectionState::Established);
    }

    #[test]
    fn test_begin_close_once() {
        let state = AtomicConnectionState::new(ConnectionState::Established);
        assert!(state.begin_close());
        assert!(!state.begin_close());
        state.set(ConnectionState::Error);
        assert!(!state.begin_close());
    }
}
