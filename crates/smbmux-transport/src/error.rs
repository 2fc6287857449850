use std::sync::Arc;

use thiserror::Error;

use crate::protocol::CorrelationId;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("transport disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("correlation id {0} is already outstanding")]
    DuplicateCorrelation(CorrelationId),

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: CorrelationId, timeout_ms: u64 },

    #[error("insufficient credits: need {needed}, {available} available")]
    InsufficientCredits { needed: u16, available: u32 },

    #[error("no available channel")]
    NoAvailableChannel,

    #[error("multi-channel is disabled")]
    MultiChannelDisabled,

    #[error("channel binding failed for {channel}: {reason}")]
    ChannelBinding { channel: String, reason: String },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("RDMA not available: {reason}")]
    RdmaNotAvailable { reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

impl TransportError {
    /// True for request-level timeouts, which never indicate a broken connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::RequestTimeout { .. })
    }

    /// True when the failure affects the whole connection and should trigger failover.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionReset
                | TransportError::Disconnected { .. }
                | TransportError::Io(_)
        )
    }

    /// True when the caller may retry the operation, possibly on another channel.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected
                | TransportError::ConnectionRefused { .. }
                | TransportError::ConnectionTimeout { .. }
                | TransportError::InsufficientCredits { .. }
                | TransportError::NoAvailableChannel
        )
    }

    /// Whether this I/O failure is a socket read timeout rather than a broken stream.
    pub fn is_read_timeout(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_cloneable_connection_fault() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        assert!(copy.is_connection_fault());
        assert!(!copy.is_timeout());
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn test_classification() {
        let timeout = TransportError::RequestTimeout { request_id: 7, timeout_ms: 10 };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_connection_fault());
        assert!(TransportError::NoAvailableChannel.is_retryable());
        assert!(!TransportError::DuplicateCorrelation(3).is_retryable());
        let read_timeout: TransportError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "idle").into();
        assert!(read_timeout.is_read_timeout());
    }
}
