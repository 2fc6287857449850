#![warn(missing_docs)]

//! SMBMux transport: SMB2/3 client request multiplexing, credit flow control,
//! lease/oplock break dispatch and multi-channel bonding.
//!
//! The layers, leaf first:
//!
//! - [`pending`] and [`credits`]: per-connection correlation table and credit window.
//! - [`connection`], [`tcp`], [`rdma`]: the physical transports behind one trait.
//! - [`engine`]: one connection with its receive loop and the synchronous call contract.
//! - [`notify`]: routing of server-initiated breaks to per-resource handlers.
//! - [`manager`]: several engines bonded to one session, with failover.

pub mod balancer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credits;
pub mod engine;
pub mod error;
pub mod interface;
pub mod manager;
pub mod metrics;
pub mod negotiate;
pub mod notify;
pub mod pending;
pub mod protocol;
pub mod rdma;
pub mod tcp;

pub use balancer::LoadBalancer;
pub use channel::{ChannelId, ChannelInfo, ChannelState, ChannelSummary};
pub use codec::{Codec, SigningContext, Smb2Codec};
pub use config::{ChannelBindingPolicy, FailoverConfig, LoadBalancing, NotificationConfig, TransportConfig};
pub use connection::{Connection, ConnectionState, Connector, TransportCapabilities};
pub use credits::{CreditSnapshot, CreditTracker};
pub use engine::{EngineBuilder, EngineState, TransportEngine};
pub use error::{Result, TransportError};
pub use interface::{InterfaceSource, NetworkInterfaceInfo, RoutedInterfaces, StaticInterfaces};
pub use manager::{ChannelFactory, ChannelManager, EngineChannelFactory, MultiChannelStatus};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use negotiate::{NegotiatedSession, SessionNegotiator, Smb2Negotiator, StaticNegotiator};
pub use notify::{ChangePoller, DispatchOutcome, DispatcherStats, NotificationDispatcher, NotificationHandler};
pub use pending::{PendingTable, ResolveOutcome};
pub use protocol::{CorrelationId, DecodedFrame, FrameClass, Notification, NotificationKind, OutgoingRequest, ResourceKey, Response};
pub use rdma::{RdmaConfig, RdmaConnection, RdmaConnector};
pub use tcp::{StreamConnection, TcpConnection, TcpConnector};
