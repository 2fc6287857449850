//! Network interface descriptors and local interface discovery.
//!
//! Servers advertise their interfaces as a chain of 152-byte
//! `NETWORK_INTERFACE_INFO` records:
//!
//! ```text
//! 0   Next        u32   offset of the next record, 0 for the last
//! 4   IfIndex     u32
//! 8   Capability  u32   RSS = 0x1, RDMA = 0x2
//! 12  Reserved    u32
//! 16  LinkSpeed   u64   bits per second
//! 24  SockAddr    128   family u16, then IPv4 at +4 or IPv6 at +8
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::Result;

/// Size of one encoded interface record.
pub const INTERFACE_INFO_SIZE: usize = 152;

const SOCKADDR_OFFSET: usize = 24;
const SOCKADDR_SIZE: usize = 128;
const AF_INET: u16 = 2;
const AF_INET6: u16 = 23;

/// Interface capability flags.
pub mod capability {
    /// Receive-side scaling.
    pub const RSS: u32 = 0x0000_0001;
    /// RDMA capable.
    pub const RDMA: u32 = 0x0000_0002;
}

/// One network interface, local or advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    /// Interface index.
    pub if_index: u32,
    /// Capability flags.
    pub capabilities: u32,
    /// Link speed in bits per second.
    pub link_speed: u64,
    /// Interface address.
    pub address: IpAddr,
}

impl NetworkInterfaceInfo {
    /// Describes an interface without capabilities.
    pub fn new(address: IpAddr, link_speed: u64) -> Self {
        Self { if_index: 0, capabilities: 0, link_speed, address }
    }

    /// Sets the capability flags.
    pub fn with_capabilities(mut self, capabilities: u32) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the interface index.
    pub fn with_index(mut self, if_index: u32) -> Self {
        self.if_index = if_index;
        self
    }

    /// Whether receive-side scaling is advertised.
    pub fn supports_rss(&self) -> bool {
        self.capabilities & capability::RSS != 0
    }

    /// Whether RDMA is advertised.
    pub fn supports_rdma(&self) -> bool {
        self.capabilities & capability::RDMA != 0
    }

    /// Whether the interface can carry a channel.
    pub fn is_usable(&self) -> bool {
        match self.address {
            IpAddr::V4(v4) => {
                !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() || v4.is_multicast())
            }
            IpAddr::V6(v6) => {
                !(v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_multicast()
                    || (v6.segments()[0] & 0xffc0) == 0xfe80)
            }
        }
    }

    /// Link speed in Mbps plus bonuses for RSS (1000) and RDMA (2000).
    pub fn score(&self) -> u64 {
        let mut score = self.link_speed / 1_000_000;
        if self.supports_rss() {
            score += 1000;
        }
        if self.supports_rdma() {
            score += 2000;
        }
        score
    }

    /// Parses the record at `offset`. Returns `None` for a truncated record
    /// or an unknown address family.
    pub fn decode(data: &[u8], offset: usize) -> Option<Self> {
        let record = data.get(offset..offset.checked_add(INTERFACE_INFO_SIZE)?)?;
        let u32_at = |at: usize| u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);

        let if_index = u32_at(4);
        let capabilities = u32_at(8);
        let mut speed = [0u8; 8];
        speed.copy_from_slice(&record[16..24]);
        let link_speed = u64::from_le_bytes(speed);

        let sockaddr = &record[SOCKADDR_OFFSET..SOCKADDR_OFFSET + SOCKADDR_SIZE];
        let address = match u16::from_le_bytes([sockaddr[0], sockaddr[1]]) {
            AF_INET => IpAddr::V4(Ipv4Addr::new(sockaddr[4], sockaddr[5], sockaddr[6], sockaddr[7])),
            AF_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&sockaddr[8..24]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            family => {
                debug!(family, "skipping interface with unknown address family");
                return None;
            }
        };

        Some(Self { if_index, capabilities, link_speed, address })
    }

    /// Walks a record chain by its `Next` offsets. Malformed records are
    /// skipped; a chain that points outside `data` stops the walk.
    pub fn decode_list(data: &[u8]) -> Vec<Self> {
        let mut interfaces = Vec::new();
        let mut offset = 0usize;
        while offset + INTERFACE_INFO_SIZE <= data.len() {
            if let Some(info) = Self::decode(data, offset) {
                interfaces.push(info);
            }
            let next = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            if next == 0 {
                break;
            }
            match offset.checked_add(next) {
                Some(n) => offset = n,
                None => break,
            }
        }
        interfaces
    }

    /// Appends this record to `buf` with the given `Next` offset.
    pub fn encode(&self, next: u32, buf: &mut BytesMut) {
        buf.reserve(INTERFACE_INFO_SIZE);
        buf.put_u32_le(next);
        buf.put_u32_le(self.if_index);
        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(0);
        buf.put_u64_le(self.link_speed);

        let mut sockaddr = [0u8; SOCKADDR_SIZE];
        match self.address {
            IpAddr::V4(v4) => {
                sockaddr[0..2].copy_from_slice(&AF_INET.to_le_bytes());
                sockaddr[4..8].copy_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                sockaddr[0..2].copy_from_slice(&AF_INET6.to_le_bytes());
                sockaddr[8..24].copy_from_slice(&v6.octets());
            }
        }
        buf.put_slice(&sockaddr);
    }

    /// Encodes a chain of records.
    pub fn encode_list(interfaces: &[Self]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(interfaces.len() * INTERFACE_INFO_SIZE);
        for (i, info) in interfaces.iter().enumerate() {
            let next = if i + 1 < interfaces.len() { INTERFACE_INFO_SIZE as u32 } else { 0 };
            info.encode(next, &mut buf);
        }
        buf
    }
}

/// A local/remote interface pairing considered for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfacePair {
    /// Client side.
    pub local: NetworkInterfaceInfo,
    /// Server side.
    pub remote: NetworkInterfaceInfo,
}

impl InterfacePair {
    /// Combined score of both ends.
    pub fn score(&self) -> u64 {
        self.local.score() + self.remote.score()
    }

    /// Whether both ends use the same addresses as `other`.
    pub fn same_addresses(&self, other: &InterfacePair) -> bool {
        self.local.address == other.local.address && self.remote.address == other.remote.address
    }
}

/// Pairs usable local and remote interfaces of the same address family,
/// best combined score first.
pub fn pair_candidates(local: &[NetworkInterfaceInfo], remote: &[NetworkInterfaceInfo]) -> Vec<InterfacePair> {
    let mut pairs: Vec<InterfacePair> = local
        .iter()
        .filter(|l| l.is_usable())
        .flat_map(|l| {
            remote
                .iter()
                .filter(|r| r.is_usable() && r.address.is_ipv4() == l.address.is_ipv4())
                .map(move |r| InterfacePair { local: l.clone(), remote: r.clone() })
        })
        .collect();
    pairs.sort_by(|a, b| b.score().cmp(&a.score()));
    pairs
}

/// Source of local interfaces.
#[async_trait]
pub trait InterfaceSource: Send + Sync {
    /// Interfaces that can reach `server`.
    async fn interfaces(&self, server: SocketAddr) -> Result<Vec<NetworkInterfaceInfo>>;
}

/// A fixed interface list.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<NetworkInterfaceInfo>);

#[async_trait]
impl InterfaceSource for StaticInterfaces {
    async fn interfaces(&self, _server: SocketAddr) -> Result<Vec<NetworkInterfaceInfo>> {
        Ok(self.0.clone())
    }
}

/// Asks the OS which local address routes to the server.
///
/// Connecting a UDP socket selects a route without sending anything.
#[derive(Debug, Clone)]
pub struct RoutedInterfaces {
    /// Link speed reported for the routed interface.
    pub assumed_link_speed: u64,
}

impl Default for RoutedInterfaces {
    fn default() -> Self {
        Self { assumed_link_speed: 1_000_000_000 }
    }
}

#[async_trait]
impl InterfaceSource for RoutedInterfaces {
    async fn interfaces(&self, server: SocketAddr) -> Result<Vec<NetworkInterfaceInfo>> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        let local = socket.local_addr()?.ip();
        debug!(%server, %local, "resolved local route");
        Ok(vec![NetworkInterfaceInfo::new(local, self.assumed_link_speed)])
    }
}
