//! Shared harness: in-memory connections and a scripted SMB2 server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use smbmux_transport::codec::build_server_frame;
use smbmux_transport::interface::InterfacePair;
use smbmux_transport::manager::ChannelFactory;
use smbmux_transport::negotiate::capability;
use smbmux_transport::protocol::status;
use smbmux_transport::{
    Codec, Connection, ConnectionState, Connector, TransportCapabilities, CorrelationId, NegotiatedSession, NetworkInterfaceInfo,
    NotificationDispatcher, Result, Smb2Codec, StaticNegotiator, StreamConnection, TransportConfig,
    TransportEngine, TransportError,
};

pub const SERVER: &str = "10.0.0.1:445";
pub const CLIENT: &str = "10.0.0.2:50000";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub id: CorrelationId,
    pub command: u16,
    pub credit_charge: u16,
    pub body: bytes::Bytes,
}

/// Server end of an in-memory connection.
#[derive(Clone)]
pub struct ScriptedServer {
    conn: Arc<dyn Connection>,
}

impl ScriptedServer {
    pub async fn next_request(&self) -> SeenRequest {
        let raw = tokio::time::timeout(Duration::from_secs(5), self.conn.recv())
            .await
            .expect("server timed out waiting for a request")
            .unwrap()
            .expect("client closed the connection");
        let frame = Smb2Codec::new().decode(&raw).unwrap();
        SeenRequest {
            id: frame.id,
            command: frame.command,
            credit_charge: frame.credit_charge,
            body: frame.payload,
        }
    }

    pub async fn reply(&self, req: &SeenRequest, credits: u16, body: &[u8]) {
        self.send(build_server_frame(req.command, req.id, status::SUCCESS, credits, None, body))
            .await;
    }

    pub async fn reply_status(&self, req: &SeenRequest, nt_status: u32, credits: u16) {
        self.send(build_server_frame(req.command, req.id, nt_status, credits, None, &[]))
            .await;
    }

    pub async fn interim(&self, req: &SeenRequest, async_id: u64, credits: u16) {
        self.send(build_server_frame(req.command, req.id, status::PENDING, credits, Some(async_id), &[]))
            .await;
    }

    pub async fn send(&self, frame: bytes::Bytes) {
        self.conn.send(&frame).await.unwrap();
    }

    pub async fn close(&self) {
        self.conn.close().await.unwrap();
    }

    /// Answers every request with success, granting back its charge.
    pub fn spawn_echo(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(Some(raw)) = self.conn.recv().await {
                let Ok(frame) = Smb2Codec::new().decode(&raw) else {
                    continue;
                };
                let reply = build_server_frame(
                    frame.command,
                    frame.id,
                    status::SUCCESS,
                    frame.credit_charge.max(1),
                    None,
                    &frame.payload,
                );
                if self.conn.send(&reply).await.is_err() {
                    return;
                }
            }
        })
    }
}

/// Client and server ends of an in-memory SMB2 connection.
pub fn duplex_pair(local: SocketAddr, remote: SocketAddr) -> (Arc<dyn Connection>, ScriptedServer) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let client: Arc<dyn Connection> = Arc::new(StreamConnection::new(ar, aw, remote, local, 1 << 20));
    let server: Arc<dyn Connection> = Arc::new(StreamConnection::new(br, bw, local, remote, 1 << 20));
    (client, ScriptedServer { conn: server })
}

/// Client connection whose writes can be made to fail.
pub struct FlakyConnection {
    inner: Arc<dyn Connection>,
    broken: AtomicBool,
}

impl FlakyConnection {
    pub fn new(inner: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self { inner, broken: AtomicBool::new(false) })
    }

    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Connection for FlakyConnection {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }
        self.inner.send(frame).await
    }

    async fn recv(&self) -> Result<Option<bytes::Bytes>> {
        self.inner.recv().await
    }

    fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.inner.capabilities()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Hands out queued connections in order, then refuses.
pub struct QueueConnector {
    queue: Mutex<VecDeque<Arc<dyn Connection>>>,
}

impl QueueConnector {
    pub fn new(conns: Vec<Arc<dyn Connection>>) -> Self {
        Self { queue: Mutex::new(conns.into()) }
    }

    pub fn push(&self, conn: Arc<dyn Connection>) {
        self.queue.lock().unwrap().push_back(conn);
    }
}

#[async_trait]
impl Connector for QueueConnector {
    async fn connect(&self, remote: SocketAddr, _local: Option<IpAddr>, _timeout: Duration) -> Result<Arc<dyn Connection>> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::ConnectionRefused { addr: remote.to_string() })
    }
}

/// Never completes a connection.
pub struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    async fn connect(&self, _remote: SocketAddr, _local: Option<IpAddr>, _timeout: Duration) -> Result<Arc<dyn Connection>> {
        std::future::pending().await
    }
}

pub fn session(initial_credits: u32, capabilities: u32) -> NegotiatedSession {
    NegotiatedSession {
        initial_credits,
        server_capabilities: capabilities,
        next_message_id: 1,
        ..Default::default()
    }
}

/// A disconnected engine whose next connect yields `server`.
pub fn engine_with_server(config: TransportConfig, initial_credits: u32) -> (TransportEngine, ScriptedServer, Arc<QueueConnector>) {
    let (client, server) = duplex_pair(addr(CLIENT), addr(SERVER));
    let connector = Arc::new(QueueConnector::new(vec![client]));
    let engine = TransportEngine::builder(addr(SERVER))
        .name("test")
        .config(config)
        .connector(connector.clone())
        .negotiator(Arc::new(StaticNegotiator::new(session(initial_credits, 0))))
        .build();
    (engine, server, connector)
}

pub async fn connected_engine(initial_credits: u32) -> (TransportEngine, ScriptedServer) {
    let (engine, server, _) = engine_with_server(TransportConfig::default(), initial_credits);
    engine.connect(Duration::from_secs(1)).await.unwrap();
    (engine, server)
}

/// Polls `f` until it returns true or a second passes.
pub async fn eventually<F: FnMut() -> bool>(mut f: F) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Channel factory backed by in-memory servers.
pub struct MockFactory {
    pub servers: Mutex<Vec<(IpAddr, ScriptedServer)>>,
    pub remote_interfaces: Vec<NetworkInterfaceInfo>,
    pub fail_bind: bool,
    pub auto_echo: bool,
}

impl MockFactory {
    pub fn new(remote_interfaces: Vec<NetworkInterfaceInfo>) -> Self {
        Self { servers: Mutex::new(Vec::new()), remote_interfaces, fail_bind: false, auto_echo: false }
    }

    pub fn server_for(&self, remote: IpAddr) -> Option<ScriptedServer> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(ip, _)| *ip == remote)
            .map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl ChannelFactory for MockFactory {
    async fn connect(
        &self,
        pair: &InterfacePair,
        config: &TransportConfig,
        dispatcher: NotificationDispatcher,
    ) -> Result<TransportEngine> {
        let local = SocketAddr::new(pair.local.address, 50001);
        let remote = SocketAddr::new(pair.remote.address, 445);
        let (client, server) = duplex_pair(local, remote);
        if self.auto_echo {
            server.clone().spawn_echo();
        }
        self.servers.lock().unwrap().push((pair.remote.address, server));
        let engine = TransportEngine::builder(remote)
            .local_addr(pair.local.address)
            .config(config.clone())
            .connector(Arc::new(QueueConnector::new(vec![client])))
            .negotiator(Arc::new(StaticNegotiator::new(session(16, capability::MULTI_CHANNEL))))
            .dispatcher(dispatcher)
            .build();
        engine.connect(config.connect_timeout()).await?;
        Ok(engine)
    }

    async fn bind(&self, _engine: &TransportEngine, _binding_hash: &[u8; 32]) -> Result<()> {
        if self.fail_bind {
            return Err(TransportError::Negotiation { reason: "binding rejected".into() });
        }
        Ok(())
    }

    async fn query_interfaces(&self, _primary: &TransportEngine) -> Result<Vec<NetworkInterfaceInfo>> {
        Ok(self.remote_interfaces.clone())
    }
}
