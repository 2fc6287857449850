//! Multi-channel bonding.
//!
//! A [`ChannelManager`] carries one logical session over several
//! [`TransportEngine`]s. It places requests with a [`LoadBalancer`], probes
//! every channel periodically, and when a channel fails it fails that
//! channel's pending requests, then tries to reconnect it in the background
//! and finally replaces it over another interface pair.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::balancer::LoadBalancer;
use crate::channel::{ChannelId, ChannelInfo, ChannelState, ChannelSummary};
use crate::config::{ChannelBindingPolicy, TransportConfig};
use crate::connection::Connector;
use crate::engine::{EngineState, TransportEngine};
use crate::error::{Result, TransportError};
use crate::interface::{pair_candidates, InterfacePair, InterfaceSource, NetworkInterfaceInfo};
use crate::metrics::TransportMetrics;
use crate::negotiate::SessionNegotiator;
use crate::notify::NotificationDispatcher;
use crate::protocol::{OutgoingRequest, Response};

/// Creates, binds and probes the engines behind channels.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    /// Builds and connects an engine over `pair`. Notifications must go to
    /// `dispatcher`, which every channel of the session shares.
    async fn connect(
        &self,
        pair: &InterfacePair,
        config: &TransportConfig,
        dispatcher: NotificationDispatcher,
    ) -> Result<TransportEngine>;

    /// Binds a connected engine to the session.
    async fn bind(&self, engine: &TransportEngine, binding_hash: &[u8; 32]) -> Result<()>;

    /// Interfaces the server advertises, queried over the primary channel.
    async fn query_interfaces(&self, primary: &TransportEngine) -> Result<Vec<NetworkInterfaceInfo>>;

    /// Health probe. Returns the round-trip time.
    async fn probe(&self, engine: &TransportEngine, timeout: Duration) -> Result<Duration> {
        engine.echo(timeout).await
    }
}

/// [`ChannelFactory`] that builds engines from a connector and negotiator.
///
/// Session binding is left to the negotiator; the server interface list is
/// configured rather than queried.
pub struct EngineChannelFactory {
    port: u16,
    connector: Arc<dyn Connector>,
    negotiator: Arc<dyn SessionNegotiator>,
    server_interfaces: Vec<NetworkInterfaceInfo>,
    metrics: Option<Arc<TransportMetrics>>,
}

impl EngineChannelFactory {
    /// Connects to `port` on each server interface.
    pub fn new(port: u16, connector: Arc<dyn Connector>, negotiator: Arc<dyn SessionNegotiator>) -> Self {
        Self { port, connector, negotiator, server_interfaces: Vec::new(), metrics: None }
    }

    /// Server interfaces to bond over. Defaults to the primary's address.
    pub fn with_server_interfaces(mut self, interfaces: Vec<NetworkInterfaceInfo>) -> Self {
        self.server_interfaces = interfaces;
        self
    }

    /// Shares one metrics sink across all engines.
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl ChannelFactory for EngineChannelFactory {
    async fn connect(
        &self,
        pair: &InterfacePair,
        config: &TransportConfig,
        dispatcher: NotificationDispatcher,
    ) -> Result<TransportEngine> {
        let mut builder = TransportEngine::builder(SocketAddr::new(pair.remote.address, self.port))
            .local_addr(pair.local.address)
            .config(config.clone())
            .connector(self.connector.clone())
            .negotiator(self.negotiator.clone())
            .dispatcher(dispatcher);
        if let Some(metrics) = &self.metrics {
            builder = builder.metrics(metrics.clone());
        }
        let engine = builder.build();
        engine.connect(config.connect_timeout()).await?;
        Ok(engine)
    }

    async fn bind(&self, engine: &TransportEngine, _binding_hash: &[u8; 32]) -> Result<()> {
        debug!(engine = %engine.name(), "channel bound by negotiation");
        Ok(())
    }

    async fn query_interfaces(&self, primary: &TransportEngine) -> Result<Vec<NetworkInterfaceInfo>> {
        if self.server_interfaces.is_empty() {
            return Ok(vec![NetworkInterfaceInfo::new(primary.remote_addr().ip(), 0)]);
        }
        Ok(self.server_interfaces.clone())
    }
}

/// Result of [`ChannelManager::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MultiChannelStatus {
    /// Turned off by configuration; only the primary channel is used.
    Disabled,
    /// The server does not advertise multi-channel support.
    NotSupported,
    /// Bonding is active.
    Active {
        /// Channels established, primary included.
        channels: usize,
    },
}

/// SHA-256 over the session key, both addresses and the channel sequence number.
pub fn binding_hash(session_key: &[u8], local: IpAddr, remote: IpAddr, sequence: u32) -> [u8; 32] {
    fn octets(ip: IpAddr) -> Vec<u8> {
        match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(session_key);
    hasher.update(octets(local));
    hasher.update(octets(remote));
    hasher.update(sequence.to_le_bytes());
    hasher.finalize().into()
}

struct ManagerInner {
    config: TransportConfig,
    primary: TransportEngine,
    factory: Arc<dyn ChannelFactory>,
    local_source: Arc<dyn InterfaceSource>,
    balancer: LoadBalancer,
    session_key: RwLock<Bytes>,
    channels: RwLock<Vec<Arc<ChannelInfo>>>,
    candidates: Mutex<Vec<InterfacePair>>,
    next_channel: AtomicU64,
    next_sequence: AtomicU32,
    initialized: AtomicBool,
    status: Mutex<Option<MultiChannelStatus>>,
    bonding: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn metrics(&self) -> &Arc<TransportMetrics> {
        self.primary.metrics()
    }

    fn channels(&self) -> Vec<Arc<ChannelInfo>> {
        self.channels.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn select(&self, exclude: Option<ChannelId>) -> Option<Arc<ChannelInfo>> {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        match exclude {
            None => self.balancer.select(&channels).cloned(),
            Some(id) => {
                let others: Vec<Arc<ChannelInfo>> =
                    channels.iter().filter(|c| c.id() != id).cloned().collect();
                self.balancer.select(&others).cloned()
            }
        }
    }

    /// Sleeps for `delay`. Returns `false` if shutdown started meanwhile.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_shut_down(),
            _ = shutdown.wait_for(|s| *s) => false,
        }
    }

    fn add_channel(&self, channel: &Arc<ChannelInfo>) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        if self.is_shut_down() {
            return false;
        }
        channel.mark_healthy();
        channels.push(channel.clone());
        true
    }

    fn detach(&self, id: ChannelId) -> Option<Arc<ChannelInfo>> {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        let pos = channels.iter().position(|c| c.id() == id)?;
        Some(channels.remove(pos))
    }

    fn live_count(&self) -> usize {
        self.channels().iter().filter(|c| c.state() != ChannelState::Removed).count()
    }

    fn unused_candidates(&self, exclude: Option<&InterfacePair>) -> Vec<InterfacePair> {
        let in_use: Vec<InterfacePair> = self.channels().iter().map(|c| c.pair().clone()).collect();
        self.candidates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|p| exclude.map(|e| !p.same_addresses(e)).unwrap_or(true))
            .filter(|p| !in_use.iter().any(|u| u.same_addresses(p)))
            .cloned()
            .collect()
    }

    async fn bind_engine(&self, engine: &TransportEngine, label: &str, pair: &InterfacePair, sequence: u32) -> Result<Option<[u8; 32]>> {
        if self.config.channel_binding == ChannelBindingPolicy::Disabled {
            return Ok(None);
        }
        let key = self.session_key.read().unwrap_or_else(|p| p.into_inner()).clone();
        let hash = binding_hash(&key, pair.local.address, pair.remote.address, sequence);
        match self.factory.bind(engine, &hash).await {
            Ok(()) => Ok(Some(hash)),
            Err(e) => Err(TransportError::ChannelBinding { channel: label.to_string(), reason: e.to_string() }),
        }
    }

    async fn establish_channel(self: &Arc<Self>, pair: InterfacePair) -> Result<Arc<ChannelInfo>> {
        if self.is_shut_down() {
            return Err(TransportError::InvalidState("channel manager is shut down".into()));
        }
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let label = id.to_string();
        debug!(channel = %label, local = %pair.local.address, remote = %pair.remote.address, "establishing channel");

        let engine = self
            .factory
            .connect(&pair, &self.config, self.primary.dispatcher().clone())
            .await?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let hash = match self.bind_engine(&engine, &label, &pair, sequence).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(channel = %label, error = %e, "channel binding failed");
                let _ = engine.disconnect(true).await;
                return Err(e);
            }
        };

        let channel = Arc::new(ChannelInfo::new(id, engine, pair, sequence, hash, false));
        if !self.add_channel(&channel) {
            let _ = channel.engine().disconnect(true).await;
            return Err(TransportError::InvalidState("channel manager is shut down".into()));
        }
        self.watch_channel(&channel);
        info!(
            channel = %label,
            local = %channel.local_interface().address,
            remote = %channel.remote_interface().address,
            "channel established"
        );
        Ok(channel)
    }

    /// Turns an engine dropping out of `Connected` into a channel failure.
    fn watch_channel(self: &Arc<Self>, channel: &Arc<ChannelInfo>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut states = channel.engine().subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let channel = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.wait_for(|s| *s) => return,
                }
                let state = *states.borrow_and_update();
                if channel.state() == ChannelState::Removed {
                    return;
                }
                if matches!(state, EngineState::Error | EngineState::NotConnected) {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.handle_failure(
                        &channel,
                        TransportError::Disconnected { reason: format!("engine {:?}", state) },
                    );
                }
            }
        });
        self.track(task);
    }

    fn handle_failure(self: &Arc<Self>, channel: &Arc<ChannelInfo>, error: TransportError) {
        if !channel.mark_failed() {
            return;
        }
        self.metrics().inc_channel_failovers();
        warn!(channel = %channel.label(), error = %error, "channel failed");
        if self.is_shut_down() {
            return;
        }

        let inner = self.clone();
        let channel = channel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = channel.engine().disconnect(true).await {
                debug!(channel = %channel.label(), error = %e, "teardown of failed channel");
            }
            inner.recover(channel).await;
        });
        self.track(task);
    }

    async fn reconnect(&self, channel: &ChannelInfo) -> Result<()> {
        let engine = channel.engine();
        engine.connect(self.config.connect_timeout()).await?;
        if !channel.is_primary() {
            if let Err(e) = self.bind_engine(engine, channel.label(), channel.pair(), channel.sequence()).await {
                let _ = engine.disconnect(true).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// A drop seen by the watcher while the channel was still `Failed` is
    /// ignored, so a channel just marked healthy re-checks its engine.
    fn confirm_connected(self: &Arc<Self>, channel: &Arc<ChannelInfo>) -> bool {
        if channel.engine().is_connected() {
            return true;
        }
        self.handle_failure(
            channel,
            TransportError::Disconnected { reason: "connection lost during recovery".into() },
        );
        false
    }

    async fn recover(self: Arc<Self>, channel: Arc<ChannelInfo>) {
        let failover = &self.config.failover;
        for attempt in 0..failover.max_recovery_attempts {
            if !self.sleep_unless_shutdown(failover.retry_delay(attempt)).await {
                return;
            }
            if channel.state() != ChannelState::Failed {
                return;
            }
            match self.reconnect(&channel).await {
                Ok(()) => {
                    if !channel.mark_healthy() {
                        let _ = channel.engine().disconnect(true).await;
                    } else if self.confirm_connected(&channel) {
                        info!(channel = %channel.label(), attempt = attempt + 1, "channel recovered");
                    }
                    return;
                }
                Err(e) => {
                    warn!(channel = %channel.label(), attempt = attempt + 1, error = %e, "channel recovery failed");
                }
            }
        }

        if self.detach(channel.id()).is_some() && channel.mark_removed() {
            info!(channel = %channel.label(), "giving up on channel");
        }
        if self.bonding.load(Ordering::Acquire) {
            self.establish_replacement(Some(channel.pair())).await;
        }
    }

    async fn establish_replacement(self: &Arc<Self>, failed: Option<&InterfacePair>) -> Option<Arc<ChannelInfo>> {
        for pair in self.unused_candidates(failed) {
            if self.is_shut_down() || self.live_count() >= self.config.max_channels {
                return None;
            }
            match self.establish_channel(pair).await {
                Ok(channel) => return Some(channel),
                Err(e) => debug!(error = %e, "replacement candidate failed"),
            }
        }
        warn!("no replacement channel available");
        None
    }

    async fn send_on(self: &Arc<Self>, channel: &Arc<ChannelInfo>, request: OutgoingRequest, timeout: Duration) -> Result<Response> {
        let started = Instant::now();
        let result = channel.engine().send_and_receive(request, timeout).await;
        channel.record(&result, started.elapsed());
        if let Err(e) = &result {
            if e.is_connection_fault() || matches!(e, TransportError::NotConnected) {
                self.handle_failure(channel, e.clone());
            }
        }
        channel.refresh_health();
        result
    }

    async fn probe_channel(self: Arc<Self>, channel: Arc<ChannelInfo>) {
        let idle = channel.pending_count() == 0;
        let timeout = self.config.health_check_interval().min(self.config.request_timeout());
        match self.factory.probe(channel.engine(), timeout).await {
            Ok(latency) => {
                channel.health().record_success(latency);
                trace!(channel = %channel.label(), latency_us = latency.as_micros() as u64, "probe ok");
            }
            Err(e) => {
                channel.health().record_failure();
                debug!(channel = %channel.label(), error = %e, "health probe failed");
                let fatal = e.is_connection_fault()
                    || matches!(e, TransportError::NotConnected)
                    || (idle && e.is_timeout());
                if fatal {
                    self.handle_failure(&channel, e);
                    return;
                }
            }
        }
        channel.refresh_health();
    }

    async fn check_health(self: &Arc<Self>) {
        let probes: Vec<JoinHandle<()>> = self
            .channels()
            .into_iter()
            .filter(|c| matches!(c.state(), ChannelState::Healthy | ChannelState::Degraded))
            .map(|channel| tokio::spawn(self.clone().probe_channel(channel)))
            .collect();
        for probe in probes {
            let _ = probe.await;
        }
    }

    fn start_health_checks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.health_check_interval();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait_for(|s| *s) => return,
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.check_health().await;
            }
        });
        self.track(task);
    }
}

/// Owns the channels of one session.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    /// Wraps a connected primary engine. Call [`initialize`](Self::initialize)
    /// before sending.
    pub fn new(
        primary: TransportEngine,
        factory: Arc<dyn ChannelFactory>,
        local_source: Arc<dyn InterfaceSource>,
        config: TransportConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                balancer: LoadBalancer::new(config.load_balancing),
                config,
                primary,
                factory,
                local_source,
                session_key: RwLock::new(Bytes::new()),
                channels: RwLock::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                next_channel: AtomicU64::new(1),
                next_sequence: AtomicU32::new(1),
                initialized: AtomicBool::new(false),
                status: Mutex::new(None),
                bonding: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Key material mixed into channel binding hashes.
    pub fn set_session_key(&self, key: impl Into<Bytes>) {
        *self.inner.session_key.write().unwrap_or_else(|p| p.into_inner()) = key.into();
    }

    /// Registers the primary channel and, when enabled by configuration and
    /// supported by the server, bonds additional channels up to `max_channels`.
    ///
    /// Calling it again returns the first result.
    pub async fn initialize(&self) -> Result<MultiChannelStatus> {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return Err(TransportError::InvalidState("channel manager is shut down".into()));
        }
        if inner.initialized.swap(true, Ordering::AcqRel) {
            let status = *inner.status.lock().unwrap_or_else(|p| p.into_inner());
            return status.ok_or_else(|| TransportError::InvalidState("initialization in progress".into()));
        }

        let result = self.initialize_channels().await;
        match &result {
            Ok(status) => {
                *inner.status.lock().unwrap_or_else(|p| p.into_inner()) = Some(*status);
                info!(?status, "channel manager initialized");
            }
            Err(_) => inner.initialized.store(false, Ordering::Release),
        }
        result
    }

    async fn initialize_channels(&self) -> Result<MultiChannelStatus> {
        let inner = &self.inner;
        let primary = inner.primary.clone();
        if !primary.is_connected() {
            return Err(TransportError::NotConnected);
        }

        if inner.channels().is_empty() {
            let local = primary
                .local_addr()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let pair = InterfacePair {
                local: NetworkInterfaceInfo::new(local, 0),
                remote: NetworkInterfaceInfo::new(primary.remote_addr().ip(), 0),
            };
            let channel = Arc::new(ChannelInfo::new(ChannelId(0), primary.clone(), pair, 0, None, true));
            if !inner.add_channel(&channel) {
                return Err(TransportError::InvalidState("channel manager is shut down".into()));
            }
            inner.watch_channel(&channel);
            inner.start_health_checks();
        }

        if !inner.config.multi_channel_enabled {
            return Ok(MultiChannelStatus::Disabled);
        }
        let supported = primary.session().map(|s| s.supports_multi_channel()).unwrap_or(false);
        if !supported {
            info!(remote = %primary.remote_addr(), "server does not support multi-channel");
            return Ok(MultiChannelStatus::NotSupported);
        }

        let local = inner.local_source.interfaces(primary.remote_addr()).await?;
        let remote = inner.factory.query_interfaces(&primary).await?;
        let primary_pair = inner.channels().first().map(|c| c.pair().clone());
        let pairs: Vec<InterfacePair> = pair_candidates(&local, &remote)
            .into_iter()
            .filter(|p| primary_pair.as_ref().map(|pp| !p.same_addresses(pp)).unwrap_or(true))
            .collect();
        debug!(local = local.len(), remote = remote.len(), candidates = pairs.len(), "interface candidates");
        *inner.candidates.lock().unwrap_or_else(|p| p.into_inner()) = pairs.clone();
        inner.bonding.store(true, Ordering::Release);

        for pair in pairs {
            if inner.live_count() >= inner.config.max_channels {
                break;
            }
            match inner.establish_channel(pair).await {
                Ok(_) => {}
                Err(e @ TransportError::ChannelBinding { .. })
                    if inner.config.channel_binding == ChannelBindingPolicy::Required =>
                {
                    inner.bonding.store(false, Ordering::Release);
                    for channel in inner.channels().into_iter().filter(|c| !c.is_primary()) {
                        self.remove_channel(channel.id()).await;
                    }
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "skipping channel candidate"),
            }
        }

        Ok(MultiChannelStatus::Active { channels: inner.live_count() })
    }

    /// Picks a healthy channel with the configured strategy.
    pub fn select_channel(&self) -> Result<Arc<ChannelInfo>> {
        self.inner.select(None).ok_or(TransportError::NoAvailableChannel)
    }

    /// Sends over a selected channel. A request that failed because its
    /// channel was not connected (nothing was written) is retried once on
    /// another healthy channel.
    pub async fn send_and_receive(&self, request: OutgoingRequest, timeout: Duration) -> Result<Response> {
        let channel = self.select_channel()?;
        match self.inner.send_on(&channel, request.clone(), timeout).await {
            Err(TransportError::NotConnected) => {
                let retry = self.inner.select(Some(channel.id())).ok_or(TransportError::NoAvailableChannel)?;
                debug!(from = %channel.label(), to = %retry.label(), "retrying request on another channel");
                self.inner.send_on(&retry, request, timeout).await
            }
            other => other,
        }
    }

    /// Takes a channel out of rotation after a connection-level failure.
    ///
    /// Returns at once; the engine teardown (which fails its pending
    /// requests), recovery and replacement run in the background.
    pub fn handle_channel_failure(&self, channel: &Arc<ChannelInfo>, error: TransportError) {
        self.inner.handle_failure(channel, error);
    }

    /// Removes a channel after draining it. Returns `false` if it was already gone.
    pub async fn remove_channel(&self, id: ChannelId) -> bool {
        let Some(channel) = self.inner.detach(id) else {
            return false;
        };
        if !channel.mark_removed() {
            return false;
        }
        if let Err(e) = channel.engine().disconnect(false).await {
            debug!(channel = %channel.label(), error = %e, "disconnect on removal");
        }
        info!(channel = %channel.label(), "channel removed");
        true
    }

    /// Grows or shrinks the channel set toward `target` (clamped to
    /// `1..=max_channels`). Shrinking removes the lowest-scoring
    /// non-primary channels. Returns the resulting channel count.
    pub async fn adjust_channel_count(&self, target: usize) -> Result<usize> {
        let inner = &self.inner;
        if !inner.bonding.load(Ordering::Acquire) {
            return Err(TransportError::MultiChannelDisabled);
        }
        let target = target.clamp(1, inner.config.max_channels);

        while inner.live_count() < target {
            if inner.establish_replacement(None).await.is_none() {
                break;
            }
        }

        let live = inner.live_count();
        if live > target {
            let mut removable: Vec<Arc<ChannelInfo>> =
                inner.channels().into_iter().filter(|c| !c.is_primary()).collect();
            removable.sort_by_key(|c| c.score());
            for channel in removable.into_iter().take(live - target) {
                self.remove_channel(channel.id()).await;
            }
        }
        Ok(inner.live_count())
    }

    /// Stops background work and tears down every channel. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }
        let channels = std::mem::take(&mut *inner.channels.write().unwrap_or_else(|p| p.into_inner()));
        for channel in &channels {
            channel.mark_removed();
            if let Err(e) = channel.engine().disconnect(true).await {
                debug!(channel = %channel.label(), error = %e, "disconnect on shutdown");
            }
        }
        if inner.primary.state() != EngineState::NotConnected {
            let _ = inner.primary.disconnect(true).await;
        }
        info!(channels = channels.len(), "channel manager shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// All channels not yet removed.
    pub fn channels(&self) -> Vec<Arc<ChannelInfo>> {
        self.inner.channels()
    }

    /// Channel by id.
    pub fn channel(&self, id: ChannelId) -> Option<Arc<ChannelInfo>> {
        self.inner.channels().into_iter().find(|c| c.id() == id)
    }

    /// Number of selectable channels.
    pub fn healthy_count(&self) -> usize {
        self.inner.channels().iter().filter(|c| c.is_selectable()).count()
    }

    /// Serializable view of every channel.
    pub fn summaries(&self) -> Vec<ChannelSummary> {
        self.inner.channels().iter().map(|c| c.summary()).collect()
    }

    /// Runs one round of health probes now.
    pub async fn check_health(&self) {
        self.inner.check_health().await;
    }

    /// The session's first engine.
    pub fn primary(&self) -> &TransportEngine {
        &self.inner.primary
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        self.inner.metrics()
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.inner.channels())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
