//! Transport engine.
//!
//! A [`TransportEngine`] owns one connection at a time. It runs the
//! handshake, starts a single receive loop per connection and exposes
//! [`send_and_receive`](TransportEngine::send_and_receive): reserve credits,
//! register the correlation id, encode, write, then wait for the receive
//! loop to resolve the request.
//!
//! ```text
//! NotConnected -> Connecting -> Connected -> Disconnecting -> NotConnected
//!                                   |
//!                                   +-> Error (connection failed; connect again)
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, SigningContext, Smb2Codec};
use crate::config::TransportConfig;
use crate::connection::{Connection, Connector, TransportCapabilities};
use crate::credits::{CreditSnapshot, CreditTracker};
use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::negotiate::{NegotiatedSession, SessionNegotiator, StaticNegotiator};
use crate::notify::NotificationDispatcher;
use crate::pending::{PendingTable, ResolveOutcome};
use crate::protocol::{command, DecodedFrame, FrameClass, OutgoingRequest, Response};
use crate::tcp::TcpConnector;

const ECHO_BODY: [u8; 4] = [4, 0, 0, 0];

/// Lifecycle of a transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EngineState {
    /// No connection.
    #[default]
    NotConnected,
    /// Connect and handshake in progress.
    Connecting,
    /// Ready for requests.
    Connected,
    /// Teardown in progress; new requests are refused.
    Disconnecting,
    /// The connection failed; every pending request was failed.
    Error,
}

/// One established connection with its request bookkeeping.
struct Link {
    conn: Arc<dyn Connection>,
    pending: PendingTable,
    credits: CreditTracker,
    session: NegotiatedSession,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Link {
    fn new(conn: Arc<dyn Connection>, session: NegotiatedSession) -> Self {
        Self {
            conn,
            pending: PendingTable::new(),
            credits: CreditTracker::new(session.initial_credits.max(1)),
            session,
            receive_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn abort_receive(&self) {
        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn close(&self, metrics: &TransportMetrics) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "error closing connection");
        }
        metrics.connection_closed();
    }
}

struct Inner {
    name: String,
    remote: SocketAddr,
    local: Option<IpAddr>,
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    negotiator: Arc<dyn SessionNegotiator>,
    dispatcher: NotificationDispatcher,
    metrics: Arc<TransportMetrics>,
    state: watch::Sender<EngineState>,
    link: RwLock<Option<Arc<Link>>>,
    next_id: AtomicU64,
    signing: RwLock<Option<SigningContext>>,
    force_disconnect: AtomicBool,
    force_notify: Notify,
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl Inner {
    fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Applies `f` to the current state atomically. Returns the previous
    /// state and whether it changed.
    fn transition<F>(&self, f: F) -> (EngineState, bool)
    where
        F: FnOnce(EngineState) -> Option<EngineState>,
    {
        let mut before = EngineState::NotConnected;
        let changed = self.state.send_if_modified(|state| {
            before = *state;
            match f(*state) {
                Some(next) if next != *state => {
                    *state = next;
                    true
                }
                _ => false,
            }
        });
        (before, changed)
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_link(&self, link: Option<Arc<Link>>) {
        *self.link.write().unwrap_or_else(|p| p.into_inner()) = link;
    }

    fn is_current(&self, link: &Arc<Link>) -> bool {
        self.current_link().map(|l| Arc::ptr_eq(&l, link)).unwrap_or(false)
    }

    fn active_link(&self) -> Result<Arc<Link>> {
        if self.state() != EngineState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.current_link().ok_or(TransportError::NotConnected)
    }

    fn signing(&self) -> Option<SigningContext> {
        self.signing.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn credits_to_request(&self, credits: &CreditTracker) -> u16 {
        let wanted = self.config.desired_credits.saturating_sub(credits.available());
        wanted.clamp(1, u32::from(u16::MAX)) as u16
    }

    /// Waits until `charge` credits can be reserved or `deadline` passes.
    async fn reserve_credits(&self, link: &Link, charge: u16, deadline: Instant) -> Result<()> {
        loop {
            let notified = link.credits.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if link.credits.try_reserve(u32::from(charge)) {
                return Ok(());
            }
            if link.pending.is_closed() {
                return Err(TransportError::NotConnected);
            }
            if self.reclaim_abandoned(link) > 0 {
                continue;
            }
            trace!(engine = %self.name, charge, available = link.credits.available(), "waiting for credits");
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.abandoned_grace()) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TransportError::InsufficientCredits {
                        needed: charge,
                        available: link.credits.available(),
                    });
                }
            }
        }
    }

    /// Returns credits held by requests whose answer is overdue past the grace period.
    fn reclaim_abandoned(&self, link: &Link) -> u32 {
        let charge = link.pending.expire_abandoned(self.config.abandoned_grace());
        if charge > 0 {
            link.credits.release(charge);
            debug!(engine = %self.name, charge, "reclaimed credits of unanswered requests");
        }
        charge
    }

    fn handle_frame(&self, link: &Link, raw: Bytes) {
        let Some(id) = self.codec.peek_correlation_id(&raw) else {
            self.metrics.inc_protocol_anomalies();
            debug!(engine = %self.name, len = raw.len(), "discarding frame without correlation id");
            return;
        };

        if !link.pending.contains(id) {
            match self.codec.decode(&raw) {
                Ok(frame) => self.route_unsolicited(link, frame),
                Err(e) => {
                    self.metrics.inc_protocol_anomalies();
                    debug!(engine = %self.name, id, error = %e, "discarding undecodable frame");
                }
            }
            return;
        }

        let frame = match self.codec.decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.inc_protocol_anomalies();
                warn!(engine = %self.name, id, error = %e, "failed to decode response");
                if let Some(charge) = link.pending.fail(id, e) {
                    link.credits.release(u32::from(charge));
                }
                return;
            }
        };

        if frame.interim {
            link.credits.grant(u32::from(frame.credits_granted));
            link.pending.extend(id);
            self.metrics.inc_interim_responses();
            trace!(engine = %self.name, id, async_id = ?frame.async_id, "interim response");
            return;
        }

        let granted = u32::from(frame.credits_granted);
        match link.pending.resolve(id, frame) {
            ResolveOutcome::Resolved { charge } => {
                link.credits.settle(u32::from(charge), granted);
                self.metrics.inc_responses_received();
            }
            ResolveOutcome::Late { charge } => {
                link.credits.settle(u32::from(charge), granted);
                self.metrics.inc_protocol_anomalies();
            }
            ResolveOutcome::Unknown(frame) => self.route_unsolicited(link, frame),
        }
    }

    /// Handles a frame with no waiter: notifications go to the dispatcher,
    /// late responses settle their credits, anything else is discarded.
    fn route_unsolicited(&self, link: &Link, frame: DecodedFrame) {
        match frame.class {
            FrameClass::Notification => {
                link.credits.grant(u32::from(frame.credits_granted));
                if let Some(notification) = frame.notification.as_ref() {
                    self.metrics.inc_notifications_routed();
                    let outcome = self.dispatcher.dispatch(notification);
                    self.metrics.notification_outcome(outcome);
                    trace!(engine = %self.name, key = %notification.key, ?outcome, "notification routed");
                }
            }
            FrameClass::Response => {
                let granted = u32::from(frame.credits_granted);
                if frame.interim {
                    link.credits.grant(granted);
                    return;
                }
                let id = frame.id;
                match link.pending.resolve(id, frame) {
                    ResolveOutcome::Late { charge } => {
                        link.credits.settle(u32::from(charge), granted);
                        self.metrics.inc_protocol_anomalies();
                        debug!(engine = %self.name, id, "late response for abandoned request");
                    }
                    ResolveOutcome::Resolved { charge } => {
                        link.credits.settle(u32::from(charge), granted);
                        self.metrics.inc_responses_received();
                    }
                    ResolveOutcome::Unknown(_) => {
                        self.metrics.inc_protocol_anomalies();
                        warn!(engine = %self.name, id, "response for unknown request discarded");
                    }
                }
            }
            FrameClass::Unrecognized => {
                self.metrics.inc_protocol_anomalies();
                debug!(engine = %self.name, id = frame.id, command = frame.command, "discarding unrecognized frame");
            }
        }
    }

    /// Fails every pending request and marks the engine failed, atomically
    /// with respect to resolution.
    async fn fail_link(&self, link: &Arc<Link>, error: TransportError) {
        let failed = link.pending.fail_all_with(error.clone(), || {
            if self.is_current(link) {
                self.transition(|s| (s == EngineState::Connected).then_some(EngineState::Error));
            }
        });
        link.credits.wake_all();
        warn!(engine = %self.name, error = %error, failed, "connection failed");
        link.close(&self.metrics).await;
    }
}

async fn receive_loop(inner: Weak<Inner>, link: Arc<Link>, idle_timeout: Duration) {
    let failure = loop {
        let next = tokio::time::timeout(idle_timeout, link.conn.recv()).await;
        let raw = match next {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                break Some(TransportError::Disconnected { reason: "end of stream".into() });
            }
            Ok(Err(e)) if !e.is_read_timeout() => break Some(e),
            Ok(Err(_)) | Err(_) => {
                if link.pending.close_if_idle(TransportError::NotConnected) {
                    break None;
                }
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.metrics.add_bytes_received(raw.len());
        inner.touch();
        inner.handle_frame(&link, raw);
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    match failure {
        Some(error) => inner.fail_link(&link, error).await,
        None => {
            debug!(engine = %inner.name, "connection idle, disconnecting");
            let engine = TransportEngine { inner };
            tokio::spawn(async move {
                let _ = engine.disconnect(false).await;
            });
        }
    }
}

/// Resets `Connecting` if a connect attempt is abandoned.
struct ConnectGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.transition(|s| {
                (s == EngineState::Connecting).then_some(EngineState::NotConnected)
            });
        }
    }
}

/// Finishes teardown if a disconnect is abandoned half way.
struct DisconnectGuard<'a> {
    inner: &'a Inner,
    link: Option<Arc<Link>>,
    armed: bool,
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(link) = &self.link {
            link.pending.fail_all(TransportError::Disconnected { reason: "disconnect abandoned".into() });
            link.credits.wake_all();
            link.abort_receive();
        }
        self.inner.set_link(None);
        self.inner.transition(|_| Some(EngineState::NotConnected));
    }
}

/// Builder for [`TransportEngine`].
pub struct EngineBuilder {
    remote: SocketAddr,
    local: Option<IpAddr>,
    name: Option<String>,
    config: TransportConfig,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
    negotiator: Option<Arc<dyn SessionNegotiator>>,
    dispatcher: Option<NotificationDispatcher>,
    metrics: Option<Arc<TransportMetrics>>,
}

impl EngineBuilder {
    /// Binds the connection to a local interface address.
    pub fn local_addr(mut self, local: IpAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// Name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport variant. Defaults to TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Wire codec. Defaults to [`Smb2Codec`].
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Handshake. Defaults to [`StaticNegotiator`] seeded from the configuration.
    pub fn negotiator(mut self, negotiator: Arc<dyn SessionNegotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Dispatcher for unsolicited notifications. Channels of one session share one.
    pub fn dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Metrics sink.
    pub fn metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds a disconnected engine.
    pub fn build(self) -> TransportEngine {
        let config = self.config;
        let name = self.name.unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("transport-{}", &id[..8])
        });
        let (state, _) = watch::channel(EngineState::NotConnected);
        TransportEngine {
            inner: Arc::new(Inner {
                name,
                remote: self.remote,
                local: self.local,
                connector: self
                    .connector
                    .unwrap_or_else(|| Arc::new(TcpConnector::from_config(&config))),
                codec: self.codec.unwrap_or_else(|| Arc::new(Smb2Codec::new())),
                negotiator: self
                    .negotiator
                    .unwrap_or_else(|| Arc::new(StaticNegotiator::from_config(&config))),
                dispatcher: self
                    .dispatcher
                    .unwrap_or_else(|| NotificationDispatcher::new(config.notification.clone())),
                metrics: self.metrics.unwrap_or_default(),
                config,
                state,
                link: RwLock::new(None),
                next_id: AtomicU64::new(0),
                signing: RwLock::new(None),
                force_disconnect: AtomicBool::new(false),
                force_notify: Notify::new(),
                epoch: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
            }),
        }
    }
}

/// A connection to one server endpoint with request/response multiplexing.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct TransportEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEngine")
            .field("name", &self.inner.name)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl TransportEngine {
    /// Starts building an engine for `remote`.
    pub fn builder(remote: SocketAddr) -> EngineBuilder {
        EngineBuilder {
            remote,
            local: None,
            name: None,
            config: TransportConfig::default(),
            connector: None,
            codec: None,
            negotiator: None,
            dispatcher: None,
            metrics: None,
        }
    }

    /// Connects and runs the handshake within `timeout`.
    ///
    /// Returns immediately if already connected. Fails with
    /// [`TransportError::InvalidState`] while another connect is running and
    /// with [`TransportError::ConnectionTimeout`] if the deadline passes, in
    /// which case the engine is back in `NotConnected` and may be retried.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        let (before, changed) = inner.transition(|s| match s {
            EngineState::NotConnected | EngineState::Error => Some(EngineState::Connecting),
            _ => None,
        });
        if !changed {
            return match before {
                EngineState::Connected => Ok(()),
                EngineState::Connecting => {
                    Err(TransportError::InvalidState("connect already in progress".into()))
                }
                other => Err(TransportError::InvalidState(format!("cannot connect while {:?}", other))),
            };
        }
        let mut guard = ConnectGuard { inner, armed: true };

        if let Some(stale) = inner.current_link() {
            stale.abort_receive();
            stale.close(&inner.metrics).await;
            inner.set_link(None);
        }

        debug!(engine = %inner.name, remote = %inner.remote, "connecting");
        let attempt = async {
            let conn = inner.connector.connect(inner.remote, inner.local, timeout).await?;
            match inner.negotiator.negotiate(conn.as_ref(), inner.codec.as_ref()).await {
                Ok(session) => Ok((conn, session)),
                Err(e) => {
                    let _ = conn.close().await;
                    Err(e)
                }
            }
        };
        let (conn, session) = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                warn!(engine = %inner.name, remote = %inner.remote, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                warn!(engine = %inner.name, remote = %inner.remote, "connect timed out");
                return Err(TransportError::ConnectionTimeout {
                    addr: inner.remote.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        inner.next_id.store(session.next_message_id, Ordering::Release);
        if let Some(signing) = &session.signing {
            *inner.signing.write().unwrap_or_else(|p| p.into_inner()) = Some(signing.clone());
        }
        inner.force_disconnect.store(false, Ordering::Release);
        let link = Arc::new(Link::new(conn, session));
        inner.set_link(Some(link.clone()));
        inner.metrics.connection_opened();
        inner.touch();
        guard.armed = false;
        inner.transition(|_| Some(EngineState::Connected));

        let task = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            link.clone(),
            inner.config.idle_timeout(),
        ));
        *link.receive_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        info!(
            engine = %inner.name,
            remote = %inner.remote,
            local = %link.conn.local_addr(),
            credits = link.credits.granted(),
            "connected"
        );
        Ok(())
    }

    /// Sends `request` and waits up to `timeout` for its response.
    ///
    /// Waits for credits within the same deadline. A write failure hard
    /// disconnects the engine before the error is returned. A timeout only
    /// abandons this request; the connection stays up.
    pub async fn send_and_receive(&self, mut request: OutgoingRequest, timeout: Duration) -> Result<Response> {
        let inner = &self.inner;
        let link = inner.active_link()?;
        let deadline = Instant::now() + timeout;
        let charge = request.credit_charge.max(1);

        inner.reserve_credits(&link, charge, deadline).await?;

        let id = match request.id {
            Some(id) => id,
            None => inner.next_id.fetch_add(u64::from(charge), Ordering::AcqRel),
        };
        request.id = Some(id);
        request.credit_charge = charge;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let handle = match link.pending.register(id, remaining, charge) {
            Ok(handle) => handle,
            Err(e) => {
                link.credits.release(u32::from(charge));
                return Err(e);
            }
        };

        request.credits_requested = inner.credits_to_request(&link.credits);
        let signing = inner.signing();
        let frame = match inner.codec.encode(&request, signing.as_ref()) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(charge) = link.pending.fail(id, e.clone()) {
                    link.credits.release(u32::from(charge));
                }
                return Err(e);
            }
        };

        if let Err(e) = link.conn.send(&frame).await {
            warn!(engine = %inner.name, id, error = %e, "write failed, disconnecting");
            if let Err(d) = self.disconnect(true).await {
                debug!(engine = %inner.name, error = %d, "disconnect after write failure");
            }
            return Err(e);
        }
        inner.metrics.request_sent(frame.len());
        inner.touch();
        trace!(engine = %inner.name, id, command = request.command, charge, "request sent");

        match link.pending.wait(handle).await {
            Ok(frame) => Ok(Response::from(frame)),
            Err(e) => {
                if e.is_timeout() {
                    inner.metrics.inc_timeouts_total();
                    debug!(engine = %inner.name, id, "request timed out");
                }
                Err(e)
            }
        }
    }

    /// Sends an ECHO and returns the round-trip time.
    pub async fn echo(&self, timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .send_and_receive(OutgoingRequest::new(command::ECHO, Bytes::from_static(&ECHO_BODY)), timeout)
            .await?;
        if !response.is_success() {
            return Err(TransportError::InvalidFrame {
                reason: format!("echo failed with status 0x{:08x}", response.status),
            });
        }
        Ok(started.elapsed())
    }

    /// Tears down the connection. Idempotent.
    ///
    /// A soft disconnect (`hard == false`) refuses new requests and waits up to
    /// the drain timeout for outstanding ones; a concurrent hard disconnect
    /// cuts the wait short. A hard disconnect fails every pending request
    /// immediately.
    pub async fn disconnect(&self, hard: bool) -> Result<()> {
        let inner = &self.inner;
        let (before, changed) = inner.transition(|s| match s {
            EngineState::Connected | EngineState::Error => Some(EngineState::Disconnecting),
            _ => None,
        });
        if !changed {
            return match before {
                EngineState::NotConnected => Ok(()),
                EngineState::Connecting => {
                    Err(TransportError::InvalidState("connect in progress".into()))
                }
                _ => {
                    if hard {
                        inner.force_disconnect.store(true, Ordering::Release);
                        inner.force_notify.notify_waiters();
                    }
                    let mut rx = inner.state.subscribe();
                    let _ = rx.wait_for(|s| *s != EngineState::Disconnecting).await;
                    Ok(())
                }
            };
        }

        let link = inner.current_link();
        let mut guard = DisconnectGuard { inner, link: link.clone(), armed: true };
        if let Some(link) = &link {
            if !hard && before == EngineState::Connected && !link.pending.is_empty() {
                debug!(engine = %inner.name, pending = link.pending.len(), "draining before disconnect");
                let forced = inner.force_notify.notified();
                tokio::pin!(forced);
                forced.as_mut().enable();
                if !inner.force_disconnect.load(Ordering::Acquire) {
                    tokio::select! {
                        _ = link.pending.wait_drained() => {}
                        _ = &mut forced => debug!(engine = %inner.name, "disconnect forced"),
                        _ = tokio::time::sleep(inner.config.drain_timeout()) => {
                            warn!(engine = %inner.name, pending = link.pending.len(), "drain timed out");
                        }
                    }
                }
            }
            let failed = link.pending.fail_all(TransportError::Disconnected {
                reason: "transport disconnected".into(),
            });
            link.credits.wake_all();
            link.abort_receive();
            link.close(&inner.metrics).await;
            if failed > 0 {
                debug!(engine = %inner.name, failed, "failed pending requests on disconnect");
            }
        }
        guard.armed = false;
        inner.set_link(None);
        inner.force_disconnect.store(false, Ordering::Release);
        inner.transition(|_| Some(EngineState::NotConnected));
        info!(engine = %inner.name, remote = %inner.remote, hard, "disconnected");
        Ok(())
    }

    /// Installs the signing context produced by session setup.
    pub fn set_signing(&self, signing: Option<SigningContext>) {
        *self.inner.signing.write().unwrap_or_else(|p| p.into_inner()) = signing;
    }

    /// Engine name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Server endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Local address of the current connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.current_link().map(|l| l.conn.local_addr())
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Whether requests can be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == EngineState::Connected
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.current_link().map(|l| l.pending.len()).unwrap_or(0)
    }

    /// Credit state of the current connection.
    pub fn credits(&self) -> Option<CreditSnapshot> {
        self.inner.current_link().map(|l| l.credits.snapshot())
    }

    /// Handshake result of the current connection.
    pub fn session(&self) -> Option<NegotiatedSession> {
        self.inner.current_link().map(|l| l.session.clone())
    }

    /// Capabilities of the current connection.
    pub fn capabilities(&self) -> Option<TransportCapabilities> {
        self.inner.current_link().map(|l| l.conn.capabilities())
    }

    /// Time since the last frame was sent or received.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed));
        self.inner.epoch.elapsed().saturating_sub(last)
    }

    /// Metrics of this engine.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.inner.metrics
    }

    /// Dispatcher receiving this engine's notifications.
    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.inner.dispatcher
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }
}
