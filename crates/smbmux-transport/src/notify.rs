//! Routing of server-initiated notifications to per-resource handlers.
//!
//! The receive loop hands every lease or oplock break to
//! [`NotificationDispatcher::dispatch`]. Handlers are looked up by
//! [`ResourceKey`]. A handler that fails or panics is counted and isolated;
//! it never reaches the receive loop.
//!
//! The dispatcher also owns polling tasks ([`NotificationDispatcher::watch`])
//! for resources whose changes must be fetched rather than pushed. Each task
//! checks its registration's active flag on every iteration and is woken by
//! [`NotificationDispatcher::unregister`], so a removed registration never
//! leaves a task behind.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::NotificationConfig;
use crate::error::{Result, TransportError};
use crate::protocol::{Notification, ResourceKey};

/// Receives notifications for one resource.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handles a notification. Errors are logged and counted by the dispatcher.
    fn on_notification(&self, notification: &Notification) -> anyhow::Result<()>;
}

impl<F> NotificationHandler for F
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        self(notification)
    }
}

/// Fetches pending changes for a watched resource.
#[async_trait]
pub trait ChangePoller: Send + Sync + 'static {
    /// Returns the notifications observed since the previous poll.
    async fn poll(&self, key: &ResourceKey) -> anyhow::Result<Vec<Notification>>;
}

/// Result of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and succeeded.
    Delivered,
    /// No active handler for the key.
    Dropped,
    /// The handler returned an error or panicked.
    HandlerFailed,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Notifications delivered to a handler.
    pub dispatched: u64,
    /// Notifications with no active handler.
    pub dropped: u64,
    /// Handler errors and panics.
    pub handler_failures: u64,
    /// Polls performed by watch tasks.
    pub polls: u64,
    /// Polls that failed.
    pub poll_failures: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    polls: AtomicU64,
    poll_failures: AtomicU64,
}

struct Registration {
    handler: Arc<dyn NotificationHandler>,
    active: Arc<AtomicBool>,
    wake: Arc<Notify>,
    poll_task: Option<JoinHandle<()>>,
}

impl Registration {
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }
}

struct Inner {
    registry: DashMap<ResourceKey, Registration>,
    counters: Counters,
    config: NotificationConfig,
}

impl Inner {
    fn invoke(&self, key: &ResourceKey, handler: &dyn NotificationHandler, n: &Notification) -> DispatchOutcome {
        match catch_unwind(AssertUnwindSafe(|| handler.on_notification(n))) {
            Ok(Ok(())) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Delivered
            }
            Ok(Err(e)) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "notification handler failed");
                DispatchOutcome::HandlerFailed
            }
            Err(_) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(%key, "notification handler panicked");
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

/// Routes notifications to registered handlers.
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(NotificationConfig::default())
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("registrations", &self.inner.registry.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl NotificationDispatcher {
    /// Creates a dispatcher with the given polling backoff.
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: DashMap::new(),
                counters: Counters::default(),
                config,
            }),
        }
    }

    /// Registers `handler` for `key`, replacing (and deactivating) any previous one.
    pub fn register(&self, key: ResourceKey, handler: Arc<dyn NotificationHandler>) {
        let registration = Registration {
            handler,
            active: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
            poll_task: None,
        };
        if let Some(previous) = self.inner.registry.insert(key, registration) {
            previous.deactivate();
        }
        debug!(%key, "notification handler registered");
    }

    /// Removes the registration for `key` and stops its poll task.
    ///
    /// Returns false if nothing was registered.
    pub fn unregister(&self, key: &ResourceKey) -> bool {
        match self.inner.registry.remove(key) {
            Some((_, registration)) => {
                registration.deactivate();
                debug!(%key, "notification handler unregistered");
                true
            }
            None => false,
        }
    }

    /// Whether an active handler is registered for `key`.
    pub fn is_registered(&self, key: &ResourceKey) -> bool {
        self.inner
            .registry
            .get(key)
            .map(|r| r.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Delivers `notification` to the handler registered for its key.
    ///
    /// Never panics and never propagates handler failures.
    pub fn dispatch(&self, notification: &Notification) -> DispatchOutcome {
        let key = notification.key;
        let handler = self.inner.registry.get(&key).and_then(|r| {
            r.active
                .load(Ordering::Acquire)
                .then(|| r.handler.clone())
        });
        // The map guard is released before the handler runs, so a handler may
        // unregister itself.
        match handler {
            Some(handler) => self.inner.invoke(&key, handler.as_ref(), notification),
            None => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%key, kind = ?notification.kind, "dropping notification with no handler");
                DispatchOutcome::Dropped
            }
        }
    }

    /// Starts polling `key` with `poller`, delivering results to its handler.
    ///
    /// Requires a registration for `key`. A previous poll task for the same
    /// registration is stopped.
    pub fn watch(&self, key: ResourceKey, poller: Arc<dyn ChangePoller>) -> Result<()> {
        let mut registration = self.inner.registry.get_mut(&key).ok_or_else(|| {
            TransportError::InvalidState(format!("no handler registered for {}", key))
        })?;
        if let Some(previous) = registration.poll_task.take() {
            previous.abort();
        }
        let active = registration.active.clone();
        let wake = registration.wake.clone();
        let handler = registration.handler.clone();
        let inner = self.inner.clone();
        registration.poll_task = Some(tokio::spawn(async move {
            poll_loop(inner, key, handler, poller, active, wake).await;
        }));
        Ok(())
    }

    /// Stops the poll task for `key` but keeps the handler registered.
    pub fn unwatch(&self, key: &ResourceKey) -> bool {
        match self.inner.registry.get_mut(key) {
            Some(mut registration) => match registration.poll_task.take() {
                Some(task) => {
                    task.abort();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Deactivates every registration and waits for poll tasks to exit.
    pub async fn shutdown(&self) {
        let keys: Vec<ResourceKey> = self.inner.registry.iter().map(|r| *r.key()).collect();
        let mut tasks = Vec::new();
        for key in keys {
            if let Some((_, mut registration)) = self.inner.registry.remove(&key) {
                registration.deactivate();
                if let Some(task) = registration.poll_task.take() {
                    tasks.push(task);
                }
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Snapshot of the dispatcher counters.
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            polls: c.polls.load(Ordering::Relaxed),
            poll_failures: c.poll_failures.load(Ordering::Relaxed),
        }
    }
}

/// Sleeps for `delay` unless the registration is deactivated first.
///
/// Returns false once the registration is inactive.
async fn sleep_while_active(delay: std::time::Duration, active: &AtomicBool, wake: &Notify) -> bool {
    let notified = wake.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if !active.load(Ordering::Acquire) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = notified => {}
    }
    active.load(Ordering::Acquire)
}

async fn poll_loop(
    inner: Arc<Inner>,
    key: ResourceKey,
    handler: Arc<dyn NotificationHandler>,
    poller: Arc<dyn ChangePoller>,
    active: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let mut failures: u32 = 0;
    debug!(%key, "watch started");
    loop {
        if !sleep_while_active(inner.config.poll_interval(failures), &active, &wake).await {
            break;
        }
        inner.counters.polls.fetch_add(1, Ordering::Relaxed);
        match poller.poll(&key).await {
            Ok(events) => {
                failures = 0;
                for event in &events {
                    if !active.load(Ordering::Acquire) {
                        break;
                    }
                    inner.invoke(&key, handler.as_ref(), event);
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                inner.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
                let delay = inner.config.retry_delay(failures);
                warn!(%key, failures, retry_in_ms = delay.as_millis() as u64, error = %e, "watch poll failed");
                if !sleep_while_active(delay, &active, &wake).await {
                    break;
                }
            }
        }
    }
    debug!(%key, "watch stopped");
}
