//! Bonded channels and their health.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::TransportEngine;
use crate::error::TransportError;
use crate::interface::{InterfacePair, NetworkInterfaceInfo};

const STATE_ESTABLISHING: u8 = 0;
const STATE_HEALTHY: u8 = 1;
const STATE_DEGRADED: u8 = 2;
const STATE_FAILED: u8 = 3;
const STATE_REMOVED: u8 = 4;

/// Error rate above which a channel is degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.10;

const HEALTH_WINDOW: usize = 100;
const MIN_HEALTH_SAMPLES: usize = 10;

/// Health state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    /// Connecting or binding.
    Establishing,
    /// Selectable.
    Healthy,
    /// Working but with a high error rate; not selectable.
    Degraded,
    /// Connection lost; recovery may bring it back.
    Failed,
    /// Gone for good.
    Removed,
}

impl From<u8> for ChannelState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_ESTABLISHING => ChannelState::Establishing,
            STATE_HEALTHY => ChannelState::Healthy,
            STATE_DEGRADED => ChannelState::Degraded,
            STATE_FAILED => ChannelState::Failed,
            _ => ChannelState::Removed,
        }
    }
}

impl From<ChannelState> for u8 {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Establishing => STATE_ESTABLISHING,
            ChannelState::Healthy => STATE_HEALTHY,
            ChannelState::Degraded => STATE_DEGRADED,
            ChannelState::Failed => STATE_FAILED,
            ChannelState::Removed => STATE_REMOVED,
        }
    }
}

/// Point-in-time view of a channel's health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelHealthSnapshot {
    /// Outcomes in the window.
    pub samples: usize,
    /// Failed outcomes in the window.
    pub failures: usize,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Latency of the last successful exchange, in microseconds.
    pub last_latency_us: u64,
    /// Moving average latency, in microseconds.
    pub avg_latency_us: u64,
}

impl ChannelHealthSnapshot {
    /// Fraction of failed outcomes in the window.
    pub fn error_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.failures as f64 / self.samples as f64
        }
    }
}

#[derive(Default)]
struct HealthWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    consecutive_failures: u32,
    last_latency_us: u64,
    avg_latency_us: u64,
}

/// Outcome window of the last exchanges on a channel.
#[derive(Default)]
pub struct ChannelHealth {
    window: Mutex<HealthWindow>,
}

impl ChannelHealth {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthWindow> {
        self.window.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(window: &mut HealthWindow, ok: bool) {
        if window.outcomes.len() == HEALTH_WINDOW {
            if let Some(false) = window.outcomes.pop_front() {
                window.failures -= 1;
            }
        }
        window.outcomes.push_back(ok);
        if !ok {
            window.failures += 1;
        }
    }

    /// Records a successful exchange.
    pub fn record_success(&self, latency: Duration) {
        let mut window = self.lock();
        Self::push(&mut window, true);
        window.consecutive_failures = 0;
        let us = latency.as_micros() as u64;
        window.last_latency_us = us;
        window.avg_latency_us = if window.avg_latency_us == 0 {
            us
        } else {
            (window.avg_latency_us * 7 + us) / 8
        };
    }

    /// Records a failed exchange.
    pub fn record_failure(&self) {
        let mut window = self.lock();
        Self::push(&mut window, false);
        window.consecutive_failures = window.consecutive_failures.saturating_add(1);
    }

    /// Forgets all outcomes.
    pub fn reset(&self) {
        *self.lock() = HealthWindow::default();
    }

    /// Fraction of failed outcomes in the window.
    pub fn error_rate(&self) -> f64 {
        self.snapshot().error_rate()
    }

    /// Current view.
    pub fn snapshot(&self) -> ChannelHealthSnapshot {
        let window = self.lock();
        ChannelHealthSnapshot {
            samples: window.outcomes.len(),
            failures: window.failures,
            consecutive_failures: window.consecutive_failures,
            last_latency_us: window.last_latency_us,
            avg_latency_us: window.avg_latency_us,
        }
    }
}

/// Identifier of a channel within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// One bonded path: a transport engine plus its interface pairing.
pub struct ChannelInfo {
    id: ChannelId,
    label: String,
    engine: TransportEngine,
    pair: InterfacePair,
    sequence: u32,
    binding_hash: Option<[u8; 32]>,
    primary: bool,
    state: AtomicU8,
    health: ChannelHealth,
}

impl ChannelInfo {
    /// Wraps an engine. The channel starts in `Establishing`.
    pub fn new(
        id: ChannelId,
        engine: TransportEngine,
        pair: InterfacePair,
        sequence: u32,
        binding_hash: Option<[u8; 32]>,
        primary: bool,
    ) -> Self {
        Self {
            id,
            label: id.to_string(),
            engine,
            pair,
            sequence,
            binding_hash,
            primary,
            state: AtomicU8::new(STATE_ESTABLISHING),
            health: ChannelHealth::new(),
        }
    }

    /// Channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Engine carrying this channel.
    pub fn engine(&self) -> &TransportEngine {
        &self.engine
    }

    /// Interface pairing.
    pub fn pair(&self) -> &InterfacePair {
        &self.pair
    }

    /// Client-side interface.
    pub fn local_interface(&self) -> &NetworkInterfaceInfo {
        &self.pair.local
    }

    /// Server-side interface.
    pub fn remote_interface(&self) -> &NetworkInterfaceInfo {
        &self.pair.remote
    }

    /// Binding sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Hash presented when the channel was bound to the session.
    pub fn binding_hash(&self) -> Option<&[u8; 32]> {
        self.binding_hash.as_ref()
    }

    /// Whether this is the session's first channel.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Health outcomes.
    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the balancer may pick this channel.
    pub fn is_selectable(&self) -> bool {
        self.state() == ChannelState::Healthy
    }

    /// Requests outstanding on the channel.
    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(u8::from(from), u8::from(to), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks a freshly connected or recovered channel healthy.
    pub fn mark_healthy(&self) -> bool {
        let ok = self.transition(ChannelState::Establishing, ChannelState::Healthy)
            || self.transition(ChannelState::Failed, ChannelState::Healthy);
        if ok {
            self.health.reset();
            info!(channel = %self.label, "channel healthy");
        }
        ok
    }

    /// Moves the channel to `Failed`. Returns `false` if it already failed or
    /// was removed, so each failure is handled once.
    pub fn mark_failed(&self) -> bool {
        [ChannelState::Healthy, ChannelState::Degraded, ChannelState::Establishing]
            .into_iter()
            .any(|from| self.transition(from, ChannelState::Failed))
    }

    /// Moves the channel to `Removed`. Returns `false` if it already was.
    pub fn mark_removed(&self) -> bool {
        self.state.swap(STATE_REMOVED, Ordering::AcqRel) != STATE_REMOVED
    }

    /// Re-evaluates `Healthy`/`Degraded` from the error rate once the window
    /// holds enough samples.
    pub fn refresh_health(&self) -> ChannelState {
        let snap = self.health.snapshot();
        let rate = snap.error_rate();
        if snap.samples >= MIN_HEALTH_SAMPLES && rate > DEGRADED_ERROR_RATE {
            if self.transition(ChannelState::Healthy, ChannelState::Degraded) {
                debug!(channel = %self.label, error_rate = rate, "channel degraded");
            }
        } else if self.transition(ChannelState::Degraded, ChannelState::Healthy) {
            debug!(channel = %self.label, error_rate = rate, "channel recovered");
        }
        self.state()
    }

    /// Feeds a request outcome into the health window.
    pub fn record<T>(&self, result: &Result<T, TransportError>, latency: Duration) {
        match result {
            Ok(_) => self.health.record_success(latency),
            Err(_) => self.health.record_failure(),
        }
    }

    /// Placement score used by adaptive balancing.
    pub fn score(&self) -> i64 {
        channel_score(self.health.error_rate(), self.pending_count(), self.pair.local.score())
    }

    /// Serializable view.
    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id,
            label: self.label.clone(),
            state: self.state(),
            primary: self.primary,
            local: self.pair.local.address.to_string(),
            remote: self.pair.remote.address.to_string(),
            pending: self.pending_count(),
            score: self.score(),
            health: self.health.snapshot(),
        }
    }
}

impl fmt::Debug for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInfo")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("local", &self.pair.local.address)
            .field("remote", &self.pair.remote.address)
            .finish()
    }
}

/// Score from error rate, load and local interface score.
///
/// Starts at 100. Loses 50 above a 10% error rate (20 above 5%) and 10 per
/// 10 pending requests, at most 40. Gains a thousandth of the interface score.
pub fn channel_score(error_rate: f64, pending: usize, interface_score: u64) -> i64 {
    let mut score: i64 = 100;
    if error_rate > 0.10 {
        score -= 50;
    } else if error_rate > 0.05 {
        score -= 20;
    }
    score -= ((pending / 10) as i64 * 10).min(40);
    score + (interface_score / 1000) as i64
}

/// Serializable description of a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    /// Channel id.
    pub id: ChannelId,
    /// Label.
    pub label: String,
    /// State.
    pub state: ChannelState,
    /// Whether this is the first channel.
    pub primary: bool,
    /// Local address.
    pub local: String,
    /// Remote address.
    pub remote: String,
    /// Outstanding requests.
    pub pending: usize,
    /// Placement score.
    pub score: i64,
    /// Health window.
    pub health: ChannelHealthSnapshot,
}
