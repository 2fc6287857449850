//! Transport configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::rdma::RdmaConfig;

/// Strategy used to place requests across bonded channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Rotate through healthy channels.
    RoundRobin,
    /// Pick the healthy channel with the fewest outstanding requests.
    LeastLoaded,
    /// Pick the healthy channel with the highest channel score.
    #[default]
    AdaptiveScore,
}

/// Whether additional channels must be bound to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelBindingPolicy {
    /// Never bind.
    Disabled,
    /// Bind; drop the channel when binding fails.
    #[default]
    Preferred,
    /// Bind; fail initialization when binding fails.
    Required,
}

/// Backoff settings for dispatcher-owned polling tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Poll interval with no failures.
    pub base_poll_interval_ms: u64,
    /// Upper bound on the poll interval.
    pub max_poll_interval_ms: u64,
    /// First retry delay after a failure.
    pub base_retry_delay_ms: u64,
    /// Upper bound on the retry delay.
    pub max_retry_delay_ms: u64,
    /// Cap on the exponent of the retry backoff.
    pub max_backoff_shift: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            base_poll_interval_ms: 1000,
            max_poll_interval_ms: 30_000,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_backoff_shift: 3,
        }
    }
}

impl NotificationConfig {
    /// Poll interval after `failures` consecutive failures.
    pub fn poll_interval(&self, failures: u32) -> Duration {
        let ms = self
            .base_poll_interval_ms
            .saturating_add(u64::from(failures).saturating_mul(2000))
            .min(self.max_poll_interval_ms);
        Duration::from_millis(ms)
    }

    /// Retry delay after `failures` consecutive failures.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let shift = failures.min(self.max_backoff_shift).min(32);
        let ms = self
            .base_retry_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_retry_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Failed-channel recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Reconnect attempts over the same interface pair before a replacement is tried.
    pub max_recovery_attempts: u32,
    /// Delay before the first attempt; doubles on each subsequent one.
    pub initial_retry_delay_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            initial_retry_delay_ms: 1000,
        }
    }
}

impl FailoverConfig {
    /// Delay before recovery attempt `attempt` (zero-based): 1s, 2s, 4s with defaults.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.initial_retry_delay_ms
                .saturating_mul(1u64 << attempt.min(16)),
        )
    }
}

/// Configuration for transport engines and the channel manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Whether multi-channel bonding is enabled.
    pub multi_channel_enabled: bool,
    /// Maximum number of bonded channels.
    pub max_channels: usize,
    /// Interval between channel health checks.
    pub health_check_interval_ms: u64,
    /// Request placement strategy.
    pub load_balancing: LoadBalancing,
    /// Session binding policy for additional channels.
    pub channel_binding: ChannelBindingPolicy,
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    /// Connect and handshake timeout.
    pub connect_timeout_ms: u64,
    /// Read idle timeout of the receive loop.
    pub idle_timeout_ms: u64,
    /// Bound on how long a soft disconnect waits for outstanding requests.
    pub drain_timeout_ms: u64,
    /// How long credits of a timed-out request stay reserved for its late answer.
    pub abandoned_grace_ms: u64,
    /// Credits assumed before negotiation.
    pub initial_credits: u32,
    /// Credits the engine tries to keep granted.
    pub desired_credits: u32,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
    /// Disable Nagle on TCP connections.
    pub nodelay: bool,
    /// Notification polling backoff.
    pub notification: NotificationConfig,
    /// Channel failover.
    pub failover: FailoverConfig,
    /// SMB Direct transport.
    pub rdma: RdmaConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            multi_channel_enabled: false,
            max_channels: 4,
            health_check_interval_ms: 10_000,
            load_balancing: LoadBalancing::default(),
            channel_binding: ChannelBindingPolicy::default(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5000,
            idle_timeout_ms: 60_000,
            drain_timeout_ms: 5000,
            abandoned_grace_ms: 60_000,
            initial_credits: 1,
            desired_credits: 512,
            max_frame_size: 16 * 1024 * 1024,
            nodelay: true,
            notification: NotificationConfig::default(),
            failover: FailoverConfig::default(),
            rdma: RdmaConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_channels == 0 {
            return Err(TransportError::Config("max_channels must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(TransportError::Config("timeouts must be non-zero".into()));
        }
        if self.idle_timeout_ms == 0 || self.health_check_interval_ms == 0 {
            return Err(TransportError::Config(
                "idle timeout and health check interval must be non-zero".into(),
            ));
        }
        if self.abandoned_grace_ms == 0 {
            return Err(TransportError::Config("abandoned_grace_ms must be non-zero".into()));
        }
        if self.initial_credits == 0 {
            return Err(TransportError::Config("initial_credits must be at least 1".into()));
        }
        if self.max_frame_size < crate::protocol::SMB2_HEADER_SIZE {
            return Err(TransportError::Config(format!(
                "max_frame_size {} is smaller than a header",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    /// Default per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect and handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Receive loop idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Soft disconnect drain bound.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Grace period for late answers to timed-out requests.
    pub fn abandoned_grace(&self) -> Duration {
        Duration::from_millis(self.abandoned_grace_ms)
    }

    /// Interval between channel health checks.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}
