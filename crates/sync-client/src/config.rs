//! Client configuration and reconnect timing.

use std::time::Duration;
use sync_core::DeviceId;
use tokio::time::Instant;

/// Quiet period after the last local edit before a live push.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// How long a batch RPC (or the connect handshake) may take.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server, e.g. `ws://127.0.0.1:8787`.
    pub url: String,
    /// User whose notes this client syncs.
    pub user_id: String,
    /// This replica's vector clock key.
    pub device_id: DeviceId,
    pub debounce: Duration,
    pub rpc_timeout: Duration,
    /// Run a batch sync this often while connected (None = only on connect).
    pub batch_interval: Option<Duration>,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, user_id: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            url: url.into(),
            user_id: user_id.into(),
            device_id,
            debounce: DEFAULT_DEBOUNCE,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            batch_interval: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Minimum time between the starts of two connection attempts
    pub min_spacing: Duration,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            min_spacing: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping for one connection.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Failed attempts since the last successful connection
    pub attempts: u32,
    /// Backoff delay chosen for the current attempt
    pub current_delay: Duration,
    last_attempt: Option<Instant>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a connection attempt starts now.
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Count a failed attempt and return how long to wait before the next.
    ///
    /// The wait is the exponential backoff, stretched so that consecutive
    /// attempts start at least `min_spacing` apart.
    pub fn schedule_reconnect(&mut self, now: Instant, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);

        let since_last = self
            .last_attempt
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(config.min_spacing);
        self.current_delay
            .max(config.min_spacing.saturating_sub(since_last))
    }

    /// Reset after a successful connection. Spacing still counts from the
    /// last attempt.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}
