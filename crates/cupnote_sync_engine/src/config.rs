//! Configuration for the sync engine.

use crate::error::SyncError;
use crate::network::NetworkQuality;
use cupnote_sync_protocol::RecordType;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Interval used by [`SyncConfig::with_periodic_sync`].
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Observer invoked before each retry with the 1-based retry number and
/// the error that caused it.
pub type RetryCallback = Arc<dyn Fn(u32, &SyncError) + Send + Sync>;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Owner of the synced rows.
    pub user_id: String,
    /// Master switch; a disabled engine never syncs.
    pub enabled: bool,
    /// Start a pass when connectivity comes back.
    pub auto_sync_on_reconnect: bool,
    /// Interval for periodic sync.
    pub sync_interval: Option<Duration>,
    /// Secondary record types, synced after tastings in this order.
    pub secondary_types: Vec<RecordType>,
    /// Retry configuration for every network call.
    pub retry: RetryConfig,
    /// Tune `retry` to the reported network quality.
    pub adapt_to_quality: bool,
    /// Push cafe and roaster visit counters at the end of a pass.
    pub sync_venue_visits: bool,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            enabled: true,
            auto_sync_on_reconnect: true,
            sync_interval: None,
            secondary_types: RecordType::SECONDARY.to_vec(),
            retry: RetryConfig::default(),
            adapt_to_quality: true,
            sync_venue_visits: true,
        }
    }

    /// Enables or disables sync entirely.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enables or disables sync on reconnect.
    pub fn with_auto_sync_on_reconnect(mut self, enabled: bool) -> Self {
        self.auto_sync_on_reconnect = enabled;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Enables periodic sync at the default five minute interval.
    pub fn with_periodic_sync(self) -> Self {
        self.with_sync_interval(DEFAULT_SYNC_INTERVAL)
    }

    /// Sets the secondary record types.
    pub fn with_secondary_types(mut self, types: impl Into<Vec<RecordType>>) -> Self {
        self.secondary_types = types.into();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables quality-based retry tuning.
    pub fn with_adapt_to_quality(mut self, adapt: bool) -> Self {
        self.adapt_to_quality = adapt;
        self
    }

    /// Enables or disables pushing venue visit counters.
    pub fn with_venue_visits(mut self, enabled: bool) -> Self {
        self.sync_venue_visits = enabled;
        self
    }

    /// Every record type a pass touches, primary first.
    pub fn record_types(&self) -> Vec<RecordType> {
        let mut types = vec![RecordType::Tasting];
        types.extend(self.secondary_types.iter().copied().filter(|t| !t.is_primary()));
        types
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Retry observer.
    pub on_retry: Option<RetryCallback>,
}

impl RetryConfig {
    /// Creates a retry configuration with default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            timeout: Duration::from_secs(60),
            on_retry: None,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            ..Self::default()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff factor.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry observer.
    pub fn with_on_retry(mut self, callback: impl Fn(u32, &SyncError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Delay before retry number `attempt + 1` (`attempt` is 0-indexed):
    /// `min(initial_delay * backoff_factor^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Returns a copy tuned for the given link quality.
    ///
    /// Slow links get more retries, a longer first delay and a longer
    /// per-attempt timeout.
    pub fn for_quality(&self, quality: NetworkQuality) -> Self {
        let mut tuned = self.clone();
        if quality == NetworkQuality::Low {
            tuned.max_retries = tuned.max_retries.max(5);
            tuned.initial_delay = tuned.initial_delay.max(Duration::from_millis(2000));
            tuned.timeout = tuned.timeout.max(Duration::from_secs(120));
        }
        tuned
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("timeout", &self.timeout)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}
