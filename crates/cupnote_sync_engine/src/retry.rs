//! Bounded exponential backoff around async operations.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Runs async operations under the retry policy of a [`RetryConfig`].
///
/// Every attempt is raced against the configured timeout. Retryable
/// failures (network, timeout, 5xx) are retried after
/// `min(initial_delay * backoff_factor^n, max_delay)`; anything else is
/// returned at once. While offline the executor waits for connectivity
/// instead of sleeping, so it resumes as soon as the link returns.
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    network: NetworkMonitor,
    adapt_to_quality: bool,
    retries: AtomicU64,
}

impl RetryExecutor {
    /// Creates an executor.
    pub fn new(config: RetryConfig, network: NetworkMonitor) -> Self {
        Self {
            config,
            network,
            adapt_to_quality: false,
            retries: AtomicU64::new(0),
        }
    }

    /// Tunes the configuration to the monitor's link quality on every run.
    pub fn with_quality_adaptation(mut self, adapt: bool) -> Self {
        self.adapt_to_quality = adapt;
        self
    }

    /// Returns the base configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total retries performed by this executor.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Executes `operation`, retrying per the policy.
    ///
    /// `operation` is called once per attempt and must produce a fresh
    /// future each time. After `max_retries` retries the last error is
    /// returned without a further delay.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let config = if self.adapt_to_quality {
            self.config.for_quality(self.network.quality())
        } else {
            self.config.clone()
        };

        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(config.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(config.timeout)),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if attempt >= config.max_retries {
                warn!(attempts = attempt + 1, error = %error, "retries exhausted");
                return Err(error);
            }

            let delay = config.delay_for_attempt(attempt);
            attempt += 1;
            self.retries.fetch_add(1, Ordering::SeqCst);

            if let Some(on_retry) = &config.on_retry {
                on_retry(attempt, &error);
            }
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient error, retrying"
            );

            if self.network.is_connected() {
                tokio::time::sleep(delay).await;
            } else if !self.network.wait_for_connection(delay).await {
                return Err(SyncError::Network("network connection timeout".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn server_error() -> SyncError {
        SyncError::from_status(503, "unavailable")
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sequence_is_bounded() {
        let retries = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&retries);
        let config = RetryConfig::default().with_on_retry(move |attempt, _| seen.lock().push(attempt));
        let executor = RetryExecutor::new(config, NetworkMonitor::online());

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&attempts);
        let start = Instant::now();
        let result: SyncResult<()> = executor
            .run(|| {
                log.lock().push(start.elapsed());
                async { Err(server_error()) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Server { status: 503, .. })));
        assert_eq!(
            *attempts.lock(),
            vec![
                Duration::ZERO,
                Duration::from_millis(1000),
                Duration::from_millis(3000),
                Duration::from_millis(7000),
            ]
        );
        assert_eq!(*retries.lock(), vec![1, 2, 3]);
        assert_eq!(start.elapsed(), Duration::from_millis(7000));
        assert_eq!(executor.retry_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_short_circuits() {
        let retried = Arc::new(Mutex::new(0u32));
        let seen = Arc::clone(&retried);
        let config = RetryConfig::default().with_on_retry(move |_, _| *seen.lock() += 1);
        let executor = RetryExecutor::new(config, NetworkMonitor::online());

        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let start = Instant::now();
        let result: SyncResult<()> = executor
            .run(|| {
                *counter.lock() += 1;
                async { Err(SyncError::from_status(422, "invalid row")) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Rejected { status: 422, .. })));
        assert_eq!(*calls.lock(), 1);
        assert_eq!(*retried.lock(), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(executor.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failure() {
        let executor = RetryExecutor::new(RetryConfig::default(), NetworkMonitor::online());
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);

        let result = executor
            .run(|| {
                let call = {
                    let mut calls = counter.lock();
                    *calls += 1;
                    *calls
                };
                async move {
                    if call < 3 {
                        Err(SyncError::Network("connection reset".into()))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(executor.retry_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_retry() {
        let config = RetryConfig::new(1).with_timeout(Duration::from_secs(1));
        let executor = RetryExecutor::new(config, NetworkMonitor::online());
        let start = Instant::now();

        let result: SyncResult<()> = executor
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(120)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(SyncError::Timeout(t)) if t == Duration::from_secs(1)));
        // 1s attempt + 1s backoff + 1s attempt
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_retry_resumes_on_reconnect() {
        let network = NetworkMonitor::offline();
        let executor = RetryExecutor::new(RetryConfig::default(), network.clone());

        let reporter = network.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            reporter.set_connected(true);
        });

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&attempts);
        let start = Instant::now();
        let result = executor
            .run(|| {
                log.lock().push(start.elapsed());
                let online = network.is_connected();
                async move {
                    if online {
                        Ok("uploaded")
                    } else {
                        Err(SyncError::Network("offline".into()))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "uploaded");
        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_retry_gives_up_when_link_stays_down() {
        let executor = RetryExecutor::new(RetryConfig::default(), NetworkMonitor::offline());
        let start = Instant::now();

        let result: SyncResult<()> = executor
            .run(|| async { Err(SyncError::Network("offline".into())) })
            .await;

        match result {
            Err(SyncError::Network(message)) => assert_eq!(message, "network connection timeout"),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn low_quality_links_get_more_retries() {
        let network = NetworkMonitor::new(crate::network::NetworkState::cellular(
            crate::network::CellularGeneration::G2,
        ));
        let executor =
            RetryExecutor::new(RetryConfig::default(), network).with_quality_adaptation(true);

        let result: SyncResult<()> = executor.run(|| async { Err(server_error()) }).await;

        assert!(result.is_err());
        assert_eq!(executor.retry_count(), 5);
    }
}
