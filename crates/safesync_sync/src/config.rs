//! Configuration for the sync driver.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Appended to the friendly name to form the remote object name.
    pub remote_suffix: String,
    /// Upper bound for a single remote call.
    pub timeout: Duration,
    /// Retry configuration for uploads.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            remote_suffix: ".psafe3".to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the remote name suffix.
    #[must_use]
    pub fn with_remote_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.remote_suffix = suffix.into();
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the upload retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the remote object name for a friendly name.
    #[must_use]
    pub fn remote_name(&self, name: &str) -> String {
        format!("{name}{}", self.remote_suffix)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How failed uploads are retried.
///
/// Only retryable network errors are retried. The pause before retry `n`
/// is `initial_delay * 2^(n-1)`, capped at `max_delay`, plus up to a quarter
/// of that when jitter is on. Downloads and revision checks are never
/// retried; the next sync repeats them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Upload attempts per sync, the first one included. Zero counts as one.
    pub max_attempts: u32,
    /// Pause before the first retry.
    pub initial_delay: Duration,
    /// Longest pause between two attempts, before jitter.
    pub max_delay: Duration,
    /// Spread concurrent retries by a random extra pause.
    pub jitter: bool,
}

impl RetryConfig {
    /// Allows `max_attempts` uploads per sync.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// Uploads once and reports the first failure.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1).with_jitter(false)
    }

    /// Sets the pause before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps the pause between attempts.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Turns jitter on or off.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the number of upload attempts per sync.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Returns the pause before retry number `retry` (1 for the first retry).
    /// No pause precedes the first attempt.
    #[must_use]
    pub fn pause_before(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let doublings = (retry - 1).min(31);
        let pause = self
            .initial_delay
            .saturating_mul(1_u32 << doublings)
            .min(self.max_delay);
        if !self.jitter || pause.is_zero() {
            return pause;
        }

        let spread = u64::try_from(pause.as_micros() / 4).unwrap_or(u64::MAX);
        pause + Duration::from_micros(rand::thread_rng().gen_range(0..=spread))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
