//! Retry bookkeeping for failed writes and feed syncs.
//!
//! The coordinator only answers "should this be retried, and after how
//! long" — callers own the actual retry loop. Counts are tracked per
//! (collection, operation kind) and reset on any success or on the
//! offline→online connectivity transition.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::types::Collection;

/// What kind of operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Durable write call
    Write,
    /// Feed subscription / resume
    FeedSync,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Write => write!(f, "write"),
            OperationKind::FeedSync => write!(f, "feed-sync"),
        }
    }
}

/// Verdict from [`RetryCoordinator::should_retry`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    /// Whether another attempt is allowed
    pub retry: bool,
    /// How long to wait before it
    pub delay: Duration,
}

/// Backoff tuning
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on the computed delay
    pub max_delay: Duration,
    /// Consecutive failures after which `retry` turns false
    pub max_attempts: u32,
    /// Fractional jitter applied to the delay (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
            jitter: 0.2,
        }
    }
}

/// Tracks consecutive failures and computes capped exponential backoff
pub struct RetryCoordinator {
    config: RetryConfig,
    failures: Mutex<HashMap<(Collection, OperationKind), u32>>,
}

impl RetryCoordinator {
    /// Create a coordinator with the given tuning
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed attempt, returning the new consecutive-failure count
    pub fn record_failure(&self, collection: Collection, kind: OperationKind) -> u32 {
        let mut failures = self.failures.lock();
        let count = failures.entry((collection, kind)).or_insert(0);
        *count += 1;
        debug!(%collection, %kind, count = *count, "attempt failed");
        *count
    }

    /// Record a success, resetting the counter for this key
    pub fn record_success(&self, collection: Collection, kind: OperationKind) {
        self.failures.lock().remove(&(collection, kind));
    }

    /// Current consecutive-failure count
    pub fn failure_count(&self, collection: Collection, kind: OperationKind) -> u32 {
        self.failures
            .lock()
            .get(&(collection, kind))
            .copied()
            .unwrap_or(0)
    }

    /// Reset every counter. Invoked on the offline→online transition.
    pub fn reset_all(&self) {
        let mut failures = self.failures.lock();
        if !failures.is_empty() {
            debug!(keys = failures.len(), "resetting retry counters");
            failures.clear();
        }
    }

    /// Whether the caller should retry, and after what delay.
    ///
    /// Zero recorded failures means retry immediately. Past the attempt cap
    /// the answer is `retry: false` with the capped delay, so callers can
    /// still show "next possible attempt" to the user.
    pub fn should_retry(&self, collection: Collection, kind: OperationKind) -> RetryDecision {
        let count = self.failure_count(collection, kind);
        if count == 0 {
            return RetryDecision {
                retry: true,
                delay: Duration::ZERO,
            };
        }
        RetryDecision {
            retry: count < self.config.max_attempts,
            delay: self.delay_for(count),
        }
    }

    /// Capped exponential delay for a failure count, with jitter
    fn delay_for(&self, count: u32) -> Duration {
        let exp = count.saturating_sub(1).min(31);
        let raw = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.max_delay);
        if self.config.jitter <= 0.0 {
            return raw;
        }
        let spread = raw.as_secs_f64() * self.config.jitter;
        let jittered = raw.as_secs_f64() + rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryCoordinator {
        RetryCoordinator::new(RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_no_failures_means_immediate_retry() {
        let retry = no_jitter();
        let decision = retry.should_retry(Collection::Messages, OperationKind::Write);
        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let retry = RetryCoordinator::new(RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            max_attempts: 100,
            jitter: 0.0,
        });
        let mut delays = Vec::new();
        for _ in 0..6 {
            retry.record_failure(Collection::Messages, OperationKind::Write);
            delays.push(
                retry
                    .should_retry(Collection::Messages, OperationKind::Write)
                    .delay,
            );
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_attempt_cap_turns_retry_off() {
        let retry = RetryCoordinator::new(RetryConfig {
            max_attempts: 2,
            jitter: 0.0,
            ..RetryConfig::default()
        });
        retry.record_failure(Collection::Channels, OperationKind::FeedSync);
        assert!(
            retry
                .should_retry(Collection::Channels, OperationKind::FeedSync)
                .retry
        );
        retry.record_failure(Collection::Channels, OperationKind::FeedSync);
        assert!(
            !retry
                .should_retry(Collection::Channels, OperationKind::FeedSync)
                .retry
        );
    }

    #[test]
    fn test_success_resets_only_its_key() {
        let retry = no_jitter();
        retry.record_failure(Collection::Messages, OperationKind::Write);
        retry.record_failure(Collection::Messages, OperationKind::FeedSync);
        retry.record_success(Collection::Messages, OperationKind::Write);
        assert_eq!(
            retry.failure_count(Collection::Messages, OperationKind::Write),
            0
        );
        assert_eq!(
            retry.failure_count(Collection::Messages, OperationKind::FeedSync),
            1
        );
    }

    #[test]
    fn test_reset_all_clears_everything() {
        let retry = no_jitter();
        retry.record_failure(Collection::Messages, OperationKind::Write);
        retry.record_failure(Collection::Webhooks, OperationKind::FeedSync);
        retry.reset_all();
        assert_eq!(
            retry.failure_count(Collection::Messages, OperationKind::Write),
            0
        );
        assert_eq!(
            retry.failure_count(Collection::Webhooks, OperationKind::FeedSync),
            0
        );
    }
}
