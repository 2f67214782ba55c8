//! Transaction options
//!
//! [`CommitOptions`] is immutable once built. Mutually exclusive
//! combinations are rejected by [`CommitOptionsBuilder::build`], before the
//! transaction ever reaches the queue.

use crate::error::TxnInitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of resync requested by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResyncType {
    /// Plain data-change transaction
    #[default]
    NotResync,
    /// Dump the southbound and reconcile in both directions
    FullResync,
    /// Trust the engine's view of the southbound, apply the NB diff only
    UpstreamResync,
    /// Re-dump the southbound and re-apply what northbound asked for
    DownstreamResync,
}

impl ResyncType {
    pub fn is_resync(&self) -> bool {
        !matches!(self, Self::NotResync)
    }
}

impl fmt::Display for ResyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotResync => "Not Resync",
            Self::FullResync => "Full Resync",
            Self::UpstreamResync => "Upstream Resync",
            Self::DownstreamResync => "Downstream Resync",
        };
        write!(f, "{}", s)
    }
}

/// Retry parameters for failed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds
    pub period_ms: u64,
    /// Maximum number of retries (0 = unlimited)
    pub max_count: u32,
    /// Double the delay with every attempt
    pub exp_backoff: bool,
}

impl RetryPolicy {
    /// One second period, three attempts, exponential backoff
    pub const DEFAULT: RetryPolicy = RetryPolicy {
        period_ms: 1000,
        max_count: 3,
        exp_backoff: true,
    };

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_max_count(mut self, max_count: u32) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn with_exp_backoff(mut self, exp_backoff: bool) -> Self {
        self.exp_backoff = exp_backoff;
        self
    }

    /// Whether another attempt (1-based) is allowed
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_count == 0 || attempt <= self.max_count
    }

    /// Delay before the next attempt, given the delay used for the previous one
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            Some(prev) if self.exp_backoff => prev * 2,
            _ => self.period(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Point of view for value dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    /// What is actually applied, read from the southbound
    SbView,
    /// What northbound requested
    NbView,
    /// The engine's view of the southbound
    InternalView,
}

/// Options passed alongside a commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    resync: ResyncType,
    verbose_resync: bool,
    non_blocking: bool,
    retry: Option<RetryPolicy>,
    revert: bool,
    description: Option<String>,
}

impl CommitOptions {
    pub fn builder() -> CommitOptionsBuilder {
        CommitOptionsBuilder::default()
    }

    /// Blocking data-change commit without retry or revert
    pub fn blocking() -> Self {
        Self::default()
    }

    pub fn resync(&self) -> ResyncType {
        self.resync
    }

    pub fn verbose_resync(&self) -> bool {
        self.verbose_resync
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    pub fn retry(&self) -> Option<RetryPolicy> {
        self.retry
    }

    pub fn revert_on_failure(&self) -> bool {
        self.revert
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Builder for [`CommitOptions`]
#[derive(Debug, Default)]
pub struct CommitOptionsBuilder {
    options: CommitOptions,
}

impl CommitOptionsBuilder {
    /// Request a resync; `verbose` logs the graph before and after refresh
    pub fn resync(mut self, resync: ResyncType, verbose: bool) -> Self {
        self.options.resync = resync;
        self.options.verbose_resync = verbose;
        self
    }

    /// Return right after the transaction is queued
    pub fn non_blocking(mut self) -> Self {
        self.options.non_blocking = true;
        self
    }

    /// Retry failed operations with the given policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = Some(policy);
        self
    }

    /// Revert already applied operations on the first failure
    pub fn revert(mut self) -> Self {
        self.options.revert = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.options.description = Some(description.into());
        self
    }

    pub fn build(self) -> Result<CommitOptions, TxnInitError> {
        if self.options.revert && self.options.resync.is_resync() {
            return Err(TxnInitError::RevertNotSupportedWithResync);
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_with_resync_rejected() {
        let result = CommitOptions::builder()
            .resync(ResyncType::FullResync, false)
            .revert()
            .build();
        assert_eq!(result, Err(TxnInitError::RevertNotSupportedWithResync));
    }

    #[test]
    fn test_builder() {
        let opts = CommitOptions::builder()
            .retry(RetryPolicy::DEFAULT.with_max_count(5))
            .revert()
            .non_blocking()
            .description("initial config")
            .build()
            .unwrap();

        assert!(opts.revert_on_failure());
        assert!(opts.is_non_blocking());
        assert_eq!(opts.retry().map(|r| r.max_count), Some(5));
        assert_eq!(opts.description(), Some("initial config"));
        assert_eq!(opts.resync(), ResyncType::NotResync);
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::DEFAULT.with_period(Duration::from_millis(100));
        assert_eq!(policy.next_delay(None), Duration::from_millis(100));
        assert_eq!(
            policy.next_delay(Some(Duration::from_millis(400))),
            Duration::from_millis(800)
        );

        let flat = policy.with_exp_backoff(false);
        assert_eq!(
            flat.next_delay(Some(Duration::from_millis(400))),
            Duration::from_millis(100)
        );

        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
        assert!(policy.with_max_count(0).allows_attempt(1000));
    }
}
