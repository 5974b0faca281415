//! Retry policy and error handling
//!
//! Failure retry with exponential backoff, fixed delays, or custom
//! per-attempt decisions. Attempt indices are zero-based over retries: the
//! initial attempt is not counted, so `attempt` 0 is the first retry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the query engine.
///
/// `Clone` so results can flow through shared in-flight futures and state
/// snapshots; `PartialEq` so change notifications can compare by value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query failed: {0}")]
    FetchFailed(String),

    #[error("type mismatch: requested {expected}, cached value is {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("network is offline")]
    Offline,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no cached entry for key {0}")]
    NotFound(String),
}

impl QueryError {
    /// Create a fetch failure with context
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::FetchFailed(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// How many retries a policy allows.
#[derive(Clone)]
pub enum RetryLimit {
    /// Retry up to this many times after the initial attempt
    Count(u32),
    /// Retry until the fetch succeeds or is cancelled
    Infinite,
    /// Consumer decides per attempt; receives the zero-based retry index and
    /// the error that caused it
    Custom(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl fmt::Debug for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "Count({n})"),
            Self::Infinite => write!(f, "Infinite"),
            Self::Custom(_) => write!(f, "Custom(fn)"),
        }
    }
}

/// Delay between retries.
#[derive(Clone)]
pub enum RetryDelay {
    /// `min(1000ms * 2^attempt, max_delay)`
    Exponential { initial: Duration },
    /// Fixed delay between retries
    Fixed(Duration),
    /// Consumer computes the delay from the zero-based retry index
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential { initial } => write!(f, "Exponential({initial:?})"),
            Self::Fixed(d) => write!(f, "Fixed({d:?})"),
            Self::Custom(_) => write!(f, "Custom(fn)"),
        }
    }
}

/// Retry configuration for queries and mutations.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub limit: RetryLimit,
    pub delay: RetryDelay,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: RetryLimit::Count(3),
            delay: RetryDelay::Exponential {
                initial: Duration::from_millis(1000),
            },
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries; the mutation default.
    pub fn none() -> Self {
        Self {
            limit: RetryLimit::Count(0),
            ..Self::default()
        }
    }

    pub fn count(retries: u32) -> Self {
        Self {
            limit: RetryLimit::Count(retries),
            ..Self::default()
        }
    }

    pub fn infinite() -> Self {
        Self {
            limit: RetryLimit::Infinite,
            ..Self::default()
        }
    }

    pub fn with_retry_fn(
        mut self,
        decide: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.limit = RetryLimit::Custom(Arc::new(decide));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = RetryDelay::Fixed(delay);
        self
    }

    pub fn with_delay_fn(mut self, delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = RetryDelay::Custom(Arc::new(delay));
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Whether a retry should follow the failure at the given zero-based
    /// retry index. Cancellations never retry.
    pub fn should_retry(&self, attempt: u32, error: &QueryError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        match &self.limit {
            RetryLimit::Count(max) => attempt < *max,
            RetryLimit::Infinite => true,
            RetryLimit::Custom(decide) => decide(attempt, error),
        }
    }

    /// Delay preceding the retry at the given zero-based retry index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.delay {
            RetryDelay::Exponential { initial } => {
                let millis = initial.as_millis() as u64;
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                let delay = millis.saturating_mul(factor);
                Duration::from_millis(delay).min(self.max_delay)
            }
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(compute) => compute(attempt),
        }
    }
}
