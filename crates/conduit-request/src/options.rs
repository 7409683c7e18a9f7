//! Configuration for the request/response engine's call shapes.

use std::time::Duration;

use conduit_cache::CacheStrategy;

/// Default per-attempt timeout for [`crate::RequestEngine::request`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Base retry backoff delay.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(1000);
/// Retry backoff delay ceiling.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_millis(30_000);

/// Relative importance of a request. Purely advisory today — callers and
/// middleware may inspect it to decide ordering or shedding policy — but
/// still validated as one of the three named levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Can be shed or delayed under load.
    Low,
    /// Default priority.
    Normal,
    /// Should be served ahead of `Low`/`Normal` work when a caller has to
    /// choose.
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Per-request cache routing. When set on [`RequestOptions`], the request is
/// resolved through the bus's cache engine instead of always dispatching.
#[derive(Debug, Clone)]
pub struct CacheRequestOptions {
    /// Which cache strategy resolves this request.
    pub strategy: CacheStrategy,
    /// Overrides the cache engine's configured default TTL for the entry
    /// this request writes. `None` keeps the engine's default.
    pub ttl: Option<Duration>,
}

impl Default for CacheRequestOptions {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            ttl: None,
        }
    }
}

/// Options for a single correlated request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// How long to wait for a response before the attempt times out.
    pub timeout: Duration,
    /// Additional attempts made after a retryable failure (`0` means "try
    /// once, never retry").
    pub max_retries: u32,
    /// Backoff base: the first retry waits roughly this long.
    pub retry_base: Duration,
    /// Backoff ceiling: no retry waits longer than this.
    pub retry_max: Duration,
    /// Relative priority of this request.
    pub priority: Priority,
    /// If set, route this request through the cache engine using the given
    /// strategy/ttl instead of always dispatching to a live responder.
    pub cache: Option<CacheRequestOptions>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: 0,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            priority: Priority::default(),
            cache: None,
        }
    }
}

/// Compute the backoff delay before retry attempt `attempt` (1-indexed:
/// the delay before the *first* retry is `attempt == 1`).
pub fn backoff_delay(attempt: u32, options: &RequestOptions) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier: u128 = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let millis = options
        .retry_base
        .as_millis()
        .saturating_mul(multiplier)
        .min(options.retry_max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Options for collecting multiple responses to one request.
#[derive(Debug, Clone)]
pub struct RequestManyOptions {
    /// Overall time budget for collecting responses.
    pub timeout: Duration,
    /// Minimum number of responses required for the call to succeed once
    /// `timeout` elapses.
    pub min_responses: usize,
    /// Stop collecting as soon as this many responses have arrived, even if
    /// `timeout` hasn't elapsed. `None` means "collect until timeout".
    pub max_responses: Option<usize>,
}

impl Default for RequestManyOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            min_responses: 1,
            max_responses: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        let options = RequestOptions {
            retry_base: Duration::from_millis(1000),
            retry_max: Duration::from_millis(30_000),
            ..RequestOptions::default()
        };
        assert_eq!(backoff_delay(1, &options), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, &options), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, &options), Duration::from_millis(4000));
        assert_eq!(backoff_delay(10, &options), Duration::from_millis(30_000));
    }

    #[test]
    fn priority_defaults_to_normal() {
        assert_eq!(RequestOptions::default().priority, Priority::Normal);
    }
}
