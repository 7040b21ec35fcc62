//! Circuit breaker for the model API
//!
//! After `threshold` consecutive failed transforms the breaker opens and new
//! proposals are rejected immediately instead of waiting on a failing API.
//! Once `cooldown` has passed a single probe request is allowed through.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests allowed
    Closed,
    /// Too many failures, requests rejected
    Open,
    /// Cooldown elapsed, next request is a probe
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker
///
/// ```
/// use hotpatch_remote::{CircuitBreaker, CircuitState};
///
/// let cb = CircuitBreaker::new(2, 60);
/// cb.record_failure();
/// cb.record_failure();
/// assert_eq!(cb.state(), CircuitState::Open);
/// assert!(!cb.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` failures and probes again
    /// after `cooldown_secs`
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            inner: Mutex::new(BreakerInner::default()),
            threshold: threshold.max(1),
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker still holds valid counters
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Record a successful call (closes the circuit)
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.threshold {
            // Re-arm the cooldown on every failure while open or probing
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Whether a call may be attempted now
    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Consecutive failures recorded so far
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time left before a probe is allowed, zero unless open
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.lock();
        match inner.opened_at {
            Some(opened) => self.cooldown.saturating_sub(opened.elapsed()),
            None => Duration::ZERO,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}
