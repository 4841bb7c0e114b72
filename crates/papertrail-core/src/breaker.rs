//! Circuit breaker shared by the AI gateways.
//!
//! Closed: calls pass through and failures are counted inside a sliding
//! window. Once `failure_threshold` consecutive failures land inside the
//! window the breaker opens and short-circuits calls for the cooldown. When
//! the cooldown has elapsed the next call is admitted as a single probe
//! (half-open). A successful probe closes the breaker and resets the
//! cooldown; a failed probe reopens it with the cooldown doubled, capped at
//! `max_cooldown`.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`, so any number of workers can share one breaker through an `Arc`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::defaults;

/// Thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Failures older than this no longer count.
    pub window: Duration,
    /// First open-state cooldown.
    pub base_cooldown: Duration,
    /// Upper bound for the doubled cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            window: Duration::from_secs(defaults::BREAKER_WINDOW_SECS),
            base_cooldown: Duration::from_secs(defaults::BREAKER_COOLDOWN_SECS),
            max_cooldown: Duration::from_secs(defaults::BREAKER_MAX_COOLDOWN_SECS),
        }
    }
}

impl BreakerConfig {
    /// Load from `<PREFIX>_BREAKER_THRESHOLD`, `<PREFIX>_BREAKER_WINDOW_SECS`,
    /// `<PREFIX>_BREAKER_COOLDOWN_SECS` and `<PREFIX>_BREAKER_MAX_COOLDOWN_SECS`.
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        let var = |suffix: &str| std::env::var(format!("{}_BREAKER_{}", prefix, suffix)).ok();
        let secs = |suffix: &str, fallback: Duration| {
            var(suffix)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            failure_threshold: var("THRESHOLD")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.failure_threshold),
            window: secs("WINDOW_SECS", defaults.window),
            base_cooldown: secs("COOLDOWN_SECS", defaults.base_cooldown),
            max_cooldown: secs("MAX_COOLDOWN_SECS", defaults.max_cooldown),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_cooldown(mut self, base: Duration, max: Duration) -> Self {
        self.base_cooldown = base;
        self.max_cooldown = max.max(base);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Decision for one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; call normally.
    Allowed,
    /// This call is the single half-open probe.
    Probe,
    /// Short-circuited; do not call the dependency.
    Rejected,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = config.base_cooldown;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                cooldown,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked: every mutation
        // is a handful of field writes.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state without triggering any transition.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Cooldown that applies to the current (or next) open period.
    pub fn current_cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    /// Whether a call made now would reach the dependency.
    ///
    /// An open breaker whose cooldown has elapsed reports available because
    /// the next call is admitted as the probe.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => cooldown_elapsed(&inner, Instant::now()),
            BreakerState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Ask to make one call.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open if cooldown_elapsed(&inner, now) => {
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                debug!(component = "breaker", breaker = %self.name, "Cooldown elapsed, admitting probe");
                Admission::Probe
            }
            BreakerState::Open => Admission::Rejected,
            BreakerState::HalfOpen if inner.probe_in_flight => Admission::Rejected,
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Admission::Probe
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let was = inner.state;
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.cooldown = self.config.base_cooldown;
        inner.probe_in_flight = false;
        if was != BreakerState::Closed {
            info!(component = "breaker", breaker = %self.name, "Circuit closed");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                let doubled = inner.cooldown.saturating_mul(2);
                inner.cooldown = doubled.min(self.config.max_cooldown);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                warn!(
                    component = "breaker",
                    breaker = %self.name,
                    cooldown_secs = inner.cooldown.as_secs(),
                    "Probe failed, circuit reopened"
                );
            }
            BreakerState::Closed => {
                let window = self.config.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    warn!(
                        component = "breaker",
                        breaker = %self.name,
                        cooldown_secs = inner.cooldown.as_secs(),
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            // Late result of a call admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }

    /// Give back a probe slot without judging the dependency.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Run `fut` under the breaker; every error counts as a failure.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_filtered(fut, |_| true).await
    }

    /// Run `fut` under the breaker; only errors for which `counts` returns
    /// true are recorded as failures.
    pub async fn call_filtered<T, E, F, P>(&self, fut: F, counts: P) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let admission = self.try_acquire();
        if admission == Admission::Rejected {
            return Err(BreakerError::Open);
        }

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };
        let result = fut.await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if counts(&e) {
                    self.record_failure();
                } else {
                    self.release_probe();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn cooldown_elapsed(inner: &Inner, now: Instant) -> bool {
    inner
        .opened_at
        .map(|at| now.duration_since(at) >= inner.cooldown)
        .unwrap_or(true)
}

/// Counts a probe as failed if its future is dropped before completing.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig::default()
                .with_failure_threshold(3)
                .with_window(Duration::from_secs(60))
                .with_cooldown(Duration::from_secs(30), Duration::from_secs(100)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        assert!(b.is_available());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.is_available());
        assert_eq!(b.try_acquire(), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_expire() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.is_available());
        assert_eq!(b.try_acquire(), Admission::Probe);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.is_available());
        assert_eq!(b.try_acquire(), Admission::Rejected);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_doubles_cooldown_capped() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.current_cooldown(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.try_acquire(), Admission::Probe);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.current_cooldown(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!b.is_available());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.try_acquire(), Admission::Probe);
        b.record_failure();
        assert_eq!(b.current_cooldown(), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(b.try_acquire(), Admission::Probe);
        b.record_success();
        assert_eq!(b.current_cooldown(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_short_circuits_when_open() {
        let b = breaker();
        for _ in 0..3 {
            let r: Result<(), BreakerError<&str>> = b.call(async { Err("boom") }).await;
            assert!(matches!(r, Err(BreakerError::Inner("boom"))));
        }
        let r: Result<u32, BreakerError<&str>> = b.call(async { Ok(1) }).await;
        assert!(matches!(r, Err(BreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_filtered_ignores_uncounted_errors() {
        let b = breaker();
        for _ in 0..5 {
            let _ = b
                .call_filtered(async { Err::<(), _>("bad input") }, |_| false)
                .await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_counts_as_failure() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let slow = b.call(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, &str>(())
        });
        let timed = tokio::time::timeout(Duration::from_secs(1), slow).await;
        assert!(timed.is_err());
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.current_cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("PTTEST_BREAKER_THRESHOLD", "5");
        std::env::set_var("PTTEST_BREAKER_COOLDOWN_SECS", "7");
        std::env::set_var("PTTEST_BREAKER_WINDOW_SECS", "not-a-number");
        let cfg = BreakerConfig::from_env("PTTEST");
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.base_cooldown, Duration::from_secs(7));
        assert_eq!(
            cfg.window,
            Duration::from_secs(defaults::BREAKER_WINDOW_SECS)
        );
        std::env::remove_var("PTTEST_BREAKER_THRESHOLD");
        std::env::remove_var("PTTEST_BREAKER_COOLDOWN_SECS");
        std::env::remove_var("PTTEST_BREAKER_WINDOW_SECS");
    }

    #[test]
    fn test_breaker_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CircuitBreaker>();
    }
}
