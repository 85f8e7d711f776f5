// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-sink circuit breaker.
//!
//! The breaker starts `Closed` and passes every call through. After `max_failures`
//! consecutive failures it trips `Open` and rejects calls without running them. Once
//! `timeout` has passed since the last failure, the next call moves it to `HalfOpen`, where
//! `successes_required` consecutive successes close it again and a single failure reopens it.
//!
//! All state lives in atomics so any number of tasks can share one breaker.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::CircuitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that trip the breaker.
    pub max_failures: u32,
    /// How long the breaker stays `Open` after the last failure before probing.
    pub timeout: Duration,
    /// Consecutive `HalfOpen` successes needed to close again.
    pub successes_required: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(30),
            successes_required: 2,
        }
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejects: u64,
}

pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    timeout: Duration,
    successes_required: u32,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    // Milliseconds since `epoch`.
    last_failure_ms: AtomicU64,
    epoch: Instant,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejects: AtomicU64,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            max_failures: config.max_failures.max(1),
            timeout: config.timeout,
            successes_required: config.successes_required.max(1),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejects: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Runs `f` unless the breaker is open, recording the outcome.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.allow_call() {
            self.total_rejects.fetch_add(1, Ordering::Relaxed);
            debug!("Circuit {} is open, rejecting call", self.name);
            return Err(CircuitError::Open);
        }

        match f().await {
            Ok(value) => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                Err(CircuitError::Call(e))
            }
        }
    }

    /// Forces the breaker back to `Closed` and zeroes every counter.
    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.last_failure_ms.store(0, Ordering::Release);
        self.total_calls.store(0, Ordering::Relaxed);
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejects.store(0, Ordering::Relaxed);
        info!("Circuit {} reset to closed", self.name);
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state(),
            consecutive_failures: self.failures.load(Ordering::Acquire),
            half_open_successes: self.successes.load(Ordering::Acquire),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejects: self.total_rejects.load(Ordering::Relaxed),
        }
    }

    fn allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let since_failure = self
                    .now_ms()
                    .saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if u128::from(since_failure) < self.timeout.as_millis() {
                    return false;
                }
                // Only the caller that wins the swap resets the trial counters; anyone who
                // loses sees the state the winner left behind.
                match self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                    Ok(()) => {
                        info!("Circuit {} half-open, probing sink", self.name);
                        true
                    }
                    Err(current) => current != CircuitState::Open,
                }
            }
        }
    }

    fn on_success(&self) {
        match self.state() {
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.successes_required
                    && self
                        .transition(CircuitState::HalfOpen, CircuitState::Closed)
                        .is_ok()
                {
                    info!(
                        "Circuit {} closed after {} successful trial requests",
                        self.name, successes
                    );
                }
            }
            // A call that started before the breaker tripped; it does not count.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.last_failure_ms.store(self.now_ms(), Ordering::Release);
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.max_failures
                    && self
                        .transition(CircuitState::Closed, CircuitState::Open)
                        .is_ok()
                {
                    warn!(
                        "Circuit {} opened after {} consecutive failures, cooling down for {} ms",
                        self.name,
                        failures,
                        self.timeout.as_millis()
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.last_failure_ms.store(self.now_ms(), Ordering::Release);
                if self
                    .transition(CircuitState::HalfOpen, CircuitState::Open)
                    .is_ok()
                {
                    warn!("Circuit {} reopened after a failed trial request", self.name);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Compare-and-swap `from -> to`, resetting both counters on success. Returns the
    /// observed state on failure.
    fn transition(&self, from: CircuitState, to: CircuitState) -> Result<(), CircuitState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| {
                self.failures.store(0, Ordering::Release);
                self.successes.store(0, Ordering::Release);
            })
            .map_err(CircuitState::from)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn breaker(max_failures: u32, timeout: Duration, successes_required: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                max_failures,
                timeout,
                successes_required,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let cb = breaker(3, Duration::from_secs(60), 1);

        for _ in 0..2 {
            assert_eq!(fail(&cb).await, Err(CircuitError::Call("boom")));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert_eq!(fail(&cb).await, Err(CircuitError::Call("boom")));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let cb = breaker(3, Duration::from_secs(60), 1);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.stats().consecutive_failures, 0);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let cb = breaker(1, Duration::from_secs(60), 1);
        let _ = fail(&cb).await;

        let invoked = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;

        assert_eq!(result, Err(CircuitError::Open));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let stats = cb.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_rejects, 1);
        assert_eq!(stats.total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(500), 3);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(600)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.stats().half_open_successes, 2);

        // No partial credit for earlier trial requests.
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().half_open_successes, 0);
        assert_eq!(succeed(&cb).await, Err(CircuitError::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_half_open_progress() {
        let cb = breaker(1, Duration::from_millis(100), 2);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_half_open_transition_happens_once() {
        let cb = Arc::new(breaker(1, Duration::from_millis(100), 10));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = Arc::clone(&cb);
            handles.push(tokio::spawn(async move { succeed(&cb).await }));
        }
        for handle in handles {
            assert!(handle.await.expect("task panicked").is_ok());
        }

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.half_open_successes, 8);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let cb = breaker(1, Duration::from_secs(60), 1);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.total_failures, 0);
        assert!(succeed(&cb).await.is_ok());
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(CircuitState::from(0), CircuitState::Closed);
        assert_eq!(CircuitState::from(1), CircuitState::Open);
        assert_eq!(CircuitState::from(2), CircuitState::HalfOpen);
        assert_eq!(CircuitState::from(42), CircuitState::Closed);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
