//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed ──(failure_threshold consecutive failures)──▶ Open
//! Open ──(recovery_timeout elapsed, next caller)──▶ HalfOpen
//! HalfOpen ──(trial succeeds)──▶ Closed
//! HalfOpen ──(trial fails or is cancelled)──▶ Open
//! ```
//!
//! Exactly one trial call runs in `HalfOpen`. Callers that arrive while the
//! trial is in flight fail fast with [`CoreError::CircuitOpen`]; they do not
//! queue behind it.
//!
//! Every move to `Open` (and every reset) starts a new generation. A call
//! admitted in an earlier generation that finishes later is ignored: only
//! calls admitted in the current generation move the state, and in
//! `HalfOpen` that is the trial alone.
//!
//! The state mutex guards admission and outcome recording only. It is never
//! held while the wrapped future runs.

use crate::config::BreakerConfig;
use crate::error::{CoreError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Point-in-time view of a breaker, safe to serialize for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    rejected_calls: u64,
    generation: u64,
}

impl BreakerInner {
    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.generation += 1;
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                last_failure_at: None,
                trial_in_flight: false,
                rejected_calls: 0,
                generation: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &BreakerConfig) -> Self {
        Self::new(name, cfg.failure_threshold, cfg.recovery_timeout())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the Open → HalfOpen timeout check lazily.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        if inner.state == CircuitState::Open && self.recovery_elapsed(&inner) {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs(),
            last_failure_at: inner.last_failure_at,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Force the breaker closed. Operator action after a dependency is known healthy.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.trial_in_flight = false;
        inner.generation += 1;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Run `operation` under the breaker.
    ///
    /// Returns [`CoreError::CircuitOpen`] without invoking `operation` while
    /// the breaker is open. Otherwise the operation's own result is returned
    /// unchanged, after the breaker has recorded its outcome.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.admit()?;
        let outcome = operation().await;
        match &outcome {
            Ok(_) => permit.succeed(),
            // A nested breaker's rejection says nothing about this dependency.
            Err(e) if e.kind() == ErrorKind::CircuitOpen => permit.release(),
            Err(_) => permit.fail(),
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // State transitions (all under the mutex, never across an await)
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Counters are updated atomically under the guard; poison is harmless.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        match inner.last_failure_time {
            Some(t) => Instant::now() >= t + self.recovery_timeout,
            None => true,
        }
    }

    fn admit(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        let generation = inner.generation;
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false, generation)),
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    Ok(Permit::new(self, true, generation))
                } else {
                    inner.rejected_calls += 1;
                    debug!(breaker = %self.name, "circuit open, rejecting call");
                    Err(CoreError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected_calls += 1;
                    debug!(breaker = %self.name, "trial in flight, rejecting call");
                    Err(CoreError::CircuitOpen(self.name.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true, generation))
                }
            }
        }
    }

    fn record_success(&self, trial: bool, generation: u64) {
        let mut inner = self.lock();
        if generation != inner.generation {
            debug!(breaker = %self.name, "ignoring success from an earlier generation");
            return;
        }
        inner.failure_count = 0;
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Closed;
            info!(breaker = %self.name, "trial call succeeded, circuit closed");
        }
    }

    fn record_failure(&self, trial: bool, generation: u64) {
        let mut inner = self.lock();
        if generation != inner.generation {
            debug!(breaker = %self.name, "ignoring failure from an earlier generation");
            return;
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        if trial {
            inner.trial_in_flight = false;
            inner.trip();
            warn!(breaker = %self.name, "trial call failed, circuit re-opened");
            return;
        }
        if inner.state == CircuitState::Closed && inner.failure_count >= self.failure_threshold {
            inner.trip();
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "failure threshold reached, circuit opened"
            );
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if generation == inner.generation {
            inner.trial_in_flight = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Admission ticket for one call.
///
/// A trial permit dropped without an outcome (the caller's future was
/// cancelled) counts as a failed trial, so the breaker never stays stuck in
/// `HalfOpen` with a trial nobody is running.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool, generation: u64) -> Self {
        Self {
            breaker,
            trial,
            generation,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial, self.generation);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial, self.generation);
    }

    fn release(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record_failure(true, self.generation);
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// One breaker per named dependency, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(name, &self.config)))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<BreakerSnapshot> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new("graph", threshold, Duration::from_secs(30))
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err::<(), _>(CoreError::Connection("refused".into())) })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3);
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(CoreError::Connection(_))));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let res = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(CoreError::CircuitOpen(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(b.snapshot().rejected_calls, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = breaker(3);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.snapshot().failure_count, 0);
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let b = breaker(1);
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(1);
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(fail(&b).await, Err(CoreError::Connection(_))));
        assert_eq!(b.state(), CircuitState::Open);
        // The re-open restarts the recovery window.
        let res = b.call(|| async { Ok(()) }).await;
        assert!(matches!(res, Err(CoreError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_in_half_open() {
        let b = Arc::new(breaker(1));
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let invoked = AtomicU32::new(0);
        let second = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(CoreError::CircuitOpen(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_counts_as_failure() {
        let b = Arc::new(breaker(1));
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| std::future::pending::<Result<()>>()).await
            })
        };
        tokio::task::yield_now().await;
        trial.abort();
        let _ = trial.await;

        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn call_admitted_before_open_cannot_decide_half_open() {
        let b = Arc::new(breaker(2));
        let (stale_tx, stale_rx) = tokio::sync::oneshot::channel::<()>();
        let stale = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = stale_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = trial_rx.await;
                    Err::<(), _>(CoreError::Connection("still down".into()))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        stale_tx.send(()).unwrap();
        stale.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let second = b.call(|| async { Ok(()) }).await;
        assert!(matches!(second, Err(CoreError::CircuitOpen(_))));

        trial_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failure_does_not_reopen_after_recovery() {
        let b = Arc::new(breaker(1));
        let (stale_tx, stale_rx) = tokio::sync::oneshot::channel::<()>();
        let stale = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = stale_rx.await;
                    Err::<(), _>(CoreError::Timeout("slow".into()))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(31)).await;
        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        stale_tx.send(()).unwrap();
        stale.await.unwrap().unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn lock_not_held_during_call() {
        let b = Arc::new(breaker(5));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        // Other callers get through while the slow call is pending.
        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nested_circuit_open_is_not_a_failure() {
        let b = breaker(1);
        let res = b
            .call(|| async { Err::<(), _>(CoreError::CircuitOpen("inner".into())) })
            .await;
        assert!(matches!(res, Err(CoreError::CircuitOpen(ref n)) if n == "inner"));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_closes() {
        let b = breaker(1);
        fail(&b).await.unwrap_err();
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        b.call(|| async { Ok(()) }).await.unwrap();
    }

    #[test]
    fn registry_returns_same_breaker() {
        let reg = BreakerRegistry::new(BreakerConfig::default());
        let a = reg.get("neo4j");
        let b = reg.get("neo4j");
        assert!(Arc::ptr_eq(&a, &b));
        reg.get("ragie");
        let names: Vec<String> = reg.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["neo4j".to_string(), "ragie".to_string()]);
    }
}
