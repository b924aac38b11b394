//! Circuit breaker for calls into failing collaborators.
//!
//! Closed passes calls through and counts consecutive failures. Open rejects
//! everything until the recovery timeout elapses, then the breaker moves to
//! HalfOpen and admits one probe at a time. `success_threshold` consecutive
//! probe successes close it again; any probe failure re-opens it.

use cadence_core::{CadenceError, CadenceResult, CircuitBreakerConfig, CircuitState, SystemError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::time::Instant;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    probe_in_flight: AtomicBool,
    opened_at: RwLock<Option<Instant>>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    times_opened: AtomicU64,
    config: CircuitBreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            opened_at: RwLock::new(None),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: CircuitState, to: CircuitState, reason: &str) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            match to {
                CircuitState::Open => {
                    *self
                        .opened_at
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(breaker = %self.name, from = %from, to = %to, reason, "circuit breaker transition");
                }
                _ => {
                    tracing::info!(breaker = %self.name, from = %from, to = %to, reason, "circuit breaker transition");
                }
            }
        }
        swapped
    }

    // The guarded value is a plain timestamp, so a poisoned lock still
    // holds a usable one.
    fn recovery_elapsed(&self) -> bool {
        self.opened_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout)
    }

    /// Whether a call may proceed now.
    ///
    /// While Open and inside the recovery timeout this is false. Once the
    /// timeout has elapsed the breaker moves to HalfOpen and exactly one
    /// caller gets `true` until that probe reports its result.
    pub fn can_execute(&self) -> bool {
        let admitted = match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.recovery_elapsed() {
                    self.transition(
                        CircuitState::Open,
                        CircuitState::HalfOpen,
                        "recovery timeout elapsed",
                    );
                    self.claim_probe()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.claim_probe(),
        };
        if !admitted {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    fn claim_probe(&self) -> bool {
        self.state() == CircuitState::HalfOpen
            && self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        if self.state() == CircuitState::HalfOpen {
            let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.config.success_threshold {
                self.success_count.store(0, Ordering::SeqCst);
                self.transition(
                    CircuitState::HalfOpen,
                    CircuitState::Closed,
                    "probe successes reached threshold",
                );
            }
        }
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn record_failure(&self, reason: &str) {
        self.success_count.store(0, Ordering::SeqCst);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::HalfOpen => {
                self.failure_count.store(0, Ordering::SeqCst);
                self.transition(CircuitState::HalfOpen, CircuitState::Open, reason);
            }
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    self.failure_count.store(0, Ordering::SeqCst);
                    self.transition(CircuitState::Closed, CircuitState::Open, reason);
                }
            }
            CircuitState::Open => {}
        }
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    /// Run `operation` through the gate with the configured call timeout.
    ///
    /// Timeouts and `System` errors count as failures. Other errors mean the
    /// collaborator answered, so they count as successes for the breaker and
    /// are returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> CadenceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        if !self.can_execute() {
            return Err(SystemError::CircuitOpen {
                name: self.name.clone(),
            }
            .into());
        }
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) if err.is_retryable() => {
                self.record_failure(&err.to_string());
                Err(err)
            }
            Ok(Err(err)) => {
                self.record_success();
                Err(err)
            }
            Err(_) => {
                self.record_failure("call timed out");
                Err(CadenceError::System(SystemError::Timeout {
                    operation: self.name.clone(),
                    after: self.config.call_timeout,
                }))
            }
        }
    }

    pub fn reset(&self) {
        let from = self.state();
        self.state
            .store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        *self
            .opened_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if from != CircuitState::Closed {
            tracing::info!(breaker = %self.name, from = %from, to = %CircuitState::Closed, reason = "manual reset", "circuit breaker transition");
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.failure_count.load(Ordering::SeqCst),
            consecutive_successes: self.success_count.load(Ordering::SeqCst),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}
