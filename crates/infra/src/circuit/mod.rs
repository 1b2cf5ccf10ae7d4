//! Process-wide circuit breaker guarding the upstream trigger call.
//!
//! ## States
//!
//! - **Closed**: calls go through; outcomes feed a rolling error window.
//! - **Open**: calls are rejected without touching upstream.
//! - **HalfOpen**: after `reset` has elapsed in Open, exactly one probe call is
//!   let through. Success closes the breaker and clears its statistics; failure
//!   reopens it for another `reset`.
//!
//! ```text
//! Closed --(error% >= threshold)--> Open --(reset elapsed)--> HalfOpen
//!   ^                                 ^                          |
//!   |                                 +-----(probe failure)------+
//!   +------------------(probe success)--------------------------+
//! ```
//!
//! Errors whose [`FailureClass::is_filtered`] returns `true` are caller-caused:
//! they are surfaced as [`CircuitError::Filtered`] and never move the error rate.
//!
//! The Open -> HalfOpen transition is evaluated lazily on the next call, so
//! [`CircuitBreaker::state`] keeps reporting `Open` until something fires.

mod window;

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitConfig;

pub use window::{Outcome, RollingWindow, WindowCounts};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Published on every call outcome and state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEvent {
    Success,
    Failure,
    Timeout,
    Reject,
    Filtered,
    Open,
    HalfOpen,
    Close,
}

/// Snapshot of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub counts: WindowCounts,
    pub error_percentage: f64,
}

/// Outcome of a guarded call that did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Rejected without calling upstream.
    #[error("circuit breaker is open")]
    Open,
    #[error("call exceeded the breaker timeout")]
    Timeout,
    #[error("call failed: {0}")]
    Failed(E),
    /// Caller-caused failure, excluded from breaker statistics.
    #[error("call rejected as invalid: {0}")]
    Filtered(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open)
    }
}

/// Error classification hook consulted by [`CircuitBreaker::fire`].
pub trait FailureClass {
    /// `true` when the failure says nothing about upstream health.
    fn is_filtered(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    window: RollingWindow,
}

enum Admission {
    Normal,
    Probe,
    Rejected,
}

/// Shared breaker; construct once per process and hand out by `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let window = RollingWindow::new(config.rolling_window, config.rolling_buckets);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                probe_in_flight: false,
                window,
            }),
            events,
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.lock();
        let counts = inner.window.counts(Instant::now());
        CircuitStats {
            state: inner.state,
            counts,
            error_percentage: counts.error_percentage(),
        }
    }

    /// Subscribe to call outcomes and state transitions.
    ///
    /// Slow receivers lag and lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Run `call` under the breaker.
    ///
    /// `call` is not invoked at all when the breaker rejects. A call that does
    /// not finish within `timeout` is dropped and counted as a failure.
    pub async fn fire<T, E, F, Fut>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClass,
    {
        let probe = match self.admit() {
            Admission::Rejected => return Err(CircuitError::Open),
            Admission::Normal => false,
            Admission::Probe => true,
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };
        let result = tokio::time::timeout(self.config.timeout, call()).await;
        guard.armed = false;

        match result {
            Ok(Ok(value)) => {
                self.settle(probe, Outcome::Success);
                Ok(value)
            }
            Ok(Err(err)) if err.is_filtered() => {
                self.settle(probe, Outcome::Filtered);
                Err(CircuitError::Filtered(err))
            }
            Ok(Err(err)) => {
                self.settle(probe, Outcome::Failure);
                Err(CircuitError::Failed(err))
            }
            Err(_) => {
                self.settle(probe, Outcome::Timeout);
                Err(CircuitError::Timeout)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CircuitEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => return Admission::Normal,
            CircuitState::Open => {
                let reset_elapsed = inner
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.reset);
                if reset_elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open, probing upstream");
                    self.emit(CircuitEvent::HalfOpen);
                    return Admission::Probe;
                }
            }
            CircuitState::HalfOpen => {
                if !inner.probe_in_flight {
                    inner.probe_in_flight = true;
                    return Admission::Probe;
                }
            }
        }

        inner.window.record(now, Outcome::Rejected);
        debug!(state = ?inner.state, "circuit breaker rejected call");
        self.emit(CircuitEvent::Reject);
        Admission::Rejected
    }

    fn settle(&self, probe: bool, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.window.record(now, outcome);
        self.emit(match outcome {
            Outcome::Success => CircuitEvent::Success,
            Outcome::Failure => CircuitEvent::Failure,
            Outcome::Timeout => CircuitEvent::Timeout,
            Outcome::Rejected => CircuitEvent::Reject,
            Outcome::Filtered => CircuitEvent::Filtered,
        });

        if probe {
            inner.probe_in_flight = false;
            match outcome {
                // Upstream answered; a filtered error still proves it is up.
                Outcome::Success | Outcome::Filtered => self.close(&mut inner),
                _ => self.trip(&mut inner, now, 100.0),
            }
            return;
        }

        if inner.state == CircuitState::Closed
            && matches!(outcome, Outcome::Failure | Outcome::Timeout)
        {
            let counts = inner.window.counts(now);
            let error_percentage = counts.error_percentage();
            if counts.counted_calls() >= u64::from(self.config.volume_threshold)
                && error_percentage >= f64::from(self.config.threshold)
            {
                self.trip(&mut inner, now, error_percentage);
            }
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant, error_percentage: f64) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        warn!(
            error_percentage,
            threshold = self.config.threshold,
            reset_ms = self.config.reset.as_millis() as u64,
            "circuit breaker opened"
        );
        self.emit(CircuitEvent::Open);
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.window.reset();
        info!("circuit breaker closed");
        self.emit(CircuitEvent::Close);
    }
}

/// Reopens the breaker if a probe's future is dropped before it settles.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.settle(true, Outcome::Failure);
        }
    }
}
