//! Circuit breaker guarding a risky async operation.
//!
//! The breaker tracks consecutive failures. When they reach the configured
//! threshold the circuit *opens* and calls are rejected without running the
//! operation. After the recovery timeout the next caller moves the circuit
//! to *half-open* and runs a single trial; concurrent callers during the
//! trial are rejected. The trial outcome closes or re-opens the circuit.
//!
//! ```text
//!   Closed ──(threshold failures)──▶ Open ──(timeout elapsed)──▶ HalfOpen
//!     ▲                               ▲                            │
//!     └──────────(trial ok)───────────┼────────────────────────────┤
//!                                     └───────(trial failed)───────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests allowed.
    Closed,
    /// Requests blocked until the recovery timeout expires.
    Open,
    /// One trial request allowed after the recovery timeout.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Milliseconds the circuit stays open before a trial is allowed.
    pub recovery_timeout_ms: u64,
    /// Cadence of the breaker's health probe when scheduled by a monitor.
    pub monitoring_interval_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            monitoring_interval_ms: 10_000,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The operation was not invoked.
    #[error("Circuit '{name}' is open (retry in {retry_after:?})")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation error, if the operation ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls rejected without running the operation.
    pub rejections: u64,
    /// Milliseconds since the circuit last opened.
    pub open_for_ms: Option<u64>,
}

type TransitionListener = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped by `reset`; results of calls admitted earlier are not applied.
    generation: u64,
    total_calls: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
}

/// Permission to run one call.
#[derive(Debug, Clone, Copy)]
struct Admission {
    trial: bool,
    generation: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            generation: 0,
            total_calls: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
        }
    }
}

/// Thread-safe three-state circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    listener: Mutex<Option<TransitionListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish()
    }
}

/// Releases the half-open trial slot if the trial future is dropped early.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.trial_in_flight = false;
            debug!(name = %self.breaker.name, "Half-open trial abandoned");
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
            listener: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback invoked (outside the lock) on every transition.
    pub fn on_transition<F>(&self, listener: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        info!(name = %self.name, %from, %to, "Circuit transition");
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(from, to);
        }
    }

    /// Current state. Open is reported until a caller triggers the trial.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            successes: inner.successes,
            failures: inner.failures,
            rejections: inner.rejections,
            open_for_ms: inner
                .opened_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Run `op` through the breaker.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let (admission, transition) = self.admit();
        self.notify(transition);
        let admission = match admission {
            Ok(admission) => admission,
            Err(retry_after) => {
                debug!(name = %self.name, ?retry_after, "Call rejected, circuit open");
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            generation: admission.generation,
            armed: admission.trial,
        };
        let result = op().await;
        guard.armed = false;
        drop(guard);

        let transition = match &result {
            Ok(_) => self.record_success(admission),
            Err(e) => self.record_failure(admission, &e.to_string()),
        };
        self.notify(transition);
        result.map_err(CircuitError::Operation)
    }

    /// Decide whether a call may run.
    fn admit(&self) -> (Result<Admission, Duration>, Option<(CircuitState, CircuitState)>) {
        let mut inner = self.lock();
        let generation = inner.generation;
        let admitted = |trial| Admission { trial, generation };
        let timeout = Duration::from_millis(self.config.recovery_timeout_ms);
        match inner.state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                (Ok(admitted(false)), None)
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(timeout);
                if elapsed >= timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.total_calls += 1;
                    (
                        Ok(admitted(true)),
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                } else {
                    inner.rejections += 1;
                    (Err(timeout - elapsed), None)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejections += 1;
                    (Err(Duration::ZERO), None)
                } else {
                    inner.trial_in_flight = true;
                    inner.total_calls += 1;
                    (Ok(admitted(true)), None)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) -> Option<(CircuitState, CircuitState)> {
        let mut inner = self.lock();
        inner.successes += 1;
        if admission.generation != inner.generation {
            debug!(name = %self.name, "Result of a call admitted before reset ignored");
            return None;
        }
        if admission.trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            return Some((CircuitState::HalfOpen, CircuitState::Closed));
        }
        // A call admitted while closed only affects a still-closed circuit.
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
        None
    }

    fn record_failure(
        &self,
        admission: Admission,
        error: &str,
    ) -> Option<(CircuitState, CircuitState)> {
        let mut inner = self.lock();
        inner.failures += 1;
        if admission.generation != inner.generation {
            debug!(name = %self.name, error, "Failure of a call admitted before reset ignored");
            return None;
        }
        inner.consecutive_failures += 1;
        if admission.trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(name = %self.name, error, "Half-open trial failed");
            return Some((CircuitState::HalfOpen, CircuitState::Open));
        }
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                name = %self.name,
                failures = inner.consecutive_failures,
                error,
                "Failure threshold reached"
            );
            return Some((CircuitState::Closed, CircuitState::Open));
        }
        None
    }

    /// Force the circuit closed and zero all failure counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
            inner.generation += 1;
            (previous != CircuitState::Closed).then_some((previous, CircuitState::Closed))
        };
        self.notify(transition);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", CircuitBreakerConfig::default())
    }
}
