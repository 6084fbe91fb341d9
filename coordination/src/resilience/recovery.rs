//! Recovery manager: bounded-retry strategies per error kind.
//!
//! Each [`ErrorKind`] may have one registered strategy. Attempt counters are
//! global per kind and only grow: once a kind has used `max_attempts`
//! invocations, further requests are rejected without calling the strategy
//! until [`RecoveryManager::reset_attempts`] is called.
//!
//! ```text
//! recover_from_error(err)
//!   ├─ !err.recoverable            → not_recoverable
//!   ├─ no strategy for err.kind    → no_strategy
//!   ├─ attempts[kind] >= max       → max_attempts_exceeded
//!   └─ backoff, invoke strategy    → { success, action: kind }
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

use crate::error::{ErrorKind, IntegrationError};
use crate::telemetry;

/// Boxed async recovery routine. Resolves to whether recovery succeeded.
pub type RecoveryFn =
    Arc<dyn Fn(IntegrationError, serde_json::Value) -> BoxFuture<'static, bool> + Send + Sync>;

/// Retry budget for one strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudget {
    pub max_attempts: u32,
    /// Base delay; attempt `n` (0-indexed) waits `n × backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

/// Registered strategy for one error kind.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub error_kind: ErrorKind,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    recovery_fn: RecoveryFn,
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("error_kind", &self.error_kind)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_ms", &self.backoff_ms)
            .finish_non_exhaustive()
    }
}

/// What the manager did with a recovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    NotRecoverable,
    NoStrategy,
    MaxAttemptsExceeded,
    /// The strategy registered for this kind was invoked.
    Strategy(ErrorKind),
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRecoverable => "not_recoverable",
            Self::NoStrategy => "no_strategy",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::Strategy(kind) => kind.as_str(),
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a recovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub action: RecoveryAction,
}

impl RecoveryOutcome {
    fn rejected(action: RecoveryAction) -> Self {
        Self {
            success: false,
            action,
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub error: IntegrationError,
    pub outcome: RecoveryOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate recovery statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    /// Strategy invocations.
    pub total_attempts: u64,
    pub successes: u64,
    /// Requests answered without invoking a strategy.
    pub rejected: u64,
    /// `successes / total_attempts`, 0 when nothing ran.
    pub success_rate: f64,
}

/// Records kept by [`RecoveryManager::history`]; older ones are dropped.
pub const MAX_RECOVERY_HISTORY: usize = 1000;

#[derive(Default)]
struct ManagerState {
    strategies: HashMap<ErrorKind, RecoveryStrategy>,
    attempts: HashMap<ErrorKind, u32>,
    history: VecDeque<RecoveryRecord>,
    /// Counted over every request, including records no longer in `history`.
    totals: RecoveryStats,
}

/// Maps error kinds to bounded recovery strategies.
#[derive(Default)]
pub struct RecoveryManager {
    state: Mutex<ManagerState>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the strategy for `kind`.
    pub fn register_strategy<F, Fut>(
        &self,
        kind: ErrorKind,
        max_attempts: u32,
        backoff_ms: u64,
        recovery_fn: F,
    ) where
        F: Fn(IntegrationError, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let recovery_fn: RecoveryFn = Arc::new(move |err, ctx| recovery_fn(err, ctx).boxed());
        debug!(%kind, max_attempts, backoff_ms, "Recovery strategy registered");
        self.lock().strategies.insert(
            kind,
            RecoveryStrategy {
                error_kind: kind,
                max_attempts,
                backoff_ms,
                recovery_fn,
            },
        );
    }

    pub fn has_strategy(&self, kind: ErrorKind) -> bool {
        self.lock().strategies.contains_key(&kind)
    }

    /// Attempt recovery for `error`.
    pub async fn recover_from_error(
        &self,
        error: &IntegrationError,
        context: serde_json::Value,
    ) -> RecoveryOutcome {
        if !error.recoverable {
            return self.finish(error, RecoveryOutcome::rejected(RecoveryAction::NotRecoverable));
        }

        // Reserve the attempt under the lock so concurrent callers can never
        // push the invocation count past the budget.
        let reserved = {
            let mut state = self.lock();
            match state.strategies.get(&error.kind).cloned() {
                None => Err(RecoveryAction::NoStrategy),
                Some(strategy) => {
                    let used = state.attempts.entry(error.kind).or_insert(0);
                    if *used >= strategy.max_attempts {
                        Err(RecoveryAction::MaxAttemptsExceeded)
                    } else {
                        let attempt = *used;
                        *used += 1;
                        Ok((strategy, attempt))
                    }
                }
            }
        };

        let (strategy, attempt) = match reserved {
            Ok(reserved) => reserved,
            Err(action) => {
                if action == RecoveryAction::MaxAttemptsExceeded {
                    warn!(kind = %error.kind, "Recovery attempts exhausted");
                }
                return self.finish(error, RecoveryOutcome::rejected(action));
            }
        };

        let delay = strategy.backoff_ms.saturating_mul(u64::from(attempt));
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let attempted = error.clone().with_attempts(attempt + 1);
        let span = telemetry::recovery_span(error.kind.as_str(), attempt + 1);
        let success = (strategy.recovery_fn)(attempted, context)
            .instrument(span.clone())
            .await;
        span.record("game.success", success);
        info!(
            kind = %error.kind,
            component = %error.component,
            attempt = attempt + 1,
            max = strategy.max_attempts,
            success,
            "Recovery attempted"
        );
        self.finish(
            error,
            RecoveryOutcome {
                success,
                action: RecoveryAction::Strategy(error.kind),
            },
        )
    }

    fn finish(&self, error: &IntegrationError, outcome: RecoveryOutcome) -> RecoveryOutcome {
        let mut state = self.lock();
        match outcome.action {
            RecoveryAction::Strategy(_) => {
                state.totals.total_attempts += 1;
                if outcome.success {
                    state.totals.successes += 1;
                }
            }
            _ => state.totals.rejected += 1,
        }
        if state.history.len() >= MAX_RECOVERY_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(RecoveryRecord {
            error: error.clone(),
            outcome,
            timestamp: Utc::now(),
        });
        outcome
    }

    /// Attempts used so far for `kind`.
    pub fn attempts(&self, kind: ErrorKind) -> u32 {
        self.lock().attempts.get(&kind).copied().unwrap_or(0)
    }

    /// Give `kind` a fresh budget.
    pub fn reset_attempts(&self, kind: ErrorKind) {
        self.lock().attempts.remove(&kind);
    }

    /// Most recent records, oldest first. At most [`MAX_RECOVERY_HISTORY`]
    /// are retained.
    pub fn history(&self, limit: Option<usize>) -> Vec<RecoveryRecord> {
        let state = self.lock();
        let skip = limit.map_or(0, |l| state.history.len().saturating_sub(l));
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> RecoveryStats {
        let mut stats = self.lock().totals.clone();
        if stats.total_attempts > 0 {
            stats.success_rate = stats.successes as f64 / stats.total_attempts as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine_error() -> IntegrationError {
        IntegrationError::new(
            ErrorKind::EngineCommunication,
            "engine_adapter",
            "get_best_move",
            "no response",
        )
    }

    #[tokio::test]
    async fn test_not_recoverable_skips_lookup() {
        let manager = RecoveryManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        manager.register_strategy(ErrorKind::ApiValidation, 5, 0, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            async { true }
        });

        let err = IntegrationError::new(ErrorKind::ApiValidation, "o", "make_move", "illegal");
        let outcome = manager.recover_from_error(&err, serde_json::Value::Null).await;
        assert_eq!(outcome.action, RecoveryAction::NotRecoverable);
        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_strategy() {
        let manager = RecoveryManager::new();
        let outcome = manager
            .recover_from_error(&engine_error(), serde_json::Value::Null)
            .await;
        assert_eq!(outcome.action.as_str(), "no_strategy");
        assert_eq!(manager.history(None).len(), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_gates_invocation() {
        let manager = RecoveryManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        manager.register_strategy(ErrorKind::EngineCommunication, 2, 0, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            async { false }
        });

        for _ in 0..2 {
            let outcome = manager
                .recover_from_error(&engine_error(), serde_json::Value::Null)
                .await;
            assert_eq!(outcome.action.as_str(), "engine_communication");
            assert!(!outcome.success);
        }
        let third = manager
            .recover_from_error(&engine_error(), serde_json::Value::Null)
            .await;
        assert_eq!(
            third,
            RecoveryOutcome {
                success: false,
                action: RecoveryAction::MaxAttemptsExceeded
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.attempts(ErrorKind::EngineCommunication), 2);
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let manager = RecoveryManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        manager.register_strategy(ErrorKind::StateSynchronization, 1, 0, move |err, _| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                assert_eq!(err.attempt_count, 1);
                n == 0
            }
        });

        let err = IntegrationError::new(ErrorKind::StateSynchronization, "o", "sync", "drift");
        assert!(manager.recover_from_error(&err, serde_json::Value::Null).await.success);
        assert!(!manager.recover_from_error(&err, serde_json::Value::Null).await.success);

        let stats = manager.stats();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.rejected, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

        manager.reset_attempts(ErrorKind::StateSynchronization);
        let outcome = manager.recover_from_error(&err, serde_json::Value::Null).await;
        assert_eq!(outcome.action, RecoveryAction::Strategy(ErrorKind::StateSynchronization));
        assert!((manager.stats().success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let manager = RecoveryManager::new();
        for i in 0..MAX_RECOVERY_HISTORY + 5 {
            let err = IntegrationError::new(
                ErrorKind::EngineCommunication,
                "engine_adapter",
                format!("search-{i}"),
                "no response",
            );
            manager.recover_from_error(&err, serde_json::Value::Null).await;
        }

        let history = manager.history(None);
        assert_eq!(history.len(), MAX_RECOVERY_HISTORY);
        assert_eq!(history[0].error.operation, "search-5");
        assert_eq!(
            manager.history(Some(1))[0].error.operation,
            format!("search-{}", MAX_RECOVERY_HISTORY + 4)
        );
        assert_eq!(manager.stats().rejected, (MAX_RECOVERY_HISTORY + 5) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_with_attempts() {
        let manager = RecoveryManager::new();
        manager.register_strategy(ErrorKind::EngineCommunication, 3, 100, |_, _| async { false });

        let start = tokio::time::Instant::now();
        manager
            .recover_from_error(&engine_error(), serde_json::Value::Null)
            .await;
        assert!(start.elapsed() < Duration::from_millis(100));
        manager
            .recover_from_error(&engine_error(), serde_json::Value::Null)
            .await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        manager
            .recover_from_error(&engine_error(), serde_json::Value::Null)
            .await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
