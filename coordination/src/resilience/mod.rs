//! Resilience: failure containment for engine-backed sessions
//!
//! Two complementary guards:
//!
//! - [`CircuitBreaker`] stops calling an operation that keeps failing and
//!   probes for recovery after a cool-down.
//! - [`RecoveryManager`] maps an [`ErrorKind`](crate::error::ErrorKind) to a
//!   registered strategy with a bounded attempt budget and backoff.
//!
//! # Usage
//!
//! ```rust,ignore
//! use game_coordination::resilience::{CircuitBreaker, CircuitBreakerConfig, RecoveryManager};
//!
//! let breaker = CircuitBreaker::new("engine", CircuitBreakerConfig::default());
//! let mv = breaker.execute(|| adapter.get_best_move(options)).await?;
//!
//! let recovery = RecoveryManager::new();
//! recovery.register_strategy(ErrorKind::EngineCrashed, 2, 500, |err, _ctx| async move {
//!     restart_engine().await.is_ok()
//! });
//! ```

pub mod circuit_breaker;
pub mod recovery;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
};
pub use recovery::{
    RecoveryAction, RecoveryFn, RecoveryManager, RecoveryOutcome, RecoveryRecord, RecoveryStats,
    RecoveryStrategy, RetryBudget,
};
