//! Game Coordination Library
//!
//! Resilience and coordination primitives for a turn-based game played
//! against an external move-search process:
//!
//! - [`events`]: typed publish/subscribe bus with priorities, bounded
//!   history and per-type metrics
//! - [`resilience`]: circuit breaker and bounded-retry recovery manager
//! - [`state`]: bounded snapshot store for rollback
//! - [`health`]: per-component async probes with an aggregated verdict
//! - [`error`]: the shared [`IntegrationError`] taxonomy
//! - [`telemetry`]: tracing setup and span helpers
//!
//! The game-specific pieces (engine adapter, AI player, orchestrator) live in
//! the `chess-agents` crate and are built on these.

#![allow(clippy::uninlined_format_args)]

pub mod error;
pub mod events;
pub mod health;
pub mod resilience;
pub mod state;
pub mod telemetry;

pub use error::{ErrorKind, IntegrationError};
pub use events::{
    names, EventBus, EventBusConfig, EventBusError, GameEvent, SharedEventBus, SubscribeOptions,
    SubscriptionId,
};
pub use health::{
    HealthCheckResult, HealthConfig, HealthMonitor, HealthProbe, HealthStatus, HealthSummary,
    ProbeReport, SharedHealthMonitor,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, RecoveryAction,
    RecoveryManager, RecoveryOutcome, RetryBudget,
};
pub use state::{BackupConfig, BackupStore, SharedBackupStore, StateSnapshot};
