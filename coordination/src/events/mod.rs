//! Event-driven coordination between game components
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the [`GameEvent`] envelope, well-known
//!    event names, subscription options and per-type metrics.
//!
//! 2. **Event Bus** (`bus.rs`): priority-ordered async delivery with bounded
//!    retries, a synchronous error channel, and a broadcast mirror.
//!
//! 3. **Event History** (`history.rs`): FIFO-bounded log queryable by type.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│   Handlers   │
//! │    (emit)    │     │  (priority)  │     │  (retried)   │
//! └──────────────┘     └──────┬───────┘     └──────┬───────┘
//!                             │                    │ failure
//!                             ▼                    ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │   History    │     │  emit_sync   │
//!                      │  (bounded)   │     │   "error"    │
//!                      └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use game_coordination::events::{names, EventBus, GameEvent, SubscribeOptions};
//!
//! let bus = EventBus::new().shared();
//! bus.subscribe(
//!     names::MOVE_COMPLETED,
//!     |event| async move {
//!         println!("{}", event.payload);
//!         Ok(())
//!     },
//!     SubscribeOptions::default().priority(10),
//! )?;
//!
//! bus.emit(GameEvent::new(names::MOVE_COMPLETED, "orchestrator", payload)).await;
//! ```

pub mod bus;
pub mod history;
pub mod types;

// Re-export core types
pub use bus::{
    report_error, EmitReport, EventBus, EventBusConfig, EventBusError, EventBusResult,
    EventHandler, SharedEventBus,
};
pub use history::{EventHistory, DEFAULT_HISTORY_CAPACITY};
pub use types::{
    names, EventMetrics, GameEvent, SubscribeOptions, SubscriptionId, SubscriptionInfo,
};
