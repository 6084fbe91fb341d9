//! Event types for game coordination
//!
//! Events are immutable once emitted. The payload is free-form JSON so that
//! collaborators outside this crate can publish their own event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a subscription, never reused by a bus instance.
pub type SubscriptionId = u64;

/// Well-known event type names.
pub mod names {
    pub const MOVE_COMPLETED: &str = "move:completed";
    pub const MOVE_REJECTED: &str = "move:rejected";
    pub const AI_THINKING_STARTED: &str = "ai:thinking_started";
    pub const AI_THINKING_STOPPED: &str = "ai:thinking_stopped";
    pub const AI_MOVE_FAILED: &str = "ai:move_failed";
    pub const AI_FALLBACK_ENABLED: &str = "ai:fallback_enabled";
    pub const MODE_CHANGED: &str = "mode:changed";
    pub const CIRCUIT_STATE_CHANGED: &str = "circuit:state_changed";
    pub const TRANSACTION_STARTED: &str = "transaction:started";
    pub const TRANSACTION_COMMITTED: &str = "transaction:committed";
    pub const TRANSACTION_ROLLED_BACK: &str = "transaction:rolled_back";
    pub const STATE_SYNCHRONIZED: &str = "state:synchronized";
    pub const RECOVERY_ATTEMPTED: &str = "recovery:attempted";
    pub const HEALTH_CHECKED: &str = "health:checked";
    /// Error channel; always emitted with `emit_sync`.
    pub const ERROR: &str = "error";
    /// Performance samples; always emitted with `emit_sync`.
    pub const PERFORMANCE: &str = "performance";
}

/// A single event flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event.
    pub source: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl GameEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    /// Error-channel event describing a failure inside `source`.
    pub fn error(source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(names::ERROR, source, payload)
    }

    /// Whether this event belongs on the synchronous channels.
    pub fn is_sync_channel(&self) -> bool {
        self.event_type == names::ERROR || self.event_type == names::PERFORMANCE
    }
}

/// Options accepted by `EventBus::subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first delivery.
    pub once: bool,
    /// Higher priorities are delivered first.
    pub priority: i32,
    /// Component owning the subscription, for bulk removal.
    pub owner: Option<String>,
}

impl SubscribeOptions {
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Read-only view of a registered subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub event_type: String,
    pub priority: i32,
    pub once: bool,
    pub owner: Option<String>,
    pub call_count: u64,
    pub last_called: Option<DateTime<Utc>>,
}

/// Per event type delivery metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventMetrics {
    pub emitted: u64,
    /// Running average of total delivery time per emission.
    pub avg_processing_ms: f64,
    pub listener_count: usize,
    pub error_count: u64,
}

impl EventMetrics {
    pub(crate) fn record_emission(&mut self, elapsed_ms: f64) {
        self.emitted += 1;
        let n = self.emitted as f64;
        self.avg_processing_ms += (elapsed_ms - self.avg_processing_ms) / n;
    }
}
