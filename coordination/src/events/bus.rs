//! Event bus for game coordination
//!
//! Subscriptions are registered per event type with a priority. `emit`
//! delivers to matching handlers in priority order (ties in registration
//! order), awaiting each with bounded retries. A handler that keeps failing
//! is reported on the `error` channel through `emit_sync`, which never
//! retries and never awaits, so error reporting cannot recurse back into the
//! retrying path.
//!
//! A Tokio broadcast channel mirrors every emitted event for stream-style
//! observers (`watch`).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::history::{EventHistory, DEFAULT_HISTORY_CAPACITY};
use super::types::{
    names, EventMetrics, GameEvent, SubscribeOptions, SubscriptionId, SubscriptionInfo,
};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Listener limit reached for '{event_type}' ({limit})")]
    ListenerLimitReached { event_type: String, limit: usize },

    #[error("Timed out after {0:?} waiting for '{1}'")]
    WaitTimeout(Duration, String),

    #[error("Subscription for '{0}' was dropped before an event arrived")]
    WaitCancelled(String),
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Boxed async event handler.
pub type EventHandler = Arc<dyn Fn(GameEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Bus tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Maximum subscriptions per event type.
    pub max_listeners_per_type: usize,
    /// Re-invocations of a failing handler before it is reported.
    pub max_retries: u32,
    /// Fixed delay between handler attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Number of events kept in history.
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_listeners_per_type: 100,
            max_retries: 2,
            retry_delay_ms: 100,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Outcome of a single `emit` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Handlers that eventually succeeded.
    pub delivered: usize,
    /// Handlers that still failed after all retries.
    pub failed: usize,
}

struct Subscription {
    id: SubscriptionId,
    event_type: String,
    priority: i32,
    once: bool,
    owner: Option<String>,
    handler: EventHandler,
    call_count: u64,
    last_called: Option<chrono::DateTime<Utc>>,
}

impl Subscription {
    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            event_type: self.event_type.clone(),
            priority: self.priority,
            once: self.once,
            owner: self.owner.clone(),
            call_count: self.call_count,
            last_called: self.last_called,
        }
    }
}

/// Handler selected for one delivery.
struct Delivery {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<String, Vec<Subscription>>,
    history: EventHistory,
    metrics: HashMap<String, EventMetrics>,
}

impl BusState {
    /// Record the event and pick its handlers in delivery order.
    ///
    /// One-shot subscriptions are removed here, before any handler runs, so
    /// they are consumed whether or not delivery succeeds and a concurrent
    /// emission can never fire them twice.
    fn begin_delivery(&mut self, event: &GameEvent) -> Vec<Delivery> {
        self.history.record(event.clone());

        let now = Utc::now();
        let mut deliveries = Vec::new();
        let mut remaining = 0;
        if let Some(subs) = self.subscriptions.get_mut(&event.event_type) {
            // Ids are monotonic, so sorting by (priority desc, id asc) yields
            // priority-then-registration order.
            subs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
            for sub in subs.iter_mut() {
                sub.call_count += 1;
                sub.last_called = Some(now);
                deliveries.push(Delivery {
                    id: sub.id,
                    handler: Arc::clone(&sub.handler),
                });
            }
            subs.retain(|s| !s.once);
            remaining = subs.len();
        }

        self.metrics
            .entry(event.event_type.clone())
            .or_default()
            .listener_count = remaining;
        deliveries
    }
}

/// Typed publish/subscribe hub.
pub struct EventBus {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    config: EventBusConfig,
    sender: broadcast::Sender<GameEvent>,
}

impl EventBus {
    /// Create a bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BusState {
                history: EventHistory::new(config.history_capacity),
                ..BusState::default()
            }),
            next_id: AtomicU64::new(1),
            config,
            sender,
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an async handler for `event_type`.
    pub fn subscribe<F, Fut>(
        &self,
        event_type: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> EventBusResult<SubscriptionId>
    where
        F: Fn(GameEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        self.subscribe_handler(event_type, handler, options)
    }

    /// Register an already boxed handler.
    pub fn subscribe_handler(
        &self,
        event_type: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> EventBusResult<SubscriptionId> {
        let mut state = self.lock();
        let subs = state.subscriptions.entry(event_type.to_string()).or_default();
        if subs.len() >= self.config.max_listeners_per_type {
            warn!(
                event_type,
                limit = self.config.max_listeners_per_type,
                "Listener limit reached"
            );
            return Err(EventBusError::ListenerLimitReached {
                event_type: event_type.to_string(),
                limit: self.config.max_listeners_per_type,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subs.push(Subscription {
            id,
            event_type: event_type.to_string(),
            priority: options.priority,
            once: options.once,
            owner: options.owner,
            handler,
            call_count: 0,
            last_called: None,
        });
        let count = subs.len();
        state
            .metrics
            .entry(event_type.to_string())
            .or_default()
            .listener_count = count;

        debug!(event_type, id, priority = options.priority, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription. Returns false if it no longer exists.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let mut removed_from = None;
        for (event_type, subs) in state.subscriptions.iter_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() != before {
                removed_from = Some((event_type.clone(), subs.len()));
                break;
            }
        }
        match removed_from {
            Some((event_type, count)) => {
                state.metrics.entry(event_type).or_default().listener_count = count;
                true
            }
            None => false,
        }
    }

    /// Remove every subscription registered by `owner`.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        let mut counts = Vec::new();
        for (event_type, subs) in state.subscriptions.iter_mut() {
            let before = subs.len();
            subs.retain(|s| s.owner.as_deref() != Some(owner));
            removed += before - subs.len();
            counts.push((event_type.clone(), subs.len()));
        }
        for (event_type, count) in counts {
            state.metrics.entry(event_type).or_default().listener_count = count;
        }
        removed
    }

    /// Deliver an event to its subscribers with bounded retries.
    ///
    /// Error and performance events are routed to [`EventBus::emit_sync`].
    pub async fn emit(&self, event: GameEvent) -> EmitReport {
        if event.is_sync_channel() {
            let dispatched = self.emit_sync(event);
            return EmitReport {
                delivered: dispatched,
                failed: 0,
            };
        }

        let started = Instant::now();
        let deliveries = self.lock().begin_delivery(&event);
        let _ = self.sender.send(event.clone());

        let mut report = EmitReport::default();
        for delivery in deliveries {
            match self.invoke_with_retries(&delivery, &event).await {
                Ok(()) => report.delivered += 1,
                Err((attempts, err)) => {
                    report.failed += 1;
                    self.report_handler_failure(&event, delivery.id, attempts, &err);
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.lock()
            .metrics
            .entry(event.event_type.clone())
            .or_default()
            .record_emission(elapsed_ms);

        debug!(
            event_type = %event.event_type,
            delivered = report.delivered,
            failed = report.failed,
            "Event emitted"
        );
        report
    }

    async fn invoke_with_retries(
        &self,
        delivery: &Delivery,
        event: &GameEvent,
    ) -> Result<(), (u32, anyhow::Error)> {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match (delivery.handler)(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= max_attempts => return Err((attempt, err)),
                Err(err) => {
                    debug!(
                        event_type = %event.event_type,
                        id = delivery.id,
                        attempt,
                        "Handler failed, retrying: {}",
                        err
                    );
                    if self.config.retry_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms))
                            .await;
                    }
                }
            }
        }
    }

    fn report_handler_failure(
        &self,
        event: &GameEvent,
        id: SubscriptionId,
        attempts: u32,
        err: &anyhow::Error,
    ) {
        warn!(
            event_type = %event.event_type,
            id,
            attempts,
            "Handler failed after retries: {}",
            err
        );
        self.lock()
            .metrics
            .entry(event.event_type.clone())
            .or_default()
            .error_count += 1;

        self.emit_sync(GameEvent::error(
            "event_bus",
            serde_json::json!({
                "kind": "event_propagation",
                "event_type": event.event_type,
                "subscription_id": id,
                "attempts": attempts,
                "message": err.to_string(),
            }),
        ));
    }

    /// Record and dispatch an event without retries or awaiting handlers.
    ///
    /// Handlers are spawned on the current Tokio runtime; their failures are
    /// logged only. Returns the number of handlers dispatched.
    pub fn emit_sync(&self, event: GameEvent) -> usize {
        let deliveries = self.lock().begin_delivery(&event);
        let _ = self.sender.send(event.clone());

        let runtime = tokio::runtime::Handle::try_current();
        let mut dispatched = 0;
        for delivery in deliveries {
            let Ok(handle) = runtime.as_ref() else {
                warn!(
                    event_type = %event.event_type,
                    "No runtime available, synchronous delivery skipped"
                );
                break;
            };
            let fut = (delivery.handler)(event.clone());
            let event_type = event.event_type.clone();
            let id = delivery.id;
            handle.spawn(async move {
                if let Err(err) = fut.await {
                    warn!(%event_type, id, "Synchronous handler failed: {}", err);
                }
            });
            dispatched += 1;
        }

        self.lock()
            .metrics
            .entry(event.event_type.clone())
            .or_default()
            .record_emission(0.0);
        dispatched
    }

    /// Resolve with the next event of `event_type`, or fail after `timeout`.
    ///
    /// The temporary subscription is removed on both paths.
    pub async fn wait_for(&self, event_type: &str, timeout: Duration) -> EventBusResult<GameEvent> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = self.subscribe(
            event_type,
            move |event| {
                let slot = Arc::clone(&slot);
                async move {
                    if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                        let _ = tx.send(event);
                    }
                    Ok(())
                }
            },
            SubscribeOptions::once().priority(i32::MAX),
        )?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(id);
        match result {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(EventBusError::WaitCancelled(event_type.to_string())),
            Err(_) => Err(EventBusError::WaitTimeout(timeout, event_type.to_string())),
        }
    }

    /// Stream of every event emitted after this call.
    pub fn watch(&self) -> broadcast::Receiver<GameEvent> {
        self.sender.subscribe()
    }

    /// Recorded events, optionally filtered by type and limited to the most
    /// recent `limit`.
    pub fn history(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<GameEvent> {
        self.lock().history.query(event_type, limit)
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn metrics(&self, event_type: &str) -> Option<EventMetrics> {
        self.lock().metrics.get(event_type).cloned()
    }

    pub fn all_metrics(&self) -> HashMap<String, EventMetrics> {
        self.lock().metrics.clone()
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.lock()
            .subscriptions
            .get(event_type)
            .map_or(0, |subs| subs.len())
    }

    /// Snapshot of subscriptions for `event_type` in delivery order.
    pub fn subscriptions(&self, event_type: &str) -> Vec<SubscriptionInfo> {
        let state = self.lock();
        let mut infos: Vec<SubscriptionInfo> = state
            .subscriptions
            .get(event_type)
            .map(|subs| subs.iter().map(Subscription::info).collect())
            .unwrap_or_default();
        infos.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        infos
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience for emitting an error-channel event from any component.
pub fn report_error(bus: &EventBus, error: &crate::error::IntegrationError) {
    bus.emit_sync(GameEvent::error(error.component.clone(), error.to_payload()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_bus() -> EventBus {
        EventBus::with_config(EventBusConfig {
            retry_delay_ms: 0,
            ..EventBusConfig::default()
        })
    }

    fn event(t: &str) -> GameEvent {
        GameEvent::new(t, "test", serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_priority_then_registration_order() {
        let bus = fast_bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [("low", 0), ("high", 10), ("low2", 0), ("mid", 5)] {
            let order = Arc::clone(&order);
            bus.subscribe(
                "tick",
                move |_| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(label);
                        Ok(())
                    }
                },
                SubscribeOptions::default().priority(priority),
            )
            .unwrap();
        }

        let report = bus.emit(event("tick")).await;
        assert_eq!(report.delivered, 4);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low", "low2"]);
    }

    #[tokio::test]
    async fn test_failing_handler_is_retried_and_isolated() {
        let bus = fast_bus();
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let sibling_calls = Arc::new(AtomicUsize::new(0));

        let fc = Arc::clone(&failing_calls);
        bus.subscribe(
            "tick",
            move |_| {
                let fc = Arc::clone(&fc);
                async move {
                    fc.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("boom"))
                }
            },
            SubscribeOptions::default().priority(1),
        )
        .unwrap();

        let sc = Arc::clone(&sibling_calls);
        bus.subscribe(
            "tick",
            move |_| {
                let sc = Arc::clone(&sc);
                async move {
                    sc.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

        let report = bus.emit(event("tick")).await;
        assert_eq!(report, EmitReport { delivered: 1, failed: 1 });
        // one call plus two retries
        assert_eq!(failing_calls.load(Ordering::SeqCst), 3);
        assert_eq!(sibling_calls.load(Ordering::SeqCst), 1);

        let errors = bus.history(Some(names::ERROR), None);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["event_type"], "tick");
        assert_eq!(bus.metrics("tick").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_once_subscription_consumed_even_on_failure() {
        let bus = fast_bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        bus.subscribe(
            "tick",
            move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("always fails"))
                }
            },
            SubscribeOptions::once(),
        )
        .unwrap();

        bus.emit(event("tick")).await;
        bus.emit(event("tick")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.listener_count("tick"), 0);
    }

    #[test]
    fn test_listener_cap() {
        let bus = EventBus::with_config(EventBusConfig {
            max_listeners_per_type: 2,
            ..EventBusConfig::default()
        });
        for _ in 0..2 {
            bus.subscribe("tick", |_| async { Ok(()) }, SubscribeOptions::default())
                .unwrap();
        }
        let err = bus
            .subscribe("tick", |_| async { Ok(()) }, SubscribeOptions::default())
            .unwrap_err();
        assert!(matches!(err, EventBusError::ListenerLimitReached { limit: 2, .. }));
        // other types are unaffected
        assert!(bus
            .subscribe("tock", |_| async { Ok(()) }, SubscribeOptions::default())
            .is_ok());
    }

    #[test]
    fn test_unsubscribe_and_unique_ids() {
        let bus = EventBus::new();
        let a = bus
            .subscribe("tick", |_| async { Ok(()) }, SubscribeOptions::default())
            .unwrap();
        let b = bus
            .subscribe("tick", |_| async { Ok(()) }, SubscribeOptions::default())
            .unwrap();
        assert_ne!(a, b);
        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        let c = bus
            .subscribe("tick", |_| async { Ok(()) }, SubscribeOptions::default())
            .unwrap();
        assert!(c > b);
        assert_eq!(bus.listener_count("tick"), 2);
    }

    #[test]
    fn test_unsubscribe_owner() {
        let bus = EventBus::new();
        for t in ["a", "b"] {
            bus.subscribe(t, |_| async { Ok(()) }, SubscribeOptions::default().owner("ai"))
                .unwrap();
        }
        bus.subscribe("a", |_| async { Ok(()) }, SubscribeOptions::default())
            .unwrap();
        assert_eq!(bus.unsubscribe_owner("ai"), 2);
        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.listener_count("b"), 0);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_and_unsubscribes() {
        let bus = Arc::new(fast_bus());
        let emitter = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            emitter.emit(event("ready")).await;
        });

        let received = bus.wait_for("ready", Duration::from_secs(5)).await.unwrap();
        assert_eq!(received.event_type, "ready");
        assert_eq!(bus.listener_count("ready"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_and_unsubscribes() {
        let bus = fast_bus();
        let err = bus
            .wait_for("never", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::WaitTimeout(_, _)));
        assert_eq!(bus.listener_count("never"), 0);
    }

    #[tokio::test]
    async fn test_history_preserves_emission_order_across_types() {
        let bus = fast_bus();
        bus.emit(event("a")).await;
        bus.emit(event("b")).await;
        bus.emit(event("a")).await;

        let types: Vec<String> = bus
            .history(None, None)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["a", "b", "a"]);
        assert_eq!(bus.history(Some("a"), Some(1)).len(), 1);
        assert_eq!(bus.metrics("a").unwrap().emitted, 2);
    }

    #[tokio::test]
    async fn test_watch_receives_emitted_events() {
        let bus = fast_bus();
        let mut rx = bus.watch();
        bus.emit(event("tick")).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "tick");
    }

    #[tokio::test]
    async fn test_error_events_are_not_retried() {
        let bus = fast_bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        bus.subscribe(
            names::ERROR,
            move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("error listener failing"))
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

        bus.emit(GameEvent::error("test", serde_json::Value::Null)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // the failing error listener does not produce another error event
        assert_eq!(bus.history(Some(names::ERROR), None).len(), 1);
    }
}
