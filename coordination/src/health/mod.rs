//! Component health monitoring
//!
//! Components register an async [`HealthProbe`]. Probes run on demand
//! (`run_probe`, `run_all`) or on a schedule owned by the monitor
//! (`start_periodic`). Every run is cached as the component's latest
//! [`HealthCheckResult`], and `summary` aggregates those into one verdict.
//!
//! ```text
//!   register_probe ──► probes ──► run_probe / run_all ──► latest ──► summary
//!                                   ▲
//!          start_periodic ── tick ──┘  (cancelled by stop_periodic)
//! ```
//!
//! A probe that returns an error or exceeds `probe_timeout_ms` yields an unhealthy result carrying the message. The
//! response time is recorded either way.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared reference to HealthMonitor
pub type SharedHealthMonitor = Arc<HealthMonitor>;

const MIN_PERIODIC_INTERVAL: Duration = Duration::from_millis(1);

/// What a probe reports when it completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub healthy: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ProbeReport {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Async liveness check for one component.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<ProbeReport>;
}

/// Adapter turning an async closure into a [`HealthProbe`].
pub struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ProbeReport>> + Send,
{
    async fn check(&self) -> anyhow::Result<ProbeReport> {
        (self.0)().await
    }
}

/// Result of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: String,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Aggregated verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub overall: HealthStatus,
}

impl HealthSummary {
    fn from_results<'a>(results: impl Iterator<Item = &'a HealthCheckResult>) -> Self {
        let (mut total, mut healthy) = (0, 0);
        for result in results {
            total += 1;
            if result.healthy {
                healthy += 1;
            }
        }
        let overall = if healthy == total {
            HealthStatus::Healthy
        } else if healthy == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            total,
            healthy,
            unhealthy: total - healthy,
            overall,
        }
    }
}

/// Monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Upper bound on a single probe run.
    pub probe_timeout_ms: u64,
    /// Default cadence for `start_periodic` callers that have no opinion.
    pub check_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            check_interval_ms: 30_000,
        }
    }
}

struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct MonitorState {
    probes: BTreeMap<String, Arc<dyn HealthProbe>>,
    latest: BTreeMap<String, HealthCheckResult>,
}

/// Registry of component probes with cached results.
pub struct HealthMonitor {
    state: Mutex<MonitorState>,
    periodic: Mutex<Option<PeriodicTask>>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            periodic: Mutex::new(None),
            config,
        }
    }

    /// Create a shared reference to this monitor
    pub fn shared(self) -> SharedHealthMonitor {
        Arc::new(self)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the probe for `component`.
    pub fn register_probe(&self, component: &str, probe: impl HealthProbe + 'static) {
        self.lock()
            .probes
            .insert(component.to_string(), Arc::new(probe));
        debug!(component, "Health probe registered");
    }

    /// Register an async closure as the probe for `component`.
    pub fn register_fn<F, Fut>(&self, component: &str, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ProbeReport>> + Send + 'static,
    {
        self.register_probe(component, FnProbe(probe));
    }

    pub fn unregister_probe(&self, component: &str) -> bool {
        let mut state = self.lock();
        state.latest.remove(component);
        state.probes.remove(component).is_some()
    }

    pub fn components(&self) -> Vec<String> {
        self.lock().probes.keys().cloned().collect()
    }

    /// Run one probe and cache its result.
    ///
    /// An unknown component yields an unhealthy result that is not cached,
    /// so it never shows up in [`HealthMonitor::summary`].
    pub async fn run_probe(&self, component: &str) -> HealthCheckResult {
        let probe = self.lock().probes.get(component).cloned();
        let Some(probe) = probe else {
            warn!(component, "No health probe registered");
            return HealthCheckResult {
                component: component.to_string(),
                healthy: false,
                message: "no probe registered".to_string(),
                response_time_ms: 0,
                timestamp: Utc::now(),
                details: None,
            };
        };
        let result = self.execute(component, probe).await;
        self.lock()
            .latest
            .insert(component.to_string(), result.clone());
        result
    }

    async fn execute(&self, component: &str, probe: Arc<dyn HealthProbe>) -> HealthCheckResult {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let outcome = tokio::time::timeout(timeout, probe.check()).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (healthy, message, details) = match outcome {
            Ok(Ok(report)) => (report.healthy, report.message, report.details),
            Ok(Err(err)) => (false, err.to_string(), None),
            Err(_) => (false, format!("probe timed out after {timeout:?}"), None),
        };
        if !healthy {
            warn!(component, response_time_ms, %message, "Health probe failed");
        } else {
            debug!(component, response_time_ms, "Health probe passed");
        }

        HealthCheckResult {
            component: component.to_string(),
            healthy,
            message,
            response_time_ms,
            timestamp: Utc::now(),
            details,
        }
    }

    /// Run every registered probe concurrently.
    pub async fn run_all(&self) -> Vec<HealthCheckResult> {
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .lock()
            .probes
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        let results = futures::future::join_all(
            probes
                .into_iter()
                .map(|(name, probe)| async move { self.execute(&name, probe).await }),
        )
        .await;

        let mut state = self.lock();
        for result in &results {
            state
                .latest
                .insert(result.component.clone(), result.clone());
        }
        results
    }

    /// Schedule `run_all` every `interval`, replacing any running schedule.
    ///
    /// The first run happens immediately. The task holds only a weak
    /// reference, so dropping the last monitor handle also ends it.
    /// Intervals below one millisecond are raised to one millisecond.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) {
        self.stop_periodic();
        let interval = interval.max(MIN_PERIODIC_INTERVAL);

        let token = CancellationToken::new();
        let child = token.clone();
        let monitor: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        let summary = {
                            monitor.run_all().await;
                            monitor.summary()
                        };
                        debug!(overall = %summary.overall, healthy = summary.healthy, total = summary.total, "Periodic health check");
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Periodic health checks started");
        *self.periodic.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(PeriodicTask { token, handle });
    }

    /// Cancel the schedule. Safe to call when nothing is running.
    pub fn stop_periodic(&self) {
        let task = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.token.cancel();
            task.handle.abort();
            info!("Periodic health checks stopped");
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn latest(&self, component: &str) -> Option<HealthCheckResult> {
        self.lock().latest.get(component).cloned()
    }

    pub fn latest_all(&self) -> Vec<HealthCheckResult> {
        self.lock().latest.values().cloned().collect()
    }

    /// Aggregate the latest cached result of every component.
    ///
    /// No results at all counts as healthy.
    pub fn summary(&self) -> HealthSummary {
        HealthSummary::from_results(self.lock().latest.values())
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_periodic();
    }
}
