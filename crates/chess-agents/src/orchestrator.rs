//! Game orchestrator
//!
//! Owns the coordination components and serializes every mutation of the
//! rules engine through one pipeline:
//!
//! ```text
//! make_move(from, to)
//!   │
//!   ├─ busy? ──────────────────────────────► Err(Busy)
//!   ├─ rules.valid_moves(from) ∌ to ───────► move:rejected, Err(InvalidMove)
//!   ├─ snapshot (BackupStore)
//!   ├─ rules.make_move
//!   ├─ views: history, FEN, PGN, status
//!   ├─ move:completed
//!   └─ side to move is automated?
//!        └─ CircuitBreaker(AiPlayer::make_move) ─► same pipeline
//!             └─ failure ─► error event, RecoveryManager,
//!                           ai_failure_threshold ─► human vs human
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(config, Box::new(rules), Some(adapter))?;
//! orchestrator.initialize().await?;
//! let outcome = orchestrator.make_move("e2", "e4", None).await?;
//! if let Some(AiTurnOutcome::Played { record, .. }) = outcome.ai_reply {
//!     println!("engine answered {}", record.san);
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use coordination::error::{ErrorKind, IntegrationError};
use coordination::events::{
    names, report_error, EmitReport, EventBus, EventBusError, GameEvent, SharedEventBus,
    SubscribeOptions, SubscriptionId,
};
use coordination::health::{
    HealthCheckResult, HealthMonitor, HealthSummary, ProbeReport, SharedHealthMonitor,
};
use coordination::resilience::{CircuitBreaker, CircuitError, CircuitState, RecoveryManager};
use coordination::state::{BackupId, BackupStore, SharedBackupStore};
use coordination::telemetry;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::ai_player::{AiPlayer, PositionSnapshot};
use crate::config::{ChessConfig, ConfigError, GameMode};
use crate::engine::protocol::{is_square, validate_fen};
use crate::engine::{EngineAdapter, SearchOptionsPatch, ThinkingCandidate};
use crate::rules::{Color, GameStatus, MoveRecord, Promotion, RulesEngine};

const COMPONENT: &str = "orchestrator";
const PRESENTATION_OWNER: &str = "presentation";

/// Kinds whose recovery counters reset after a successful automated turn.
const ENGINE_KINDS: [ErrorKind; 4] = [
    ErrorKind::EngineInitialization,
    ErrorKind::EngineCommunication,
    ErrorKind::CalculationTimeout,
    ErrorKind::EngineCrashed,
];

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Another move is being processed")]
    Busy,

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("It is the automated player's turn")]
    AiTurn,

    #[error("No automated move is due")]
    NotAiTurn,

    #[error("Game is over")]
    GameOver,

    #[error("A transaction is already active")]
    TransactionActive,

    #[error("No active transaction")]
    NoTransaction,

    #[error("Orchestrator has been shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] EventBusError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Integration(err) => err.kind,
            Self::Listener(_) => ErrorKind::EventPropagation,
            Self::Config(_) => ErrorKind::ComponentInitialization,
            _ => ErrorKind::ApiValidation,
        }
    }

    pub fn to_integration(&self, operation: &str) -> IntegrationError {
        match self {
            Self::Integration(err) => err.clone(),
            _ => IntegrationError::new(self.kind(), COMPONENT, operation, self.to_string()),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Shared reference to Orchestrator
pub type SharedOrchestrator = Arc<Orchestrator>;

/// Result of one automated turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AiTurnOutcome {
    Played {
        record: MoveRecord,
        fallback: bool,
    },
    Failed {
        kind: ErrorKind,
        error: String,
        consecutive_failures: u32,
        /// The game dropped to human vs human because of this failure.
        mode_changed: bool,
    },
}

impl AiTurnOutcome {
    pub fn is_played(&self) -> bool {
        matches!(self, Self::Played { .. })
    }
}

/// Result of a human move.
#[derive(Debug, Clone, Serialize)]
pub struct MoveOutcome {
    pub record: MoveRecord,
    pub ai_reply: Option<AiTurnOutcome>,
    pub state: GameState,
}

/// Read model for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct GameState {
    pub fen: String,
    pub pgn: String,
    pub turn: Color,
    pub status: GameStatus,
    pub in_check: bool,
    pub mode: GameMode,
    pub move_count: usize,
    pub last_move: Option<MoveRecord>,
    pub ai_thinking: bool,
    pub ai_fallback: bool,
    pub transaction_active: bool,
}

/// Findings of a synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub in_sync: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub summary: HealthSummary,
    pub components: Vec<HealthCheckResult>,
}

/// Runtime-adjustable subset of the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub search: Option<SearchOptionsPatch>,
    pub mode: Option<GameMode>,
    pub ai_failure_threshold: Option<u32>,
    pub auto_ai_reply: Option<bool>,
    pub snapshot_moves: Option<bool>,
}

/// Derived views of the rules engine, refreshed after every mutation.
#[derive(Debug, Clone)]
struct GameViews {
    history: Vec<MoveRecord>,
    fen: String,
    pgn: String,
    turn: Color,
    status: GameStatus,
    in_check: bool,
}

impl GameViews {
    fn from_rules(rules: &dyn RulesEngine) -> Self {
        let mut views = Self {
            history: Vec::new(),
            fen: String::new(),
            pgn: String::new(),
            turn: Color::White,
            status: GameStatus::Active,
            in_check: false,
        };
        views.refresh(rules);
        views
    }

    fn refresh(&mut self, rules: &dyn RulesEngine) {
        self.fen = rules.fen();
        self.pgn = rules.pgn();
        self.turn = rules.turn();
        self.status = rules.status();
        self.in_check = rules.is_in_check(None);
    }

    fn drift(&self, rules: &dyn RulesEngine) -> Vec<String> {
        let mut issues = Vec::new();
        let count = rules.move_count();
        if self.history.len() != count {
            issues.push(format!(
                "history holds {} moves, rules engine reports {count}",
                self.history.len()
            ));
        }
        if self.fen != rules.fen() {
            issues.push("cached FEN differs from rules engine".to_string());
        }
        if self.pgn != rules.pgn() {
            issues.push("cached PGN differs from rules engine".to_string());
        }
        if self.turn != rules.turn() {
            issues.push(format!("cached turn {} differs from rules engine", self.turn));
        }
        if self.status != rules.status() {
            issues.push("cached status differs from rules engine".to_string());
        }
        issues
    }
}

/// Rebuild the views from the rules engine. Moves missing from the history
/// cannot be recovered; surplus moves (after an undo) are dropped.
fn resync(rules: &dyn RulesEngine, views: &mut GameViews) -> SyncReport {
    let mut issues = views.drift(rules);
    let count = rules.move_count();
    if views.history.len() > count {
        views.history.truncate(count);
    }
    views.refresh(rules);
    let in_sync = views.history.len() == count;
    if !in_sync {
        issues.push(format!(
            "{} moves missing from history cannot be rebuilt",
            count - views.history.len()
        ));
    }
    SyncReport { in_sync, issues }
}

fn lock_views(views: &Mutex<GameViews>) -> MutexGuard<'_, GameViews> {
    views.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Transaction {
    backup_id: BackupId,
    base_moves: usize,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    config: ChessConfig,
    mode: GameMode,
    ai_failures: u32,
    transaction: Option<Transaction>,
    shut_down: bool,
}

/// Clears the busy flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> OrchestratorResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| OrchestratorError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type SharedRules = Arc<AsyncMutex<Box<dyn RulesEngine>>>;

pub struct Orchestrator {
    rules: SharedRules,
    views: Arc<Mutex<GameViews>>,
    session: Mutex<Session>,
    busy: AtomicBool,
    bus: SharedEventBus,
    breaker: Arc<CircuitBreaker>,
    recovery: Arc<RecoveryManager>,
    backups: SharedBackupStore,
    health: SharedHealthMonitor,
    ai: Option<Arc<AiPlayer>>,
}

impl Orchestrator {
    /// Wire the components together. Without an engine the game runs human
    /// vs human regardless of the configured mode.
    pub fn new(
        config: ChessConfig,
        rules: Box<dyn RulesEngine>,
        engine: Option<Arc<EngineAdapter>>,
    ) -> OrchestratorResult<SharedOrchestrator> {
        config.validate()?;

        let bus = EventBus::with_config(config.events.clone()).shared();
        let breaker = Arc::new(CircuitBreaker::new("ai_player", config.breaker.clone()));
        let recovery = Arc::new(RecoveryManager::new());
        let backups = BackupStore::new(config.backup.clone()).shared();
        let health = HealthMonitor::new(config.health.clone()).shared();
        let ai = engine.map(|adapter| {
            Arc::new(AiPlayer::new(
                adapter,
                Arc::clone(&bus),
                config.ai.clone(),
                config.search.clone(),
            ))
        });

        let mut mode = config.game.mode;
        if ai.is_none() && mode.ai_color().is_some() {
            warn!("No engine configured, playing human vs human");
            mode = GameMode::HumanVsHuman;
        }

        let views = Arc::new(Mutex::new(GameViews::from_rules(&*rules)));
        let rules: SharedRules = Arc::new(AsyncMutex::new(rules));

        let orchestrator = Arc::new(Self {
            rules,
            views,
            session: Mutex::new(Session {
                config,
                mode,
                ai_failures: 0,
                transaction: None,
                shut_down: false,
            }),
            busy: AtomicBool::new(false),
            bus,
            breaker,
            recovery,
            backups,
            health,
            ai,
        });
        orchestrator.wire_breaker_events();
        orchestrator.register_recovery_strategies();
        orchestrator.register_health_probes();
        info!(mode = mode.as_str(), "Orchestrator ready");
        Ok(orchestrator)
    }

    /// Spawn the configured engine process and wire it in.
    pub fn with_engine_process(
        config: ChessConfig,
        rules: Box<dyn RulesEngine>,
    ) -> OrchestratorResult<SharedOrchestrator> {
        let adapter = EngineAdapter::spawn_process(config.engine.clone())
            .map_err(|e| e.to_integration("spawn_engine"))?;
        Self::new(config, rules, Some(Arc::new(adapter)))
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn views(&self) -> MutexGuard<'_, GameViews> {
        lock_views(&self.views)
    }

    fn ensure_running(&self) -> OrchestratorResult<()> {
        if self.session().shut_down {
            return Err(OrchestratorError::ShutDown);
        }
        Ok(())
    }

    fn wire_breaker_events(&self) {
        let bus = Arc::clone(&self.bus);
        self.breaker.on_transition(move |from, to| {
            let event = GameEvent::new(
                names::CIRCUIT_STATE_CHANGED,
                "circuit_breaker",
                json!({ "from": from, "to": to }),
            );
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let bus = Arc::clone(&bus);
                    handle.spawn(async move {
                        bus.emit(event).await;
                    });
                }
                Err(_) => warn!(%from, %to, "No runtime to publish circuit transition"),
            }
        });
    }

    fn register_recovery_strategies(&self) {
        let budget = self.session().config.recovery;

        if let Some(ai) = &self.ai {
            for kind in [ErrorKind::EngineCrashed, ErrorKind::EngineInitialization] {
                let ai = Arc::clone(ai);
                self.recovery
                    .register_strategy(kind, budget.max_attempts, budget.backoff_ms, move |err, _| {
                        let ai = Arc::clone(&ai);
                        async move {
                            ai.enable_fallback(err.kind.as_str()).await;
                            true
                        }
                    });
            }
            for kind in [ErrorKind::CalculationTimeout, ErrorKind::EngineCommunication] {
                let ai = Arc::clone(ai);
                self.recovery
                    .register_strategy(kind, budget.max_attempts, budget.backoff_ms, move |_, _| {
                        let ai = Arc::clone(&ai);
                        async move { ai.cancel().await.is_ok() }
                    });
            }
        }

        let rules = Arc::clone(&self.rules);
        let views = Arc::clone(&self.views);
        self.recovery.register_strategy(
            ErrorKind::StateSynchronization,
            budget.max_attempts,
            budget.backoff_ms,
            move |_, _| {
                let rules = Arc::clone(&rules);
                let views = Arc::clone(&views);
                async move {
                    let rules = rules.lock().await;
                    let report = resync(&**rules, &mut lock_views(&views));
                    report.in_sync
                }
            },
        );
    }

    fn register_health_probes(&self) {
        let rules = Arc::clone(&self.rules);
        self.health.register_fn("rules_engine", move || {
            let rules = Arc::clone(&rules);
            async move {
                // A held lock means a move or search is in progress.
                let Ok(rules) = rules.try_lock() else {
                    return Ok(ProbeReport::healthy("rules engine in use"));
                };
                let report = match validate_fen(&rules.fen()) {
                    Ok(_) => ProbeReport::healthy("position well formed"),
                    Err(reason) => ProbeReport::unhealthy(format!("malformed FEN: {reason}")),
                };
                Ok(report.with_details(json!({ "moves": rules.move_count() })))
            }
        });

        if let Some(ai) = &self.ai {
            let ai = Arc::clone(ai);
            self.health.register_fn("engine_adapter", move || {
                let ai = Arc::clone(&ai);
                async move {
                    let report = ai.adapter().probe();
                    if !report.healthy && ai.is_fallback() {
                        return Ok(ProbeReport::healthy("engine unavailable, fallback active")
                            .with_details(report.details.unwrap_or_default()));
                    }
                    Ok(report)
                }
            });
        }

        let breaker = Arc::clone(&self.breaker);
        self.health.register_fn("circuit_breaker", move || {
            let breaker = Arc::clone(&breaker);
            async move {
                let stats = breaker.stats();
                let details = serde_json::to_value(&stats)?;
                let report = match stats.state {
                    CircuitState::Open => ProbeReport::unhealthy("circuit open"),
                    state => ProbeReport::healthy(format!("circuit {state}")),
                };
                Ok(report.with_details(details))
            }
        });

        let bus = Arc::clone(&self.bus);
        self.health.register_fn("event_bus", move || {
            let bus = Arc::clone(&bus);
            async move {
                let metrics = bus.all_metrics();
                let errors: u64 = metrics.values().map(|m| m.error_count).sum();
                let emitted: u64 = metrics.values().map(|m| m.emitted).sum();
                Ok(ProbeReport::healthy("event bus running")
                    .with_details(json!({ "emitted": emitted, "handler_errors": errors })))
            }
        });

        let backups = Arc::clone(&self.backups);
        self.health.register_fn("backup_store", move || {
            let backups = Arc::clone(&backups);
            async move {
                let stats = backups.stats();
                let details = serde_json::to_value(&stats)?;
                let report = if stats.count <= stats.max_backups {
                    ProbeReport::healthy(format!("{} snapshots", stats.count))
                } else {
                    ProbeReport::unhealthy("snapshot capacity exceeded")
                };
                Ok(report.with_details(details))
            }
        });
    }

    /// Start the engine and scheduled health checks.
    ///
    /// An engine that fails to start is reported and handed to recovery,
    /// which switches the automated player to fallback moves; the game stays
    /// playable and the failure is returned.
    pub async fn initialize(&self) -> OrchestratorResult<()> {
        self.ensure_running()?;
        let (periodic, interval) = {
            let session = self.session();
            (
                session.config.game.periodic_health_checks,
                session.config.health_check_interval(),
            )
        };
        if periodic {
            self.health.start_periodic(interval);
        }

        let Some(ai) = &self.ai else {
            return Ok(());
        };
        if ai.adapter().is_initialized() {
            return Ok(());
        }
        if let Err(err) = ai.adapter().initialize().await {
            let failure = err.to_integration("initialize");
            report_error(&self.bus, &failure);
            let outcome = self
                .recovery
                .recover_from_error(&failure, json!({ "operation": "initialize" }))
                .await;
            warn!(error = %err, recovery = %outcome.action, "Engine failed to start");
            return Err(IntegrationError::new(
                ErrorKind::ComponentInitialization,
                COMPONENT,
                "initialize",
                "engine unavailable",
            )
            .with_cause(&err)
            .into());
        }
        Ok(())
    }

    // ── Move pipeline ────────────────────────────────────────────────

    /// Apply a human move, then play the automated reply when one is due.
    pub async fn make_move(
        &self,
        from: &str,
        to: &str,
        promotion: Option<Promotion>,
    ) -> OrchestratorResult<MoveOutcome> {
        self.ensure_running()?;
        let _busy = BusyGuard::acquire(&self.busy)?;

        if !is_square(from) || !is_square(to) {
            return Err(OrchestratorError::InvalidMove(format!(
                "malformed square in {from}-{to}"
            )));
        }
        let turn = self.views().turn;
        if self.mode().ai_color() == Some(turn) {
            return Err(OrchestratorError::AiTurn);
        }

        let record = self.apply_move(from, to, promotion, "human").await?;

        let auto_reply = self.session().config.game.auto_ai_reply;
        let ai_reply = if auto_reply && self.ai_due() {
            Some(self.play_ai_turn().await)
        } else {
            None
        };
        Ok(MoveOutcome {
            record,
            ai_reply,
            state: self.game_state(),
        })
    }

    /// Play the automated side's move, e.g. to retry after a failed reply.
    pub async fn trigger_ai_move(&self) -> OrchestratorResult<AiTurnOutcome> {
        self.ensure_running()?;
        let _busy = BusyGuard::acquire(&self.busy)?;
        if !self.ai_due() {
            return Err(OrchestratorError::NotAiTurn);
        }
        Ok(self.play_ai_turn().await)
    }

    fn ai_due(&self) -> bool {
        let mode = self.mode();
        let views = self.views();
        self.ai.is_some() && mode.ai_color() == Some(views.turn) && !views.status.is_over()
    }

    async fn apply_move(
        &self,
        from: &str,
        to: &str,
        promotion: Option<Promotion>,
        actor: &str,
    ) -> OrchestratorResult<MoveRecord> {
        let started = Instant::now();
        let move_number = self.views().history.len() + 1;
        let span = telemetry::move_span(from, to, move_number);
        let result = self
            .apply_move_inner(from, to, promotion, actor)
            .instrument(span.clone())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        telemetry::record_move_result(&span, result.is_ok(), elapsed_ms);

        if result.is_ok() {
            self.bus.emit_sync(GameEvent::new(
                names::PERFORMANCE,
                COMPONENT,
                json!({ "operation": "make_move", "actor": actor, "duration_ms": elapsed_ms }),
            ));
        }
        result
    }

    async fn apply_move_inner(
        &self,
        from: &str,
        to: &str,
        promotion: Option<Promotion>,
        actor: &str,
    ) -> OrchestratorResult<MoveRecord> {
        let mut rules = self.rules.lock().await;
        if rules.status().is_over() {
            return Err(OrchestratorError::GameOver);
        }
        if !rules.valid_moves(Some(from)).iter().any(|sq| sq == to) {
            drop(rules);
            let reason = format!("{from}{to} is not legal in this position");
            return Err(self.reject(from, to, actor, reason).await);
        }

        let snapshot_moves = self.session().config.game.snapshot_moves;
        let snapshot = snapshot_moves.then(|| self.snapshot(&**rules, "make_move"));

        let result = rules.make_move(from, to, promotion);
        let record = match (result.is_valid, result.mv) {
            (true, Some(record)) => record,
            _ => {
                drop(rules);
                if let Some(id) = &snapshot {
                    self.backups.remove_backup(id);
                }
                let reason = result
                    .error
                    .unwrap_or_else(|| format!("{from}{to} rejected by rules engine"));
                return Err(self.reject(from, to, actor, reason).await);
            }
        };

        let (move_number, in_sync, fen, status) = {
            let mut views = self.views();
            views.history.push(record.clone());
            views.refresh(&**rules);
            (
                views.history.len(),
                views.history.len() == rules.move_count(),
                views.fen.clone(),
                views.status.clone(),
            )
        };
        drop(rules);

        debug!(actor, san = %record.san, move_number, "Move applied");
        if !in_sync {
            self.handle_desync("make_move").await;
        }
        self.bus
            .emit(GameEvent::new(
                names::MOVE_COMPLETED,
                COMPONENT,
                json!({
                    "move": record,
                    "actor": actor,
                    "move_number": move_number,
                    "fen": fen,
                    "status": status,
                }),
            ))
            .await;
        Ok(record)
    }

    async fn reject(&self, from: &str, to: &str, actor: &str, reason: String) -> OrchestratorError {
        debug!(from, to, actor, %reason, "Move rejected");
        self.bus
            .emit(GameEvent::new(
                names::MOVE_REJECTED,
                COMPONENT,
                json!({ "from": from, "to": to, "actor": actor, "reason": reason }),
            ))
            .await;
        OrchestratorError::InvalidMove(reason)
    }

    fn snapshot(&self, rules: &dyn RulesEngine, operation: &str) -> BackupId {
        let mode = self.mode();
        let moves = self
            .views()
            .history
            .iter()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect();
        let aux = json!({
            "pgn": rules.pgn(),
            "status": rules.status(),
            "mode": mode,
        });
        self.backups
            .create_backup(rules.fen(), moves, aux, COMPONENT, operation)
    }

    async fn handle_desync(&self, operation: &str) {
        let err = IntegrationError::new(
            ErrorKind::StateSynchronization,
            COMPONENT,
            operation,
            "move history diverged from rules engine",
        );
        report_error(&self.bus, &err);
        let outcome = self
            .recovery
            .recover_from_error(&err, json!({ "operation": operation }))
            .await;
        self.announce_recovery(&err, outcome).await;
    }

    async fn announce_recovery(
        &self,
        err: &IntegrationError,
        outcome: coordination::resilience::RecoveryOutcome,
    ) {
        self.bus
            .emit(GameEvent::new(
                names::RECOVERY_ATTEMPTED,
                COMPONENT,
                json!({
                    "kind": err.kind,
                    "operation": err.operation,
                    "success": outcome.success,
                    "action": outcome.action.as_str(),
                }),
            ))
            .await;
    }

    // ── Automated turn ───────────────────────────────────────────────

    async fn play_ai_turn(&self) -> AiTurnOutcome {
        let Some(ai) = self.ai.clone() else {
            let err = IntegrationError::new(
                ErrorKind::ComponentInitialization,
                COMPONENT,
                "ai_turn",
                "no automated player configured",
            );
            return self.ai_failed(err).await;
        };

        let color = self.views().turn;
        let span = telemetry::ai_turn_span(color.as_str(), ai.is_fallback());
        let started = Instant::now();
        let outcome = self.run_ai_turn(&ai).instrument(span.clone()).await;
        telemetry::record_ai_result(
            &span,
            outcome.is_played(),
            started.elapsed().as_millis() as u64,
        );
        outcome
    }

    async fn run_ai_turn(&self, ai: &Arc<AiPlayer>) -> AiTurnOutcome {
        let rules = &self.rules;
        let chosen = self
            .breaker
            .execute(move || async move {
                // The board lock must not be held while the player emits events.
                let position = {
                    let rules = rules.lock().await;
                    PositionSnapshot::capture(&**rules)
                };
                ai.play(&position).await
            })
            .await;

        let chosen = match chosen {
            Ok(chosen) => chosen,
            Err(CircuitError::Open { name, retry_after }) => {
                let err = IntegrationError::new(
                    ErrorKind::CircuitOpen,
                    COMPONENT,
                    "ai_turn",
                    format!("circuit '{name}' open, retry in {retry_after:?}"),
                );
                return self.ai_failed(err).await;
            }
            Err(CircuitError::Operation(err)) => {
                return self.ai_failed(err.to_integration("make_move")).await;
            }
        };

        match self
            .apply_move(&chosen.from, &chosen.to, chosen.promotion, "ai")
            .await
        {
            Ok(record) => {
                self.session().ai_failures = 0;
                for kind in ENGINE_KINDS {
                    self.recovery.reset_attempts(kind);
                }
                info!(san = %record.san, fallback = chosen.fallback, "Automated move played");
                AiTurnOutcome::Played {
                    record,
                    fallback: chosen.fallback,
                }
            }
            Err(err) => self.ai_failed(err.to_integration("apply_ai_move")).await,
        }
    }

    async fn ai_failed(&self, err: IntegrationError) -> AiTurnOutcome {
        report_error(&self.bus, &err);
        let outcome = self
            .recovery
            .recover_from_error(&err, json!({ "operation": "ai_turn" }))
            .await;
        if matches!(
            outcome.action,
            coordination::resilience::RecoveryAction::Strategy(_)
        ) {
            self.announce_recovery(&err, outcome).await;
        }

        let (failures, threshold) = {
            let mut session = self.session();
            session.ai_failures += 1;
            (session.ai_failures, session.config.game.ai_failure_threshold)
        };
        warn!(error = %err, failures, threshold, "Automated turn failed");
        self.bus
            .emit(GameEvent::new(
                names::AI_MOVE_FAILED,
                COMPONENT,
                json!({
                    "error": err.to_payload(),
                    "consecutive_failures": failures,
                    "recovery": outcome.action.as_str(),
                }),
            ))
            .await;

        let mode_changed =
            failures >= threshold && self.change_mode(GameMode::HumanVsHuman, "ai_failures").await;
        AiTurnOutcome::Failed {
            kind: err.kind,
            error: err.message,
            consecutive_failures: failures,
            mode_changed,
        }
    }

    // ── Mode ─────────────────────────────────────────────────────────

    pub fn mode(&self) -> GameMode {
        self.session().mode
    }

    /// Switch who plays which side. Returns false if the mode is unchanged.
    pub async fn set_mode(&self, mode: GameMode) -> OrchestratorResult<bool> {
        self.ensure_running()?;
        if mode.ai_color().is_some() && self.ai.is_none() {
            return Err(OrchestratorError::Integration(IntegrationError::new(
                ErrorKind::ComponentInitialization,
                COMPONENT,
                "set_mode",
                "no automated player configured",
            )));
        }
        Ok(self.change_mode(mode, "requested").await)
    }

    async fn change_mode(&self, mode: GameMode, reason: &str) -> bool {
        let previous = {
            let mut session = self.session();
            if session.mode == mode {
                return false;
            }
            session.ai_failures = 0;
            std::mem::replace(&mut session.mode, mode)
        };
        info!(from = previous.as_str(), to = mode.as_str(), reason, "Game mode changed");
        self.bus
            .emit(GameEvent::new(
                names::MODE_CHANGED,
                COMPONENT,
                json!({ "from": previous, "to": mode, "reason": reason }),
            ))
            .await;
        true
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Mark the current position so later moves can be rolled back.
    pub async fn enable_transaction_mode(&self) -> OrchestratorResult<BackupId> {
        self.ensure_running()?;
        let _busy = BusyGuard::acquire(&self.busy)?;
        if self.session().transaction.is_some() {
            return Err(OrchestratorError::TransactionActive);
        }

        let rules = self.rules.lock().await;
        let backup_id = self.snapshot(&**rules, "transaction");
        let base_moves = rules.move_count();
        drop(rules);

        self.session().transaction = Some(Transaction {
            backup_id: backup_id.clone(),
            base_moves,
            started_at: Utc::now(),
        });
        info!(%backup_id, base_moves, "Transaction started");
        self.bus
            .emit(GameEvent::new(
                names::TRANSACTION_STARTED,
                COMPONENT,
                json!({ "backup_id": backup_id, "base_moves": base_moves }),
            ))
            .await;
        Ok(backup_id)
    }

    /// Keep the moves made since the marker. Returns how many there were.
    pub async fn commit_transaction(&self) -> OrchestratorResult<usize> {
        self.ensure_running()?;
        let _busy = BusyGuard::acquire(&self.busy)?;
        let transaction = self
            .session()
            .transaction
            .take()
            .ok_or(OrchestratorError::NoTransaction)?;
        self.backups.remove_backup(&transaction.backup_id);

        let committed = self.views().history.len().saturating_sub(transaction.base_moves);
        let held_ms = (Utc::now() - transaction.started_at).num_milliseconds();
        info!(committed, held_ms, "Transaction committed");
        self.bus
            .emit(GameEvent::new(
                names::TRANSACTION_COMMITTED,
                COMPONENT,
                json!({ "backup_id": transaction.backup_id, "moves": committed }),
            ))
            .await;
        Ok(committed)
    }

    /// Undo every move since the marker and restore the history recorded
    /// with it. Returns the number of moves undone.
    pub async fn rollback_transaction(&self) -> OrchestratorResult<usize> {
        self.ensure_running()?;
        let _busy = BusyGuard::acquire(&self.busy)?;
        let transaction = self
            .session()
            .transaction
            .take()
            .ok_or(OrchestratorError::NoTransaction)?;
        let snapshot = self.backups.get_backup(&transaction.backup_id);

        let mut rules = self.rules.lock().await;
        let mut undone = 0;
        while rules.move_count() > transaction.base_moves {
            if !rules.undo() {
                break;
            }
            undone += 1;
        }

        let mut issues = Vec::new();
        {
            let mut views = self.views();
            match &snapshot {
                Some(snapshot) => {
                    views.history = snapshot
                        .move_list
                        .iter()
                        .filter_map(|m| serde_json::from_value(m.clone()).ok())
                        .collect();
                    if snapshot.serialized_position != rules.fen() {
                        issues.push("position after undo differs from transaction marker");
                    }
                }
                None => {
                    warn!(backup_id = %transaction.backup_id, "Transaction marker evicted, truncating history");
                    views.history.truncate(transaction.base_moves);
                }
            }
            views.refresh(&**rules);
            if views.history.len() != rules.move_count() {
                issues.push("history length differs from rules engine after rollback");
            }
        }
        drop(rules);
        self.backups.remove_backup(&transaction.backup_id);

        if !issues.is_empty() {
            let err = IntegrationError::new(
                ErrorKind::StateSynchronization,
                COMPONENT,
                "rollback_transaction",
                issues.join("; "),
            )
            .with_context("undone", json!(undone));
            report_error(&self.bus, &err);
            return Err(err.into());
        }

        info!(undone, "Transaction rolled back");
        self.bus
            .emit(GameEvent::new(
                names::TRANSACTION_ROLLED_BACK,
                COMPONENT,
                json!({
                    "backup_id": transaction.backup_id,
                    "undone": undone,
                    "snapshot_restored": snapshot.is_some(),
                }),
            ))
            .await;
        Ok(undone)
    }

    pub fn transaction_active(&self) -> bool {
        self.session().transaction.is_some()
    }

    // ── Consistency ──────────────────────────────────────────────────

    /// Rebuild every derived view from the rules engine.
    pub async fn force_synchronization(&self) -> OrchestratorResult<SyncReport> {
        self.ensure_running()?;
        let rules = self.rules.lock().await;
        let report = resync(&**rules, &mut self.views());
        drop(rules);

        if report.issues.is_empty() {
            debug!("Views already in sync");
        } else {
            info!(issues = ?report.issues, in_sync = report.in_sync, "Views resynchronized");
        }
        self.bus
            .emit(GameEvent::new(
                names::STATE_SYNCHRONIZED,
                COMPONENT,
                serde_json::to_value(&report).unwrap_or_default(),
            ))
            .await;
        Ok(report)
    }

    /// Compare the derived views and the automated player with the rules
    /// engine without changing anything.
    pub async fn validate_component_synchronization(&self) -> SyncReport {
        let rules = self.rules.lock().await;
        let mut issues = self.views().drift(&**rules);
        drop(rules);

        if let Some(ai) = &self.ai {
            if !self.busy.load(Ordering::Acquire) && ai.is_thinking() != ai.adapter().is_thinking()
            {
                issues.push("AI thinking flag differs from engine adapter".to_string());
            }
        }
        if self.mode().ai_color().is_some() && self.ai.is_none() {
            issues.push("automated mode without an automated player".to_string());
        }
        SyncReport {
            in_sync: issues.is_empty(),
            issues,
        }
    }

    /// Run every health probe now.
    pub async fn perform_health_check(&self) -> HealthReport {
        let components = self.health.run_all().await;
        let summary = self.health.summary();
        debug!(overall = %summary.overall, healthy = summary.healthy, total = summary.total, "Health check complete");
        self.bus
            .emit(GameEvent::new(
                names::HEALTH_CHECKED,
                COMPONENT,
                serde_json::to_value(&summary).unwrap_or_default(),
            ))
            .await;
        HealthReport {
            summary,
            components,
        }
    }

    /// Structural checks across the components.
    pub async fn validate_integrity(&self) -> IntegrityReport {
        let mut issues = Vec::new();
        let rules = self.rules.lock().await;
        let count = rules.move_count();
        let fen = rules.fen();
        drop(rules);

        let (history, transaction_base) = {
            let views = self.views();
            let base = self.session().transaction.as_ref().map(|t| t.base_moves);
            (views.history.clone(), base)
        };
        if history.len() != count {
            issues.push(format!(
                "history holds {} moves, rules engine reports {count}",
                history.len()
            ));
        }
        if let Err(reason) = validate_fen(&fen) {
            issues.push(format!("malformed FEN: {reason}"));
        }
        if let Some(pair) = history.windows(2).find(|w| w[0].color == w[1].color) {
            issues.push(format!(
                "{} moved twice in a row ({} then {})",
                pair[0].color, pair[0].san, pair[1].san
            ));
        }
        let backups = self.backups.stats();
        if backups.count > backups.max_backups {
            issues.push(format!(
                "{} snapshots held, capacity {}",
                backups.count, backups.max_backups
            ));
        }
        let history_capacity = self.bus.config().history_capacity;
        if self.bus.history(None, None).len() > history_capacity {
            issues.push("event history exceeds its capacity".to_string());
        }
        if let Some(base) = transaction_base {
            if base > count {
                issues.push(format!(
                    "transaction marker at move {base} is ahead of the game ({count})"
                ));
            }
        }

        if !issues.is_empty() {
            warn!(?issues, "Integrity check failed");
        }
        IntegrityReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    // ── Presentation ─────────────────────────────────────────────────

    pub fn add_event_listener<F, Fut>(
        &self,
        event_type: &str,
        handler: F,
    ) -> OrchestratorResult<SubscriptionId>
    where
        F: Fn(GameEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let options = SubscribeOptions {
            owner: Some(PRESENTATION_OWNER.to_string()),
            ..SubscribeOptions::default()
        };
        Ok(self.bus.subscribe(event_type, handler, options)?)
    }

    pub fn remove_event_listener(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub async fn emit_event(&self, event: GameEvent) -> EmitReport {
        self.bus.emit(event).await
    }

    pub fn game_state(&self) -> GameState {
        let (mode, transaction_active) = {
            let session = self.session();
            (session.mode, session.transaction.is_some())
        };
        let views = self.views();
        GameState {
            fen: views.fen.clone(),
            pgn: views.pgn.clone(),
            turn: views.turn,
            status: views.status.clone(),
            in_check: views.in_check,
            mode,
            move_count: views.history.len(),
            last_move: views.history.last().cloned(),
            ai_thinking: self.is_ai_thinking(),
            ai_fallback: self.ai.as_ref().is_some_and(|ai| ai.is_fallback()),
            transaction_active,
        }
    }

    pub fn move_history(&self) -> Vec<MoveRecord> {
        self.views().history.clone()
    }

    pub fn ai_thinking_moves(&self) -> Vec<ThinkingCandidate> {
        self.ai
            .as_ref()
            .map(|ai| ai.thinking_moves())
            .unwrap_or_default()
    }

    pub fn is_ai_thinking(&self) -> bool {
        self.ai.as_ref().is_some_and(|ai| ai.is_thinking())
    }

    /// Latest cached probe results; see [`Self::perform_health_check`].
    pub fn component_health(&self) -> HealthReport {
        HealthReport {
            summary: self.health.summary(),
            components: self.health.latest_all(),
        }
    }

    pub fn config(&self) -> ChessConfig {
        self.session().config.clone()
    }

    /// Apply runtime changes. The whole update is rejected if the result
    /// would be invalid.
    pub async fn update_config(&self, update: ConfigUpdate) -> OrchestratorResult<ChessConfig> {
        let mut next = self.config();
        if let Some(threshold) = update.ai_failure_threshold {
            next.game.ai_failure_threshold = threshold;
        }
        if let Some(auto) = update.auto_ai_reply {
            next.game.auto_ai_reply = auto;
        }
        if let Some(snapshot) = update.snapshot_moves {
            next.game.snapshot_moves = snapshot;
        }
        if let Some(patch) = &update.search {
            next.search = next.search.merged(patch);
        }
        if let Some(mode) = update.mode {
            next.game.mode = mode;
        }
        next.validate()?;

        if let Some(mode) = update.mode {
            self.set_mode(mode).await?;
        }
        if let (Some(patch), Some(ai)) = (&update.search, &self.ai) {
            ai.set_engine_options(patch);
            next.search = ai.options();
        }
        self.session().config = next.clone();
        debug!("Configuration updated");
        Ok(next)
    }

    // ── Component access ─────────────────────────────────────────────

    pub fn events(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn backups(&self) -> &SharedBackupStore {
        &self.backups
    }

    pub fn health(&self) -> &SharedHealthMonitor {
        &self.health
    }

    pub fn ai_player(&self) -> Option<&Arc<AiPlayer>> {
        self.ai.as_ref()
    }

    /// Stop scheduled work, release presentation listeners and quit the
    /// engine. Later mutations fail with [`OrchestratorError::ShutDown`].
    pub async fn shutdown(&self) {
        {
            let mut session = self.session();
            if session.shut_down {
                return;
            }
            session.shut_down = true;
        }
        self.health.stop_periodic();
        if let Some(ai) = &self.ai {
            ai.adapter().shutdown().await;
        }
        let released = self.bus.unsubscribe_owner(PRESENTATION_OWNER);
        info!(released, "Orchestrator shut down");
    }
}
