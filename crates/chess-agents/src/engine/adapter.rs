//! Asynchronous engine adapter
//!
//! The adapter never touches the transport from the caller's task. A worker
//! task owns the write half, a reader task forwards the read half, and
//! callers talk to the worker over a command channel:
//!
//! ```text
//!  caller ──cmd──► worker ──line──► engine
//!    ▲               │  ▲             │
//!    └──oneshot──────┘  └──line── reader task
//! ```
//!
//! At most one search is outstanding. Starting a new one, calling `stop`, or
//! hitting the local deadline abandons the current search; the engine still
//! owes exactly one `bestmove` for it, and the worker drops that line when it
//! arrives.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use coordination::error::{ErrorKind, IntegrationError};
use coordination::health::ProbeReport;
use coordination::telemetry;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use super::protocol::{
    validate_fen, EngineCommand, EngineMessage, EngineMove, InfoLine, SearchBudget,
    SearchOptions,
};
use super::transport::{EngineTransport, LineSink, LineSource, ProcessTransport};
use crate::config::EngineConfig;
use crate::rules::Color;

const COMPONENT: &str = "engine_adapter";
const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Initialization(String),

    #[error("Engine already initialized")]
    AlreadyInitialized,

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Engine communication error: {0}")]
    Communication(String),

    /// Carries the local deadline that elapsed: the time limit plus
    /// `timeout_grace_ms`, or `depth_timeout_ms` for depth searches.
    #[error("Calculation timed out after {0} ms")]
    Timeout(u64),

    #[error("Calculation stopped")]
    Stopped,

    #[error("Engine crashed: {0}")]
    Crashed(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) | Self::AlreadyInitialized | Self::NotInitialized => {
                ErrorKind::EngineInitialization
            }
            Self::InvalidPosition(_) => ErrorKind::InvalidPosition,
            Self::Communication(_) | Self::Stopped => ErrorKind::EngineCommunication,
            Self::Timeout(_) => ErrorKind::CalculationTimeout,
            Self::Crashed(_) => ErrorKind::EngineCrashed,
        }
    }

    /// Structured form for recovery and the error channel.
    pub fn to_integration(&self, operation: &str) -> IntegrationError {
        IntegrationError::new(self.kind(), COMPONENT, operation, self.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// One ranked line reported while the engine thinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingCandidate {
    #[serde(rename = "move")]
    pub mv: String,
    /// Centipawns from white's point of view; mates are ±`MATE_SENTINEL`.
    pub evaluation: i32,
    pub depth: u32,
    pub principal_variation: Vec<String>,
}

/// Candidates keyed by first move, sorted by evaluation then arrival.
#[derive(Debug, Default)]
struct CandidateBoard {
    entries: Vec<(u64, ThinkingCandidate)>,
    next_seq: u64,
    limit: usize,
}

impl CandidateBoard {
    fn reset(&mut self, limit: usize) {
        self.entries.clear();
        self.next_seq = 0;
        self.limit = limit;
    }

    fn update(&mut self, info: &InfoLine, side_to_move: Color) {
        let (Some(score), Some(first)) = (info.score, info.pv.first()) else {
            return;
        };
        let candidate = ThinkingCandidate {
            mv: first.clone(),
            evaluation: score.normalized(side_to_move),
            depth: info.depth.unwrap_or(0),
            principal_variation: info.pv.clone(),
        };
        match self.entries.iter_mut().find(|(_, c)| c.mv == candidate.mv) {
            Some((_, existing)) => *existing = candidate,
            None => {
                self.entries.push((self.next_seq, candidate));
                self.next_seq += 1;
            }
        }
        self.entries.sort_by(|(sa, a), (sb, b)| {
            b.evaluation.cmp(&a.evaluation).then(sa.cmp(sb))
        });
        self.entries.truncate(self.limit.max(1));
    }

    fn snapshot(&self) -> Vec<ThinkingCandidate> {
        self.entries.iter().map(|(_, c)| c.clone()).collect()
    }
}

/// Terminal answer of a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub best: EngineMove,
    pub ponder: Option<String>,
    /// Ranked lines seen during the search.
    pub candidates: Vec<ThinkingCandidate>,
    pub correlation_id: Uuid,
    pub elapsed_ms: u64,
}

/// Read-only view of the adapter for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStatus {
    pub initialized: bool,
    pub thinking: bool,
    pub crashed: Option<String>,
    pub searches: u64,
    pub discarded_responses: u64,
}

#[derive(Debug, Default)]
struct AdapterState {
    initialized: bool,
    crashed: Option<String>,
    thinking: bool,
    side_to_move: Option<Color>,
    candidates: CandidateBoard,
    searches: u64,
    discarded: u64,
}

type SharedState = Arc<Mutex<AdapterState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, AdapterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

type SearchReply = oneshot::Sender<EngineResult<(EngineMove, Option<String>)>>;

enum WorkerCommand {
    Init {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Send(EngineCommand),
    Go {
        correlation_id: Uuid,
        budget: SearchBudget,
        debug: bool,
        reply: SearchReply,
    },
    /// Abandon the pending search, or only the one with this id.
    Stop { correlation_id: Option<Uuid> },
    Quit,
}

/// Client for one external engine.
pub struct EngineAdapter {
    config: EngineConfig,
    state: SharedState,
    transport: Mutex<Option<Box<dyn EngineTransport>>>,
    commands: Mutex<Option<mpsc::Sender<WorkerCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EngineAdapter {
    pub fn new(config: EngineConfig, transport: impl EngineTransport + 'static) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(AdapterState::default())),
            transport: Mutex::new(Some(Box::new(transport))),
            commands: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawn `config.program` as a child process. Requires a Tokio runtime.
    pub fn spawn_process(config: EngineConfig) -> EngineResult<Self> {
        let transport = ProcessTransport::spawn(&config.program, &config.args).map_err(|e| {
            EngineError::Initialization(format!("failed to spawn {}: {e}", config.program))
        })?;
        Ok(Self::new(config, transport))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn sender(&self) -> EngineResult<mpsc::Sender<WorkerCommand>> {
        if let Some(reason) = lock(&self.state).crashed.clone() {
            return Err(EngineError::Crashed(reason));
        }
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::NotInitialized)
    }

    async fn dispatch(&self, command: WorkerCommand) -> EngineResult<()> {
        let sender = self.sender()?;
        sender.send(command).await.map_err(|_| self.worker_gone())
    }

    fn worker_gone(&self) -> EngineError {
        let reason = lock(&self.state)
            .crashed
            .clone()
            .unwrap_or_else(|| "engine worker stopped".to_string());
        EngineError::Crashed(reason)
    }

    fn ensure_ready(&self) -> EngineResult<()> {
        let state = lock(&self.state);
        if let Some(reason) = &state.crashed {
            return Err(EngineError::Crashed(reason.clone()));
        }
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }
        Ok(())
    }

    /// Start the worker on first use, then handshake with `init`/`readyok`.
    pub async fn initialize(&self) -> EngineResult<()> {
        if lock(&self.state).initialized {
            return Err(EngineError::AlreadyInitialized);
        }
        self.start_worker()?;

        let (reply, response) = oneshot::channel();
        self.dispatch(WorkerCommand::Init { reply }).await?;

        let timeout = Duration::from_millis(self.config.init_timeout_ms);
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(Ok(()))) => {
                lock(&self.state).initialized = true;
                info!(program = %self.config.program, "Engine initialized");
                Ok(())
            }
            Ok(Ok(Err(err))) => Err(EngineError::Initialization(err.to_string())),
            Ok(Err(_)) => Err(EngineError::Initialization(
                "engine worker stopped during handshake".to_string(),
            )),
            Err(_) => Err(EngineError::Initialization(format!(
                "no readyok within {} ms",
                self.config.init_timeout_ms
            ))),
        }
    }

    fn start_worker(&self) -> EngineResult<()> {
        let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        if commands.is_some() {
            return Ok(());
        }
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EngineError::Initialization("transport already consumed".into()))?;

        let (sink, source) = transport.split();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (line_tx, line_rx) = mpsc::channel(COMMAND_BUFFER);

        tokio::spawn(read_lines(source, line_tx));
        let worker = Worker {
            sink,
            commands: cmd_rx,
            lines: line_rx,
            state: Arc::clone(&self.state),
            pending: None,
            pending_init: None,
            owed: 0,
            debug: false,
        };
        let handle = tokio::spawn(worker.run());

        *commands = Some(cmd_tx);
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Validate `fen` locally, then send it to the engine.
    pub async fn set_position(&self, fen: &str) -> EngineResult<()> {
        let summary = validate_fen(fen).map_err(EngineError::InvalidPosition)?;
        self.ensure_ready()?;
        lock(&self.state).side_to_move = Some(summary.side_to_move);
        self.dispatch(WorkerCommand::Send(EngineCommand::Position(fen.to_string())))
            .await
    }

    /// Search the current position and resolve with the engine's best move.
    pub async fn get_best_move(&self, options: &SearchOptions) -> EngineResult<SearchResult> {
        self.ensure_ready()?;
        if self.is_thinking() {
            debug!("Stopping previous search before starting a new one");
            self.stop().await?;
        }

        let budget = options.budget();
        let correlation_id = Uuid::new_v4();
        let deadline_ms = match budget {
            SearchBudget::MoveTime(ms) => ms.saturating_add(self.config.timeout_grace_ms),
            SearchBudget::Depth(_) => self.config.depth_timeout_ms,
        };
        {
            let mut state = lock(&self.state);
            state.candidates.reset(options.effective_multi_pv());
            state.thinking = true;
            state.searches += 1;
        }

        let span = telemetry::engine_search_span(&correlation_id.to_string(), &budget.to_string());
        let started = Instant::now();
        let (reply, mut response) = oneshot::channel();
        if let Err(err) = self
            .dispatch(WorkerCommand::Go {
                correlation_id,
                budget,
                debug: options.debug,
                reply,
            })
            .await
        {
            lock(&self.state).thinking = false;
            return Err(err);
        }

        let outcome = async {
            tokio::select! {
                biased;
                result = &mut response => {
                    result.unwrap_or_else(|_| Err(self.worker_gone()))
                }
                _ = tokio::time::sleep(Duration::from_millis(deadline_ms)) => {
                    // The response may have landed while the timer fired.
                    match response.try_recv() {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(%correlation_id, deadline_ms, "Search deadline passed, stopping");
                            let _ = self
                                .dispatch(WorkerCommand::Stop { correlation_id: Some(correlation_id) })
                                .await;
                            Err(EngineError::Timeout(deadline_ms))
                        }
                    }
                }
            }
        }
        .instrument(span.clone())
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (best, ponder) = match outcome {
            Ok(found) => found,
            Err(err) => {
                telemetry::record_search_result(&span, None, elapsed_ms);
                return Err(err);
            }
        };
        telemetry::record_search_result(&span, Some(&best.to_string()), elapsed_ms);
        debug!(%correlation_id, best = %best, elapsed_ms, "Search complete");
        Ok(SearchResult {
            best,
            ponder,
            candidates: self.candidates(),
            correlation_id,
            elapsed_ms,
        })
    }

    /// Abandon the current search, if any, and send `stop`.
    pub async fn stop(&self) -> EngineResult<()> {
        self.dispatch(WorkerCommand::Stop {
            correlation_id: None,
        })
        .await
    }

    /// Send `quit` and wait for the worker to exit.
    pub async fn shutdown(&self) {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(WorkerCommand::Quit).await;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("Engine worker did not stop in time, aborting");
                handle.abort();
            }
        }
        let mut state = lock(&self.state);
        state.initialized = false;
        state.thinking = false;
        info!("Engine adapter shut down");
    }

    /// Ranked candidates of the current or last search.
    pub fn candidates(&self) -> Vec<ThinkingCandidate> {
        lock(&self.state).candidates.snapshot()
    }

    pub fn is_thinking(&self) -> bool {
        lock(&self.state).thinking
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn side_to_move(&self) -> Option<Color> {
        lock(&self.state).side_to_move
    }

    pub fn status(&self) -> AdapterStatus {
        let state = lock(&self.state);
        AdapterStatus {
            initialized: state.initialized,
            thinking: state.thinking,
            crashed: state.crashed.clone(),
            searches: state.searches,
            discarded_responses: state.discarded,
        }
    }

    /// Health verdict for the monitor.
    pub fn probe(&self) -> ProbeReport {
        let status = self.status();
        let report = match (&status.crashed, status.initialized) {
            (Some(reason), _) => ProbeReport::unhealthy(format!("engine crashed: {reason}")),
            (None, false) => ProbeReport::unhealthy("engine not initialized"),
            (None, true) => ProbeReport::healthy("engine ready"),
        };
        report.with_details(serde_json::to_value(&status).unwrap_or_default())
    }
}

impl Drop for EngineAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn read_lines(mut source: Box<dyn LineSource>, lines: mpsc::Sender<std::io::Result<String>>) {
    loop {
        match source.next_line().await {
            Ok(Some(line)) => {
                if lines.send(Ok(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = lines.send(Err(err)).await;
                break;
            }
        }
    }
}

struct PendingSearch {
    correlation_id: Uuid,
    reply: SearchReply,
}

struct Worker {
    sink: Box<dyn LineSink>,
    commands: mpsc::Receiver<WorkerCommand>,
    lines: mpsc::Receiver<std::io::Result<String>>,
    state: SharedState,
    pending: Option<PendingSearch>,
    pending_init: Option<oneshot::Sender<EngineResult<()>>>,
    /// Terminal lines still owed by abandoned searches.
    owed: u32,
    debug: bool,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                line = self.lines.recv() => match line {
                    Some(Ok(line)) => self.handle_line(&line),
                    Some(Err(err)) => {
                        self.fail(format!("read failed: {err}"));
                        break;
                    }
                    None => {
                        self.fail("engine closed its output".to_string());
                        break;
                    }
                },
            }
        }
        debug!("Engine worker exiting");
    }

    /// Returns false when the worker must exit.
    async fn handle_command(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Init { reply } => {
                self.pending_init = Some(reply);
                self.write(EngineCommand::Init).await
            }
            WorkerCommand::Send(command) => self.write(command).await,
            WorkerCommand::Go {
                correlation_id,
                budget,
                debug,
                reply,
            } => {
                if self.pending.is_some() {
                    self.abandon(None);
                    if !self.write(EngineCommand::Stop).await {
                        return false;
                    }
                }
                self.debug = debug;
                self.pending = Some(PendingSearch {
                    correlation_id,
                    reply,
                });
                lock(&self.state).thinking = true;
                self.write(EngineCommand::Go(budget)).await
            }
            WorkerCommand::Stop { correlation_id } => {
                let matches = self.pending.as_ref().is_some_and(|p| {
                    correlation_id.map_or(true, |id| id == p.correlation_id)
                });
                if correlation_id.is_some() && !matches {
                    // That search already resolved; nothing is owed.
                    return true;
                }
                if matches {
                    self.abandon(correlation_id);
                }
                self.write(EngineCommand::Stop).await
            }
            WorkerCommand::Quit => {
                self.abandon(None);
                let _ = self.write(EngineCommand::Quit).await;
                if let Err(err) = self.sink.close().await {
                    debug!("Closing engine transport failed: {}", err);
                }
                false
            }
        }
    }

    fn abandon(&mut self, correlation_id: Option<Uuid>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        debug!(
            correlation_id = %pending.correlation_id,
            requested = ?correlation_id,
            "Search abandoned, dropping its terminal line"
        );
        self.owed += 1;
        lock(&self.state).thinking = false;
        let _ = pending.reply.send(Err(EngineError::Stopped));
    }

    async fn write(&mut self, command: EngineCommand) -> bool {
        let line = command.to_string();
        trace!(%line, "engine <<");
        match self.sink.send_line(&line).await {
            Ok(()) => true,
            Err(err) => {
                self.fail(format!("write failed: {err}"));
                false
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        if self.debug {
            debug!(%line, "engine >>");
        } else {
            trace!(%line, "engine >>");
        }

        match EngineMessage::parse(line) {
            EngineMessage::ReadyOk => {
                if let Some(reply) = self.pending_init.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            EngineMessage::Info(info) => {
                if self.owed == 0 && self.pending.is_some() {
                    let mut state = lock(&self.state);
                    let side = state.side_to_move.unwrap_or(Color::White);
                    state.candidates.update(&info, side);
                }
            }
            EngineMessage::BestMove { best, raw, ponder } => {
                if self.owed > 0 {
                    self.owed -= 1;
                    lock(&self.state).discarded += 1;
                    debug!(%raw, owed = self.owed, "Discarded stale bestmove");
                    return;
                }
                let Some(pending) = self.pending.take() else {
                    debug!(%raw, "Unsolicited bestmove ignored");
                    return;
                };
                lock(&self.state).thinking = false;
                let result = best
                    .map(|mv| (mv, ponder))
                    .ok_or_else(|| EngineError::Communication(format!("engine returned no move ({raw})")));
                let _ = pending.reply.send(result);
            }
            EngineMessage::Other(_) => {}
        }
    }

    fn fail(&mut self, reason: String) {
        warn!(%reason, "Engine worker failed");
        {
            let mut state = lock(&self.state);
            state.crashed = Some(reason.clone());
            state.thinking = false;
        }
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(EngineError::Crashed(reason.clone())));
        }
        if let Some(reply) = self.pending_init.take() {
            let _ = reply.send(Err(EngineError::Crashed(reason)));
        }
    }
}
