//! Automated player backed by the engine adapter
//!
//! Every engine answer is re-checked against the rules engine before it is
//! returned, so a confused engine surfaces as [`AiPlayerError::InvalidMove`]
//! rather than as an illegal move reaching the board.
//!
//! After `fallback_threshold` consecutive failures the player switches itself
//! to fallback mode, announces it with `ai:fallback_enabled`, and from then on
//! answers with a uniformly random legal move without contacting the engine.
//!
//! The player works from a [`PositionSnapshot`] rather than the live rules
//! engine, so callers can release the board before the search starts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use coordination::error::{ErrorKind, IntegrationError};
use coordination::events::{names, GameEvent, SharedEventBus};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AiConfig;
use crate::engine::{EngineAdapter, EngineError, SearchOptions, SearchOptionsPatch, ThinkingCandidate};
use crate::rules::{Color, Piece, PieceKind, Promotion, RulesEngine, Square};

const COMPONENT: &str = "ai_player";

/// Everything the player needs from the board to choose and check a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub fen: String,
    pub turn: Color,
    pub pieces: HashMap<Square, Piece>,
    /// Destinations per origin square for the side to move.
    pub legal_moves: BTreeMap<Square, Vec<Square>>,
}

impl PositionSnapshot {
    pub fn capture(rules: &dyn RulesEngine) -> Self {
        let mut pieces = HashMap::new();
        for file in 'a'..='h' {
            for rank in '1'..='8' {
                let square: Square = format!("{file}{rank}");
                if let Some(piece) = rules.piece_at(&square) {
                    pieces.insert(square, piece);
                }
            }
        }
        let legal_moves = rules
            .valid_moves(None)
            .into_iter()
            .map(|from| {
                let targets = rules.valid_moves(Some(&from));
                (from, targets)
            })
            .collect();
        Self {
            fen: rules.fen(),
            turn: rules.turn(),
            pieces,
            legal_moves,
        }
    }

    pub fn piece_at(&self, square: &str) -> Option<Piece> {
        self.pieces.get(square).copied()
    }

    pub fn is_legal(&self, from: &str, to: &str) -> bool {
        self.legal_moves
            .get(from)
            .is_some_and(|targets| targets.iter().any(|t| t == to))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AiPlayerError {
    #[error("Invalid AI move: {0}")]
    InvalidMove(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("No legal moves available")]
    NoLegalMoves,
}

impl AiPlayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMove(_) => ErrorKind::InvalidAiMove,
            Self::Engine(err) => err.kind(),
            Self::NoLegalMoves => ErrorKind::ApiValidation,
        }
    }

    pub fn to_integration(&self, operation: &str) -> IntegrationError {
        match self {
            Self::Engine(err) => err.to_integration(operation),
            _ => IntegrationError::new(self.kind(), COMPONENT, operation, self.to_string()),
        }
    }

    pub fn is_engine_error(&self) -> bool {
        matches!(self, Self::Engine(_))
    }
}

pub type AiPlayerResult<T> = Result<T, AiPlayerError>;

/// A move chosen by the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AiMove {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Promotion>,
    /// Chosen at random in fallback mode.
    pub fallback: bool,
    /// Evaluation of the chosen line, when the engine reported one.
    pub evaluation: Option<i32>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AiPlayerStats {
    pub moves: u64,
    pub fallback_moves: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub fallback: bool,
}

#[derive(Debug, Default)]
struct PlayerState {
    options: SearchOptions,
    consecutive_failures: u32,
    fallback: bool,
    thinking: bool,
    thinking_moves: Vec<ThinkingCandidate>,
    moves: u64,
    fallback_moves: u64,
    failures: u64,
}

pub struct AiPlayer {
    adapter: Arc<EngineAdapter>,
    bus: SharedEventBus,
    config: AiConfig,
    defaults: SearchOptions,
    state: Mutex<PlayerState>,
}

impl AiPlayer {
    pub fn new(
        adapter: Arc<EngineAdapter>,
        bus: SharedEventBus,
        config: AiConfig,
        defaults: SearchOptions,
    ) -> Self {
        Self {
            adapter,
            bus,
            config,
            state: Mutex::new(PlayerState {
                options: defaults.clone(),
                ..PlayerState::default()
            }),
            defaults,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn adapter(&self) -> &Arc<EngineAdapter> {
        &self.adapter
    }

    /// Options for the next search.
    pub fn options(&self) -> SearchOptions {
        self.lock().options.clone()
    }

    /// Shallow-merge `patch` over the default options.
    pub fn set_engine_options(&self, patch: &SearchOptionsPatch) {
        let merged = self.defaults.merged(patch);
        debug!(?merged, "Search options updated");
        self.lock().options = merged;
    }

    pub fn is_fallback(&self) -> bool {
        self.lock().fallback
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn stats(&self) -> AiPlayerStats {
        let state = self.lock();
        AiPlayerStats {
            moves: state.moves,
            fallback_moves: state.fallback_moves,
            failures: state.failures,
            consecutive_failures: state.consecutive_failures,
            fallback: state.fallback,
        }
    }

    /// Switch to random legal moves. Returns false if already enabled.
    pub async fn enable_fallback(&self, reason: &str) -> bool {
        let failures = {
            let mut state = self.lock();
            if state.fallback {
                return false;
            }
            state.fallback = true;
            state.consecutive_failures
        };
        warn!(reason, failures, "AI fallback enabled");
        self.bus
            .emit(GameEvent::new(
                names::AI_FALLBACK_ENABLED,
                COMPONENT,
                serde_json::json!({ "reason": reason, "consecutive_failures": failures }),
            ))
            .await;
        true
    }

    /// Return to engine-backed play with a clean failure count.
    pub fn disable_fallback(&self) {
        let mut state = self.lock();
        state.fallback = false;
        state.consecutive_failures = 0;
        info!("AI fallback disabled");
    }

    /// Mark the start of a search for observers.
    pub async fn start_thinking(&self) {
        {
            let mut state = self.lock();
            state.thinking = true;
            state.thinking_moves.clear();
        }
        self.bus
            .emit(GameEvent::new(
                names::AI_THINKING_STARTED,
                COMPONENT,
                serde_json::Value::Null,
            ))
            .await;
    }

    /// Freeze the engine's candidates and mark the search finished.
    pub async fn stop_thinking(&self) {
        let candidates = self.adapter.candidates();
        let count = candidates.len();
        {
            let mut state = self.lock();
            if !state.thinking {
                return;
            }
            state.thinking = false;
            state.thinking_moves = candidates;
        }
        self.bus
            .emit(GameEvent::new(
                names::AI_THINKING_STOPPED,
                COMPONENT,
                serde_json::json!({ "candidates": count }),
            ))
            .await;
    }

    pub fn is_thinking(&self) -> bool {
        self.lock().thinking
    }

    /// Live candidates while thinking, the last search's afterwards.
    pub fn thinking_moves(&self) -> Vec<ThinkingCandidate> {
        let state = self.lock();
        if state.thinking {
            drop(state);
            self.adapter.candidates()
        } else {
            state.thinking_moves.clone()
        }
    }

    /// Abandon the current search.
    pub async fn cancel(&self) -> AiPlayerResult<()> {
        self.adapter.stop().await?;
        self.stop_thinking().await;
        Ok(())
    }

    /// Choose a move for the side to move in `rules`.
    pub async fn make_move(&self, rules: &dyn RulesEngine) -> AiPlayerResult<AiMove> {
        self.play(&PositionSnapshot::capture(rules)).await
    }

    /// Choose a move for the side to move in a captured position.
    pub async fn play(&self, position: &PositionSnapshot) -> AiPlayerResult<AiMove> {
        if self.is_fallback() {
            let chosen = random_legal_move(position);
            let mut state = self.lock();
            return match chosen {
                Some(mv) => {
                    state.moves += 1;
                    state.fallback_moves += 1;
                    debug!(from = %mv.from, to = %mv.to, "Fallback move chosen");
                    Ok(mv)
                }
                None => Err(AiPlayerError::NoLegalMoves),
            };
        }

        match self.engine_move(position).await {
            Ok(mv) => {
                let mut state = self.lock();
                state.consecutive_failures = 0;
                state.moves += 1;
                Ok(mv)
            }
            Err(err) => {
                self.record_failure(&err).await;
                Err(err)
            }
        }
    }

    async fn engine_move(&self, position: &PositionSnapshot) -> AiPlayerResult<AiMove> {
        let started = Instant::now();
        self.adapter.set_position(&position.fen).await?;

        let options = self.options();
        self.start_thinking().await;
        let search = self.adapter.get_best_move(&options).await;
        self.stop_thinking().await;
        let search = search?;

        let best = search.best;
        let described = best.to_string();
        let Some(piece) = position.piece_at(&best.from) else {
            return Err(AiPlayerError::InvalidMove(format!(
                "{described}: no piece on {}",
                best.from
            )));
        };
        if piece.color != position.turn {
            return Err(AiPlayerError::InvalidMove(format!(
                "{described}: piece on {} belongs to {}",
                best.from, piece.color
            )));
        }
        if !position.is_legal(&best.from, &best.to) {
            return Err(AiPlayerError::InvalidMove(format!(
                "{described}: {} is not reachable from {}",
                best.to, best.from
            )));
        }

        let evaluation = search
            .candidates
            .iter()
            .find(|c| c.mv == described || c.principal_variation.first() == Some(&described))
            .map(|c| c.evaluation);
        Ok(AiMove {
            from: best.from,
            to: best.to,
            promotion: best.promotion,
            fallback: false,
            evaluation,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn record_failure(&self, err: &AiPlayerError) {
        let failures = {
            let mut state = self.lock();
            state.consecutive_failures += 1;
            state.failures += 1;
            state.consecutive_failures
        };
        warn!(error = %err, failures, threshold = self.config.fallback_threshold, "AI move failed");
        if failures >= self.config.fallback_threshold {
            self.enable_fallback("consecutive_failures").await;
        }
    }
}

/// Uniformly random legal move for the side to move.
pub fn random_legal_move(position: &PositionSnapshot) -> Option<AiMove> {
    let candidates: Vec<(&Square, &Square)> = position
        .legal_moves
        .iter()
        .flat_map(|(from, targets)| targets.iter().map(move |to| (from, to)))
        .collect();
    let (from, to) = candidates
        .choose(&mut rand::thread_rng())
        .map(|(from, to)| ((*from).clone(), (*to).clone()))?;

    let promotes = position
        .piece_at(&from)
        .is_some_and(|p| p.kind == PieceKind::Pawn)
        && (to.ends_with('8') || to.ends_with('1'));
    Some(AiMove {
        promotion: promotes.then_some(Promotion::Queen),
        from,
        to,
        fallback: true,
        evaluation: None,
        elapsed_ms: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MockRulesEngine;
    use crate::testing::{FakeRules, ScriptedEngine, SearchReply};
    use coordination::events::EventBus;
    use std::time::Duration;

    fn player(replies: Vec<SearchReply>) -> (AiPlayer, ScriptedEngine, SharedEventBus) {
        let (adapter, engine) = ScriptedEngine::adapter(replies);
        let bus = EventBus::new().shared();
        let player = AiPlayer::new(
            adapter,
            bus.clone(),
            AiConfig::default(),
            SearchOptions::default(),
        );
        (player, engine, bus)
    }

    async fn after_e4() -> FakeRules {
        let mut rules = FakeRules::new();
        assert!(rules.make_move("e2", "e4", None).is_valid);
        rules
    }

    #[tokio::test]
    async fn test_engine_move_is_validated_and_returned() {
        let (player, _engine, _bus) = player(vec![SearchReply::best("e7e5")]);
        player.adapter().initialize().await.unwrap();
        let rules = after_e4().await;

        let mv = player.make_move(&rules).await.unwrap();
        assert_eq!((mv.from.as_str(), mv.to.as_str()), ("e7", "e5"));
        assert!(!mv.fallback);
        assert_eq!(player.consecutive_failures(), 0);
        assert!(!player.is_thinking());
        assert_eq!(player.thinking_moves().len(), 1);
    }

    #[tokio::test]
    async fn test_move_from_empty_square_is_invalid_ai_move() {
        let (player, _engine, _bus) = player(vec![SearchReply::best("e5e4")]);
        player.adapter().initialize().await.unwrap();
        let rules = after_e4().await;

        let err = player.make_move(&rules).await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid AI move"));
        assert_eq!(err.kind(), ErrorKind::InvalidAiMove);
        assert!(!err.is_engine_error());
        assert_eq!(player.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_rejected() {
        let mut rules = MockRulesEngine::new();
        rules
            .expect_fen()
            .returning(|| "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".into());
        rules.expect_piece_at().returning(|_| {
            Some(Piece {
                color: Color::White,
                kind: PieceKind::Pawn,
            })
        });
        rules.expect_turn().returning(|| Color::White);
        rules
            .expect_valid_moves()
            .returning(|_| vec!["e3".to_string(), "e4".to_string()]);

        let (player, _engine, _bus) = player(vec![SearchReply::best("e2e5")]);
        player.adapter().initialize().await.unwrap();
        let err = player.make_move(&rules).await.unwrap_err();
        assert!(matches!(err, AiPlayerError::InvalidMove(ref m) if m.contains("not reachable")));
    }

    #[tokio::test]
    async fn test_fallback_after_threshold_failures() {
        let (player, _engine, bus) = player(vec![
            SearchReply::NoMove,
            SearchReply::NoMove,
            SearchReply::NoMove,
        ]);
        player.adapter().initialize().await.unwrap();
        let mut events = bus.watch();
        let rules = after_e4().await;

        for _ in 0..3 {
            let err = player.make_move(&rules).await.unwrap_err();
            assert!(err.is_engine_error());
        }
        assert!(player.is_fallback());

        let announced = loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.event_type == names::AI_FALLBACK_ENABLED {
                break event;
            }
        };
        assert_eq!(announced.payload["consecutive_failures"], 3);

        let mv = player.make_move(&rules).await.unwrap();
        assert!(mv.fallback);
        assert_eq!(rules.piece_at(&mv.from).unwrap().color, Color::Black);
        assert!(rules.valid_moves(Some(&mv.from)).contains(&mv.to));
        assert_eq!(player.stats().fallback_moves, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (player, _engine, _bus) =
            player(vec![SearchReply::NoMove, SearchReply::best("e7e5")]);
        player.adapter().initialize().await.unwrap();
        let rules = after_e4().await;

        assert!(player.make_move(&rules).await.is_err());
        assert_eq!(player.consecutive_failures(), 1);
        player.make_move(&rules).await.unwrap();
        assert_eq!(player.consecutive_failures(), 0);
    }

    #[test]
    fn test_set_engine_options_merges_over_defaults() {
        let (adapter, _engine) = ScriptedEngine::unstarted_adapter();
        let player = AiPlayer::new(
            adapter,
            EventBus::new().shared(),
            AiConfig::default(),
            SearchOptions::default(),
        );
        player.set_engine_options(&SearchOptionsPatch::depth(8));
        assert_eq!(player.options().depth, Some(8));
        player.set_engine_options(&SearchOptionsPatch::default().multi_pv(3));
        let options = player.options();
        assert_eq!(options.depth, None);
        assert_eq!(options.multi_pv, 3);
        assert_eq!(options.time_limit_ms, Some(1000));
    }

    #[test]
    fn test_random_legal_move_without_moves() {
        let mut rules = MockRulesEngine::new();
        rules.expect_fen().returning(|| "8/8/8/8/8/8/8/k6K w - - 0 1".into());
        rules.expect_turn().returning(|| Color::White);
        rules.expect_piece_at().returning(|_| None);
        rules.expect_valid_moves().returning(|_| Vec::new());
        let position = PositionSnapshot::capture(&rules);
        assert!(position.legal_moves.is_empty());
        assert!(random_legal_move(&position).is_none());
    }

    #[test]
    fn test_random_move_promotes_pawn_on_last_rank() {
        let position = PositionSnapshot {
            fen: "8/4P3/8/8/8/8/8/k6K w - - 0 1".into(),
            turn: Color::White,
            pieces: HashMap::from([(
                "e7".to_string(),
                Piece {
                    color: Color::White,
                    kind: PieceKind::Pawn,
                },
            )]),
            legal_moves: BTreeMap::from([("e7".to_string(), vec!["e8".to_string()])]),
        };
        let mv = random_legal_move(&position).unwrap();
        assert_eq!((mv.from.as_str(), mv.to.as_str()), ("e7", "e8"));
        assert_eq!(mv.promotion, Some(Promotion::Queen));
        assert!(mv.fallback);
    }

    #[tokio::test]
    async fn test_play_works_from_a_detached_snapshot() {
        let (player, _engine, _bus) = player(vec![SearchReply::best("e7e5")]);
        player.adapter().initialize().await.unwrap();
        let position = {
            let rules = after_e4().await;
            PositionSnapshot::capture(&rules)
        };
        assert_eq!(position.turn, Color::Black);
        assert!(position.is_legal("e7", "e5"));

        let mv = player.play(&position).await.unwrap();
        assert_eq!((mv.from.as_str(), mv.to.as_str()), ("e7", "e5"));
    }
}
