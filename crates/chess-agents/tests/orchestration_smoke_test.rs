//! Orchestration smoke tests: full sessions against the in-memory rules
//! engine and a scripted move-search engine.
//!
//! Tests verify:
//! - History, `move:completed` events and the rules engine agree on the
//!   number of moves
//! - An automated reply is re-validated and played through the pipeline
//! - Repeated engine failures drop the game to human vs human
//! - The circuit breaker stops calling a failing engine and recovers
//! - Transactions roll back both sides of the game
//! - Listener failures never block a move
//! - Listeners may query the orchestrator while the engine is searching

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chess_agents::config::{ChessConfig, GameMode};
use chess_agents::orchestrator::{AiTurnOutcome, Orchestrator, OrchestratorError};
use chess_agents::rules::Color;
use chess_agents::testing::{FakeRules, ScriptedEngine, SearchReply, START_FEN};
use chess_agents::SharedOrchestrator;
use coordination::events::names;
use coordination::{CircuitState, ErrorKind, HealthStatus};

fn base_config() -> ChessConfig {
    let mut config = ChessConfig::default();
    config.recovery.backoff_ms = 0;
    config.events.retry_delay_ms = 0;
    config
}

fn human_game(config: ChessConfig) -> SharedOrchestrator {
    let mut config = config;
    config.game.mode = GameMode::HumanVsHuman;
    Orchestrator::new(config, Box::new(FakeRules::new()), None).unwrap()
}

async fn ai_game(
    config: ChessConfig,
    replies: Vec<SearchReply>,
) -> (SharedOrchestrator, ScriptedEngine) {
    let (adapter, engine) = ScriptedEngine::adapter(replies);
    let orchestrator =
        Orchestrator::new(config, Box::new(FakeRules::new()), Some(adapter)).unwrap();
    orchestrator.initialize().await.unwrap();
    (orchestrator, engine)
}

/// Yield until `event_type` has been recorded `expected` times.
async fn recorded(orchestrator: &Orchestrator, event_type: &str, expected: usize) {
    for _ in 0..1000 {
        if orchestrator.events().history(Some(event_type), None).len() >= expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{event_type} recorded fewer than {expected} times");
}

// ── Move accounting ──────────────────────────────────────────────────

#[tokio::test]
async fn smoke_history_events_and_rules_agree() {
    let orchestrator = human_game(base_config());
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed);
    orchestrator
        .add_event_listener(names::MOVE_COMPLETED, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    let moves = [
        ("e2", "e4"),
        ("e7", "e5"),
        ("g1", "f3"),
        ("b8", "c6"),
        ("f1", "c4"),
        ("g8", "f6"),
    ];
    for (from, to) in moves {
        orchestrator.make_move(from, to, None).await.unwrap();
    }
    // Rejected moves are not counted.
    assert!(orchestrator.make_move("e1", "e3", None).await.is_err());

    let state = orchestrator.game_state();
    assert_eq!(orchestrator.move_history().len(), moves.len());
    assert_eq!(completed.load(Ordering::SeqCst), moves.len());
    assert_eq!(
        orchestrator
            .events()
            .history(Some(names::MOVE_COMPLETED), None)
            .len(),
        moves.len()
    );
    assert_eq!(state.move_count, moves.len());
    assert_eq!(state.pgn, "1. e2e4 e7e5 2. g1f3 b8c6 3. f1c4 g8f6");

    let integrity = orchestrator.validate_integrity().await;
    assert!(integrity.valid, "{:?}", integrity.issues);
}

#[tokio::test]
async fn smoke_first_move_leaves_black_to_move() {
    let mut config = base_config();
    config.game.auto_ai_reply = false;
    let (orchestrator, engine) = ai_game(config, vec![]).await;

    let outcome = orchestrator.make_move("e2", "e4", None).await.unwrap();
    assert!(outcome.ai_reply.is_none());
    assert_eq!(outcome.state.turn, Color::Black);
    assert!(outcome.state.fen.contains(" b "));
    assert_eq!(engine.count("go"), 0);
}

#[tokio::test]
async fn smoke_backups_keep_newest_positions() {
    let mut config = base_config();
    config.backup.max_backups = 3;
    let orchestrator = human_game(config);

    for (from, to) in [("e2", "e4"), ("e7", "e5"), ("g1", "f3"), ("b8", "c6")] {
        orchestrator.make_move(from, to, None).await.unwrap();
    }
    let before_last = orchestrator.game_state().fen;
    orchestrator.make_move("f1", "c4", None).await.unwrap();

    let backups = orchestrator.backups().list();
    assert_eq!(backups.len(), 3);
    assert!(backups.iter().all(|b| b.serialized_position != START_FEN));
    let latest = orchestrator.backups().latest().unwrap();
    assert_eq!(latest.serialized_position, before_last);
    assert_eq!(latest.move_list.len(), 4);
}

// ── Automated turns ──────────────────────────────────────────────────

#[tokio::test]
async fn smoke_engine_reply_is_played() {
    let (orchestrator, engine) = ai_game(base_config(), vec![SearchReply::best("e7e5")]).await;

    let outcome = orchestrator.make_move("e2", "e4", None).await.unwrap();
    match outcome.ai_reply {
        Some(AiTurnOutcome::Played { record, fallback }) => {
            assert_eq!(record.san, "e7e5");
            assert_eq!(record.color, Color::Black);
            assert!(!fallback);
        }
        other => panic!("expected an automated move, got {other:?}"),
    }
    assert_eq!(outcome.state.turn, Color::White);
    assert_eq!(orchestrator.move_history().len(), 2);
    assert_eq!(
        engine.received()[1],
        "position fen rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1"
    );
    assert!(!orchestrator.is_ai_thinking());
    assert_eq!(orchestrator.ai_thinking_moves()[0].mv, "e7e5");
}

#[tokio::test]
async fn smoke_move_from_empty_square_is_invalid_ai_move() {
    let (orchestrator, _engine) = ai_game(base_config(), vec![SearchReply::best("e5e4")]).await;

    let outcome = orchestrator.make_move("e2", "e4", None).await.unwrap();
    match outcome.ai_reply {
        Some(AiTurnOutcome::Failed { kind, error, .. }) => {
            assert_eq!(kind, ErrorKind::InvalidAiMove);
            assert!(error.starts_with("Invalid AI move"), "{error}");
        }
        other => panic!("expected a failed automated move, got {other:?}"),
    }
    assert_eq!(orchestrator.move_history().len(), 1);
    assert_eq!(orchestrator.game_state().turn, Color::Black);
    assert_eq!(
        orchestrator.events().history(Some(names::ERROR), None).len(),
        1
    );
}

#[tokio::test]
async fn smoke_three_engine_failures_switch_to_human_vs_human() {
    let (orchestrator, _engine) = ai_game(
        base_config(),
        vec![SearchReply::NoMove, SearchReply::NoMove, SearchReply::NoMove],
    )
    .await;

    let outcome = orchestrator.make_move("e2", "e4", None).await.unwrap();
    assert!(matches!(
        outcome.ai_reply,
        Some(AiTurnOutcome::Failed {
            kind: ErrorKind::EngineCommunication,
            consecutive_failures: 1,
            mode_changed: false,
            ..
        })
    ));
    assert!(matches!(
        orchestrator.trigger_ai_move().await.unwrap(),
        AiTurnOutcome::Failed {
            consecutive_failures: 2,
            ..
        }
    ));
    assert!(matches!(
        orchestrator.trigger_ai_move().await.unwrap(),
        AiTurnOutcome::Failed {
            mode_changed: true,
            ..
        }
    ));

    assert_eq!(orchestrator.mode(), GameMode::HumanVsHuman);
    let changes = orchestrator.events().history(Some(names::MODE_CHANGED), None);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].payload["reason"], "ai_failures");
    assert_eq!(changes[0].payload["to"]["kind"], "human_vs_human");
    assert_eq!(
        orchestrator
            .events()
            .history(Some(names::AI_MOVE_FAILED), None)
            .len(),
        3
    );

    // The human now plays both sides.
    assert!(matches!(
        orchestrator.trigger_ai_move().await,
        Err(OrchestratorError::NotAiTurn)
    ));
    orchestrator.make_move("e7", "e5", None).await.unwrap();
    assert_eq!(orchestrator.move_history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn smoke_breaker_stops_calling_failing_engine() {
    let mut config = base_config();
    config.breaker.failure_threshold = 2;
    config.breaker.recovery_timeout_ms = 5_000;
    config.game.ai_failure_threshold = 10;
    config.ai.fallback_threshold = 10;
    let (orchestrator, engine) = ai_game(
        config,
        vec![
            SearchReply::NoMove,
            SearchReply::NoMove,
            SearchReply::best("e7e5"),
        ],
    )
    .await;

    orchestrator.make_move("e2", "e4", None).await.unwrap();
    orchestrator.trigger_ai_move().await.unwrap();
    assert_eq!(orchestrator.breaker().state(), CircuitState::Open);

    let rejected = orchestrator.trigger_ai_move().await.unwrap();
    assert!(matches!(
        rejected,
        AiTurnOutcome::Failed {
            kind: ErrorKind::CircuitOpen,
            ..
        }
    ));
    assert_eq!(engine.count("go"), 2);
    recorded(&orchestrator, names::CIRCUIT_STATE_CHANGED, 1).await;

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    let played = orchestrator.trigger_ai_move().await.unwrap();
    assert!(played.is_played());
    assert_eq!(orchestrator.breaker().state(), CircuitState::Closed);
    assert_eq!(orchestrator.breaker().failure_count(), 0);
    recorded(&orchestrator, names::CIRCUIT_STATE_CHANGED, 3).await;
}

#[tokio::test]
async fn smoke_crashed_engine_falls_back_to_random_moves() {
    let (orchestrator, _engine) = ai_game(base_config(), vec![SearchReply::Crash]).await;

    let outcome = orchestrator.make_move("e2", "e4", None).await.unwrap();
    assert!(matches!(
        outcome.ai_reply,
        Some(AiTurnOutcome::Failed {
            kind: ErrorKind::EngineCrashed,
            ..
        })
    ));
    assert!(orchestrator.game_state().ai_fallback);
    assert_eq!(
        orchestrator
            .events()
            .history(Some(names::AI_FALLBACK_ENABLED), None)
            .len(),
        1
    );

    match orchestrator.trigger_ai_move().await.unwrap() {
        AiTurnOutcome::Played { record, fallback } => {
            assert!(fallback);
            assert_eq!(record.color, Color::Black);
        }
        other => panic!("expected a fallback move, got {other:?}"),
    }

    // Fallback keeps the engine probe from failing the session.
    let health = orchestrator.perform_health_check().await;
    assert_eq!(health.summary.overall, HealthStatus::Healthy);
}

#[tokio::test]
async fn smoke_listener_can_inspect_board_during_engine_search() {
    let (orchestrator, _engine) = ai_game(base_config(), vec![SearchReply::best("e7e5")]).await;
    let reports = Arc::new(Mutex::new(Vec::new()));
    let handle: Weak<Orchestrator> = Arc::downgrade(&orchestrator);
    let seen = Arc::clone(&reports);
    orchestrator
        .add_event_listener(names::AI_THINKING_STARTED, move |_| {
            let handle = handle.clone();
            let seen = Arc::clone(&seen);
            async move {
                if let Some(orchestrator) = handle.upgrade() {
                    let report = orchestrator.validate_integrity().await;
                    seen.lock().unwrap().push(report.valid);
                }
                Ok(())
            }
        })
        .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        orchestrator.make_move("e2", "e4", None),
    )
    .await
    .expect("automated turn stalled behind a listener")
    .unwrap();

    assert!(matches!(outcome.ai_reply, Some(AiTurnOutcome::Played { .. })));
    assert_eq!(orchestrator.move_history().len(), 2);
    assert_eq!(*reports.lock().unwrap(), vec![true]);
}

// ── Transactions and consistency ─────────────────────────────────────

#[tokio::test]
async fn smoke_rollback_undoes_both_sides() {
    let (orchestrator, _engine) = ai_game(
        base_config(),
        vec![SearchReply::best("e7e5"), SearchReply::best("b8c6")],
    )
    .await;

    orchestrator.enable_transaction_mode().await.unwrap();
    orchestrator.make_move("e2", "e4", None).await.unwrap();
    orchestrator.make_move("g1", "f3", None).await.unwrap();
    assert_eq!(orchestrator.move_history().len(), 4);

    assert_eq!(orchestrator.rollback_transaction().await.unwrap(), 4);
    let state = orchestrator.game_state();
    assert_eq!(state.fen, START_FEN);
    assert_eq!(state.move_count, 0);
    assert_eq!(state.pgn, "");
    assert_eq!(
        orchestrator
            .events()
            .history(Some(names::TRANSACTION_ROLLED_BACK), None)
            .len(),
        1
    );
    assert!(orchestrator.validate_component_synchronization().await.in_sync);
}

#[tokio::test]
async fn smoke_failing_listener_does_not_block_moves() {
    let orchestrator = human_game(base_config());
    orchestrator
        .add_event_listener(names::MOVE_COMPLETED, |_| async {
            Err::<(), _>(anyhow::anyhow!("renderer unavailable"))
        })
        .unwrap();

    orchestrator.make_move("d2", "d4", None).await.unwrap();
    orchestrator.make_move("d7", "d5", None).await.unwrap();

    assert_eq!(orchestrator.move_history().len(), 2);
    let errors = orchestrator.events().history(Some(names::ERROR), None);
    assert_eq!(errors.len(), 2);
    let metrics = orchestrator.events().metrics(names::MOVE_COMPLETED).unwrap();
    assert_eq!(metrics.error_count, 2);
}

#[tokio::test]
async fn smoke_health_and_integrity_after_session() {
    let (orchestrator, _engine) = ai_game(base_config(), vec![SearchReply::best("e7e5")]).await;
    orchestrator.make_move("e2", "e4", None).await.unwrap();

    let health = orchestrator.perform_health_check().await;
    assert_eq!(health.summary.overall, HealthStatus::Healthy);
    assert_eq!(health.components.len(), 5);
    assert_eq!(orchestrator.component_health().summary.total, 5);

    assert!(orchestrator.validate_integrity().await.valid);
    let sync = orchestrator.force_synchronization().await.unwrap();
    assert!(sync.in_sync);
    assert!(sync.issues.is_empty());

    orchestrator.shutdown().await;
    assert!(matches!(
        orchestrator.make_move("g1", "f3", None).await,
        Err(OrchestratorError::ShutDown)
    ));
}
