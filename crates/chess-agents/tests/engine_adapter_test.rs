//! Engine adapter integration tests: the adapter against an in-memory engine
//! speaking the line protocol.
//!
//! Tests verify:
//! - A `bestmove` inside the time limit resolves the search
//! - Silence past the time limit times out at the limit, and the late
//!   answer is discarded without disturbing the next search
//! - The reported timeout includes the configured grace period
//! - A new search or an explicit stop rejects the pending one
//! - Scores are normalized to white's point of view
//! - A vanished engine fails every later call

use std::time::Duration;

use chess_agents::config::EngineConfig;
use chess_agents::engine::{
    ChannelTransport, EngineAdapter, EngineEndpoint, EngineError, SearchOptions,
    SearchOptionsPatch, MATE_SENTINEL,
};
use chess_agents::testing::{ScriptedEngine, SearchReply, START_FEN};
use coordination::ErrorKind;

const BLACK_TO_MOVE: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

fn one_second() -> SearchOptions {
    SearchOptions::default().merged(&SearchOptionsPatch::time_limit(1000))
}

async fn next_command(engine: &mut EngineEndpoint) -> String {
    engine.commands.recv().await.unwrap_or_default()
}

/// Wait for the scripted engine to have seen `expected` commands starting
/// with `prefix`.
async fn received(engine: &ScriptedEngine, prefix: &str, expected: usize) {
    for _ in 0..1000 {
        if engine.count(prefix) == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("engine saw {} '{prefix}' commands, expected {expected}", engine.count(prefix));
}

/// Adapter past the `init`/`readyok` handshake, with the raw engine side.
async fn connected() -> (EngineAdapter, EngineEndpoint) {
    let (transport, mut engine) = ChannelTransport::pair();
    let adapter = EngineAdapter::new(EngineConfig::default(), transport);
    let (init, ()) = tokio::join!(adapter.initialize(), async {
        assert_eq!(next_command(&mut engine).await, "init");
        engine.reply("readyok");
    });
    init.unwrap();
    (adapter, engine)
}

// ── Deadlines ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn engine_answer_before_deadline_wins() {
    let (adapter, mut engine) = connected().await;
    adapter.set_position(START_FEN).await.unwrap();

    let options = one_second();
    let (result, ()) = tokio::join!(adapter.get_best_move(&options), async {
        assert_eq!(
            next_command(&mut engine).await,
            format!("position fen {START_FEN}")
        );
        assert_eq!(next_command(&mut engine).await, "go movetime 1000");
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.reply("info depth 8 multipv 1 score cp 30 pv e2e4 e7e5");
        engine.reply("bestmove e2e4 ponder e7e5");
    });

    let result = result.unwrap();
    assert_eq!(result.best.from, "e2");
    assert_eq!(result.best.to, "e4");
    assert_eq!(result.ponder.as_deref(), Some("e7e5"));
    assert_eq!(result.candidates.len(), 1);
    assert_eq!(result.candidates[0].principal_variation, vec!["e2e4", "e7e5"]);
    assert!(!adapter.is_thinking());
}

#[tokio::test(start_paused = true)]
async fn engine_silence_times_out_at_limit() {
    let (adapter, mut engine) = connected().await;
    adapter.set_position(START_FEN).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = adapter.get_best_move(&one_second()).await.unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err, EngineError::Timeout(1000));
    assert_eq!(err.kind(), ErrorKind::CalculationTimeout);
    assert!(waited >= Duration::from_millis(1000));
    assert!(waited < Duration::from_millis(1100));

    assert!(next_command(&mut engine).await.starts_with("position fen"));
    assert_eq!(next_command(&mut engine).await, "go movetime 1000");
    assert_eq!(next_command(&mut engine).await, "stop");

    // The abandoned search still answers; that line must not resolve the
    // next search.
    engine.reply("bestmove d2d4");
    let options = one_second();
    let (result, ()) = tokio::join!(adapter.get_best_move(&options), async {
        assert_eq!(next_command(&mut engine).await, "go movetime 1000");
        engine.reply("bestmove g1f3");
    });
    assert_eq!(result.unwrap().best.to_string(), "g1f3");
    assert_eq!(adapter.status().discarded_responses, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_reports_deadline_including_grace() {
    let config = EngineConfig {
        timeout_grace_ms: 200,
        ..EngineConfig::default()
    };
    let (adapter, engine) = ScriptedEngine::adapter_with(config, [SearchReply::Hang]);
    adapter.initialize().await.unwrap();
    adapter.set_position(START_FEN).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = adapter.get_best_move(&one_second()).await.unwrap_err();
    assert_eq!(err, EngineError::Timeout(1200));
    assert!(started.elapsed() >= Duration::from_millis(1200));
    assert_eq!(engine.count("go movetime 1000"), 1);
    received(&engine, "stop", 1).await;
}

#[tokio::test(start_paused = true)]
async fn depth_search_sends_depth_budget() {
    let (adapter, mut engine) = connected().await;
    adapter.set_position(START_FEN).await.unwrap();

    let options = SearchOptions::default().merged(&SearchOptionsPatch::depth(12));
    let (result, ()) = tokio::join!(adapter.get_best_move(&options), async {
        next_command(&mut engine).await;
        assert_eq!(next_command(&mut engine).await, "go depth 12");
        engine.reply("bestmove d2d4");
    });
    assert_eq!(result.unwrap().best.to_string(), "d2d4");
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn new_search_stops_previous() {
    let (adapter, engine) =
        ScriptedEngine::adapter([SearchReply::Hang, SearchReply::best("e2e4")]);
    adapter.initialize().await.unwrap();
    adapter.set_position(START_FEN).await.unwrap();

    let options = one_second();
    let (first, second) = tokio::join!(adapter.get_best_move(&options), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        adapter.get_best_move(&options).await
    });

    assert_eq!(first.unwrap_err(), EngineError::Stopped);
    assert_eq!(second.unwrap().best.to_string(), "e2e4");
    assert_eq!(engine.count("stop"), 1);
    assert_eq!(engine.count("go"), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_rejects_pending_search() {
    let (adapter, engine) = ScriptedEngine::adapter([SearchReply::Hang]);
    adapter.initialize().await.unwrap();
    adapter.set_position(START_FEN).await.unwrap();

    let options = one_second();
    let (search, stopped) = tokio::join!(adapter.get_best_move(&options), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        adapter.stop().await
    });
    stopped.unwrap();
    assert_eq!(search.unwrap_err(), EngineError::Stopped);
    assert!(!adapter.is_thinking());
    received(&engine, "stop", 1).await;
}

// ── Scores ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scores_are_from_whites_point_of_view() {
    let (adapter, mut engine) = connected().await;

    adapter.set_position(BLACK_TO_MOVE).await.unwrap();
    let options = SearchOptions::default().merged(&SearchOptionsPatch::default().multi_pv(2));
    let (result, ()) = tokio::join!(adapter.get_best_move(&options), async {
        next_command(&mut engine).await;
        next_command(&mut engine).await;
        engine.reply("info depth 10 multipv 1 score cp 25 pv e7e5");
        engine.reply("info depth 10 multipv 2 score cp -40 pv c7c5");
        engine.reply("bestmove e7e5");
    });
    let candidates = result.unwrap().candidates;
    assert_eq!(candidates.len(), 2);
    // Black's best line is white's worst.
    assert_eq!(candidates[0].mv, "c7c5");
    assert_eq!(candidates[0].evaluation, 40);
    assert_eq!(candidates[1].mv, "e7e5");
    assert_eq!(candidates[1].evaluation, -25);

    adapter.set_position(START_FEN).await.unwrap();
    let mate_options = one_second();
    let (result, ()) = tokio::join!(adapter.get_best_move(&mate_options), async {
        next_command(&mut engine).await;
        next_command(&mut engine).await;
        engine.reply("info depth 20 score mate 2 pv d1h5");
        engine.reply("bestmove d1h5");
    });
    assert_eq!(result.unwrap().candidates[0].evaluation, MATE_SENTINEL);
}

// ── Faults ───────────────────────────────────────────────────────────

#[tokio::test]
async fn vanished_engine_fails_later_calls() {
    let (adapter, _engine) = ScriptedEngine::adapter([SearchReply::Crash]);
    adapter.initialize().await.unwrap();
    adapter.set_position(START_FEN).await.unwrap();

    let err = adapter.get_best_move(&one_second()).await.unwrap_err();
    assert!(matches!(err, EngineError::Crashed(_)));
    assert_eq!(err.kind(), ErrorKind::EngineCrashed);

    let err = adapter.set_position(START_FEN).await.unwrap_err();
    assert!(matches!(err, EngineError::Crashed(_)));
    assert!(!adapter.probe().healthy);
}

#[tokio::test]
async fn malformed_position_never_reaches_engine() {
    let (adapter, engine) = ScriptedEngine::adapter([]);
    adapter.initialize().await.unwrap();

    let err = adapter
        .set_position("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP w KQkq - 0 1")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPosition(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidPosition);
    assert_eq!(engine.count("position"), 0);
}

#[tokio::test]
async fn shutdown_sends_quit() {
    let (adapter, engine) = ScriptedEngine::adapter([]);
    adapter.initialize().await.unwrap();
    adapter.shutdown().await;

    assert!(!adapter.is_initialized());
    received(&engine, "quit", 1).await;
    assert!(matches!(
        adapter.set_position(START_FEN).await,
        Err(EngineError::NotInitialized | EngineError::Crashed(_))
    ));
}
