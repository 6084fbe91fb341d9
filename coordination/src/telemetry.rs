//! Tracing setup and span helpers
//!
//! Hosts call [`init_tracing`] once at startup. Library code never installs a
//! subscriber itself; it only opens the spans below so that a move can be
//! followed from the orchestrator through the AI turn into the engine search.
//!
//! # Span Hierarchy
//!
//! ```text
//! game.move                 (one per applied move, human or automated)
//! game.ai_turn              (automated reply, wraps the breaker call)
//!   └─ engine.search        (one `go` command and its terminal response)
//! game.recovery             (one recovery strategy invocation)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use game_coordination::telemetry;
//!
//! telemetry::init_tracing("info");
//! let span = telemetry::move_span("e2", "e4", 1);
//! let _guard = span.enter();
//! telemetry::record_move_result(&span, true, 3);
//! ```

use tracing::Span;
use tracing_subscriber::EnvFilter;

// ── Span Name Constants ──────────────────────────────────────────────

pub const SPAN_MOVE: &str = "game.move";
pub const SPAN_AI_TURN: &str = "game.ai_turn";
pub const SPAN_ENGINE_SEARCH: &str = "engine.search";
pub const SPAN_RECOVERY: &str = "game.recovery";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` when the variable is unset or invalid.
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

// ── Span Builders ────────────────────────────────────────────────────

/// Span for applying one move.
///
/// Fields filled later via [`record_move_result`]: `game.success`, `game.duration_ms`.
pub fn move_span(from: &str, to: &str, move_number: usize) -> Span {
    tracing::info_span!(
        "game.move",
        "game.move.from" = %from,
        "game.move.to" = %to,
        "game.move.number" = move_number as u64,
        "game.success" = tracing::field::Empty,
        "game.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_move_result(span: &Span, success: bool, duration_ms: u64) {
    span.record("game.success", success);
    span.record("game.duration_ms", duration_ms);
}

/// Span for an automated reply.
pub fn ai_turn_span(color: &str, fallback: bool) -> Span {
    tracing::info_span!(
        "game.ai_turn",
        "game.ai.color" = %color,
        "game.ai.fallback" = fallback,
        "game.success" = tracing::field::Empty,
        "game.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_ai_result(span: &Span, success: bool, duration_ms: u64) {
    span.record("game.success", success);
    span.record("game.duration_ms", duration_ms);
}

/// Span for one engine search, keyed by its correlation id.
///
/// `budget` is the rendered `go` arguments, e.g. `movetime 1000`.
pub fn engine_search_span(correlation_id: &str, budget: &str) -> Span {
    tracing::debug_span!(
        "engine.search",
        "engine.correlation_id" = %correlation_id,
        "engine.budget" = %budget,
        "engine.best_move" = tracing::field::Empty,
        "game.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_search_result(span: &Span, best_move: Option<&str>, duration_ms: u64) {
    if let Some(best_move) = best_move {
        span.record("engine.best_move", best_move);
    }
    span.record("game.duration_ms", duration_ms);
}

/// Span for one recovery strategy invocation.
pub fn recovery_span(kind: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "game.recovery",
        "game.recovery.kind" = %kind,
        "game.recovery.attempt" = attempt,
        "game.success" = tracing::field::Empty,
    )
}
