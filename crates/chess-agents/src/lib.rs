//! Chess Agents
//!
//! Engine-backed chess sessions built on `game-coordination`:
//!
//! - [`engine`]: asynchronous client for an external UCI-style engine
//! - [`ai_player`]: automated player with move re-validation and fallback
//! - [`orchestrator`]: single-writer move pipeline, transactions and
//!   consistency checks
//! - [`rules`]: the interface to the external rules engine
//! - [`config`]: TOML and `CHESS_*` environment configuration
//! - [`testing`]: in-memory rules and engine doubles

#![allow(clippy::uninlined_format_args)]

pub mod ai_player;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod rules;
pub mod testing;

pub use ai_player::{AiMove, AiPlayer, AiPlayerError, AiPlayerResult};
pub use config::{ChessConfig, ConfigError, GameMode};
pub use engine::{EngineAdapter, EngineError, SearchOptions, SearchOptionsPatch};
pub use orchestrator::{
    AiTurnOutcome, ConfigUpdate, GameState, MoveOutcome, Orchestrator, OrchestratorError,
    OrchestratorResult, SharedOrchestrator,
};
pub use rules::{Color, GameStatus, MoveRecord, MoveResult, Promotion, RulesEngine};
