//! Session configuration
//!
//! Every section has serde defaults, so an empty TOML file is a valid
//! configuration. Environment variables prefixed `CHESS_` override file
//! values:
//!
//! | Variable                      | Field                               |
//! |-------------------------------|-------------------------------------|
//! | `CHESS_ENGINE_PATH`           | `engine.program`                    |
//! | `CHESS_ENGINE_ARGS`           | `engine.args` (whitespace split)    |
//! | `CHESS_ENGINE_INIT_TIMEOUT_MS`| `engine.init_timeout_ms`            |
//! | `CHESS_SEARCH_TIME_MS`        | `search.time_limit_ms`              |
//! | `CHESS_SEARCH_DEPTH`          | `search.depth`                      |
//! | `CHESS_MULTI_PV`              | `search.multi_pv`                   |
//! | `CHESS_AI_COLOR`              | `game.mode` (human vs AI)           |
//! | `CHESS_AI_FAILURE_THRESHOLD`  | `game.ai_failure_threshold`         |
//! | `CHESS_FALLBACK_THRESHOLD`    | `ai.fallback_threshold`             |
//! | `CHESS_MAX_BACKUPS`           | `backup.max_backups`                |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use coordination::events::EventBusConfig;
use coordination::health::HealthConfig;
use coordination::resilience::{CircuitBreakerConfig, RetryBudget};
use coordination::state::BackupConfig;
use serde::{Deserialize, Serialize};

use crate::engine::protocol::{SearchOptions, MAX_MULTI_PV};
use crate::rules::Color;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Who plays which side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameMode {
    HumanVsHuman,
    HumanVsAi { ai_color: Color },
}

impl GameMode {
    pub fn ai_color(self) -> Option<Color> {
        match self {
            Self::HumanVsHuman => None,
            Self::HumanVsAi { ai_color } => Some(ai_color),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HumanVsHuman => "human_vs_human",
            Self::HumanVsAi { .. } => "human_vs_ai",
        }
    }
}

impl Default for GameMode {
    fn default() -> Self {
        Self::HumanVsAi {
            ai_color: Color::Black,
        }
    }
}

/// External engine process and adapter timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Time allowed between `init` and `readyok`.
    pub init_timeout_ms: u64,
    /// Local deadline for depth-bounded searches, which carry no time limit.
    pub depth_timeout_ms: u64,
    /// Added to a search's time limit before the local deadline fires.
    pub timeout_grace_ms: u64,
    /// Time `shutdown` waits for the worker after `quit`.
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "chess-engine".to_string(),
            args: Vec::new(),
            init_timeout_ms: 5_000,
            depth_timeout_ms: 30_000,
            timeout_grace_ms: 0,
            shutdown_timeout_ms: 1_000,
        }
    }
}

/// AI player behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Consecutive failures before the player switches to random legal moves.
    pub fallback_threshold: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            fallback_threshold: 3,
        }
    }
}

/// Orchestrator behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub mode: GameMode,
    /// Consecutive failed automated turns before the game drops to
    /// human vs human.
    pub ai_failure_threshold: u32,
    /// Snapshot state before every applied move.
    pub snapshot_moves: bool,
    /// Play the automated reply inside `make_move`.
    pub auto_ai_reply: bool,
    /// Run health checks on a schedule from `Orchestrator::initialize`.
    pub periodic_health_checks: bool,
    /// Schedule cadence. Defaults to the breaker's `monitoring_interval_ms`.
    pub health_check_interval_ms: Option<u64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            mode: GameMode::default(),
            ai_failure_threshold: 3,
            snapshot_moves: true,
            auto_ai_reply: true,
            periodic_health_checks: false,
            health_check_interval_ms: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessConfig {
    pub engine: EngineConfig,
    pub search: SearchOptions,
    pub ai: AiConfig,
    pub game: GameConfig,
    pub breaker: CircuitBreakerConfig,
    pub recovery: RetryBudget,
    pub backup: BackupConfig,
    pub events: EventBusConfig,
    pub health: HealthConfig,
}

impl ChessConfig {
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and apply `CHESS_*` overrides.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `CHESS_*` overrides.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHESS_*` overrides from `vars`. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "CHESS_ENGINE_PATH" => self.engine.program = value.to_string(),
                "CHESS_ENGINE_ARGS" => {
                    self.engine.args = value.split_whitespace().map(str::to_string).collect()
                }
                "CHESS_ENGINE_INIT_TIMEOUT_MS" => {
                    self.engine.init_timeout_ms = parse_value(key, value)?
                }
                "CHESS_SEARCH_TIME_MS" => {
                    self.search.time_limit_ms = Some(parse_value(key, value)?)
                }
                "CHESS_SEARCH_DEPTH" => self.search.depth = Some(parse_value(key, value)?),
                "CHESS_MULTI_PV" => self.search.multi_pv = parse_value(key, value)?,
                "CHESS_AI_COLOR" => {
                    self.game.mode = match value {
                        "none" => GameMode::HumanVsHuman,
                        "white" => GameMode::HumanVsAi {
                            ai_color: Color::White,
                        },
                        "black" => GameMode::HumanVsAi {
                            ai_color: Color::Black,
                        },
                        _ => return Err(invalid(key, value, "expected white, black or none")),
                    }
                }
                "CHESS_AI_FAILURE_THRESHOLD" => {
                    self.game.ai_failure_threshold = parse_value(key, value)?
                }
                "CHESS_FALLBACK_THRESHOLD" => {
                    self.ai.fallback_threshold = parse_value(key, value)?
                }
                "CHESS_MAX_BACKUPS" => self.backup.max_backups = parse_value(key, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=MAX_MULTI_PV).contains(&self.search.multi_pv) {
            return Err(invalid(
                "search.multi_pv",
                &self.search.multi_pv.to_string(),
                "must be between 1 and 5",
            ));
        }
        if self.search.time_limit_ms == Some(0) {
            return Err(invalid("search.time_limit_ms", "0", "must be positive"));
        }
        if self.backup.max_backups == 0 {
            return Err(invalid("backup.max_backups", "0", "must be positive"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "0", "must be positive"));
        }
        if self.game.ai_failure_threshold == 0 {
            return Err(invalid("game.ai_failure_threshold", "0", "must be positive"));
        }
        if self.ai.fallback_threshold == 0 {
            return Err(invalid("ai.fallback_threshold", "0", "must be positive"));
        }
        if self.game.health_check_interval_ms == Some(0) {
            return Err(invalid("game.health_check_interval_ms", "0", "must be positive"));
        }
        // Also the health cadence when no explicit interval is set.
        if self.breaker.monitoring_interval_ms == 0 {
            return Err(invalid("breaker.monitoring_interval_ms", "0", "must be positive"));
        }
        Ok(())
    }

    /// Cadence of scheduled health checks.
    pub fn health_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.game
                .health_check_interval_ms
                .unwrap_or(self.breaker.monitoring_interval_ms),
        )
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
