//! Line protocol spoken with the external search engine
//!
//! Outbound commands render to one line each; inbound lines parse into
//! [`EngineMessage`]. Nothing here performs I/O.
//!
//! ```text
//!   ──► init                      ◄── readyok
//!   ──► position fen <FEN>
//!   ──► go depth <N> | go movetime <ms>
//!                                 ◄── info depth 12 multipv 1 score cp 25 pv e2e4 e7e5
//!                                 ◄── bestmove e2e4 [ponder e7e5]
//!   ──► stop
//!   ──► quit
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rules::{Color, Promotion};

/// Score assigned to a forced mate, before sign normalization.
pub const MATE_SENTINEL: i32 = 100_000;

/// Thinking time used when a search names neither depth nor time.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 1_000;

/// Highest number of principal variations the adapter tracks.
pub const MAX_MULTI_PV: u8 = 5;

static SQUARE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-h][1-8]$").expect("SQUARE_RE regex should compile"));

static EN_PASSANT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-|[a-h][36])$").expect("EN_PASSANT_RE regex should compile"));

static MOVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-h][1-8])([a-h][1-8])([qrbnQRBN])?$").expect("MOVE_RE regex should compile")
});

// ── Search options ───────────────────────────────────────────────────

/// Parameters for one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Thinking time in milliseconds; used when `depth` is unset.
    pub time_limit_ms: Option<u64>,
    /// Fixed search depth in plies; takes precedence over the time limit.
    pub depth: Option<u32>,
    /// Candidate lines to track, clamped to 1..=5.
    pub multi_pv: u8,
    /// Log every engine line at debug level.
    pub debug: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            time_limit_ms: Some(DEFAULT_TIME_LIMIT_MS),
            depth: None,
            multi_pv: 1,
            debug: false,
        }
    }
}

impl SearchOptions {
    /// How the `go` command bounds the search.
    pub fn budget(&self) -> SearchBudget {
        match (self.depth, self.time_limit_ms) {
            (Some(depth), _) => SearchBudget::Depth(depth),
            (None, Some(ms)) => SearchBudget::MoveTime(ms),
            (None, None) => SearchBudget::MoveTime(DEFAULT_TIME_LIMIT_MS),
        }
    }

    pub fn effective_multi_pv(&self) -> usize {
        usize::from(self.multi_pv.clamp(1, MAX_MULTI_PV))
    }

    /// Shallow merge: every field present in `patch` replaces ours.
    pub fn merged(&self, patch: &SearchOptionsPatch) -> Self {
        Self {
            time_limit_ms: patch.time_limit_ms.unwrap_or(self.time_limit_ms),
            depth: patch.depth.unwrap_or(self.depth),
            multi_pv: patch.multi_pv.unwrap_or(self.multi_pv),
            debug: patch.debug.unwrap_or(self.debug),
        }
    }
}

/// Partial update for [`SearchOptions`].
///
/// The outer `Option` says whether the field is present; for the optional
/// budgets the inner `Option` lets a patch clear them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptionsPatch {
    pub time_limit_ms: Option<Option<u64>>,
    pub depth: Option<Option<u32>>,
    pub multi_pv: Option<u8>,
    pub debug: Option<bool>,
}

impl SearchOptionsPatch {
    pub fn time_limit(ms: u64) -> Self {
        Self {
            time_limit_ms: Some(Some(ms)),
            depth: Some(None),
            ..Self::default()
        }
    }

    pub fn depth(depth: u32) -> Self {
        Self {
            depth: Some(Some(depth)),
            ..Self::default()
        }
    }

    pub fn multi_pv(mut self, multi_pv: u8) -> Self {
        self.multi_pv = Some(multi_pv);
        self
    }
}

/// Bound carried by the `go` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBudget {
    Depth(u32),
    MoveTime(u64),
}

impl fmt::Display for SearchBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Depth(depth) => write!(f, "depth {depth}"),
            Self::MoveTime(ms) => write!(f, "movetime {ms}"),
        }
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Init,
    Position(String),
    Go(SearchBudget),
    Stop,
    Quit,
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Position(fen) => write!(f, "position fen {fen}"),
            Self::Go(budget) => write!(f, "go {budget}"),
            Self::Stop => write!(f, "stop"),
            Self::Quit => write!(f, "quit"),
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Raw engine score, from the side to move's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Score {
    Centipawns(i32),
    /// Mate in `n` moves; zero or negative when the side to move gets mated.
    Mate(i32),
}

impl Score {
    /// Evaluation from white's point of view, mates collapsed to
    /// ±[`MATE_SENTINEL`].
    pub fn normalized(self, side_to_move: Color) -> i32 {
        let raw = match self {
            Self::Centipawns(cp) => cp,
            Self::Mate(n) if n <= 0 => -MATE_SENTINEL,
            Self::Mate(_) => MATE_SENTINEL,
        };
        match side_to_move {
            Color::White => raw,
            Color::Black => raw.saturating_neg(),
        }
    }
}

/// Parsed `info` line. Only the fields the adapter uses are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub multipv: Option<u32>,
    pub score: Option<Score>,
    pub pv: Vec<String>,
}

/// Coordinate move as emitted by the engine, e.g. `e7e8q`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMove {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<Promotion>,
}

impl EngineMove {
    pub fn parse(text: &str) -> Option<Self> {
        let caps = MOVE_RE.captures(text)?;
        Some(Self {
            from: caps[1].to_string(),
            to: caps[2].to_string(),
            promotion: caps
                .get(3)
                .and_then(|m| m.as_str().chars().next())
                .and_then(Promotion::from_char),
        })
    }
}

impl fmt::Display for EngineMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)?;
        if let Some(promotion) = self.promotion {
            write!(f, "{}", promotion.as_char())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMessage {
    ReadyOk,
    Info(InfoLine),
    /// Terminal answer to `go`. `best` is `None` for `(none)`/`0000` or an
    /// unparseable move, carried as `raw`.
    BestMove {
        best: Option<EngineMove>,
        raw: String,
        ponder: Option<String>,
    },
    Other(String),
}

impl EngineMessage {
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("readyok") => Self::ReadyOk,
            Some("info") => Self::Info(parse_info(tokens)),
            Some("bestmove") => {
                let raw = tokens.next().unwrap_or_default().to_string();
                let ponder = match tokens.next() {
                    Some("ponder") => tokens.next().map(str::to_string),
                    _ => None,
                };
                Self::BestMove {
                    best: EngineMove::parse(&raw),
                    raw,
                    ponder,
                }
            }
            _ => Self::Other(line.trim().to_string()),
        }
    }
}

fn parse_info<'a>(mut tokens: impl Iterator<Item = &'a str>) -> InfoLine {
    let mut info = InfoLine::default();
    while let Some(token) = tokens.next() {
        match token {
            "depth" => info.depth = tokens.next().and_then(|t| t.parse().ok()),
            "multipv" => info.multipv = tokens.next().and_then(|t| t.parse().ok()),
            "score" => {
                let unit = tokens.next();
                let value = tokens.next().and_then(|t| t.parse::<i32>().ok());
                info.score = match (unit, value) {
                    (Some("cp"), Some(v)) => Some(Score::Centipawns(v)),
                    (Some("mate"), Some(v)) => Some(Score::Mate(v)),
                    _ => info.score,
                };
            }
            // pv runs to the end of the line
            "pv" => {
                info.pv = tokens.by_ref().map(str::to_string).collect();
            }
            _ => {}
        }
    }
    info
}

// ── FEN shape check ──────────────────────────────────────────────────

/// What the adapter needs from a validated FEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenSummary {
    pub side_to_move: Color,
}

/// Check that `fen` is well formed. Legality of the position is not
/// checked, only its shape.
pub fn validate_fen(fen: &str) -> Result<FenSummary, String> {
    let fields: Vec<&str> = fen.split_whitespace().collect();
    if !(4..=6).contains(&fields.len()) {
        return Err(format!("expected 4 to 6 fields, found {}", fields.len()));
    }

    let ranks: Vec<&str> = fields[0].split('/').collect();
    if ranks.len() != 8 {
        return Err(format!("expected 8 ranks, found {}", ranks.len()));
    }
    for (i, rank) in ranks.iter().enumerate() {
        let mut files = 0u32;
        for c in rank.chars() {
            match c {
                '1'..='8' => files += c.to_digit(10).unwrap_or(0),
                'p' | 'n' | 'b' | 'r' | 'q' | 'k' | 'P' | 'N' | 'B' | 'R' | 'Q' | 'K' => {
                    files += 1
                }
                other => return Err(format!("invalid piece '{other}' in rank {}", 8 - i)),
            }
        }
        if files != 8 {
            return Err(format!("rank {} covers {files} files", 8 - i));
        }
    }

    let side_to_move = match fields[1] {
        "w" => Color::White,
        "b" => Color::Black,
        other => return Err(format!("invalid side to move '{other}'")),
    };

    let castling = fields[2];
    if castling != "-" {
        let mut seen = String::new();
        for c in castling.chars() {
            if !"KQkq".contains(c) || seen.contains(c) {
                return Err(format!("invalid castling field '{castling}'"));
            }
            seen.push(c);
        }
    }

    if !EN_PASSANT_RE.is_match(fields[3]) {
        return Err(format!("invalid en passant square '{}'", fields[3]));
    }

    for clock in fields.iter().skip(4) {
        if clock.parse::<u32>().is_err() {
            return Err(format!("invalid move clock '{clock}'"));
        }
    }

    Ok(FenSummary { side_to_move })
}

/// Whether `text` names a board square.
pub fn is_square(text: &str) -> bool {
    SQUARE_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[test]
    fn test_command_lines() {
        assert_eq!(EngineCommand::Init.to_string(), "init");
        assert_eq!(
            EngineCommand::Position(START.into()).to_string(),
            format!("position fen {START}")
        );
        assert_eq!(
            EngineCommand::Go(SearchBudget::Depth(12)).to_string(),
            "go depth 12"
        );
        assert_eq!(
            EngineCommand::Go(SearchBudget::MoveTime(1000)).to_string(),
            "go movetime 1000"
        );
    }

    #[test]
    fn test_parse_info_line() {
        let msg = EngineMessage::parse(
            "info depth 12 seldepth 18 multipv 2 score cp -31 nodes 1000 pv d7d5 e4d5 d8d5",
        );
        let EngineMessage::Info(info) = msg else {
            panic!("expected info, got {msg:?}");
        };
        assert_eq!(info.depth, Some(12));
        assert_eq!(info.multipv, Some(2));
        assert_eq!(info.score, Some(Score::Centipawns(-31)));
        assert_eq!(info.pv, vec!["d7d5", "e4d5", "d8d5"]);
    }

    #[test]
    fn test_parse_bestmove() {
        match EngineMessage::parse("bestmove e7e8q ponder a2a3") {
            EngineMessage::BestMove { best, ponder, .. } => {
                let best = best.unwrap();
                assert_eq!(best.from, "e7");
                assert_eq!(best.to, "e8");
                assert_eq!(best.promotion, Some(Promotion::Queen));
                assert_eq!(best.to_string(), "e7e8q");
                assert_eq!(ponder.as_deref(), Some("a2a3"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match EngineMessage::parse("bestmove (none)") {
            EngineMessage::BestMove { best, raw, .. } => {
                assert!(best.is_none());
                assert_eq!(raw, "(none)");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            EngineMessage::parse("bestmove 0000"),
            EngineMessage::BestMove { best: None, .. }
        ));
    }

    #[test]
    fn test_score_normalization() {
        assert_eq!(Score::Centipawns(25).normalized(Color::Black), -25);
        assert_eq!(Score::Centipawns(25).normalized(Color::White), 25);
        assert_eq!(Score::Mate(2).normalized(Color::White), MATE_SENTINEL);
        assert_eq!(Score::Mate(2).normalized(Color::Black), -MATE_SENTINEL);
        assert_eq!(Score::Mate(-3).normalized(Color::White), -MATE_SENTINEL);
    }

    #[test]
    fn test_mate_zero_means_side_to_move_is_mated() {
        assert_eq!(Score::Mate(0).normalized(Color::White), -MATE_SENTINEL);
        assert_eq!(Score::Mate(0).normalized(Color::Black), MATE_SENTINEL);
        assert_eq!(
            Score::Centipawns(i32::MIN).normalized(Color::Black),
            i32::MAX
        );
    }

    #[test]
    fn test_validate_fen_accepts_common_positions() {
        assert_eq!(validate_fen(START).unwrap().side_to_move, Color::White);
        let after_e4 = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";
        assert_eq!(validate_fen(after_e4).unwrap().side_to_move, Color::Black);
        assert!(validate_fen("8/8/8/8/8/8/8/K6k w - -").is_ok());
    }

    #[test]
    fn test_validate_fen_rejects_malformed() {
        let cases = [
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP w KQkq - 0 1",
            "rnbqkbnr/pppppppp/9/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "rnbqkbnr/ppppxppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR x KQkq - 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQxq - 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KKq - 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq e4 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - x 1",
            "not a fen",
        ];
        for fen in cases {
            assert!(validate_fen(fen).is_err(), "accepted {fen}");
        }
    }

    #[test]
    fn test_options_budget_and_merge() {
        let defaults = SearchOptions::default();
        assert_eq!(defaults.budget(), SearchBudget::MoveTime(1000));

        let deep = defaults.merged(&SearchOptionsPatch::depth(15).multi_pv(9));
        assert_eq!(deep.budget(), SearchBudget::Depth(15));
        assert_eq!(deep.time_limit_ms, Some(1000));
        assert_eq!(deep.effective_multi_pv(), 5);

        let timed = deep.merged(&SearchOptionsPatch::time_limit(250));
        assert_eq!(timed.budget(), SearchBudget::MoveTime(250));
        assert_eq!(timed.multi_pv, 9);
    }

    #[test]
    fn test_is_square() {
        assert!(is_square("e4"));
        assert!(!is_square("i9"));
        assert!(!is_square("e44"));
    }
}
