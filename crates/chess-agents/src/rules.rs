//! Rules engine boundary
//!
//! Legality, board representation and notation are owned by an external
//! rules engine. This module only describes the interface the orchestrator
//! and AI player need from it, plus the small value types that cross it.

use serde::{Deserialize, Serialize};

/// Algebraic square name, e.g. `"e4"`.
pub type Square = String;

/// Side in a two-player game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opposite(self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }

    /// FEN side-to-move letter.
    pub fn from_fen_char(c: char) -> Option<Self> {
        match c {
            'w' => Some(Self::White),
            'b' => Some(Self::Black),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    pub color: Color,
    pub kind: PieceKind,
}

impl Piece {
    /// Parse a FEN piece letter (uppercase white, lowercase black).
    pub fn from_fen_char(c: char) -> Option<Self> {
        let color = if c.is_ascii_uppercase() {
            Color::White
        } else {
            Color::Black
        };
        let kind = match c.to_ascii_lowercase() {
            'p' => PieceKind::Pawn,
            'n' => PieceKind::Knight,
            'b' => PieceKind::Bishop,
            'r' => PieceKind::Rook,
            'q' => PieceKind::Queen,
            'k' => PieceKind::King,
            _ => return None,
        };
        Some(Self { color, kind })
    }

    pub fn to_fen_char(self) -> char {
        let c = match self.kind {
            PieceKind::Pawn => 'p',
            PieceKind::Knight => 'n',
            PieceKind::Bishop => 'b',
            PieceKind::Rook => 'r',
            PieceKind::Queen => 'q',
            PieceKind::King => 'k',
        };
        match self.color {
            Color::White => c.to_ascii_uppercase(),
            Color::Black => c,
        }
    }
}

/// Piece a pawn promotes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Promotion {
    Queen,
    Rook,
    Bishop,
    Knight,
}

impl Promotion {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'q' => Some(Self::Queen),
            'r' => Some(Self::Rook),
            'b' => Some(Self::Bishop),
            'n' => Some(Self::Knight),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Queen => 'q',
            Self::Rook => 'r',
            Self::Bishop => 'b',
            Self::Knight => 'n',
        }
    }

    pub fn kind(self) -> PieceKind {
        match self {
            Self::Queen => PieceKind::Queen,
            Self::Rook => PieceKind::Rook,
            Self::Bishop => PieceKind::Bishop,
            Self::Knight => PieceKind::Knight,
        }
    }
}

/// A move as applied by the rules engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub from: Square,
    pub to: Square,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<Promotion>,
    pub color: Color,
    pub piece: PieceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured: Option<PieceKind>,
    /// Notation the rules engine uses in its PGN.
    pub san: String,
}

/// Game status reported by the rules engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GameStatus {
    Active,
    Check,
    Checkmate { winner: Color },
    Stalemate,
    Draw { reason: String },
}

impl GameStatus {
    pub fn is_over(&self) -> bool {
        matches!(
            self,
            Self::Checkmate { .. } | Self::Stalemate | Self::Draw { .. }
        )
    }
}

/// Outcome of `RulesEngine::make_move`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveResult {
    pub is_valid: bool,
    #[serde(rename = "move", default, skip_serializing_if = "Option::is_none")]
    pub mv: Option<MoveRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: GameStatus,
}

impl MoveResult {
    pub fn valid(mv: MoveRecord, status: GameStatus) -> Self {
        Self {
            is_valid: true,
            mv: Some(mv),
            error: None,
            status,
        }
    }

    pub fn invalid(error: impl Into<String>, status: GameStatus) -> Self {
        Self {
            is_valid: false,
            mv: None,
            error: Some(error.into()),
            status,
        }
    }
}

/// Side to move according to a FEN string's second field.
pub fn fen_side_to_move(fen: &str) -> Option<Color> {
    fen.split_whitespace()
        .nth(1)
        .and_then(|field| field.chars().next())
        .and_then(Color::from_fen_char)
}

/// External rules engine.
///
/// Calls are synchronous; the orchestrator serializes access behind its own
/// lock and may hold a shared reference across an engine search, hence
/// `Sync`. `valid_moves(None)` lists the origin squares of every piece of the
/// side to move that has at least one legal move; `valid_moves(Some(sq))`
/// lists the legal destinations of the piece on `sq`.
#[cfg_attr(test, mockall::automock)]
pub trait RulesEngine: Send + Sync {
    fn make_move(&mut self, from: &str, to: &str, promotion: Option<Promotion>) -> MoveResult;

    fn valid_moves<'a>(&self, square: Option<&'a str>) -> Vec<Square>;

    fn fen(&self) -> String;

    fn pgn(&self) -> String;

    fn status(&self) -> GameStatus;

    /// Whether `color` (default: side to move) is in check.
    fn is_in_check(&self, color: Option<Color>) -> bool;

    /// Take back the last move. False when there is nothing to undo.
    fn undo(&mut self) -> bool;

    /// Half-moves applied so far.
    fn move_count(&self) -> usize;

    fn piece_at(&self, square: &str) -> Option<Piece>;

    fn turn(&self) -> Color {
        fen_side_to_move(&self.fen()).unwrap_or(Color::White)
    }
}
