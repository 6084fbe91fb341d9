//! Test doubles for the two external collaborators
//!
//! [`FakeRules`] is a small pseudo-legal board: pieces move the way they
//! move, but check, castling and en passant are not modelled. It is enough to
//! drive the orchestrator through realistic sequences.
//!
//! [`ScriptedEngine`] answers the engine line protocol over a
//! [`ChannelTransport`] from a queue of [`SearchReply`] entries and records
//! every command it receives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::engine::protocol::validate_fen;
use crate::engine::{ChannelTransport, EngineAdapter, EngineEndpoint};
use crate::rules::{
    Color, GameStatus, MoveRecord, MoveResult, Piece, PieceKind, Promotion, RulesEngine, Square,
};

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

// ── Rules ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Position {
    board: [Option<Piece>; 64],
    turn: Color,
    castling: String,
    halfmove: u32,
    fullmove: u32,
}

/// Pseudo-legal in-memory rules engine.
#[derive(Debug, Clone)]
pub struct FakeRules {
    position: Position,
    history: Vec<(MoveRecord, Position)>,
    status: GameStatus,
    in_check: bool,
}

impl Default for FakeRules {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRules {
    /// Standard starting position.
    pub fn new() -> Self {
        match Self::from_fen(START_FEN) {
            Ok(rules) => rules,
            Err(err) => unreachable!("start position is well formed: {err}"),
        }
    }

    pub fn from_fen(fen: &str) -> Result<Self, String> {
        let summary = validate_fen(fen)?;
        let fields: Vec<&str> = fen.split_whitespace().collect();

        let mut board = [None; 64];
        for (i, rank) in fields[0].split('/').enumerate() {
            let rank_index = 7 - i;
            let mut file = 0usize;
            for c in rank.chars() {
                if let Some(skip) = c.to_digit(10) {
                    file += skip as usize;
                } else {
                    board[rank_index * 8 + file] = Piece::from_fen_char(c);
                    file += 1;
                }
            }
        }

        Ok(Self {
            position: Position {
                board,
                turn: summary.side_to_move,
                castling: fields[2].to_string(),
                halfmove: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
                fullmove: fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(1),
            },
            history: Vec::new(),
            status: GameStatus::Active,
            in_check: false,
        })
    }

    /// Override the reported status.
    pub fn set_status(&mut self, status: GameStatus) {
        self.status = status;
    }

    pub fn set_in_check(&mut self, in_check: bool) {
        self.in_check = in_check;
    }

    fn at(&self, index: usize) -> Option<Piece> {
        self.position.board[index]
    }

    fn destinations(&self, from: usize) -> Vec<usize> {
        let Some(piece) = self.at(from) else {
            return Vec::new();
        };
        let (file, rank) = ((from % 8) as i32, (from / 8) as i32);
        let mut out = Vec::new();

        let target = |f: i32, r: i32| -> Option<usize> {
            ((0..8).contains(&f) && (0..8).contains(&r)).then(|| (r * 8 + f) as usize)
        };
        let enemy_or_empty =
            |idx: usize| self.at(idx).map_or(true, |other| other.color != piece.color);

        match piece.kind {
            PieceKind::Pawn => {
                let dir = if piece.color == Color::White { 1 } else { -1 };
                let start = if piece.color == Color::White { 1 } else { 6 };
                if let Some(one) = target(file, rank + dir) {
                    if self.at(one).is_none() {
                        out.push(one);
                        if rank == start {
                            if let Some(two) = target(file, rank + 2 * dir) {
                                if self.at(two).is_none() {
                                    out.push(two);
                                }
                            }
                        }
                    }
                }
                for df in [-1, 1] {
                    if let Some(diag) = target(file + df, rank + dir) {
                        if self.at(diag).is_some_and(|other| other.color != piece.color) {
                            out.push(diag);
                        }
                    }
                }
            }
            PieceKind::Knight | PieceKind::King => {
                let steps: &[(i32, i32)] = if piece.kind == PieceKind::Knight {
                    &[(1, 2), (2, 1), (2, -1), (1, -2), (-1, -2), (-2, -1), (-2, 1), (-1, 2)]
                } else {
                    &[(1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1), (0, -1), (1, -1)]
                };
                for (df, dr) in steps {
                    if let Some(idx) = target(file + df, rank + dr) {
                        if enemy_or_empty(idx) {
                            out.push(idx);
                        }
                    }
                }
            }
            PieceKind::Bishop | PieceKind::Rook | PieceKind::Queen => {
                let diagonal = [(1, 1), (1, -1), (-1, 1), (-1, -1)];
                let straight = [(1, 0), (-1, 0), (0, 1), (0, -1)];
                let rays: Vec<(i32, i32)> = match piece.kind {
                    PieceKind::Bishop => diagonal.to_vec(),
                    PieceKind::Rook => straight.to_vec(),
                    _ => diagonal.iter().chain(straight.iter()).copied().collect(),
                };
                for (df, dr) in rays {
                    let (mut f, mut r) = (file + df, rank + dr);
                    while let Some(idx) = target(f, r) {
                        match self.at(idx) {
                            None => out.push(idx),
                            Some(other) => {
                                if other.color != piece.color {
                                    out.push(idx);
                                }
                                break;
                            }
                        }
                        f += df;
                        r += dr;
                    }
                }
            }
        }
        out
    }
}

fn square_index(square: &str) -> Option<usize> {
    let mut chars = square.chars();
    let file = chars.next()?;
    let rank = chars.next()?;
    if chars.next().is_some() || !('a'..='h').contains(&file) || !('1'..='8').contains(&rank) {
        return None;
    }
    Some((rank as usize - '1' as usize) * 8 + (file as usize - 'a' as usize))
}

fn square_name(index: usize) -> Square {
    let file = (b'a' + (index % 8) as u8) as char;
    let rank = (b'1' + (index / 8) as u8) as char;
    format!("{file}{rank}")
}

impl RulesEngine for FakeRules {
    fn make_move(&mut self, from: &str, to: &str, promotion: Option<Promotion>) -> MoveResult {
        let status = self.status.clone();
        if status.is_over() {
            return MoveResult::invalid("Game is over", status);
        }
        let (Some(from_idx), Some(to_idx)) = (square_index(from), square_index(to)) else {
            return MoveResult::invalid(format!("Invalid square in {from}{to}"), status);
        };
        let Some(piece) = self.at(from_idx) else {
            return MoveResult::invalid(format!("No piece on {from}"), status);
        };
        if piece.color != self.position.turn {
            return MoveResult::invalid(format!("Not {}'s turn", piece.color), status);
        }
        if !self.destinations(from_idx).contains(&to_idx) {
            return MoveResult::invalid(format!("Illegal move {from}{to}"), status);
        }

        let before = self.position.clone();
        let captured = self.at(to_idx).map(|p| p.kind);
        let last_rank = if piece.color == Color::White { 7 } else { 0 };
        let promotion = (piece.kind == PieceKind::Pawn && to_idx / 8 == last_rank)
            .then(|| promotion.unwrap_or(Promotion::Queen));
        let placed = match promotion {
            Some(p) => Piece {
                color: piece.color,
                kind: p.kind(),
            },
            None => piece,
        };

        let position = &mut self.position;
        position.board[from_idx] = None;
        position.board[to_idx] = Some(placed);
        position.halfmove = if piece.kind == PieceKind::Pawn || captured.is_some() {
            0
        } else {
            position.halfmove + 1
        };
        if piece.color == Color::Black {
            position.fullmove += 1;
        }
        position.turn = piece.color.opposite();

        let mut san = format!("{from}{to}");
        if let Some(p) = promotion {
            san.push(p.as_char());
        }
        let record = MoveRecord {
            from: from.to_string(),
            to: to.to_string(),
            promotion,
            color: piece.color,
            piece: piece.kind,
            captured,
            san,
        };
        self.history.push((record.clone(), before));
        MoveResult::valid(record, self.status.clone())
    }

    fn valid_moves(&self, square: Option<&str>) -> Vec<Square> {
        match square {
            Some(square) => square_index(square)
                .filter(|&idx| self.at(idx).is_some_and(|p| p.color == self.position.turn))
                .map(|idx| self.destinations(idx).into_iter().map(square_name).collect())
                .unwrap_or_default(),
            None => (0..64)
                .filter(|&idx| self.at(idx).is_some_and(|p| p.color == self.position.turn))
                .filter(|&idx| !self.destinations(idx).is_empty())
                .map(square_name)
                .collect(),
        }
    }

    fn fen(&self) -> String {
        let position = &self.position;
        let mut placement = String::new();
        for rank in (0..8).rev() {
            let mut empty = 0;
            for file in 0..8 {
                match position.board[rank * 8 + file] {
                    Some(piece) => {
                        if empty > 0 {
                            placement.push_str(&empty.to_string());
                            empty = 0;
                        }
                        placement.push(piece.to_fen_char());
                    }
                    None => empty += 1,
                }
            }
            if empty > 0 {
                placement.push_str(&empty.to_string());
            }
            if rank > 0 {
                placement.push('/');
            }
        }
        let side = if position.turn == Color::White { 'w' } else { 'b' };
        format!(
            "{placement} {side} {} - {} {}",
            position.castling, position.halfmove, position.fullmove
        )
    }

    fn pgn(&self) -> String {
        let mut parts = Vec::new();
        for (i, (record, before)) in self.history.iter().enumerate() {
            if record.color == Color::White {
                parts.push(format!("{}. {}", before.fullmove, record.san));
            } else if i == 0 {
                parts.push(format!("{}... {}", before.fullmove, record.san));
            } else {
                parts.push(record.san.clone());
            }
        }
        parts.join(" ")
    }

    fn status(&self) -> GameStatus {
        self.status.clone()
    }

    fn is_in_check(&self, _color: Option<Color>) -> bool {
        self.in_check
    }

    fn undo(&mut self) -> bool {
        match self.history.pop() {
            Some((_, before)) => {
                self.position = before;
                true
            }
            None => false,
        }
    }

    fn move_count(&self) -> usize {
        self.history.len()
    }

    fn piece_at(&self, square: &str) -> Option<Piece> {
        square_index(square).and_then(|idx| self.at(idx))
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// How the scripted engine answers one `go`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchReply {
    /// Send these lines verbatim.
    Lines(Vec<String>),
    /// Say nothing until `stop`.
    Hang,
    /// Answer `bestmove (none)`.
    NoMove,
    /// Close the connection.
    Crash,
}

impl SearchReply {
    /// One info line and the matching `bestmove`.
    pub fn best(mv: &str) -> Self {
        Self::Lines(vec![
            format!("info depth 1 multipv 1 score cp 10 pv {mv}"),
            format!("bestmove {mv}"),
        ])
    }
}

/// In-memory engine driven by a queue of replies. Once the queue is empty
/// every search hangs.
pub struct ScriptedEngine {
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl ScriptedEngine {
    /// Serve `endpoint` on a new task.
    pub fn spawn(endpoint: EngineEndpoint, replies: impl IntoIterator<Item = SearchReply>) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(
            endpoint,
            replies.into_iter().collect(),
            Arc::clone(&received),
        ));
        Self { received, task }
    }

    /// Adapter with default config wired to a scripted engine.
    pub fn adapter(replies: impl IntoIterator<Item = SearchReply>) -> (Arc<EngineAdapter>, Self) {
        Self::adapter_with(EngineConfig::default(), replies)
    }

    pub fn adapter_with(
        config: EngineConfig,
        replies: impl IntoIterator<Item = SearchReply>,
    ) -> (Arc<EngineAdapter>, Self) {
        let (transport, endpoint) = ChannelTransport::pair();
        let engine = Self::spawn(endpoint, replies);
        (Arc::new(EngineAdapter::new(config, transport)), engine)
    }

    /// Adapter whose engine side is returned raw, for tests that never
    /// start the worker or want to script lines by hand.
    pub fn unstarted_adapter() -> (Arc<EngineAdapter>, EngineEndpoint) {
        let (transport, endpoint) = ChannelTransport::pair();
        (
            Arc::new(EngineAdapter::new(EngineConfig::default(), transport)),
            endpoint,
        )
    }

    /// Commands received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.received()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut endpoint: EngineEndpoint,
    mut replies: VecDeque<SearchReply>,
    received: Arc<Mutex<Vec<String>>>,
) {
    let mut searching = false;
    while let Some(command) = endpoint.commands.recv().await {
        received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());

        let verb = command.split_whitespace().next().unwrap_or_default();
        match verb {
            "init" => {
                endpoint.reply("readyok");
            }
            "go" => match replies.pop_front().unwrap_or(SearchReply::Hang) {
                SearchReply::Lines(lines) => {
                    for line in lines {
                        endpoint.reply(line);
                    }
                }
                SearchReply::Hang => searching = true,
                SearchReply::NoMove => {
                    endpoint.reply("bestmove (none)");
                }
                SearchReply::Crash => return,
            },
            "stop" => {
                if searching {
                    searching = false;
                    endpoint.reply("bestmove 0000");
                }
            }
            "quit" => return,
            _ => {}
        }
    }
}
