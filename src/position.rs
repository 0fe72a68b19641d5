// src/position.rs
//! The chess-rules seam. The search core only talks to [`Position`];
//! [`ChessPosition`] implements it over the `chess` crate.

use crate::game::{InputPlanes, Mv};
use chess::{Board, BoardStatus, Color, MoveGen, Piece, ALL_SQUARES};
use std::str::FromStr;
use thiserror::Error;

pub const STARTING_POSITION: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),
}

/// Capability set the search core needs from a rules engine.
///
/// `Default` must produce the standard starting position.
pub trait Position: Clone + Default + Send {
    fn to_play(&self) -> Color;

    /// Game ply of the current position (0 at the standard starting position).
    fn ply(&self) -> i32;

    /// Fill `out` with all legal moves. An empty list signals a terminal
    /// position (checkmate or stalemate).
    fn generate_legal_moves(&self, out: &mut Vec<Mv>);

    fn is_in_check(&self) -> bool;

    fn apply_move(&mut self, mv: Mv);

    fn undo_move(&mut self);

    fn zobrist_key(&self) -> u64;

    fn generate_input_planes(&self, image: &mut InputPlanes);

    /// True iff the 50-move counter exceeds 99 halfmoves, or the position
    /// repeats once strictly inside the last `ply_to_search_root` plies, or
    /// repeats twice anywhere. Checkmate is never classified as a draw here.
    fn is_draw_by_rule_or_repetition(&self, ply_to_search_root: i32) -> bool;

    /// Reset to `fen` and play out `moves`. An illegal move drops it and the
    /// remainder of the list (logged), which is not an error at this seam.
    fn set_from(&mut self, fen: &str, moves: &[Mv]) -> Result<(), PositionError>;

    /// Parse UCI move text against the current position's legal moves.
    fn parse_move(&self, text: &str) -> Option<Mv>;
}

/// Stack-of-snapshots position over `chess::Board`.
///
/// The `chess` crate is copy-on-make with no halfmove clock, so apply/undo
/// keeps parallel stacks of boards, Zobrist keys and a tracked clock.
#[derive(Clone)]
pub struct ChessPosition {
    boards: Vec<Board>,
    keys: Vec<u64>,
    clocks: Vec<u32>,
    base_ply: i32,
}

impl Default for ChessPosition {
    fn default() -> Self {
        let board = Board::default();
        let key = board.get_hash();
        ChessPosition {
            boards: vec![board],
            keys: vec![key],
            clocks: vec![0],
            base_ply: 0,
        }
    }
}

impl ChessPosition {
    pub fn from_fen(fen: &str) -> Result<Self, PositionError> {
        let mut pos = ChessPosition::default();
        pos.set_from(fen, &[])?;
        Ok(pos)
    }

    #[inline]
    fn board(&self) -> &Board {
        self.boards.last().expect("position stack never empty")
    }

    pub fn halfmove_clock(&self) -> u32 {
        *self.clocks.last().expect("position stack never empty")
    }

    /// Distance in plies to the nearest earlier occurrence of the current
    /// position, if any, plus whether a second occurrence exists.
    fn find_repetition(&self) -> Option<(i32, bool)> {
        let current = *self.keys.last().unwrap();
        let window = (self.halfmove_clock() as usize).min(self.keys.len() - 1);
        let top = self.keys.len() - 1;

        let mut first: Option<i32> = None;
        let mut distance = 4;
        while distance <= window {
            if self.keys[top - distance] == current {
                match first {
                    None => first = Some(distance as i32),
                    Some(d) => return Some((d, true)),
                }
            }
            distance += 2;
        }
        first.map(|d| (d, false))
    }
}

impl Position for ChessPosition {
    fn to_play(&self) -> Color {
        self.board().side_to_move()
    }

    fn ply(&self) -> i32 {
        self.base_ply + (self.boards.len() as i32 - 1)
    }

    fn generate_legal_moves(&self, out: &mut Vec<Mv>) {
        out.clear();
        out.extend(MoveGen::new_legal(self.board()).map(Mv::from));
    }

    fn is_in_check(&self) -> bool {
        self.board().checkers().popcnt() > 0
    }

    fn apply_move(&mut self, mv: Mv) {
        let chess_mv = mv.to_chess_move();
        let board = self.board();

        let is_pawn_move = board.piece_on(chess_mv.get_source()) == Some(Piece::Pawn);
        let is_capture = board.piece_on(chess_mv.get_dest()).is_some();
        let clock = if is_pawn_move || is_capture {
            0
        } else {
            self.halfmove_clock() + 1
        };

        let next = board.make_move_new(chess_mv);
        self.keys.push(next.get_hash());
        self.boards.push(next);
        self.clocks.push(clock);
    }

    fn undo_move(&mut self) {
        debug_assert!(self.boards.len() > 1, "undo past the setup position");
        if self.boards.len() > 1 {
            self.boards.pop();
            self.keys.pop();
            self.clocks.pop();
        }
    }

    fn zobrist_key(&self) -> u64 {
        *self.keys.last().unwrap()
    }

    fn generate_input_planes(&self, image: &mut InputPlanes) {
        let board = self.board();
        for plane in image.iter_mut() {
            plane.fill(0.0);
        }

        for (idx, sq) in ALL_SQUARES.iter().enumerate() {
            if let Some(piece) = board.piece_on(*sq) {
                let color_offset = match board.color_on(*sq) {
                    Some(Color::White) => 0,
                    _ => 6,
                };
                image[color_offset + piece.to_index()][idx] = 1.0;
            }
        }

        let fill = |plane: &mut [f32; 64], value: f32| plane.fill(value);
        fill(
            &mut image[12],
            if board.side_to_move() == Color::White { 1.0 } else { 0.0 },
        );
        let white_rights = board.castle_rights(Color::White);
        let black_rights = board.castle_rights(Color::Black);
        fill(&mut image[13], white_rights.has_kingside() as i32 as f32);
        fill(&mut image[14], white_rights.has_queenside() as i32 as f32);
        fill(&mut image[15], black_rights.has_kingside() as i32 as f32);
        fill(&mut image[16], black_rights.has_queenside() as i32 as f32);
        fill(&mut image[17], self.halfmove_clock() as f32 / 100.0);
        fill(
            &mut image[18],
            if self.find_repetition().is_some() { 1.0 } else { 0.0 },
        );
    }

    fn is_draw_by_rule_or_repetition(&self, ply_to_search_root: i32) -> bool {
        if self.halfmove_clock() > 99 {
            return true;
        }
        match self.find_repetition() {
            Some((_, true)) => true,
            Some((distance, false)) => distance < ply_to_search_root,
            None => false,
        }
    }

    fn set_from(&mut self, fen: &str, moves: &[Mv]) -> Result<(), PositionError> {
        let board =
            Board::from_str(fen).map_err(|_| PositionError::InvalidFen(fen.to_string()))?;

        // `chess::Board` drops the clock and fullmove fields; recover them
        // from the FEN text so ply-based decisions stay correct.
        let fields: Vec<&str> = fen.split_whitespace().collect();
        let clock = fields
            .get(4)
            .and_then(|f| f.parse::<u32>().ok())
            .unwrap_or(0);
        let fullmove = fields
            .get(5)
            .and_then(|f| f.parse::<i32>().ok())
            .unwrap_or(1)
            .max(1);
        self.base_ply =
            (fullmove - 1) * 2 + if board.side_to_move() == Color::Black { 1 } else { 0 };

        self.keys.clear();
        self.boards.clear();
        self.clocks.clear();
        self.keys.push(board.get_hash());
        self.boards.push(board);
        self.clocks.push(clock);

        for (i, mv) in moves.iter().enumerate() {
            if !self.board().legal(mv.to_chess_move()) {
                log::warn!(
                    "illegal move {} at index {} while setting position; dropping the rest",
                    mv,
                    i
                );
                break;
            }
            self.apply_move(*mv);
        }
        Ok(())
    }

    fn parse_move(&self, text: &str) -> Option<Mv> {
        let mv = Mv::parse_uci(text)?;
        if self.board().legal(mv.to_chess_move()) {
            Some(mv)
        } else {
            None
        }
    }
}

impl ChessPosition {
    pub fn is_checkmate(&self) -> bool {
        self.board().status() == BoardStatus::Checkmate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::zeroed_input_planes;

    fn moves(list: &[&str]) -> Vec<Mv> {
        list.iter().map(|m| Mv::parse_uci(m).unwrap()).collect()
    }

    #[test]
    fn apply_undo_restores_zobrist() {
        let mut pos = ChessPosition::default();
        let start_key = pos.zobrist_key();
        for mv in moves(&["e2e4", "e7e5", "g1f3"]) {
            pos.apply_move(mv);
        }
        assert_ne!(pos.zobrist_key(), start_key);
        pos.undo_move();
        pos.undo_move();
        pos.undo_move();
        assert_eq!(pos.zobrist_key(), start_key);
        assert_eq!(pos.ply(), 0);
    }

    #[test]
    fn halfmove_clock_resets_on_pawn_and_capture() {
        let mut pos = ChessPosition::default();
        pos.apply_move(Mv::parse_uci("g1f3").unwrap());
        assert_eq!(pos.halfmove_clock(), 1);
        pos.apply_move(Mv::parse_uci("d7d5").unwrap());
        assert_eq!(pos.halfmove_clock(), 0);
        pos.apply_move(Mv::parse_uci("b1c3").unwrap());
        pos.apply_move(Mv::parse_uci("d5d4").unwrap());
        pos.apply_move(Mv::parse_uci("c3e4").unwrap());
        assert_eq!(pos.halfmove_clock(), 1);
    }

    #[test]
    fn repetition_depends_on_search_root() {
        // e2e4 d7d6 d1g4 g8f6 g4d1 f6g8 d1g4: the final position first
        // occurred four plies earlier (after move 3).
        let line = moves(&["e2e4", "d7d6", "d1g4", "g8f6", "g4d1", "f6g8", "d1g4"]);

        let mut pos = ChessPosition::default();
        for mv in &line {
            pos.apply_move(*mv);
        }
        // Search root at the starting position: repetition is inside the search.
        assert!(pos.is_draw_by_rule_or_repetition(7));
        // Search root after six moves: the earlier occurrence predates it.
        assert!(!pos.is_draw_by_rule_or_repetition(1));
    }

    #[test]
    fn second_repetition_draws_anywhere() {
        let shuffle = ["b1c3", "b8c6", "c3b1", "c6b8"];
        let mut pos = ChessPosition::default();
        for mv in moves(&shuffle) {
            pos.apply_move(mv);
        }
        // One occurrence before the root only: no claim with a tight root.
        assert!(!pos.is_draw_by_rule_or_repetition(1));
        for mv in moves(&shuffle) {
            pos.apply_move(mv);
        }
        // Position has now occurred three times: draw regardless of the root.
        assert!(pos.is_draw_by_rule_or_repetition(1));
    }

    #[test]
    fn set_from_drops_illegal_tail() {
        let mut pos = ChessPosition::default();
        let list = moves(&["e2e4", "e7e5", "e4e5", "g8f6"]);
        pos.set_from(STARTING_POSITION, &list).unwrap();
        // e4e5 is illegal (blocked); it and g8f6 are dropped.
        assert_eq!(pos.ply(), 2);
    }

    #[test]
    fn fen_ply_and_clock_recovered() {
        let pos =
            ChessPosition::from_fen("8/8/8/4k3/8/4K3/8/7R w - - 12 47").unwrap();
        assert_eq!(pos.halfmove_clock(), 12);
        assert_eq!(pos.ply(), 92);
    }

    #[test]
    fn input_planes_mark_side_to_move() {
        let mut image = zeroed_input_planes();
        let mut pos = ChessPosition::default();
        pos.generate_input_planes(&mut image);
        assert_eq!(image[12][0], 1.0);
        pos.apply_move(Mv::parse_uci("e2e4").unwrap());
        pos.generate_input_planes(&mut image);
        assert_eq!(image[12][0], 0.0);
        // Pawn plane: e4 occupied, e2 empty now.
        assert_eq!(image[Piece::Pawn.to_index()][28], 1.0);
        assert_eq!(image[Piece::Pawn.to_index()][12], 0.0);
    }
}
