// src/game.rs
//! Shared game-level vocabulary: the 16-bit move handle, value constants,
//! the move/policy codec and the network plane shapes.

use chess::{ChessMove, Piece, Square, ALL_SQUARES};
use std::fmt;

/// Win/draw/loss values on the [0, 1] probability scale.
pub const VALUE_WIN: f32 = 1.0;
pub const VALUE_DRAW: f32 = 0.5;
pub const VALUE_LOSS: f32 = 0.0;

/// Number of input planes fed to the network (12 piece planes plus
/// side-to-move, castling rights, halfmove-clock and repetition planes).
pub const INPUT_PLANE_COUNT: usize = 25;

/// Number of policy output planes. Tokens live in `[0, 68 * 64)`:
/// the flat from*64+to block, then the promotion block starting at 4096.
pub const POLICY_PLANE_COUNT: usize = 68;

/// Opaque fixed-size input tensor for one position.
pub type InputPlanes = [[f32; 64]; INPUT_PLANE_COUNT];

/// Policy logits for one position, addressed through [`MoveCodec`].
pub type OutputPlanes = [[f32; 64]; POLICY_PLANE_COUNT];

pub fn zeroed_input_planes() -> InputPlanes {
    [[0.0; 64]; INPUT_PLANE_COUNT]
}

pub fn zeroed_output_planes() -> OutputPlanes {
    [[0.0; 64]; POLICY_PLANE_COUNT]
}

/// Flip a [0, 1] value to the other player's perspective.
#[inline]
pub fn flip_value(value: f32) -> f32 {
    1.0 - value
}

/// Map a tanh-scaled network value in (-1, 1) onto [0, 1].
#[inline]
pub fn map_tanh_value(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Probability -> centipawn mapping for UCI `score cp` output.
/// Leela-style tangent curve, clamped to a sane reporting range.
pub fn probability_to_centipawns(probability01: f32) -> i32 {
    let q = (2.0 * probability01 - 1.0).clamp(-0.9999, 0.9999);
    let cp = 111.7 * (1.562_068_8 * q).tan();
    cp.clamp(-12_800.0, 12_800.0) as i32
}

// Packed move layout, same scheme as a transposition-table move word:
// [promo:3][to:6][from:6]
const MV_SQ_MASK: u16 = 0x3F;

/// Opaque 16-bit move handle. `Mv::NONE` (all zero) is reserved; it cannot
/// collide with a real move because a1->a1 is never legal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Mv(pub u16);

impl Mv {
    pub const NONE: Mv = Mv(0);

    pub fn new(from: Square, to: Square, promotion: Option<Piece>) -> Mv {
        let promo = match promotion {
            Some(Piece::Knight) => 1u16,
            Some(Piece::Bishop) => 2,
            Some(Piece::Rook) => 3,
            Some(Piece::Queen) => 4,
            _ => 0,
        };
        Mv((promo << 12) | ((to.to_index() as u16) << 6) | from.to_index() as u16)
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == Mv::NONE
    }

    #[inline]
    pub fn from_square(self) -> Square {
        ALL_SQUARES[(self.0 & MV_SQ_MASK) as usize]
    }

    #[inline]
    pub fn to_square(self) -> Square {
        ALL_SQUARES[((self.0 >> 6) & MV_SQ_MASK) as usize]
    }

    pub fn promotion(self) -> Option<Piece> {
        match (self.0 >> 12) & 0x7 {
            1 => Some(Piece::Knight),
            2 => Some(Piece::Bishop),
            3 => Some(Piece::Rook),
            4 => Some(Piece::Queen),
            _ => None,
        }
    }

    pub fn to_chess_move(self) -> ChessMove {
        ChessMove::new(self.from_square(), self.to_square(), self.promotion())
    }

    /// Parse long-algebraic UCI text ("e2e4", "e7e8q"). Purely syntactic;
    /// legality is the position's concern.
    pub fn parse_uci(text: &str) -> Option<Mv> {
        let bytes = text.as_bytes();
        if bytes.len() < 4 || bytes.len() > 5 {
            return None;
        }
        let sq = |file: u8, rank: u8| -> Option<Square> {
            if !(b'a'..=b'h').contains(&file) || !(b'1'..=b'8').contains(&rank) {
                return None;
            }
            Some(ALL_SQUARES[((rank - b'1') as usize) * 8 + (file - b'a') as usize])
        };
        let from = sq(bytes[0], bytes[1])?;
        let to = sq(bytes[2], bytes[3])?;
        let promotion = if bytes.len() == 5 {
            match bytes[4] {
                b'n' => Some(Piece::Knight),
                b'b' => Some(Piece::Bishop),
                b'r' => Some(Piece::Rook),
                b'q' => Some(Piece::Queen),
                _ => return None,
            }
        } else {
            None
        };
        Some(Mv::new(from, to, promotion))
    }
}

impl From<ChessMove> for Mv {
    fn from(mv: ChessMove) -> Mv {
        Mv::new(mv.get_source(), mv.get_dest(), mv.get_promotion())
    }
}

impl fmt::Display for Mv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "0000");
        }
        write!(f, "{}{}", self.from_square(), self.to_square())?;
        match self.promotion() {
            Some(Piece::Knight) => write!(f, "n"),
            Some(Piece::Bishop) => write!(f, "b"),
            Some(Piece::Rook) => write!(f, "r"),
            Some(Piece::Queen) => write!(f, "q"),
            _ => Ok(()),
        }
    }
}

/// Maps moves onto flat policy tokens: `from * 64 + to` for normal moves,
/// a promotion block at 4096 indexed by piece and destination square.
pub struct MoveCodec;

impl MoveCodec {
    pub fn move_to_token(mv: Mv) -> usize {
        let from = mv.from_square().to_index();
        let to = mv.to_square().to_index();
        match mv.promotion() {
            Some(piece) => {
                let piece_idx = match piece {
                    Piece::Knight => 0,
                    Piece::Bishop => 1,
                    Piece::Rook => 2,
                    Piece::Queen => 3,
                    _ => 0,
                };
                4096 + piece_idx * 64 + to
            }
            None => from * 64 + to,
        }
    }

    /// Read the raw logit for a move out of the policy planes.
    #[inline]
    pub fn policy_logit(policy: &OutputPlanes, mv: Mv) -> f32 {
        let token = Self::move_to_token(mv);
        policy[token / 64][token % 64]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn move_handle_round_trip() {
        for text in ["e2e4", "g8f6", "e1g1", "a7a8q", "h2h1n", "b7c8r"] {
            let mv = Mv::parse_uci(text).unwrap();
            assert_eq!(mv.to_string(), text);
            let chess_mv = ChessMove::from_str(text).unwrap();
            assert_eq!(Mv::from(chess_mv), mv);
            assert_eq!(mv.to_chess_move(), chess_mv);
        }
    }

    #[test]
    fn none_is_reserved() {
        assert!(Mv::NONE.is_none());
        assert_eq!(Mv::NONE.to_string(), "0000");
        assert!(!Mv::parse_uci("e2e4").unwrap().is_none());
    }

    #[test]
    fn tokens_stay_in_range() {
        let token_max = POLICY_PLANE_COUNT * 64;
        for text in ["a1h8", "e7e8q", "a2a1n", "h7h8r"] {
            let mv = Mv::parse_uci(text).unwrap();
            assert!(MoveCodec::move_to_token(mv) < token_max);
        }
    }

    #[test]
    fn centipawns_monotone() {
        assert_eq!(probability_to_centipawns(0.5), 0);
        assert!(probability_to_centipawns(0.9) > probability_to_centipawns(0.6));
        assert!(probability_to_centipawns(0.1) < 0);
    }
}
