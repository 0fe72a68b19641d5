// src/search/time.rs
//! UCI time control: what `go` asked for, and how much clock a search may
//! burn. The actual stop decision lives with the worker, which checks these
//! budgets between batched predictions.

use crate::config::MiscConfig;
use chess::Color;

#[derive(Clone, Copy, Debug, Default)]
pub struct TimeControl {
    pub infinite: bool,
    /// Fixed think time (`go movetime N`); 0 when unset.
    pub move_time_ms: i64,
    /// Remaining clock per color (`wtime`/`btime`); 0 when unset.
    pub time_remaining_ms: [i64; 2],
    /// Increment per color (`winc`/`binc`).
    pub increment_ms: [i64; 2],
    /// Simulation cap (`go nodes N`); 0 when unset.
    pub node_budget: i64,
}

#[inline]
pub fn color_index(color: Color) -> usize {
    match color {
        Color::White => 0,
        Color::Black => 1,
    }
}

/// Clock-based allowance: a fraction of remaining time plus the increment,
/// minus a safety buffer for transport overhead. `None` when the result is
/// non-positive (no usable clock info), in which case the caller falls back
/// to a plain simulation budget.
pub fn allowed_clock_time_ms(
    time_control: &TimeControl,
    to_play: Color,
    misc: &MiscConfig,
) -> Option<i64> {
    let side = color_index(to_play);
    let allowed = time_control.time_remaining_ms[side] / misc.time_control_fraction_of_remaining
        + time_control.increment_ms[side]
        - misc.time_control_safety_buffer_ms;
    (allowed > 0).then_some(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn misc() -> MiscConfig {
        MiscConfig {
            time_control_safety_buffer_ms: 100,
            time_control_fraction_of_remaining: 20,
            ..MiscConfig::default()
        }
    }

    #[test]
    fn clock_allowance_uses_fraction_and_increment() {
        let tc = TimeControl {
            time_remaining_ms: [60_000, 30_000],
            increment_ms: [1_000, 0],
            ..TimeControl::default()
        };
        // 60000/20 + 1000 - 100
        assert_eq!(allowed_clock_time_ms(&tc, Color::White, &misc()), Some(3_900));
        // 30000/20 + 0 - 100
        assert_eq!(allowed_clock_time_ms(&tc, Color::Black, &misc()), Some(1_400));
    }

    #[test]
    fn no_clock_means_no_allowance() {
        let tc = TimeControl::default();
        assert_eq!(allowed_clock_time_ms(&tc, Color::White, &misc()), None);
    }
}
