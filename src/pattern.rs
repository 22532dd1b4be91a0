// =============================================================================
// Double-Bottom Pattern Detector
// =============================================================================
//
// Scans the closed bar series for the classic Double Bottom:
//
//   1. Two pivot lows (symmetric 5-bar window) at least 10 bars apart.
//   2. The lows equal within max(2 pips, 0.15 * ATR14).
//   3. A higher intermediate high between them — the neckline.
//   4. A later bar that CLOSES strictly above the neckline — the breakout.
//
// The detector is a pure function of its inputs: identical bars produce the
// identical pattern, and a fresh candidate closer to the series end always
// supersedes a stale one. Patterns are immutable once emitted.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Bar, StructureState};

/// Bars on each side of a pivot that must carry higher lows (5-bar window).
const PIVOT_WING: usize = 2;

/// Minimum bars between the two pivot lows.
const MIN_LOW_SEPARATION: usize = 10;

/// ATR fraction used for the low-equality tolerance.
const EQUALITY_ATR_FACTOR: f64 = 0.15;

/// Pip floor for the low-equality tolerance.
const EQUALITY_MIN_PIPS: f64 = 2.0;

/// A confirmed Double Bottom. Indices refer to the closed bar slice handed
/// to [`detect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub left_low_index: usize,
    pub right_low_index: usize,
    pub neckline_price: f64,
    pub neckline_index: usize,
    /// First bar whose close exceeded the neckline.
    pub breakout_index: usize,
    /// Tolerance the low-equality check used, expressed in pips.
    pub equality_tolerance_pips: f64,
    /// Structural quality in [0, 10].
    pub quality_score: f64,
}

impl Pattern {
    /// Whether `index` is the bar that confirmed the breakout.
    pub fn breaks_out_at(&self, index: usize) -> bool {
        self.breakout_index == index
    }
}

/// Detect the most recent confirmed Double Bottom in `bars`.
///
/// Returns `None` when no candidate satisfies all four structural rules or
/// no later close has crossed the neckline yet. At most one pattern is
/// returned; among multiple candidates the one with the most recent right
/// low wins, and ties fall to the tightest low equality.
pub fn detect(bars: &[Bar], atr14: f64, pip_size: f64) -> Option<Pattern> {
    if bars.len() < 2 * PIVOT_WING + MIN_LOW_SEPARATION
        || !atr14.is_finite()
        || atr14 <= 0.0
        || !pip_size.is_finite()
        || pip_size <= 0.0
    {
        return None;
    }

    let pivots = pivot_lows(bars);
    if pivots.len() < 2 {
        return None;
    }

    let tolerance = (EQUALITY_MIN_PIPS * pip_size).max(EQUALITY_ATR_FACTOR * atr14);

    let mut best: Option<Pattern> = None;

    // Walk pairs newest-first so a fresh candidate supersedes a stale one.
    for (right_pos, &right) in pivots.iter().enumerate().rev() {
        for &left in pivots[..right_pos].iter().rev() {
            if right - left < MIN_LOW_SEPARATION {
                continue;
            }

            let low_diff = (bars[left].low - bars[right].low).abs();
            if low_diff > tolerance {
                continue;
            }

            // Neckline: highest intermediate high, strictly between the lows,
            // and genuinely higher than both pivot bars.
            let (neckline_index, neckline_price) = intermediate_high(bars, left, right)?;
            if neckline_price <= bars[left].high || neckline_price <= bars[right].high {
                continue;
            }

            // Breakout: first later bar that CLOSES above the neckline.
            let breakout_index = (right + 1..bars.len())
                .find(|&i| bars[i].close > neckline_price);
            let Some(breakout_index) = breakout_index else {
                continue;
            };

            let quality_score = quality(
                bars,
                left,
                right,
                neckline_index,
                neckline_price,
                breakout_index,
                low_diff,
                tolerance,
                atr14,
            );

            let candidate = Pattern {
                left_low_index: left,
                right_low_index: right,
                neckline_price,
                neckline_index,
                breakout_index,
                equality_tolerance_pips: tolerance / pip_size,
                quality_score,
            };

            let replace = match &best {
                None => true,
                Some(b) => {
                    candidate.right_low_index > b.right_low_index
                        || (candidate.right_low_index == b.right_low_index
                            && low_diff
                                < (bars[b.left_low_index].low - bars[b.right_low_index].low).abs())
                }
            };
            if replace {
                best = Some(candidate);
            }
        }
        // Everything with an older right low can only be stale now.
        if best.is_some() {
            break;
        }
    }

    if let Some(ref p) = best {
        debug!(
            left = p.left_low_index,
            right = p.right_low_index,
            neckline = format!("{:.2}", p.neckline_price),
            breakout = p.breakout_index,
            quality = format!("{:.2}", p.quality_score),
            "double bottom confirmed"
        );
    }

    best
}

/// Indices of pivot lows: bars whose low is strictly below the lows of the
/// two bars on each side.
pub fn pivot_lows(bars: &[Bar]) -> Vec<usize> {
    if bars.len() < 2 * PIVOT_WING + 1 {
        return Vec::new();
    }

    (PIVOT_WING..bars.len() - PIVOT_WING)
        .filter(|&i| {
            let low = bars[i].low;
            (1..=PIVOT_WING).all(|w| low < bars[i - w].low && low < bars[i + w].low)
        })
        .collect()
}

/// Lowest low over the final `lookback` bars. Used to anchor the post-TP2
/// trailing stop.
pub fn swing_low(bars: &[Bar], lookback: usize) -> Option<f64> {
    if bars.is_empty() || lookback == 0 {
        return None;
    }
    let start = bars.len().saturating_sub(lookback);
    bars[start..]
        .iter()
        .map(|b| b.low)
        .fold(None, |acc: Option<f64>, low| {
            Some(acc.map_or(low, |a| a.min(low)))
        })
        .filter(|v| v.is_finite())
}

/// Classify the recent swing structure from the last two pivot lows.
pub fn classify_structure(bars: &[Bar]) -> StructureState {
    let pivots = pivot_lows(bars);
    let n = pivots.len();
    if n < 2 {
        return StructureState::Unknown;
    }

    let prev = bars[pivots[n - 2]].low;
    let last = bars[pivots[n - 1]].low;

    if last > prev {
        StructureState::HigherLows
    } else if last < prev {
        StructureState::LowerLow
    } else {
        StructureState::Unknown
    }
}

/// Highest high strictly between the two pivot lows.
fn intermediate_high(bars: &[Bar], left: usize, right: usize) -> Option<(usize, f64)> {
    (left + 1..right)
        .map(|i| (i, bars[i].high))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

/// Structural quality score in [0, 10].
///
/// Weighted sum of four components:
///   equality tightness 3.0, neckline clearance 2.5,
///   drop depth 2.5, time symmetry 2.0.
#[allow(clippy::too_many_arguments)]
fn quality(
    bars: &[Bar],
    left: usize,
    right: usize,
    neckline_index: usize,
    neckline_price: f64,
    breakout_index: usize,
    low_diff: f64,
    tolerance: f64,
    atr14: f64,
) -> f64 {
    // Equality tightness: 1.0 for identical lows, 0.0 at the tolerance edge.
    let tightness = if tolerance > 0.0 {
        (1.0 - low_diff / tolerance).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Neckline clearance: how decisively the breakout closed above.
    let clearance =
        ((bars[breakout_index].close - neckline_price) / (0.5 * atr14)).clamp(0.0, 1.0);

    // Drop depth: valley depth below the neckline relative to volatility.
    let deepest = bars[left].low.min(bars[right].low);
    let depth = ((neckline_price - deepest) / (2.0 * atr14)).clamp(0.0, 1.0);

    // Time symmetry: neckline centred between the lows scores best.
    let total_span = (right - left) as f64;
    let left_span = (neckline_index - left) as f64;
    let right_span = (right - neckline_index) as f64;
    let symmetry = (1.0 - (left_span - right_span).abs() / total_span).clamp(0.0, 1.0);

    3.0 * tightness + 2.5 * clearance + 2.5 * depth + 2.0 * symmetry
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    const PIP: f64 = 0.1;

    fn bars_from_path(path: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        path.iter()
            .enumerate()
            .map(|(i, &mid)| Bar {
                open_time: start + Duration::hours(i as i64),
                open: mid - 0.5,
                high: mid + 1.5,
                low: mid - 1.5,
                close: mid + 0.5,
            })
            .collect()
    }

    /// A clean W-shape: descent, first low, rebound to the neckline area,
    /// second low at the same level, then a breakout above the neckline.
    fn double_bottom_path() -> Vec<f64> {
        let mut path = Vec::new();
        // Descent into the first low.
        for i in 0..6 {
            path.push(2020.0 - i as f64 * 4.0); // 2020 .. 2000
        }
        // First low region around 1998.
        path.extend_from_slice(&[1998.0, 1999.5, 2001.0]);
        // Rebound to the intermediate high (~2014) and back down.
        path.extend_from_slice(&[2006.0, 2010.0, 2014.0, 2012.0, 2008.0, 2004.0]);
        // Second low, equal to the first.
        path.extend_from_slice(&[2002.0, 1998.1, 1999.5, 2002.0]);
        // Breakout run above the neckline high (2014 + 1.5 = 2015.5).
        path.extend_from_slice(&[2008.0, 2012.0, 2018.0, 2021.0]);
        path
    }

    #[test]
    fn detects_clean_double_bottom() {
        let bars = bars_from_path(&double_bottom_path());
        let pattern = detect(&bars, 10.0, PIP).expect("pattern expected");

        assert!(pattern.right_low_index - pattern.left_low_index >= MIN_LOW_SEPARATION);
        assert!(pattern.neckline_index > pattern.left_low_index);
        assert!(pattern.neckline_index < pattern.right_low_index);
        assert!(pattern.breakout_index > pattern.right_low_index);
        assert!(bars[pattern.breakout_index].close > pattern.neckline_price);
        assert!(pattern.quality_score > 0.0);
        assert!(pattern.quality_score <= 10.0);
    }

    #[test]
    fn no_breakout_no_pattern() {
        let mut path = double_bottom_path();
        // Chop off the breakout: stay below the neckline forever.
        path.truncate(path.len() - 4);
        path.extend_from_slice(&[2006.0, 2007.0, 2006.5, 2007.5]);
        let bars = bars_from_path(&path);
        assert!(detect(&bars, 10.0, PIP).is_none());
    }

    #[test]
    fn unequal_lows_rejected() {
        let mut path = double_bottom_path();
        // Push the second low far below the equality tolerance.
        path[16] = 1988.0;
        let bars = bars_from_path(&path);
        assert!(detect(&bars, 10.0, PIP).is_none());
    }

    #[test]
    fn lows_too_close_rejected() {
        // Two pivot lows only 3 bars apart, then a clean breakout.
        let path = [
            2010.0, 2006.0, 2002.0, 1998.0, 2002.0, 2006.0, 1998.2, 2002.0, 2006.0, 2010.0,
            2014.0, 2018.0, 2022.0, 2026.0,
        ];
        let bars = bars_from_path(&path);
        assert!(detect(&bars, 10.0, PIP).is_none());
    }

    #[test]
    fn detection_is_idempotent() {
        let bars = bars_from_path(&double_bottom_path());
        let a = detect(&bars, 10.0, PIP);
        let b = detect(&bars, 10.0, PIP);
        assert_eq!(a, b);
    }

    #[test]
    fn newer_candidate_supersedes_stale_one() {
        let mut path = double_bottom_path();
        let first_len = path.len();
        // Append a second, later double bottom at a higher level.
        for i in 0..4 {
            path.push(2018.0 - i as f64 * 4.0);
        }
        path.extend_from_slice(&[2004.0, 2005.5, 2008.0]);
        path.extend_from_slice(&[2012.0, 2016.0, 2020.0, 2018.0, 2014.0, 2010.0]);
        path.extend_from_slice(&[2008.0, 2004.1, 2005.5, 2008.0]);
        path.extend_from_slice(&[2014.0, 2019.0, 2024.0, 2027.0]);

        let bars = bars_from_path(&path);
        let pattern = detect(&bars, 10.0, PIP).expect("pattern expected");
        assert!(
            pattern.right_low_index >= first_len,
            "stale candidate won: right low at {}",
            pattern.right_low_index
        );
    }

    #[test]
    fn invalid_atr_rejected() {
        let bars = bars_from_path(&double_bottom_path());
        assert!(detect(&bars, 0.0, PIP).is_none());
        assert!(detect(&bars, f64::NAN, PIP).is_none());
    }

    #[test]
    fn pivot_lows_symmetric_window() {
        // A single V: the minimum at index 3 is the only pivot.
        let path = [2010.0, 2006.0, 2002.0, 1998.0, 2002.0, 2006.0, 2010.0];
        let bars = bars_from_path(&path);
        assert_eq!(pivot_lows(&bars), vec![3]);
    }

    #[test]
    fn pivot_lows_short_input() {
        let bars = bars_from_path(&[2000.0, 1999.0, 2000.0]);
        assert!(pivot_lows(&bars).is_empty());
    }

    #[test]
    fn swing_low_over_lookback() {
        let bars = bars_from_path(&[2010.0, 2000.0, 2005.0, 2008.0]);
        // Lookback 3 skips the global minimum at index 1.
        let sl = swing_low(&bars, 3).unwrap();
        assert!((sl - (2005.0 - 1.5)).abs() < 1e-9);
        // Full lookback reaches it.
        let sl_all = swing_low(&bars, 10).unwrap();
        assert!((sl_all - (2000.0 - 1.5)).abs() < 1e-9);
    }

    #[test]
    fn structure_higher_lows() {
        let path = [
            2010.0, 2005.0, 2000.0, 2005.0, 2010.0, 2008.0, 2004.0, 2008.0, 2012.0,
        ];
        let bars = bars_from_path(&path);
        assert_eq!(classify_structure(&bars), StructureState::HigherLows);
    }

    #[test]
    fn structure_lower_low() {
        let path = [
            2010.0, 2006.0, 2002.0, 2006.0, 2010.0, 2004.0, 1998.0, 2004.0, 2010.0,
        ];
        let bars = bars_from_path(&path);
        assert_eq!(classify_structure(&bars), StructureState::LowerLow);
    }

    #[test]
    fn structure_unknown_without_two_pivots() {
        let bars = bars_from_path(&[2000.0, 2001.0, 2002.0, 2003.0, 2004.0]);
        assert_eq!(classify_structure(&bars), StructureState::Unknown);
    }
}
