// =============================================================================
// Average true range
// =============================================================================
//
// A bar's true range extends its high-low span across any gap against the
// previous close:
//
//   TR = max(high - low, |high - prev_close|, |low - prev_close|)
//
// The TR stream is then smoothed with the same EMA the rest of the engine
// uses (alpha = 2 / (period + 1), seeded by the first value), giving the
// volatility unit behind stop distances, retrace thresholds, and the
// pattern equality tolerance.
// =============================================================================

use crate::indicators::ema::ema_series;
use crate::types::Bar;

/// True range of `bar` against the close of the bar before it.
fn true_range(prev_close: f64, bar: &Bar) -> f64 {
    let span = bar.high - bar.low;
    span.max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// Most recent ATR over `bars` (oldest first).
///
/// Each bar after the first contributes one true-range value, and the
/// smoothing wants a full `period` of them, so at least `period + 1` bars
/// are required. `None` on degenerate periods, short input, or any
/// non-finite range in the stream.
pub fn latest_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() <= period {
        return None;
    }

    let ranges: Vec<f64> = bars
        .windows(2)
        .map(|pair| true_range(pair[0].close, &pair[1]))
        .collect();
    if ranges.iter().any(|r| !r.is_finite()) {
        return None;
    }

    let smoothed = ema_series(&ranges, period);
    if smoothed.len() != ranges.len() {
        return None;
    }
    smoothed.last().copied()
}
