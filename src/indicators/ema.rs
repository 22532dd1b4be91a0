// =============================================================================
// Exponential moving average
// =============================================================================
//
// Smoothing uses alpha = 2 / (period + 1), written in incremental form:
//
//   level_{t} = level_{t-1} + alpha * (close_t - level_{t-1})
//
// The recursion is seeded with the very first close (the `adjust=false`
// convention charting platforms use), so the output covers every input bar
// and nothing looks ahead.
// =============================================================================

/// Full EMA series over `closes`, one value per input element.
///
/// A non-finite close poisons the recursion from that point on, so the
/// series is cut short there instead of carrying garbage; callers that need
/// the final value go through [`latest_ema`], which checks coverage.
/// Degenerate requests (empty input, `period` of zero, fewer closes than
/// the period) yield an empty series.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = closes.first() else {
        return Vec::new();
    };
    if period < 1 || closes.len() < period || !first.is_finite() {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut level = first;
    let mut series = Vec::with_capacity(closes.len());
    series.push(level);

    for &close in closes.iter().skip(1) {
        level += alpha * (close - level);
        if !level.is_finite() {
            // Truncated on purpose; the short length flags the break.
            break;
        }
        series.push(level);
    }

    series
}

/// EMA at the most recent close.
///
/// `None` when the series could not be computed or broke off early on a
/// non-finite input, so a poisoned tail can never reach a decision.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    let series = ema_series(closes, period);
    if series.len() != closes.len() {
        return None;
    }
    series.last().copied()
}
