// =============================================================================
// Momentum Classifier — short-horizon read over the last closed bars
// =============================================================================
//
// Classifies near-term momentum into STRONG / MODERATE / BROKEN / UNKNOWN
// for the post-TP exit engines. The read is ATR-scaled so the same rules
// work in quiet and volatile tape:
//
//   STRONG   — net gain over the last three closes >= 0.6 * ATR and the
//              latest bar is a bull bar
//   BROKEN   — net loss over the last three closes >= 0.5 * ATR, or two
//              consecutive bear bodies summing to >= 0.4 * ATR
//   MODERATE — everything in between
//   UNKNOWN  — not enough bars or degenerate ATR
// =============================================================================

use tracing::trace;

use crate::types::{Bar, Momentum};

/// Net three-close gain required for STRONG, as an ATR multiple.
const STRONG_NET_ATR: f64 = 0.6;
/// Net three-close loss that flags BROKEN, as an ATR multiple.
const BROKEN_NET_ATR: f64 = 0.5;
/// Combined size of two consecutive bear bodies that flags BROKEN.
const BROKEN_BODIES_ATR: f64 = 0.4;

/// Minimum closed bars before any classification is attempted.
const MIN_BARS: usize = 3;

/// Classify momentum from the tail of the closed bar series.
pub fn classify(bars: &[Bar], atr14: f64) -> Momentum {
    if bars.len() < MIN_BARS || !atr14.is_finite() || atr14 <= 0.0 {
        return Momentum::Unknown;
    }

    let n = bars.len();
    let last = &bars[n - 1];
    let prev = &bars[n - 2];
    let net = last.close - bars[n - MIN_BARS].close;

    if !net.is_finite() {
        return Momentum::Unknown;
    }

    let verdict = if net <= -BROKEN_NET_ATR * atr14 {
        Momentum::Broken
    } else if last.body() < 0.0
        && prev.body() < 0.0
        && (last.body() + prev.body()).abs() >= BROKEN_BODIES_ATR * atr14
    {
        Momentum::Broken
    } else if net >= STRONG_NET_ATR * atr14 && last.body() > 0.0 {
        Momentum::Strong
    } else {
        Momentum::Moderate
    };

    trace!(
        net = format!("{:.3}", net),
        atr = format!("{:.3}", atr14),
        momentum = %verdict,
        "momentum classified"
    );

    verdict
}
