// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the engine
// decides on: EMA50, EMA200, and ATR14 over the closed bar series.

pub mod atr;
pub mod ema;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::Bar;

/// EMA look-back for the fast trend line.
pub const EMA_FAST_PERIOD: usize = 50;
/// EMA look-back for the slow trend line.
pub const EMA_SLOW_PERIOD: usize = 200;
/// ATR look-back.
pub const ATR_PERIOD: usize = 14;

/// Minimum closed bars before the indicator values are trustworthy: the
/// slow EMA needs its full window plus settle-in room.
pub const MIN_BARS_FOR_INDICATORS: usize = 220;

/// The indicator values for one closed bar, consumed by the regime scorer
/// and the entry engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ema50: f64,
    pub ema200: f64,
    pub atr14: f64,
}

/// Compute EMA50 / EMA200 / ATR14 over the closed bar series.
///
/// Fails with `InsufficientHistory` below [`MIN_BARS_FOR_INDICATORS`] bars
/// and with `InvalidInputData` on any non-finite or incoherent bar. NaN is
/// rejected here rather than propagated into downstream decisions.
pub fn compute(closed_bars: &[Bar]) -> Result<IndicatorSnapshot> {
    if closed_bars.len() < MIN_BARS_FOR_INDICATORS {
        return Err(EngineError::InsufficientHistory {
            got: closed_bars.len(),
            required: MIN_BARS_FOR_INDICATORS,
        });
    }

    if let Some(idx) = closed_bars.iter().position(|b| !b.is_coherent()) {
        return Err(EngineError::InvalidInputData(format!(
            "bar at index {idx} is malformed (non-finite or OHLC incoherent)"
        )));
    }

    let closes: Vec<f64> = closed_bars.iter().map(|b| b.close).collect();

    let ema50 = ema::latest_ema(&closes, EMA_FAST_PERIOD).ok_or_else(|| {
        EngineError::InvalidInputData("EMA50 series broke on non-finite value".into())
    })?;
    let ema200 = ema::latest_ema(&closes, EMA_SLOW_PERIOD).ok_or_else(|| {
        EngineError::InvalidInputData("EMA200 series broke on non-finite value".into())
    })?;
    let atr14 = atr::latest_atr(closed_bars, ATR_PERIOD).ok_or_else(|| {
        EngineError::InvalidInputData("ATR14 could not be computed".into())
    })?;

    Ok(IndicatorSnapshot { ema50, ema200, atr14 })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let base = 2000.0 + (i as f64 * 0.07).sin() * 15.0 + i as f64 * 0.05;
                Bar {
                    open_time: start + Duration::hours(i as i64),
                    open: base,
                    high: base + 3.0,
                    low: base - 3.0,
                    close: base + 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn rejects_short_history() {
        let bars = series(219);
        match compute(&bars) {
            Err(EngineError::InsufficientHistory { got, required }) => {
                assert_eq!(got, 219);
                assert_eq!(required, 220);
            }
            other => panic!("expected InsufficientHistory, got {other:?}"),
        }
    }

    #[test]
    fn accepts_exact_minimum() {
        let bars = series(220);
        let snap = compute(&bars).unwrap();
        assert!(snap.ema50.is_finite());
        assert!(snap.ema200.is_finite());
        assert!(snap.atr14 > 0.0);
    }

    #[test]
    fn rejects_nan_bar() {
        let mut bars = series(300);
        bars[150].close = f64::NAN;
        assert!(matches!(compute(&bars), Err(EngineError::InvalidInputData(_))));
    }

    #[test]
    fn rejects_incoherent_bar() {
        let mut bars = series(300);
        // Low above open breaks the OHLC invariant.
        bars[42].low = bars[42].open + 10.0;
        bars[42].high = bars[42].low + 20.0;
        assert!(matches!(compute(&bars), Err(EngineError::InvalidInputData(_))));
    }

    #[test]
    fn replay_is_deterministic() {
        let bars = series(400);
        let a = compute(&bars).unwrap();
        let b = compute(&bars).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn uptrend_orders_the_emas() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..400)
            .map(|i| {
                let base = 1800.0 + i as f64 * 0.8;
                Bar {
                    open_time: start + Duration::hours(i as i64),
                    open: base,
                    high: base + 2.0,
                    low: base - 2.0,
                    close: base + 1.0,
                }
            })
            .collect();
        let snap = compute(&bars).unwrap();
        assert!(snap.ema50 > snap.ema200, "fast EMA above slow in an uptrend");
    }
}
