// =============================================================================
// Market Regime Scorer — trend context and composite entry quality
// =============================================================================
//
// Classifies the market into one of three regimes from the close/EMA50/EMA200
// ordering:
//
//   BULL  — close > EMA50 > EMA200
//   BEAR  — close < EMA50 < EMA200
//   RANGE — any other ordering (confidence pinned to zero)
//
// Confidence blends the EMA spread and the price distance from EMA50:
//
//   confidence = 0.6 * min(|EMA50-EMA200| / EMA200 / 0.01, 1)
//              + 0.4 * min(|close-EMA50|  / EMA50  / 0.02, 1)
//
// The scorer is CONTEXT ONLY: it never emits orders and never overrides the
// entry engine's verdict. Its output feeds the entry gates and the UI feed.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::IndicatorSnapshot;
use crate::types::Bar;

/// High-level trend regime from the EMA stack ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Bull,
    Bear,
    Range,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Bear => write!(f, "BEAR"),
            Self::Range => write!(f, "RANGE"),
        }
    }
}

/// Complete snapshot of the regime classification plus the contributing
/// gap measurements (both in percent).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub regime: Regime,
    /// Confidence in the classification [0.0, 1.0]. Zero for RANGE.
    pub confidence: f64,
    /// (EMA50 - EMA200) / EMA200, in percent.
    pub ema_gap_pct: f64,
    /// (close - EMA50) / EMA50, in percent.
    pub price_ema50_gap_pct: f64,
}

/// Classify the regime from the closed-bar close and the two EMAs.
pub fn evaluate(close: f64, ema50: f64, ema200: f64) -> RegimeSnapshot {
    // Degenerate inputs land in RANGE with zero confidence rather than
    // propagating NaN into downstream gates.
    if !close.is_finite() || !ema50.is_finite() || !ema200.is_finite() || ema50 <= 0.0 || ema200 <= 0.0
    {
        return RegimeSnapshot {
            regime: Regime::Range,
            confidence: 0.0,
            ema_gap_pct: 0.0,
            price_ema50_gap_pct: 0.0,
        };
    }

    let ema_gap_pct = (ema50 - ema200) / ema200 * 100.0;
    let price_ema50_gap_pct = (close - ema50) / ema50 * 100.0;

    let regime = if close > ema50 && ema50 > ema200 {
        Regime::Bull
    } else if close < ema50 && ema50 < ema200 {
        Regime::Bear
    } else {
        Regime::Range
    };

    let confidence = match regime {
        Regime::Range => 0.0,
        _ => {
            let spread = ((ema50 - ema200).abs() / ema200 / 0.01).min(1.0);
            let distance = ((close - ema50).abs() / ema50 / 0.02).min(1.0);
            0.6 * spread + 0.4 * distance
        }
    };

    debug!(
        regime = %regime,
        confidence = format!("{:.2}", confidence),
        ema_gap_pct = format!("{:.3}", ema_gap_pct),
        price_gap_pct = format!("{:.3}", price_ema50_gap_pct),
        "regime evaluated"
    );

    RegimeSnapshot {
        regime,
        confidence,
        ema_gap_pct,
        price_ema50_gap_pct,
    }
}

// =============================================================================
// Composite entry quality
// =============================================================================

/// ATR-percent band considered appropriate volatility for entries.
const VOL_IDEAL_LO_PCT: f64 = 0.10;
const VOL_IDEAL_HI_PCT: f64 = 1.50;

/// Breakdown of the composite entry-quality score, kept for the UI feed and
/// decision audit lines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub pattern_quality: f64,
    pub momentum_score: f64,
    pub ema_alignment_score: f64,
    pub volatility_score: f64,
    /// 0.35*pattern + 0.25*momentum + 0.25*alignment + 0.15*volatility.
    pub composite: f64,
}

/// Compute the composite entry-quality score (0..10).
///
/// Sub-scores, each 0..10:
///   - pattern quality: taken as-is from the detector
///   - momentum: bull-body size relative to 0.6 * ATR
///   - EMA alignment: regime and its confidence
///   - volatility appropriateness: ATR%-of-price inside the ideal band
pub fn entry_quality_score(
    pattern_quality: f64,
    reference_bar: &Bar,
    indicators: &IndicatorSnapshot,
    regime: &RegimeSnapshot,
) -> QualityScore {
    let pattern_quality = pattern_quality.clamp(0.0, 10.0);

    let momentum_score = if indicators.atr14 > 0.0 {
        let body = reference_bar.body();
        if body <= 0.0 {
            0.0
        } else {
            (body / (0.6 * indicators.atr14)).min(1.0) * 10.0
        }
    } else {
        0.0
    };

    let ema_alignment_score = match regime.regime {
        Regime::Bull => 6.0 + 4.0 * regime.confidence,
        Regime::Range => 4.0,
        Regime::Bear => 0.0,
    };

    let volatility_score = volatility_appropriateness(indicators.atr14, reference_bar.close);

    let composite = 0.35 * pattern_quality
        + 0.25 * momentum_score
        + 0.25 * ema_alignment_score
        + 0.15 * volatility_score;

    QualityScore {
        pattern_quality,
        momentum_score,
        ema_alignment_score,
        volatility_score,
        composite,
    }
}

/// Score how suitable current volatility is for an entry: full marks inside
/// the ideal ATR% band, falling off linearly outside it.
fn volatility_appropriateness(atr: f64, close: f64) -> f64 {
    if atr <= 0.0 || close <= 0.0 {
        return 0.0;
    }
    let atr_pct = atr / close * 100.0;

    if atr_pct < VOL_IDEAL_LO_PCT {
        // Dead tape: ramp up from zero at perfectly flat to full marks at
        // the band floor.
        (atr_pct / VOL_IDEAL_LO_PCT * 10.0).clamp(0.0, 10.0)
    } else if atr_pct > VOL_IDEAL_HI_PCT {
        // Overheated: fade out, reaching zero at triple the band ceiling.
        let overshoot = (atr_pct - VOL_IDEAL_HI_PCT) / (2.0 * VOL_IDEAL_HI_PCT);
        ((1.0 - overshoot) * 10.0).clamp(0.0, 10.0)
    } else {
        10.0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, close: f64) -> Bar {
        Bar {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
        }
    }

    #[test]
    fn classify_bull() {
        let snap = evaluate(2050.0, 2030.0, 2000.0);
        assert_eq!(snap.regime, Regime::Bull);
        assert!(snap.confidence > 0.0);
    }

    #[test]
    fn classify_bear() {
        let snap = evaluate(1950.0, 1980.0, 2000.0);
        assert_eq!(snap.regime, Regime::Bear);
        assert!(snap.confidence > 0.0);
    }

    #[test]
    fn mixed_ordering_is_range_with_zero_confidence() {
        // Close above EMA50 but EMA50 below EMA200.
        let snap = evaluate(2010.0, 1990.0, 2000.0);
        assert_eq!(snap.regime, Regime::Range);
        assert!((snap.confidence - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn confidence_formula_exact() {
        // EMA spread 0.5% of EMA200 => spread term = 0.5; price 1% above
        // EMA50 => distance term = 0.5.
        let ema200 = 2000.0;
        let ema50 = 2010.0;
        let close = ema50 * 1.01;
        let snap = evaluate(close, ema50, ema200);
        assert_eq!(snap.regime, Regime::Bull);
        let expected = 0.6 * 0.5 + 0.4 * 0.5;
        assert!(
            (snap.confidence - expected).abs() < 1e-9,
            "got {}, expected {expected}",
            snap.confidence
        );
    }

    #[test]
    fn confidence_terms_cap_at_one() {
        // Enormous spread and distance saturate both terms.
        let snap = evaluate(3000.0, 2500.0, 2000.0);
        assert_eq!(snap.regime, Regime::Bull);
        assert!((snap.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs_fall_to_range() {
        assert_eq!(evaluate(f64::NAN, 2000.0, 2000.0).regime, Regime::Range);
        assert_eq!(evaluate(2000.0, 0.0, 2000.0).regime, Regime::Range);
        assert_eq!(evaluate(2000.0, 2000.0, f64::INFINITY).regime, Regime::Range);
    }

    #[test]
    fn gap_percentages_signed() {
        let snap = evaluate(1950.0, 1980.0, 2000.0);
        assert!(snap.ema_gap_pct < 0.0);
        assert!(snap.price_ema50_gap_pct < 0.0);
    }

    fn indicators(atr: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema50: 2000.0,
            ema200: 1980.0,
            atr14: atr,
        }
    }

    #[test]
    fn quality_composite_weights() {
        let snap = RegimeSnapshot {
            regime: Regime::Bull,
            confidence: 1.0,
            ema_gap_pct: 1.0,
            price_ema50_gap_pct: 1.0,
        };
        // Strong bull candle: body 6.0 on ATR 10 => momentum score 10.
        let b = bar(2000.0, 2006.0);
        let q = entry_quality_score(8.0, &b, &indicators(10.0), &snap);

        assert!((q.momentum_score - 10.0).abs() < 1e-9);
        assert!((q.ema_alignment_score - 10.0).abs() < 1e-9);
        assert!((q.volatility_score - 10.0).abs() < 1e-9);
        let expected = 0.35 * 8.0 + 0.25 * 10.0 + 0.25 * 10.0 + 0.15 * 10.0;
        assert!((q.composite - expected).abs() < 1e-9);
    }

    #[test]
    fn bearish_candle_has_zero_momentum() {
        let snap = evaluate(2050.0, 2030.0, 2000.0);
        let b = bar(2006.0, 2000.0);
        let q = entry_quality_score(8.0, &b, &indicators(10.0), &snap);
        assert!((q.momentum_score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bear_regime_zeroes_alignment() {
        let snap = evaluate(1950.0, 1980.0, 2000.0);
        let b = bar(2000.0, 2006.0);
        let q = entry_quality_score(8.0, &b, &indicators(10.0), &snap);
        assert!((q.ema_alignment_score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn composite_stays_in_bounds() {
        let bull = RegimeSnapshot {
            regime: Regime::Bull,
            confidence: 1.0,
            ema_gap_pct: 0.0,
            price_ema50_gap_pct: 0.0,
        };
        let b = bar(2000.0, 2020.0);
        let q = entry_quality_score(10.0, &b, &indicators(10.0), &bull);
        assert!(q.composite <= 10.0);
        assert!(q.composite >= 0.0);
    }

    #[test]
    fn extreme_volatility_scores_low() {
        // ATR of 120 on a 2000 close is 6% — far past the ideal band.
        let score = volatility_appropriateness(120.0, 2000.0);
        assert!(score < 2.0, "got {score}");
        // Dead-flat market scores low too.
        let flat = volatility_appropriateness(0.5, 2000.0);
        assert!(flat < 5.0, "got {flat}");
        // A typical gold ATR sits comfortably inside the band.
        let normal = volatility_appropriateness(10.0, 2000.0);
        assert!((normal - 10.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_fade_is_clamped_at_zero() {
        // Ten times the band ceiling would go negative without the clamp.
        let score = volatility_appropriateness(300.0, 2000.0);
        assert!((score - 0.0).abs() < 1e-9);
        // Exactly at triple the ceiling the fade bottoms out.
        let at_edge = volatility_appropriateness(90.0, 2000.0);
        assert!((at_edge - 0.0).abs() < 1e-9);
    }
}
