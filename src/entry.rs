// =============================================================================
// Entry Engine — multi-gate long-entry decision
// =============================================================================
//
// Combines the pattern, trend context, momentum, cooldown, and quality gates
// into a single ENTER_LONG / NO_TRADE verdict. Gates are evaluated in a
// fixed order and the FIRST failing gate wins; its machine-readable code is
// reported so that every NO_TRADE is auditable:
//
//   1. Reference bar closed and coherent          -> BAR_NOT_CLOSED
//   2. Pattern present and internally valid       -> INVALID_PATTERN_STRUCTURE
//   3. Breakout close on the reference bar        -> NO_NECKLINE_BREAK
//   4. Close above EMA50 (+ optional body filter) -> CONTEXT_NOT_ALIGNED
//   5. Cooldown elapsed                           -> COOLDOWN_ACTIVE
//   6. Quality >= threshold, regime not BEAR      -> REGIME_CONFLICT
//
// On ENTER_LONG the engine proposes the entry price (reference close), the
// initial stop-loss (entry - k * ATR), and the risk-sized volume that seeds
// the TP ladder.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::guard::{self, BarFilters};
use crate::indicators::IndicatorSnapshot;
use crate::pattern::Pattern;
use crate::regime::{self, Regime, RegimeSnapshot};
use crate::types::{Bar, FailureCode, Verdict};

/// Smallest tradable lot and the sizing step.
const MIN_LOT: f64 = 0.01;
const LOT_STEP: f64 = 0.01;

/// Everything the entry engine needs for one evaluation. Immutable; the
/// engine holds no state across ticks.
#[derive(Debug, Clone, Copy)]
pub struct EntryInput<'a> {
    /// Closed bars, oldest first; the last element is the reference bar.
    pub closed_bars: &'a [Bar],
    pub pattern: Option<&'a Pattern>,
    pub indicators: &'a IndicatorSnapshot,
    pub regime: &'a RegimeSnapshot,
    pub last_entry_time: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    /// Account balance in the deposit currency, for volume sizing.
    pub account_balance: f64,
}

/// Order parameters proposed alongside an ENTER_LONG verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryProposal {
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Risk unit R = entry - stop, in quote units.
    pub risk_unit: f64,
    pub volume: f64,
}

/// Outcome of one entry evaluation. `failure_code` is `None` exactly when
/// the verdict is `EnterLong`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDecision {
    pub verdict: Verdict,
    pub reason_text: String,
    pub failure_code: Option<FailureCode>,
    /// Composite quality score (0..10) if evaluation got that far.
    pub quality_score: f64,
    /// Whether the quality gate was passed.
    pub gate_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<EntryProposal>,
}

impl EntryDecision {
    fn no_trade(code: FailureCode, reason: impl Into<String>, quality: f64) -> Self {
        let reason = reason.into();
        debug!(failure_code = %code, reason = %reason, "NO_TRADE");
        Self {
            verdict: Verdict::NoTrade,
            reason_text: reason,
            failure_code: Some(code),
            quality_score: quality,
            gate_passed: false,
            proposal: None,
        }
    }
}

/// Stateless entry evaluator, configured once at startup.
#[derive(Debug, Clone)]
pub struct EntryEngine {
    momentum_filter_enabled: bool,
    momentum_atr_threshold: f64,
    cooldown: chrono::Duration,
    cooldown_blocking: bool,
    quality_gate_threshold: f64,
    atr_multiplier_stop: f64,
    risk_percent: f64,
    contract_size: f64,
    bar_period: chrono::Duration,
    filters: BarFilters,
}

impl EntryEngine {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            momentum_filter_enabled: config.momentum_filter_enabled,
            momentum_atr_threshold: config.momentum_atr_threshold,
            cooldown: config.cooldown(),
            cooldown_blocking: config.cooldown_blocking,
            quality_gate_threshold: config.quality_gate_threshold,
            atr_multiplier_stop: config.atr_multiplier_stop,
            risk_percent: config.risk_percent,
            contract_size: config.contract_size,
            bar_period: config.bar_period(),
            filters: BarFilters::from_config(config),
        }
    }

    /// Evaluate all gates against one tick context.
    pub fn evaluate_entry(&self, input: &EntryInput) -> EntryDecision {
        // ── Gate 1: reference bar closed and coherent ───────────────────
        let Some(reference) = input.closed_bars.last() else {
            return EntryDecision::no_trade(
                FailureCode::BarNotClosed,
                "no closed bars available",
                0.0,
            );
        };
        let reference_index = input.closed_bars.len() - 1;

        if let Err(reason) = guard::validate(reference, self.bar_period, input.now) {
            return EntryDecision::no_trade(FailureCode::BarNotClosed, reason, 0.0);
        }
        if let Some(reason) = self.filters.tick_noise_block(reference) {
            return EntryDecision::no_trade(FailureCode::BarNotClosed, reason, 0.0);
        }

        // ── Gate 2: pattern present and internally valid ────────────────
        let Some(pattern) = input.pattern else {
            return EntryDecision::no_trade(
                FailureCode::InvalidPatternStructure,
                "no double-bottom candidate",
                0.0,
            );
        };
        if !pattern_is_sound(pattern, input.closed_bars.len()) {
            return EntryDecision::no_trade(
                FailureCode::InvalidPatternStructure,
                format!(
                    "pattern indices inconsistent: lows {}..{}, neckline {}, breakout {}",
                    pattern.left_low_index,
                    pattern.right_low_index,
                    pattern.neckline_index,
                    pattern.breakout_index
                ),
                0.0,
            );
        }

        // ── Gate 3: breakout close on THIS bar ──────────────────────────
        // Entering bars after the breakout would chase; entering before it
        // would repaint. Only the confirming close itself is actionable.
        if !pattern.breaks_out_at(reference_index) || reference.close <= pattern.neckline_price {
            return EntryDecision::no_trade(
                FailureCode::NoNecklineBreak,
                format!(
                    "no breakout on reference bar: close {:.2} vs neckline {:.2} (breakout bar {})",
                    reference.close, pattern.neckline_price, pattern.breakout_index
                ),
                0.0,
            );
        }

        // A confirmed signal exists from here on. The anti-FOMO filter only
        // watches cadence — it warns and never blocks.
        let bars_since_last_signal = input.last_entry_time.and_then(|t| {
            let period_secs = self.bar_period.num_seconds();
            if period_secs <= 0 {
                return None;
            }
            let elapsed = (input.now - t).num_seconds().max(0);
            Some((elapsed / period_secs) as u32)
        });
        self.filters.anti_fomo_warn(bars_since_last_signal);

        // ── Gate 4: trend + optional candle-body momentum ───────────────
        if reference.close <= input.indicators.ema50 {
            return EntryDecision::no_trade(
                FailureCode::ContextNotAligned,
                format!(
                    "close {:.2} not above EMA50 {:.2}",
                    reference.close, input.indicators.ema50
                ),
                0.0,
            );
        }
        if self.momentum_filter_enabled {
            let body = reference.body().abs();
            let required = self.momentum_atr_threshold * input.indicators.atr14;
            if body < required {
                return EntryDecision::no_trade(
                    FailureCode::ContextNotAligned,
                    format!(
                        "candle body {:.2} below momentum threshold {:.2}",
                        body, required
                    ),
                    0.0,
                );
            }
        }

        // ── Gate 5: cooldown ────────────────────────────────────────────
        if let Some(last_entry) = input.last_entry_time {
            let elapsed = input.now - last_entry;
            if elapsed < self.cooldown {
                let reason = format!(
                    "cooldown active: {}m elapsed of {}m",
                    elapsed.num_minutes(),
                    self.cooldown.num_minutes()
                );
                if self.cooldown_blocking {
                    return EntryDecision::no_trade(FailureCode::CooldownActive, reason, 0.0);
                }
                warn!(reason = %reason, "cooldown breached but configured warn-only");
            }
        }

        // ── Gate 6: composite quality + regime ──────────────────────────
        let quality = regime::entry_quality_score(
            pattern.quality_score,
            reference,
            input.indicators,
            input.regime,
        );

        if input.regime.regime == Regime::Bear {
            return EntryDecision::no_trade(
                FailureCode::RegimeConflict,
                format!(
                    "regime BEAR (confidence {:.2}) vetoes longs",
                    input.regime.confidence
                ),
                quality.composite,
            );
        }
        if quality.composite < self.quality_gate_threshold {
            return EntryDecision::no_trade(
                FailureCode::RegimeConflict,
                format!(
                    "quality {:.2} below gate {:.2} (pattern {:.1}, momentum {:.1}, alignment {:.1}, volatility {:.1})",
                    quality.composite,
                    self.quality_gate_threshold,
                    quality.pattern_quality,
                    quality.momentum_score,
                    quality.ema_alignment_score,
                    quality.volatility_score
                ),
                quality.composite,
            );
        }

        // ── All gates passed: build the proposal ────────────────────────
        let entry_price = reference.close;
        let stop_loss = entry_price - self.atr_multiplier_stop * input.indicators.atr14;
        let risk_unit = entry_price - stop_loss;
        let volume = self.size_volume(input.account_balance, risk_unit);

        let caveat = match input.regime.regime {
            Regime::Range => " [RANGE regime: reduced conviction]",
            _ => "",
        };
        let reason_text = format!(
            "breakout close {:.2} above neckline {:.2}, quality {:.2}, regime {}{}",
            entry_price, pattern.neckline_price, quality.composite, input.regime.regime, caveat
        );

        info!(
            entry_price,
            stop_loss,
            risk_unit,
            volume,
            quality = format!("{:.2}", quality.composite),
            regime = %input.regime.regime,
            "ENTER_LONG"
        );

        EntryDecision {
            verdict: Verdict::EnterLong,
            reason_text,
            failure_code: None,
            quality_score: quality.composite,
            gate_passed: true,
            proposal: Some(EntryProposal {
                entry_price,
                stop_loss,
                risk_unit,
                volume,
            }),
        }
    }

    /// Size the order so that a stop-out loses `risk_percent` of balance.
    /// Rounded down to the lot step, floored at the minimum lot.
    fn size_volume(&self, account_balance: f64, risk_unit: f64) -> f64 {
        if account_balance <= 0.0 || risk_unit <= 0.0 || self.contract_size <= 0.0 {
            return MIN_LOT;
        }
        let risk_cash = account_balance * self.risk_percent / 100.0;
        let raw = risk_cash / (risk_unit * self.contract_size);
        let stepped = (raw / LOT_STEP).floor() * LOT_STEP;
        stepped.max(MIN_LOT)
    }
}

/// Internal-structure sanity for a pattern handed in from outside: ordered
/// indices inside the series, finite prices, quality in range.
fn pattern_is_sound(pattern: &Pattern, series_len: usize) -> bool {
    pattern.left_low_index < pattern.neckline_index
        && pattern.neckline_index < pattern.right_low_index
        && pattern.right_low_index < pattern.breakout_index
        && pattern.breakout_index < series_len
        && pattern.neckline_price.is_finite()
        && pattern.neckline_price > 0.0
        && pattern.quality_score.is_finite()
        && (0.0..=10.0).contains(&pattern.quality_score)
}
