// =============================================================================
// TP1 Exit Engine — hold / wait / exit after the first take-profit touch
// =============================================================================
//
// Rules, evaluated in priority order (first match wins):
//
//   1. bars_since_tp1 == 0                        -> HOLD
//      (anti-premature guard: never exit on the bar that touched TP1)
//   2. EXIT on any of:
//        - two consecutive closes below TP1
//        - momentum BROKEN
//        - regime flipped to RANGE or BEAR
//        - retrace below TP1 of at least 0.5 * ATR
//   3. HOLD on any of:
//        - retrace at most 0.25 * ATR (micro-pullback)
//        - previous close still at or above TP1
//        - regime BULL
//   4. WAIT_NEXT_BAR on a single-bar pullback still above entry, or while
//      momentum stays STRONG / MODERATE
//   5. default HOLD
//
// The engine is stateless; all context is passed in. Alongside the verdict
// it proposes a cushioned stop (entry + 0.2 * ATR) — never bare breakeven.
// =============================================================================

use tracing::debug;

use crate::exit::{PostTpDecision, TpExitVerdict};
use crate::regime::Regime;
use crate::types::{Bar, Momentum};

/// Retrace at or below this ATR multiple is treated as noise.
pub const MICRO_PULLBACK_ATR: f64 = 0.25;
/// Retrace at or beyond this ATR multiple is a confirmed failure.
pub const DEEP_RETRACE_ATR: f64 = 0.5;
/// Cushion above entry for the proposed stop.
const STOP_CUSHION_ATR: f64 = 0.2;

/// Immutable context for one TP1-engine evaluation, assembled by the
/// arbiter from the tick snapshot and the position copy.
#[derive(Debug, Clone, Copy)]
pub struct Tp1Context<'a> {
    /// Close of the bar under evaluation.
    pub current_price: f64,
    pub entry_price: f64,
    pub tp1_price: f64,
    pub current_stop_loss: f64,
    pub atr14: f64,
    pub regime: Regime,
    pub momentum: Momentum,
    /// The closed bar immediately BEFORE the one under evaluation.
    pub last_closed_bar: Option<&'a Bar>,
    /// Full bars spent in TP1_REACHED, including the current one.
    pub bars_since_tp1: u32,
}

/// Evaluate the post-TP1 rules for one bar-close.
pub fn evaluate(ctx: &Tp1Context) -> TpExitVerdict {
    let retrace = ctx.tp1_price - ctx.current_price;
    let proposed_stop = cushioned_stop(ctx);

    // ── 1. Anti-premature guard ─────────────────────────────────────────
    // No stop proposal either: the breakeven lock from the ladder is the
    // only stop movement allowed on the triggering close.
    if ctx.bars_since_tp1 == 0 {
        return verdict(
            PostTpDecision::Hold,
            "TP1 touch bar itself — never exit on the triggering close".to_string(),
            None,
        );
    }

    let prev_close = ctx.last_closed_bar.map(|b| b.close);

    // ── 2. Confirmed failures ───────────────────────────────────────────
    if let Some(prev) = prev_close {
        if prev < ctx.tp1_price && ctx.current_price < ctx.tp1_price {
            return verdict(
                PostTpDecision::ExitTrade,
                format!(
                    "two consecutive closes below TP1 ({:.2}, {:.2} < {:.2})",
                    prev, ctx.current_price, ctx.tp1_price
                ),
                None,
            );
        }
    }
    if ctx.momentum == Momentum::Broken {
        return verdict(
            PostTpDecision::ExitTrade,
            "momentum BROKEN after TP1".to_string(),
            None,
        );
    }
    if ctx.regime != Regime::Bull {
        return verdict(
            PostTpDecision::ExitTrade,
            format!("regime flipped to {} after TP1", ctx.regime),
            None,
        );
    }
    if retrace >= DEEP_RETRACE_ATR * ctx.atr14 {
        return verdict(
            PostTpDecision::ExitTrade,
            format!(
                "deep retrace {:.2} >= {:.2} (0.5*ATR) below TP1",
                retrace,
                DEEP_RETRACE_ATR * ctx.atr14
            ),
            None,
        );
    }

    // ── 3. Comfortable holds ────────────────────────────────────────────
    if retrace <= MICRO_PULLBACK_ATR * ctx.atr14 {
        return verdict(
            PostTpDecision::Hold,
            format!(
                "micro-pullback {:.2} <= {:.2} (0.25*ATR) — noise",
                retrace.max(0.0),
                MICRO_PULLBACK_ATR * ctx.atr14
            ),
            proposed_stop,
        );
    }
    if let Some(prev) = prev_close {
        if prev >= ctx.tp1_price {
            return verdict(
                PostTpDecision::Hold,
                format!("previous close {:.2} still at/above TP1", prev),
                proposed_stop,
            );
        }
    }
    if ctx.regime == Regime::Bull {
        return verdict(
            PostTpDecision::Hold,
            "regime BULL supports holding through the pullback".to_string(),
            proposed_stop,
        );
    }

    // ── 4. Ambiguous — wait one more bar ────────────────────────────────
    let single_bar_pullback =
        ctx.current_price < ctx.tp1_price && ctx.current_price > ctx.entry_price;
    if single_bar_pullback || matches!(ctx.momentum, Momentum::Strong | Momentum::Moderate) {
        return verdict(
            PostTpDecision::WaitNextBar,
            format!(
                "single-bar pullback above entry (momentum {}) — confirm next bar",
                ctx.momentum
            ),
            proposed_stop,
        );
    }

    // ── 5. Default ──────────────────────────────────────────────────────
    verdict(
        PostTpDecision::Hold,
        "no exit rule matched — default hold".to_string(),
        proposed_stop,
    )
}

/// Proposed stop: entry plus a cushion, but never below what the position
/// already has. Exact breakeven is deliberately avoided.
fn cushioned_stop(ctx: &Tp1Context) -> Option<f64> {
    let cushion = ctx.entry_price + STOP_CUSHION_ATR * ctx.atr14;
    Some(cushion.max(ctx.current_stop_loss))
}

fn verdict(decision: PostTpDecision, reason: String, proposed_stop: Option<f64>) -> TpExitVerdict {
    debug!(decision = %decision, reason = %reason, "TP1 engine verdict");
    TpExitVerdict {
        decision,
        reason,
        proposed_stop,
        trailing_proposal: None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(close: f64) -> Bar {
        Bar {
            open_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
        }
    }

    /// Baseline: TP1 at 2070 on a 2000 entry, ATR 10, bull regime, one bar
    /// since the touch.
    fn ctx(current: f64, prev: &Bar) -> Tp1Context<'_> {
        Tp1Context {
            current_price: current,
            entry_price: 2000.0,
            tp1_price: 2070.0,
            current_stop_loss: 2000.0,
            atr14: 10.0,
            regime: Regime::Bull,
            momentum: Momentum::Moderate,
            last_closed_bar: Some(prev),
            bars_since_tp1: 1,
        }
    }

    #[test]
    fn never_exits_on_the_touch_bar() {
        let prev = bar(2060.0);
        let mut c = ctx(2055.0, &prev); // would be a deep retrace otherwise
        c.bars_since_tp1 = 0;
        let v = evaluate(&c);
        assert_eq!(v.decision, PostTpDecision::Hold);
    }

    #[test]
    fn micro_pullback_holds() {
        // Retrace 2.0 < 0.25 * 10 = 2.5 — scenario S3.
        let prev = bar(2070.0);
        let v = evaluate(&ctx(2068.0, &prev));
        assert_eq!(v.decision, PostTpDecision::Hold);
        assert!(v.reason.contains("micro-pullback"));
    }

    #[test]
    fn deep_retrace_exits() {
        // Retrace 6.0 >= 0.5 * 10 = 5.0 — scenario S4.
        let prev = bar(2070.5);
        let v = evaluate(&ctx(2064.0, &prev));
        assert_eq!(v.decision, PostTpDecision::ExitTrade);
        assert!(v.reason.contains("deep retrace"));
    }

    #[test]
    fn two_closes_below_tp1_exit() {
        let prev = bar(2067.0); // already below TP1
        let v = evaluate(&ctx(2066.5, &prev));
        assert_eq!(v.decision, PostTpDecision::ExitTrade);
        assert!(v.reason.contains("two consecutive closes"));
    }

    #[test]
    fn broken_momentum_exits() {
        let prev = bar(2071.0);
        let mut c = ctx(2069.0, &prev);
        c.momentum = Momentum::Broken;
        let v = evaluate(&c);
        assert_eq!(v.decision, PostTpDecision::ExitTrade);
        assert!(v.reason.contains("BROKEN"));
    }

    #[test]
    fn regime_flip_exits() {
        let prev = bar(2071.0);
        for flipped in [Regime::Range, Regime::Bear] {
            let mut c = ctx(2069.0, &prev);
            c.regime = flipped;
            // Keep the retrace shallow so only the regime rule can fire.
            c.current_price = 2069.0;
            let v = evaluate(&c);
            assert_eq!(v.decision, PostTpDecision::ExitTrade, "{flipped}");
            assert!(v.reason.contains("regime"));
        }
    }

    #[test]
    fn recovered_price_above_tp1_holds() {
        let prev = bar(2071.0);
        let v = evaluate(&ctx(2072.0, &prev));
        assert_eq!(v.decision, PostTpDecision::Hold);
    }

    #[test]
    fn mid_zone_with_prev_above_tp1_holds() {
        // Retrace 3.0 sits between micro (2.5) and deep (5.0); previous
        // close was above TP1 so this is the first dip.
        let prev = bar(2071.0);
        let v = evaluate(&ctx(2067.0, &prev));
        assert_eq!(v.decision, PostTpDecision::Hold);
        assert!(v.reason.contains("previous close"));
    }

    #[test]
    fn proposed_stop_is_cushioned_above_entry() {
        let prev = bar(2070.0);
        let v = evaluate(&ctx(2068.0, &prev));
        let stop = v.proposed_stop.unwrap();
        // entry + 0.2 * ATR = 2002, strictly above bare breakeven.
        assert!((stop - 2002.0).abs() < 1e-9);
        assert!(stop > 2000.0);
    }

    #[test]
    fn proposed_stop_never_downgrades() {
        let prev = bar(2070.0);
        let mut c = ctx(2068.0, &prev);
        c.current_stop_loss = 2010.0; // already better than the cushion
        let v = evaluate(&c);
        assert!((v.proposed_stop.unwrap() - 2010.0).abs() < 1e-9);
    }

    #[test]
    fn exit_verdicts_carry_no_stop_proposal() {
        let prev = bar(2070.5);
        let v = evaluate(&ctx(2064.0, &prev));
        assert_eq!(v.decision, PostTpDecision::ExitTrade);
        assert!(v.proposed_stop.is_none());
    }

    #[test]
    fn tp1_engine_never_proposes_trailing() {
        let prev = bar(2070.0);
        let v = evaluate(&ctx(2068.0, &prev));
        assert!(v.trailing_proposal.is_none());
    }
}
