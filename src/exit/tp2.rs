// =============================================================================
// TP2 Exit Engine — hold / wait / exit after the second take-profit touch
// =============================================================================
//
// Mirrors the TP1 engine with TIGHTER thresholds — by TP2 the trade has
// banked nearly two risk units and gives back less rope:
//
//   micro-pullback  <= 0.20 * ATR   (TP1: 0.25)
//   deep retrace    >= 0.35 * ATR   (TP1: 0.50)
//
// One additional EXIT condition comes from swing structure: a LOWER_LOW
// after TP2 means the advance is failing. The engine also produces a fresh
// trailing-stop proposal (ATR anchor vs swing anchor vs entry floor) that
// the arbiter merges monotonically.
// =============================================================================

use tracing::debug;

use crate::exit::{PostTpDecision, TpExitVerdict};
use crate::ladder;
use crate::regime::Regime;
use crate::types::{Bar, Momentum, StructureState};

/// Retrace at or below this ATR multiple is treated as noise.
pub const MICRO_PULLBACK_ATR: f64 = 0.20;
/// Retrace at or beyond this ATR multiple is a confirmed failure.
pub const DEEP_RETRACE_ATR: f64 = 0.35;
/// Cushion above entry for the proposed stop.
const STOP_CUSHION_ATR: f64 = 0.2;

/// Immutable context for one TP2-engine evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Tp2Context<'a> {
    /// Close of the bar under evaluation.
    pub current_price: f64,
    pub entry_price: f64,
    pub tp2_price: f64,
    pub current_stop_loss: f64,
    pub atr14: f64,
    pub regime: Regime,
    pub momentum: Momentum,
    pub structure: StructureState,
    /// The closed bar immediately BEFORE the one under evaluation.
    pub last_closed_bar: Option<&'a Bar>,
    /// Full bars spent in TP2_REACHED, including the current one.
    pub bars_since_tp2: u32,
    /// Recent swing low anchoring the trailing stop.
    pub swing_low: Option<f64>,
    /// (atr_offset, swing_offset) from config.
    pub trailing_offsets: (f64, f64),
}

/// Evaluate the post-TP2 rules for one bar-close.
pub fn evaluate(ctx: &Tp2Context) -> TpExitVerdict {
    let retrace = ctx.tp2_price - ctx.current_price;
    let proposed_stop = cushioned_stop(ctx);
    let trailing = Some(ladder::trailing_proposal(
        ctx.entry_price,
        ctx.current_price,
        ctx.atr14,
        ctx.swing_low,
        ctx.trailing_offsets,
    ));

    // ── 1. Anti-premature guard ─────────────────────────────────────────
    // No stop proposal on the triggering close; the trailing seed from the
    // ladder transition is the only stop movement this bar.
    if ctx.bars_since_tp2 == 0 {
        return verdict(
            PostTpDecision::Hold,
            "TP2 touch bar itself — never exit on the triggering close".to_string(),
            None,
            trailing,
        );
    }

    let prev_close = ctx.last_closed_bar.map(|b| b.close);

    // ── 2. Confirmed failures ───────────────────────────────────────────
    if let Some(prev) = prev_close {
        if prev < ctx.tp2_price && ctx.current_price < ctx.tp2_price {
            return verdict(
                PostTpDecision::ExitTrade,
                format!(
                    "two consecutive closes below TP2 ({:.2}, {:.2} < {:.2})",
                    prev, ctx.current_price, ctx.tp2_price
                ),
                None,
                trailing,
            );
        }
    }
    if ctx.momentum == Momentum::Broken {
        return verdict(
            PostTpDecision::ExitTrade,
            "momentum BROKEN after TP2".to_string(),
            None,
            trailing,
        );
    }
    if ctx.structure == StructureState::LowerLow {
        return verdict(
            PostTpDecision::ExitTrade,
            "LOWER_LOW printed after TP2 — advance failing".to_string(),
            None,
            trailing,
        );
    }
    if ctx.regime != Regime::Bull {
        return verdict(
            PostTpDecision::ExitTrade,
            format!("regime flipped to {} after TP2", ctx.regime),
            None,
            trailing,
        );
    }
    if retrace >= DEEP_RETRACE_ATR * ctx.atr14 {
        return verdict(
            PostTpDecision::ExitTrade,
            format!(
                "deep retrace {:.2} >= {:.2} (0.35*ATR) below TP2",
                retrace,
                DEEP_RETRACE_ATR * ctx.atr14
            ),
            None,
            trailing,
        );
    }

    // ── 3. Comfortable holds ────────────────────────────────────────────
    if retrace <= MICRO_PULLBACK_ATR * ctx.atr14 {
        return verdict(
            PostTpDecision::Hold,
            format!(
                "micro-pullback {:.2} <= {:.2} (0.20*ATR) — noise",
                retrace.max(0.0),
                MICRO_PULLBACK_ATR * ctx.atr14
            ),
            proposed_stop,
            trailing,
        );
    }
    if let Some(prev) = prev_close {
        if prev >= ctx.tp2_price {
            return verdict(
                PostTpDecision::Hold,
                format!("previous close {:.2} still at/above TP2", prev),
                proposed_stop,
                trailing,
            );
        }
    }
    if ctx.regime == Regime::Bull {
        return verdict(
            PostTpDecision::Hold,
            "regime BULL supports holding through the pullback".to_string(),
            proposed_stop,
            trailing,
        );
    }

    // ── 4. Ambiguous — wait one more bar ────────────────────────────────
    let single_bar_pullback =
        ctx.current_price < ctx.tp2_price && ctx.current_price > ctx.entry_price;
    if single_bar_pullback || matches!(ctx.momentum, Momentum::Strong | Momentum::Moderate) {
        return verdict(
            PostTpDecision::WaitNextBar,
            format!(
                "single-bar pullback above entry (momentum {}) — confirm next bar",
                ctx.momentum
            ),
            proposed_stop,
            trailing,
        );
    }

    // ── 5. Default ──────────────────────────────────────────────────────
    verdict(
        PostTpDecision::Hold,
        "no exit rule matched — default hold".to_string(),
        proposed_stop,
        trailing,
    )
}

fn cushioned_stop(ctx: &Tp2Context) -> Option<f64> {
    let cushion = ctx.entry_price + STOP_CUSHION_ATR * ctx.atr14;
    Some(cushion.max(ctx.current_stop_loss))
}

fn verdict(
    decision: PostTpDecision,
    reason: String,
    proposed_stop: Option<f64>,
    trailing_proposal: Option<f64>,
) -> TpExitVerdict {
    debug!(decision = %decision, reason = %reason, "TP2 engine verdict");
    TpExitVerdict {
        decision,
        reason,
        proposed_stop,
        trailing_proposal,
    }
}
