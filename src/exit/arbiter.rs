// =============================================================================
// Exit Arbiter — priority-ordered exit evaluation with reason integrity
// =============================================================================
//
// Runs once per open position per bar-close. Priority is fixed and the
// stop-loss check is UNINTERRUPTIBLE — no TP logic can preempt it:
//
//   1. Stop-loss:          close <= current_stop_loss  => exit "Stop Loss"
//   2. Ladder advance:     TP3 crossing                => exit "TP3 Hit"
//   3. TP1_REACHED:        TP1 engine verdict          => exit "TP1 Hit"
//   4. TP2_REACHED:        TP2 engine verdict          => exit "TP2 Hit"
//                          (+ monotone trailing merge)
//   5. otherwise:          an explicit NO_EXIT record. Silent no-exits are
//                          forbidden; the record carries regime, momentum,
//                          and ladder state.
//
// Every exit reason is validated before it may reach the state store:
// numeric or empty labels become "Unknown Closure", a "TP3" label whose
// price never reached TP3 becomes "Protective Exit", and any exit price
// within one point of the stop is relabelled "Stop Loss".
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exit::{tp1, tp2, PostTpDecision};
use crate::indicators::IndicatorSnapshot;
use crate::ladder::{self, LadderTransition};
use crate::regime::RegimeSnapshot;
use crate::store::Position;
use crate::types::{Bar, Momentum, StructureState, TpState};

/// Exit reason vocabulary. Persisted as strings; the constants keep the
/// spelling in one place.
pub const REASON_STOP_LOSS: &str = "Stop Loss";
pub const REASON_TP1_HIT: &str = "TP1 Hit";
pub const REASON_TP2_HIT: &str = "TP2 Hit";
pub const REASON_TP3_HIT: &str = "TP3 Hit";
pub const REASON_PROTECTIVE: &str = "Protective Exit";
pub const REASON_UNKNOWN: &str = "Unknown Closure";

/// Immutable per-tick market context shared by every position evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    /// Closed bars, oldest first; the last element is the reference bar.
    pub closed_bars: &'a [Bar],
    pub indicators: &'a IndicatorSnapshot,
    pub regime: &'a RegimeSnapshot,
    pub momentum: Momentum,
    pub structure: StructureState,
    pub swing_low: Option<f64>,
    /// Close instant of the reference bar.
    pub closed_at: DateTime<Utc>,
}

/// A validated instruction to close a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCommand {
    pub ticket: u64,
    pub exit_price: f64,
    pub exit_reason: String,
    /// Set when reason integrity rewrote the original label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_from: Option<String>,
}

/// Outcome of one arbiter pass over one position.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Exit(ExitCommand),
    /// No exit this bar; the reason line is mandatory observability.
    NoExit { reason: String },
}

/// Stateless arbiter, configured once at startup.
#[derive(Debug, Clone)]
pub struct ExitArbiter {
    point_size: f64,
    trailing_offsets: (f64, f64),
}

impl ExitArbiter {
    pub fn new(point_size: f64, trailing_offsets: (f64, f64)) -> Self {
        Self {
            point_size,
            trailing_offsets,
        }
    }

    /// Evaluate one position for one bar-close.
    ///
    /// Returns the mutated position copy (ladder state, counters, stops,
    /// post-TP metadata) plus the outcome. The caller commits the copy and
    /// applies the exit through the store so the whole step is atomic.
    pub fn evaluate_exit(&self, position: &Position, ctx: &TickContext) -> (Position, ExitOutcome) {
        let mut work = position.clone();

        let Some(reference) = ctx.closed_bars.last() else {
            return (
                work,
                ExitOutcome::NoExit {
                    reason: "NO_EXIT: no closed bars in tick context".to_string(),
                },
            );
        };
        let close = reference.close;
        let prev_bar = ctx.closed_bars.len().checked_sub(2).map(|i| &ctx.closed_bars[i]);

        // ── 1. Stop-loss first, always ──────────────────────────────────
        if ladder::stop_hit(&work, close) {
            work.tp_state = TpState::Exited;
            let command = self.validated(
                &work,
                close,
                REASON_STOP_LOSS.to_string(),
            );
            info!(
                ticket = work.ticket,
                close,
                sl = work.current_stop_loss,
                "stop-loss exit"
            );
            return (work, ExitOutcome::Exit(command));
        }

        // Positions restored without a usable ladder are SL-managed only.
        if !work.has_ladder() {
            let reason = format!(
                "NO_EXIT: ticket {} has no TP ladder (recovery-limited) | close {:.2} sl {:.2} regime {} momentum {}",
                work.ticket, close, work.current_stop_loss, ctx.regime.regime, ctx.momentum
            );
            info!(reason = %reason, "no exit");
            return (work, ExitOutcome::NoExit { reason });
        }

        // ── 2. Ladder advance ───────────────────────────────────────────
        let transitions = ladder::advance_on_close(
            &mut work,
            close,
            ctx.indicators.atr14,
            ctx.swing_low,
            self.trailing_offsets,
            ctx.closed_at,
        );

        if transitions.contains(&LadderTransition::Tp3Reached) {
            work.tp_state = TpState::Exited;
            let command = self.validated(&work, close, REASON_TP3_HIT.to_string());
            return (work, ExitOutcome::Exit(command));
        }

        // ── 3. TP1 engine ───────────────────────────────────────────────
        if work.tp_state == TpState::Tp1Reached {
            let verdict = tp1::evaluate(&tp1::Tp1Context {
                current_price: close,
                entry_price: work.entry_price,
                tp1_price: work.tp1_price,
                current_stop_loss: work.current_stop_loss,
                atr14: ctx.indicators.atr14,
                regime: ctx.regime.regime,
                momentum: ctx.momentum,
                last_closed_bar: prev_bar,
                bars_since_tp1: work.bars_held_after_tp1,
            });

            work.post_tp1_decision = Some(verdict.decision);
            work.tp1_exit_reason = Some(verdict.reason.clone());

            if verdict.decision == PostTpDecision::ExitTrade {
                work.tp_state = TpState::Exited;
                let command = self.validated(&work, close, REASON_TP1_HIT.to_string());
                return (work, ExitOutcome::Exit(command));
            }

            if let Some(stop) = verdict.proposed_stop {
                if stop > work.current_stop_loss {
                    work.current_stop_loss = stop;
                }
            }

            let reason = format!(
                "NO_EXIT: {} after TP1 ({}) | state {} regime {} momentum {} close {:.2}",
                verdict.decision, verdict.reason, work.tp_state, ctx.regime.regime, ctx.momentum, close
            );
            info!(ticket = work.ticket, reason = %reason, "no exit");
            return (work, ExitOutcome::NoExit { reason });
        }

        // ── 4. TP2 engine ───────────────────────────────────────────────
        if work.tp_state == TpState::Tp2Reached {
            let verdict = tp2::evaluate(&tp2::Tp2Context {
                current_price: close,
                entry_price: work.entry_price,
                tp2_price: work.tp2_price,
                current_stop_loss: work.current_stop_loss,
                atr14: ctx.indicators.atr14,
                regime: ctx.regime.regime,
                momentum: ctx.momentum,
                structure: ctx.structure,
                last_closed_bar: prev_bar,
                bars_since_tp2: work.bars_held_after_tp2,
                swing_low: ctx.swing_low,
                trailing_offsets: self.trailing_offsets,
            });

            work.post_tp2_decision = Some(verdict.decision);
            work.tp2_exit_reason = Some(verdict.reason.clone());

            if verdict.decision == PostTpDecision::ExitTrade {
                work.tp_state = TpState::Exited;
                let command = self.validated(&work, close, REASON_TP2_HIT.to_string());
                return (work, ExitOutcome::Exit(command));
            }

            if let Some(trail) = verdict.trailing_proposal {
                ladder::merge_trailing(&mut work, trail);
            }
            if let Some(stop) = verdict.proposed_stop {
                if stop > work.current_stop_loss {
                    work.current_stop_loss = stop;
                }
            }

            let reason = format!(
                "NO_EXIT: {} after TP2 ({}) | state {} regime {} momentum {} structure {} close {:.2}",
                verdict.decision,
                verdict.reason,
                work.tp_state,
                ctx.regime.regime,
                ctx.momentum,
                ctx.structure,
                close
            );
            info!(ticket = work.ticket, reason = %reason, "no exit");
            return (work, ExitOutcome::NoExit { reason });
        }

        // ── 5. Explicit no-exit record ──────────────────────────────────
        let reason = format!(
            "NO_EXIT: no trigger | state {} regime {} momentum {} close {:.2} sl {:.2}",
            work.tp_state, ctx.regime.regime, ctx.momentum, close, work.current_stop_loss
        );
        debug!(ticket = work.ticket, reason = %reason, "no exit");
        (work, ExitOutcome::NoExit { reason })
    }

    /// Build an exit command with the mandatory reason validation applied.
    fn validated(&self, position: &Position, exit_price: f64, raw_reason: String) -> ExitCommand {
        let (reason, corrected_from) = validate_exit_reason(
            &raw_reason,
            exit_price,
            position.tp3_price,
            position.current_stop_loss,
            self.point_size,
        );
        ExitCommand {
            ticket: position.ticket,
            exit_price,
            exit_reason: reason,
            corrected_from,
        }
    }
}

/// Mandatory exit-reason integrity pass.
///
/// Returns the validated reason plus the original label when a rewrite
/// happened. Rules, in order:
///   1. empty or numeric label            -> "Unknown Closure" (warn)
///   2. "TP3" label with price below TP3  -> "Protective Exit" (warn)
///   3. price within one point of the SL  -> "Stop Loss"
pub fn validate_exit_reason(
    raw: &str,
    exit_price: f64,
    tp3_price: f64,
    stop_loss: f64,
    point_size: f64,
) -> (String, Option<String>) {
    let trimmed = raw.trim();

    let mut reason = if trimmed.is_empty() || trimmed.parse::<f64>().is_ok() {
        warn!(
            raw = %raw,
            "exit reason empty or numeric — recorded as Unknown Closure"
        );
        REASON_UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    };

    if reason.contains("TP3") && tp3_price > 0.0 && exit_price < tp3_price {
        warn!(
            exit_price,
            tp3_price,
            original = %reason,
            "TP3 label below TP3 price — rewritten to Protective Exit"
        );
        reason = REASON_PROTECTIVE.to_string();
    }

    if (exit_price - stop_loss).abs() <= point_size && reason != REASON_STOP_LOSS {
        debug!(
            exit_price,
            stop_loss,
            original = %reason,
            "exit price at the stop — relabelled Stop Loss"
        );
        reason = REASON_STOP_LOSS.to_string();
    }

    let corrected_from = if reason != trimmed {
        Some(raw.to_string())
    } else {
        None
    };
    (reason, corrected_from)
}
