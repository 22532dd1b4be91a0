// =============================================================================
// TP Ladder Engine — three-level take-profit calculation and state machine
// =============================================================================
//
// The ladder derives three take-profit levels from the risk unit R:
//
//   R   = entry - stop_loss            (must be strictly positive)
//   TPi = entry + rr_i * R             (strictly monotonic TP1 < TP2 < TP3)
//
// Both conditions are asserted fail-fast: a violation logs a diagnostic and
// yields no levels, and the caller must refuse to open the position.
//
// State machine, evaluated on bar-close only:
//
//   IN_TRADE    --close >= TP1-->  TP1_REACHED   (SL lifted to breakeven)
//   TP1_REACHED --close >= TP2-->  TP2_REACHED   (trailing stop enabled)
//   TP2_REACHED --close >= TP3-->  TP3_REACHED   (flagged for closure)
//
// The stop-loss is monotone: the engine never lowers current_stop_loss.
// Bar counters tick once per bar-close while the position sits in the
// corresponding state.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::store::Position;
use crate::types::TpState;

/// Fixed ATR floor above entry for the trailing-stop seed.
const TRAIL_ENTRY_FLOOR_ATR: f64 = 0.1;

/// The computed ladder for a new position: prices plus their cash values at
/// the position's volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TpLevels {
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub tp3_price: f64,
    pub risk_cash: f64,
    pub tp1_cash: f64,
    pub tp2_cash: f64,
    pub tp3_cash: f64,
}

/// An upward transition taken by [`advance_on_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LadderTransition {
    Tp1Reached,
    Tp2Reached,
    Tp3Reached,
}

/// Calculate the TP ladder for a long position.
///
/// Assertion 1: R = entry - stop_loss > 0. Assertion 2: TP1 < TP2 < TP3
/// strictly. Either failure returns `TpConfigurationInvalid` with a
/// diagnostic; no levels are produced and the position must not be opened.
pub fn calculate_tp_levels(
    entry: f64,
    stop_loss: f64,
    volume: f64,
    rr_ratios: (f64, f64, f64),
    contract_size: f64,
) -> Result<TpLevels> {
    if !entry.is_finite() || !stop_loss.is_finite() {
        let diag = format!("non-finite entry {entry} or stop {stop_loss}");
        error!(diagnostic = %diag, "TP ladder rejected");
        return Err(EngineError::TpConfigurationInvalid(diag));
    }

    let risk_unit = entry - stop_loss;
    if risk_unit <= 0.0 {
        let diag = format!(
            "risk unit not positive: entry {entry:.2} stop {stop_loss:.2} => R {risk_unit:.2}"
        );
        error!(diagnostic = %diag, "TP ladder rejected");
        return Err(EngineError::TpConfigurationInvalid(diag));
    }

    let (rr1, rr2, rr3) = rr_ratios;
    let tp1_price = entry + rr1 * risk_unit;
    let tp2_price = entry + rr2 * risk_unit;
    let tp3_price = entry + rr3 * risk_unit;

    if !(tp1_price < tp2_price && tp2_price < tp3_price) {
        let diag = format!(
            "TP ladder not strictly monotonic: {tp1_price:.2} / {tp2_price:.2} / {tp3_price:.2} (rr {rr1}/{rr2}/{rr3})"
        );
        error!(diagnostic = %diag, "TP ladder rejected");
        return Err(EngineError::TpConfigurationInvalid(diag));
    }

    let cash = |target: f64| (target - entry) * volume * contract_size;
    let levels = TpLevels {
        tp1_price,
        tp2_price,
        tp3_price,
        risk_cash: risk_unit * volume * contract_size,
        tp1_cash: cash(tp1_price),
        tp2_cash: cash(tp2_price),
        tp3_cash: cash(tp3_price),
    };

    debug!(
        entry,
        stop_loss,
        tp1 = format!("{:.2}", levels.tp1_price),
        tp2 = format!("{:.2}", levels.tp2_price),
        tp3 = format!("{:.2}", levels.tp3_price),
        risk_cash = format!("{:.2}", levels.risk_cash),
        "TP ladder calculated"
    );

    Ok(levels)
}

/// Whether the closed bar took out the current stop.
pub fn stop_hit(position: &Position, close: f64) -> bool {
    close <= position.current_stop_loss
}

/// Advance the ladder state machine for one bar-close.
///
/// Mutates the position copy in place: bar counters tick first (the bar
/// closed while the position held its pre-advance state), then every ladder
/// level the close has reached is crossed in order, applying its
/// side-effects. The caller commits the mutated copy atomically via the
/// state store.
pub fn advance_on_close(
    position: &mut Position,
    close: f64,
    atr14: f64,
    swing_low: Option<f64>,
    trailing_offsets: (f64, f64),
    closed_at: chrono::DateTime<chrono::Utc>,
) -> Vec<LadderTransition> {
    // Counters reflect full bars spent in the state, so they tick before
    // any transition this close triggers.
    match position.tp_state {
        TpState::Tp1Reached => position.bars_held_after_tp1 += 1,
        TpState::Tp2Reached => position.bars_held_after_tp2 += 1,
        _ => {}
    }

    let mut transitions = Vec::new();

    if position.tp_state == TpState::InTrade && close >= position.tp1_price {
        position.tp_state = TpState::Tp1Reached;
        position.tp_state_changed_at = Some(closed_at);
        // Breakeven lock: never below entry from here on.
        raise_stop(position, position.entry_price, "breakeven at TP1");
        transitions.push(LadderTransition::Tp1Reached);
        info!(
            ticket = position.ticket,
            close,
            tp1 = position.tp1_price,
            sl = position.current_stop_loss,
            "TP1 reached — stop moved to breakeven"
        );
    }

    if position.tp_state == TpState::Tp1Reached && close >= position.tp2_price {
        position.tp_state = TpState::Tp2Reached;
        position.tp_state_changed_at = Some(closed_at);
        position.trailing_sl_enabled = true;
        let seed =
            trailing_proposal(position.entry_price, close, atr14, swing_low, trailing_offsets);
        merge_trailing(position, seed);
        transitions.push(LadderTransition::Tp2Reached);
        info!(
            ticket = position.ticket,
            close,
            tp2 = position.tp2_price,
            trailing = ?position.trailing_sl_level,
            "TP2 reached — trailing stop enabled"
        );
    }

    if position.tp_state == TpState::Tp2Reached && close >= position.tp3_price {
        position.tp_state = TpState::Tp3Reached;
        position.tp_state_changed_at = Some(closed_at);
        transitions.push(LadderTransition::Tp3Reached);
        info!(
            ticket = position.ticket,
            close,
            tp3 = position.tp3_price,
            "TP3 reached — position flagged for closure"
        );
    }

    transitions
}

/// Trailing proposal for a long: the strongest of the ATR anchor, the
/// swing anchor, and the entry floor.
pub fn trailing_proposal(
    entry_price: f64,
    current_price: f64,
    atr14: f64,
    swing_low: Option<f64>,
    trailing_offsets: (f64, f64),
) -> f64 {
    let (atr_offset, swing_offset) = trailing_offsets;
    let atr_sl = current_price - atr_offset * atr14;
    let entry_floor = entry_price + TRAIL_ENTRY_FLOOR_ATR * atr14;

    match swing_low {
        Some(swing) => atr_sl.max(swing - swing_offset * atr14).max(entry_floor),
        None => atr_sl.max(entry_floor),
    }
}

/// Monotone merge of a trailing proposal: proposals below the current stop
/// are ignored, accepted ones lift both the trailing level and the stop.
pub fn merge_trailing(position: &mut Position, proposal: f64) -> bool {
    if !proposal.is_finite() {
        return false;
    }
    if proposal <= position.current_stop_loss {
        debug!(
            ticket = position.ticket,
            proposal,
            current_sl = position.current_stop_loss,
            "trailing proposal below current stop — ignored"
        );
        // Still record the level if none was ever seeded.
        if position.trailing_sl_level.is_none() {
            position.trailing_sl_level = Some(position.current_stop_loss);
        }
        return false;
    }
    position.trailing_sl_level = Some(proposal);
    position.current_stop_loss = proposal;
    true
}

/// Lift the stop to `candidate` if that is an improvement. The stop never
/// moves down.
fn raise_stop(position: &mut Position, candidate: f64, context: &str) {
    if candidate > position.current_stop_loss {
        debug!(
            ticket = position.ticket,
            from = position.current_stop_loss,
            to = candidate,
            context,
            "stop raised"
        );
        position.current_stop_loss = candidate;
    }
}
