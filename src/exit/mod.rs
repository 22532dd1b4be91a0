// =============================================================================
// Exit Management — post-TP decision engines and the exit arbiter
// =============================================================================
//
// After a take-profit level is touched, the position is not closed blindly:
// a dedicated engine distinguishes micro-pullbacks (noise, keep holding)
// from confirmed failures (exit now) using ATR-scaled retrace thresholds,
// momentum, and regime context. The arbiter owns priority: the stop-loss
// check always runs first and can never be preempted by TP logic.

pub mod arbiter;
pub mod tp1;
pub mod tp2;

use serde::{Deserialize, Serialize};

/// Verdict of a post-TP exit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostTpDecision {
    /// Keep the position; the pullback is noise or momentum supports it.
    Hold,
    /// Ambiguous bar — re-evaluate on the next close before acting.
    WaitNextBar,
    /// Confirmed failure — close the position now.
    ExitTrade,
}

impl std::fmt::Display for PostTpDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "HOLD"),
            Self::WaitNextBar => write!(f, "WAIT_NEXT_BAR"),
            Self::ExitTrade => write!(f, "EXIT_TRADE"),
        }
    }
}

/// Full output of a post-TP engine: the decision, the rule that produced
/// it, and any stop-loss improvement the engine proposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpExitVerdict {
    pub decision: PostTpDecision,
    pub reason: String,
    /// Stop-loss the engine wants (cushioned above breakeven). Merged
    /// monotonically by the caller; never a downgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_stop: Option<f64>,
    /// TP2 engine only: fresh trailing-stop proposal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_proposal: Option<f64>,
}
