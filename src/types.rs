// =============================================================================
// Shared types used across the Aurum trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single closed OHLC bar from the terminal.
///
/// The engine only ever consumes closed bars; the penultimate element of a
/// fetched series is the reference bar for all decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instant the bar opened.
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    /// Check the OHLC ordering invariants: open <= high, low <= close,
    /// low <= open, low <= high. NaN comparisons fail, so a bar carrying
    /// non-finite values is never coherent.
    pub fn is_coherent(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }

    /// Signed candle body (close - open). Positive for a bull bar.
    pub fn body(&self) -> f64 {
        self.close - self.open
    }
}

/// Progress of a position through the take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TpState {
    InTrade,
    Tp1Reached,
    Tp2Reached,
    Tp3Reached,
    Exited,
}

impl Default for TpState {
    fn default() -> Self {
        Self::InTrade
    }
}

impl std::fmt::Display for TpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InTrade => write!(f, "IN_TRADE"),
            Self::Tp1Reached => write!(f, "TP1_REACHED"),
            Self::Tp2Reached => write!(f, "TP2_REACHED"),
            Self::Tp3Reached => write!(f, "TP3_REACHED"),
            Self::Exited => write!(f, "EXITED"),
        }
    }
}

/// Short-horizon momentum classification fed into the post-TP exit engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Momentum {
    Strong,
    Moderate,
    Broken,
    Unknown,
}

impl std::fmt::Display for Momentum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "STRONG"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::Broken => write!(f, "BROKEN"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Swing-structure classification used by the TP2 exit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureState {
    HigherLows,
    LowerLow,
    Unknown,
}

impl std::fmt::Display for StructureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HigherLows => write!(f, "HIGHER_LOWS"),
            Self::LowerLow => write!(f, "LOWER_LOW"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Final verdict of the entry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    EnterLong,
    NoTrade,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnterLong => write!(f, "ENTER_LONG"),
            Self::NoTrade => write!(f, "NO_TRADE"),
        }
    }
}

/// Machine-readable reason a potential entry was rejected. Reported by the
/// first failing gate; absent exactly when the verdict is `EnterLong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    BarNotClosed,
    InvalidPatternStructure,
    NoNecklineBreak,
    ContextNotAligned,
    CooldownActive,
    RegimeConflict,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BarNotClosed => write!(f, "BAR_NOT_CLOSED"),
            Self::InvalidPatternStructure => write!(f, "INVALID_PATTERN_STRUCTURE"),
            Self::NoNecklineBreak => write!(f, "NO_NECKLINE_BREAK"),
            Self::ContextNotAligned => write!(f, "CONTEXT_NOT_ALIGNED"),
            Self::CooldownActive => write!(f, "COOLDOWN_ACTIVE"),
            Self::RegimeConflict => write!(f, "REGIME_CONFLICT"),
        }
    }
}
