// =============================================================================
// Error taxonomy for the Aurum trading engine
// =============================================================================
//
// Every failure mode the engine can encounter is a named kind. Recoverable
// I/O errors (history, terminal) are absorbed within a tick; structural
// errors (TP configuration, exit-reason mismatch) change behaviour
// deterministically; persistence failures become sticky past a threshold
// and gate new position opens.
// =============================================================================

use thiserror::Error;

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Fewer usable closed bars than the configured minimum. Recoverable on
    /// the next tick once more history is available.
    #[error("insufficient history: {got} usable bars, {required} required")]
    InsufficientHistory { got: usize, required: usize },

    /// Connection, fetch, or order call against the terminal failed. The
    /// tick aborts without mutating state and the recovery protocol runs.
    #[error("terminal unavailable: {0}")]
    TerminalUnavailable(String),

    /// NaN/non-positive OHLC or otherwise malformed bar data. The tick is
    /// skipped and the condition reported.
    #[error("invalid input data: {0}")]
    InvalidInputData(String),

    /// Risk unit <= 0 or a non-monotonic TP ladder. The position must not
    /// be opened.
    #[error("invalid TP configuration: {0}")]
    TpConfigurationInvalid(String),

    /// An exit price inconsistent with its label (e.g. "TP3 Hit" below the
    /// TP3 level). Auto-corrected by the arbiter; surfaced for audit.
    #[error("exit reason mismatch: {0}")]
    ExitReasonMismatch(String),

    /// A state write failed. In-memory state is kept and the write retried
    /// on the next flush.
    #[error("state persistence failure: {0}")]
    StatePersistenceFailure(String),

    /// Broker position absent from the store (or vice versa) during
    /// startup reconciliation.
    #[error("recovery inconsistency: {0}")]
    RecoveryInconsistency(String),
}

impl EngineError {
    /// Whether the engine may simply retry on the next tick without any
    /// behavioural change.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientHistory { .. }
                | Self::TerminalUnavailable(_)
                | Self::InvalidInputData(_)
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(EngineError::InsufficientHistory { got: 100, required: 220 }.is_recoverable());
        assert!(EngineError::TerminalUnavailable("ping failed".into()).is_recoverable());
        assert!(EngineError::InvalidInputData("NaN close".into()).is_recoverable());
    }

    #[test]
    fn structural_kinds_are_not_recoverable() {
        assert!(!EngineError::TpConfigurationInvalid("risk unit 0".into()).is_recoverable());
        assert!(!EngineError::StatePersistenceFailure("disk full".into()).is_recoverable());
        assert!(!EngineError::RecoveryInconsistency("ticket 7 unknown".into()).is_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let err = EngineError::InsufficientHistory { got: 180, required: 220 };
        let msg = err.to_string();
        assert!(msg.contains("180"));
        assert!(msg.contains("220"));
    }
}
