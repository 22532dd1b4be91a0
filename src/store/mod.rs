// =============================================================================
// State Store — authoritative in-memory state with atomic persistence
// =============================================================================
//
// The single source of truth for open positions and closed trades. All
// mutation flows through this API; other components receive clones and
// commit changes back through it, so the position set has exactly one
// owner.
//
// Persistence model:
//   - every mutation schedules a snapshot write (dirty flag)
//   - writes are batched (~5 s) off the hot path via `flush_if_due`
//   - `close_position` and shutdown flush IMMEDIATELY — a closed trade is
//     not observable downstream until its write has landed
//   - repeated write failures become sticky and gate new position opens
//
// A SQLite `trades` projection mirrors the closed-trade list; the JSON
// snapshot stays authoritative and the table is rebuilt on divergence.
// =============================================================================

pub mod journal;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::exit::PostTpDecision;
use crate::ladder::{self, TpLevels};
use crate::store::journal::TradeJournal;
use crate::store::snapshot::SnapshotDocument;
use crate::types::TpState;

/// Exit-reason fallback when an empty or missing label reaches the store.
pub const UNKNOWN_CLOSURE: &str = "Unknown Closure";

fn default_direction() -> i8 {
    1
}

// =============================================================================
// Position
// =============================================================================

/// A live position. Owned exclusively by the store while open; everyone
/// else works on clones and commits through the store API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    /// +1 for long. The engine is long-only; the field is persisted so the
    /// invariant is visible in the snapshot.
    #[serde(default = "default_direction")]
    pub direction: i8,
    pub entry_price: f64,
    pub initial_stop_loss: f64,
    pub current_stop_loss: f64,
    #[serde(default)]
    pub tp1_price: f64,
    #[serde(default)]
    pub tp2_price: f64,
    #[serde(default)]
    pub tp3_price: f64,
    #[serde(default)]
    pub risk_cash: f64,
    #[serde(default)]
    pub tp1_cash: f64,
    #[serde(default)]
    pub tp2_cash: f64,
    #[serde(default)]
    pub tp3_cash: f64,
    pub volume: f64,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub tp_state: TpState,
    #[serde(default)]
    pub tp_state_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bars_held_after_tp1: u32,
    #[serde(default)]
    pub bars_held_after_tp2: u32,
    #[serde(default)]
    pub post_tp1_decision: Option<PostTpDecision>,
    #[serde(default)]
    pub tp1_exit_reason: Option<String>,
    #[serde(default)]
    pub post_tp2_decision: Option<PostTpDecision>,
    #[serde(default)]
    pub tp2_exit_reason: Option<String>,
    #[serde(default)]
    pub trailing_sl_level: Option<f64>,
    #[serde(default)]
    pub trailing_sl_enabled: bool,
    /// Open time of the last closed bar this position was evaluated on.
    /// Persisted so neither an aborted tick nor a restart can double-count
    /// a bar.
    #[serde(default)]
    pub last_evaluated_bar_time: Option<DateTime<Utc>>,
    /// Single take-profit carried by snapshots from before the ladder
    /// existed. Recovery synthesizes the ladder from the risk unit and
    /// ignores this value.
    #[serde(
        default,
        rename = "take_profit",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_take_profit: Option<f64>,
}

impl Position {
    /// Build a fresh long position from a fill and its calculated ladder.
    pub fn new(
        ticket: u64,
        entry_price: f64,
        stop_loss: f64,
        levels: TpLevels,
        volume: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket,
            direction: 1,
            entry_price,
            initial_stop_loss: stop_loss,
            current_stop_loss: stop_loss,
            tp1_price: levels.tp1_price,
            tp2_price: levels.tp2_price,
            tp3_price: levels.tp3_price,
            risk_cash: levels.risk_cash,
            tp1_cash: levels.tp1_cash,
            tp2_cash: levels.tp2_cash,
            tp3_cash: levels.tp3_cash,
            volume,
            entry_time,
            tp_state: TpState::InTrade,
            tp_state_changed_at: None,
            bars_held_after_tp1: 0,
            bars_held_after_tp2: 0,
            post_tp1_decision: None,
            tp1_exit_reason: None,
            post_tp2_decision: None,
            tp2_exit_reason: None,
            trailing_sl_level: None,
            trailing_sl_enabled: false,
            last_evaluated_bar_time: None,
            legacy_take_profit: None,
        }
    }

    /// Whether a usable, strictly monotonic TP ladder is present.
    pub fn has_ladder(&self) -> bool {
        self.tp1_price > 0.0 && self.tp1_price < self.tp2_price && self.tp2_price < self.tp3_price
    }
}

// =============================================================================
// Closed trade
// =============================================================================

/// The immutable record of a finished trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: u64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub profit: f64,
    /// Always a non-empty string from the fixed vocabulary, never a number.
    pub exit_reason: String,
    #[serde(default)]
    pub tp3_price_at_close: f64,
    pub volume: f64,
}

/// Aggregate statistics over the closed-trade history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_profit: f64,
    pub profit_factor: f64,
}

/// What `recover()` found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub open_restored: usize,
    pub closed_restored: usize,
    /// Tickets whose TP ladder was synthesized from the risk unit.
    pub synthesized_ladders: Vec<u64>,
    /// Human-readable descriptions of items that could not be reconciled.
    pub unreconciled: Vec<String>,
}

// =============================================================================
// StateStore
// =============================================================================

struct PersistBackend {
    state_file: PathBuf,
    backup_dir: PathBuf,
    ring_size: usize,
    journal: TradeJournal,
}

/// Thread-safe store owning the open/closed collections.
pub struct StateStore {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<ClosedTrade>>,
    symbol: String,
    contract_size: f64,
    persist: Option<PersistBackend>,
    dirty: AtomicBool,
    last_flush: Mutex<Instant>,
    batch_window: StdDuration,
    persist_failures: AtomicU32,
    max_persist_failures: u32,
}

impl StateStore {
    /// Store with no on-disk backend (tests, dry runs).
    pub fn in_memory(symbol: &str, contract_size: f64) -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            symbol: symbol.to_string(),
            contract_size,
            persist: None,
            dirty: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
            batch_window: StdDuration::from_secs(5),
            persist_failures: AtomicU32::new(0),
            max_persist_failures: 3,
        }
    }

    /// Store with the full snapshot + journal backend from config.
    pub fn with_persistence(config: &EngineConfig) -> Result<Self> {
        let journal = TradeJournal::open(&config.journal_db)?;
        let mut store = Self::in_memory(&config.symbol, config.contract_size);
        store.persist = Some(PersistBackend {
            state_file: PathBuf::from(&config.state_file),
            backup_dir: PathBuf::from(&config.backup_dir),
            ring_size: config.backup_ring_size,
            journal,
        });
        store.batch_window = StdDuration::from_secs(config.persist_batch_seconds);
        store.max_persist_failures = config.max_persist_failures;
        Ok(store)
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Register a freshly filled position. The write is flushed before the
    /// call returns so a crash cannot forget a live position.
    pub fn open_position(&self, position: Position) -> Result<()> {
        if position.direction != 1 {
            return Err(EngineError::TpConfigurationInvalid(format!(
                "only long positions are supported (direction {})",
                position.direction
            )));
        }
        if !position.has_ladder() {
            return Err(EngineError::TpConfigurationInvalid(format!(
                "position {} has no monotonic TP ladder",
                position.ticket
            )));
        }

        {
            let mut open = self.open.write();
            if open.iter().any(|p| p.ticket == position.ticket) {
                return Err(EngineError::RecoveryInconsistency(format!(
                    "duplicate ticket {}",
                    position.ticket
                )));
            }
            info!(
                ticket = position.ticket,
                entry = position.entry_price,
                sl = position.current_stop_loss,
                tp1 = position.tp1_price,
                tp2 = position.tp2_price,
                tp3 = position.tp3_price,
                volume = position.volume,
                "position opened"
            );
            open.push(position);
        }

        self.flush_now()
    }

    /// Commit a ladder-state advance: state, stop, counters, and timestamp
    /// change together or not at all (single write-lock scope).
    pub fn update_position_tp_state(
        &self,
        ticket: u64,
        new_state: TpState,
        new_stop_loss: Option<f64>,
        bars_after_tp1: u32,
        bars_after_tp2: u32,
        tp_state_changed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        {
            let mut open = self.open.write();
            let position = open
                .iter_mut()
                .find(|p| p.ticket == ticket)
                .ok_or_else(|| {
                    EngineError::RecoveryInconsistency(format!("unknown ticket {ticket}"))
                })?;

            position.tp_state = new_state;
            if let Some(sl) = new_stop_loss {
                // Monotone: the stop never moves down.
                if sl > position.current_stop_loss {
                    position.current_stop_loss = sl;
                } else if sl < position.current_stop_loss {
                    debug!(
                        ticket,
                        rejected = sl,
                        kept = position.current_stop_loss,
                        "stop-loss downgrade ignored"
                    );
                }
            }
            position.bars_held_after_tp1 = bars_after_tp1;
            position.bars_held_after_tp2 = bars_after_tp2;
            if tp_state_changed_at.is_some() {
                position.tp_state_changed_at = tp_state_changed_at;
            }
        }

        self.mark_dirty();
        Ok(())
    }

    /// Record post-TP engine output on the position. `None` fields are left
    /// untouched; the trailing level merges monotonically.
    #[allow(clippy::too_many_arguments)]
    pub fn update_tp_exit_metadata(
        &self,
        ticket: u64,
        post_tp1_decision: Option<PostTpDecision>,
        tp1_exit_reason: Option<String>,
        post_tp2_decision: Option<PostTpDecision>,
        tp2_exit_reason: Option<String>,
        trailing_sl_level: Option<f64>,
        trailing_sl_enabled: Option<bool>,
    ) -> Result<()> {
        {
            let mut open = self.open.write();
            let position = open
                .iter_mut()
                .find(|p| p.ticket == ticket)
                .ok_or_else(|| {
                    EngineError::RecoveryInconsistency(format!("unknown ticket {ticket}"))
                })?;

            if let Some(d) = post_tp1_decision {
                position.post_tp1_decision = Some(d);
            }
            if let Some(r) = tp1_exit_reason {
                position.tp1_exit_reason = Some(r);
            }
            if let Some(d) = post_tp2_decision {
                position.post_tp2_decision = Some(d);
            }
            if let Some(r) = tp2_exit_reason {
                position.tp2_exit_reason = Some(r);
            }
            if let Some(level) = trailing_sl_level {
                ladder::merge_trailing(position, level);
            }
            if let Some(enabled) = trailing_sl_enabled {
                position.trailing_sl_enabled = enabled;
            }
        }

        self.mark_dirty();
        Ok(())
    }

    /// Stamp the bar a position was last evaluated on.
    pub fn mark_bar_evaluated(&self, ticket: u64, bar_time: DateTime<Utc>) -> Result<()> {
        {
            let mut open = self.open.write();
            let position = open
                .iter_mut()
                .find(|p| p.ticket == ticket)
                .ok_or_else(|| {
                    EngineError::RecoveryInconsistency(format!("unknown ticket {ticket}"))
                })?;
            position.last_evaluated_bar_time = Some(bar_time);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Move a position into the closed-trade history. Flushes immediately:
    /// the closure is not observable downstream before its write lands.
    pub fn close_position(
        &self,
        ticket: u64,
        exit_price: f64,
        exit_reason: &str,
        exit_time: DateTime<Utc>,
    ) -> Result<ClosedTrade> {
        let reason = if exit_reason.trim().is_empty() {
            warn!(ticket, "empty exit reason reached the store — recorded as Unknown Closure");
            UNKNOWN_CLOSURE.to_string()
        } else {
            exit_reason.to_string()
        };

        let trade = {
            let mut open = self.open.write();
            let idx = open
                .iter()
                .position(|p| p.ticket == ticket)
                .ok_or_else(|| {
                    EngineError::RecoveryInconsistency(format!("unknown ticket {ticket}"))
                })?;
            let position = open.remove(idx);

            let profit = (exit_price - position.entry_price)
                * position.direction as f64
                * position.volume
                * self.contract_size;

            ClosedTrade {
                ticket: position.ticket,
                entry_price: position.entry_price,
                exit_price,
                entry_time: position.entry_time,
                exit_time,
                profit,
                exit_reason: reason,
                tp3_price_at_close: position.tp3_price,
                volume: position.volume,
            }
        };

        info!(
            ticket,
            exit_price,
            profit = format!("{:.2}", trade.profit),
            reason = %trade.exit_reason,
            "position closed"
        );

        self.closed.write().push(trade.clone());

        if let Some(backend) = &self.persist {
            if let Err(e) = backend.journal.insert(&trade) {
                // The JSON snapshot is authoritative; a journal miss is
                // repaired by the next reconcile.
                warn!(ticket, error = %e, "journal insert failed");
            }
        }

        self.flush_now()?;
        Ok(trade)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Snapshot of all currently open positions.
    pub fn get_all_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    /// One open position by ticket.
    pub fn get_position(&self, ticket: u64) -> Option<Position> {
        self.open.read().iter().find(|p| p.ticket == ticket).cloned()
    }

    /// Full closed-trade history, oldest first.
    pub fn get_closed_trades(&self) -> Vec<ClosedTrade> {
        self.closed.read().clone()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    /// Aggregate statistics over closed trades, if any exist.
    pub fn journal_stats(&self) -> Option<JournalStats> {
        let closed = self.closed.read();
        if closed.is_empty() {
            return None;
        }
        let total_trades = closed.len();
        let wins = closed.iter().filter(|t| t.profit > 0.0).count();
        let gross_profit: f64 = closed.iter().map(|t| t.profit).filter(|p| *p > 0.0).sum();
        let gross_loss: f64 = closed
            .iter()
            .map(|t| t.profit)
            .filter(|p| *p < 0.0)
            .map(f64::abs)
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        Some(JournalStats {
            total_trades,
            win_rate: wins as f64 / total_trades as f64,
            total_net_profit: closed.iter().map(|t| t.profit).sum(),
            profit_factor,
        })
    }

    // ── Persistence ─────────────────────────────────────────────────────

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Whether the write path is healthy enough to allow NEW positions.
    /// Exits are always allowed regardless.
    pub fn persistence_healthy(&self) -> bool {
        self.persist_failures.load(Ordering::SeqCst) < self.max_persist_failures
    }

    /// Flush if the batch window elapsed and something changed.
    pub fn flush_if_due(&self) -> Result<()> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.last_flush.lock().elapsed() < self.batch_window {
            return Ok(());
        }
        self.flush_now()
    }

    /// Write the snapshot now. In-memory state is kept on failure and the
    /// write retried on the next flush; repeated failures trip the sticky
    /// gate surfaced by [`persistence_healthy`].
    pub fn flush_now(&self) -> Result<()> {
        let Some(backend) = &self.persist else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        };

        let doc = SnapshotDocument::new(
            self.open.read().clone(),
            self.closed.read().clone(),
            &self.symbol,
        );

        match snapshot::write_snapshot(
            &backend.state_file,
            &backend.backup_dir,
            backend.ring_size,
            doc,
        ) {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                self.persist_failures.store(0, Ordering::SeqCst);
                *self.last_flush.lock() = Instant::now();
                Ok(())
            }
            Err(e) => {
                let failures = self.persist_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    error = %e,
                    consecutive_failures = failures,
                    gating = failures >= self.max_persist_failures,
                    "snapshot flush failed — in-memory state retained"
                );
                Err(e)
            }
        }
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Restore state from disk after a (possibly unclean) shutdown.
    ///
    /// Checksum-validated, with fallback through the backup ring. Legacy
    /// positions carrying only a single `take_profit` get a ladder
    /// synthesized from their risk unit when `synthesize_ladder` is on;
    /// otherwise they are restored unmanaged and reported.
    pub fn recover(
        &self,
        rr_ratios: (f64, f64, f64),
        synthesize_ladder: bool,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let Some(backend) = &self.persist else {
            return Ok(report);
        };

        let Some(doc) = snapshot::load_with_backups(&backend.state_file, &backend.backup_dir)?
        else {
            info!("no persisted state found — starting fresh");
            return Ok(report);
        };

        let mut restored_open = Vec::with_capacity(doc.open_positions.len());
        for mut position in doc.open_positions {
            if !position.has_ladder() {
                if synthesize_ladder {
                    match ladder::calculate_tp_levels(
                        position.entry_price,
                        position.initial_stop_loss,
                        position.volume,
                        rr_ratios,
                        self.contract_size,
                    ) {
                        Ok(levels) => {
                            position.tp1_price = levels.tp1_price;
                            position.tp2_price = levels.tp2_price;
                            position.tp3_price = levels.tp3_price;
                            position.risk_cash = levels.risk_cash;
                            position.tp1_cash = levels.tp1_cash;
                            position.tp2_cash = levels.tp2_cash;
                            position.tp3_cash = levels.tp3_cash;
                            warn!(
                                ticket = position.ticket,
                                tp1 = levels.tp1_price,
                                tp2 = levels.tp2_price,
                                tp3 = levels.tp3_price,
                                "legacy position — TP ladder synthesized from risk unit"
                            );
                            report.synthesized_ladders.push(position.ticket);
                        }
                        Err(e) => {
                            report.unreconciled.push(format!(
                                "ticket {}: ladder synthesis failed ({e})",
                                position.ticket
                            ));
                        }
                    }
                } else {
                    report.unreconciled.push(format!(
                        "ticket {}: no TP ladder and synthesis disabled",
                        position.ticket
                    ));
                }
            }
            restored_open.push(position);
        }

        report.open_restored = restored_open.len();
        report.closed_restored = doc.closed_trades.len();

        *self.open.write() = restored_open;
        *self.closed.write() = doc.closed_trades;

        // The tabular projection follows the JSON truth.
        backend.journal.reconcile(&self.closed.read())?;

        info!(
            open = report.open_restored,
            closed = report.closed_restored,
            synthesized = report.synthesized_ladders.len(),
            unreconciled = report.unreconciled.len(),
            "state recovered"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("open_positions", &self.open.read().len())
            .field("closed_trades", &self.closed.read().len())
            .field("persistent", &self.persist.is_some())
            .finish()
    }
}
