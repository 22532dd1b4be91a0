// =============================================================================
// Trade Journal — tabular projection of closed trades (SQLite, WAL)
// =============================================================================
//
// Mirrors the closed-trade list of the JSON snapshot into a `trades` table
// for ad-hoc querying. The JSON snapshot is AUTHORITATIVE: whenever the two
// diverge (missing tickets, stray rows, count drift) the table is dropped
// and rebuilt from the snapshot.
//
// The connection runs in WAL journal mode so a crash mid-insert never
// leaves a torn table behind.
// =============================================================================

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::store::ClosedTrade;

/// SQLite-backed journal of closed trades.
pub struct TradeJournal {
    conn: Mutex<Connection>,
}

impl TradeJournal {
    /// Open (or create) the journal database at `path` and ensure the
    /// schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| EngineError::StatePersistenceFailure(format!("open journal: {e}")))?;
        Self::init(conn)
    }

    /// In-memory journal for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::StatePersistenceFailure(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL keeps concurrent readers consistent and survives crashes.
        // In-memory databases silently stay in their default mode.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                ticket      INTEGER NOT NULL,
                entry_time  TEXT,
                exit_time   TEXT,
                entry_price REAL,
                exit_price  REAL,
                profit      REAL,
                volume      REAL,
                exit_reason TEXT NOT NULL,
                tp3_price   REAL
            )",
            [],
        )
        .map_err(|e| EngineError::StatePersistenceFailure(format!("create trades: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one closed trade.
    pub fn insert(&self, trade: &ClosedTrade) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (ticket, entry_time, exit_time, entry_price, exit_price,
                                 profit, volume, exit_reason, tp3_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.ticket as i64,
                trade.entry_time.to_rfc3339(),
                trade.exit_time.to_rfc3339(),
                trade.entry_price,
                trade.exit_price,
                trade.profit,
                trade.volume,
                trade.exit_reason,
                trade.tp3_price_at_close,
            ],
        )
        .map_err(|e| EngineError::StatePersistenceFailure(format!("insert trade: {e}")))?;

        debug!(ticket = trade.ticket, reason = %trade.exit_reason, "trade journaled");
        Ok(())
    }

    /// Number of journaled trades.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .map_err(|e| EngineError::StatePersistenceFailure(format!("count trades: {e}")))?;
        Ok(n as usize)
    }

    /// All journaled tickets, in insertion order.
    pub fn tickets(&self) -> Result<Vec<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT ticket FROM trades ORDER BY rowid")
            .map_err(|e| EngineError::StatePersistenceFailure(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(|e| EngineError::StatePersistenceFailure(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let t = row.map_err(|e| EngineError::StatePersistenceFailure(e.to_string()))?;
            out.push(t as u64);
        }
        Ok(out)
    }

    /// Whether the table mirrors `authoritative` exactly (same multiset of
    /// tickets in the same count).
    pub fn consistent_with(&self, authoritative: &[ClosedTrade]) -> Result<bool> {
        let mut mine = self.tickets()?;
        let mut theirs: Vec<u64> = authoritative.iter().map(|t| t.ticket).collect();
        mine.sort_unstable();
        theirs.sort_unstable();
        Ok(mine == theirs)
    }

    /// Drop everything and repopulate from the authoritative snapshot list.
    pub fn rebuild_from(&self, authoritative: &[ClosedTrade]) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM trades", [])
                .map_err(|e| EngineError::StatePersistenceFailure(format!("clear trades: {e}")))?;
        }
        for trade in authoritative {
            self.insert(trade)?;
        }
        info!(count = authoritative.len(), "trade journal rebuilt from snapshot");
        Ok(())
    }

    /// Reconcile against the authoritative list, rebuilding on divergence.
    pub fn reconcile(&self, authoritative: &[ClosedTrade]) -> Result<()> {
        if self.consistent_with(authoritative)? {
            debug!(count = authoritative.len(), "trade journal consistent");
            return Ok(());
        }
        warn!(
            journal = self.count()?,
            snapshot = authoritative.len(),
            "trade journal diverged from snapshot — rebuilding (JSON is authoritative)"
        );
        self.rebuild_from(authoritative)
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("trades", &self.count().unwrap_or(0))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn trade(ticket: u64, reason: &str) -> ClosedTrade {
        ClosedTrade {
            ticket,
            entry_price: 2000.0,
            exit_price: 2064.0,
            entry_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            exit_time: Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
            profit: 640.0,
            exit_reason: reason.to_string(),
            tp3_price_at_close: 2125.0,
            volume: 0.10,
        }
    }

    #[test]
    fn insert_and_count() {
        let journal = TradeJournal::open_in_memory().unwrap();
        journal.insert(&trade(1, "TP1 Hit")).unwrap();
        journal.insert(&trade(2, "Stop Loss")).unwrap();
        assert_eq!(journal.count().unwrap(), 2);
        assert_eq!(journal.tickets().unwrap(), vec![1, 2]);
    }

    #[test]
    fn consistency_detects_divergence() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let trades = vec![trade(1, "TP3 Hit"), trade(2, "Stop Loss")];
        journal.insert(&trades[0]).unwrap();

        assert!(!journal.consistent_with(&trades).unwrap());
        journal.insert(&trades[1]).unwrap();
        assert!(journal.consistent_with(&trades).unwrap());
    }

    #[test]
    fn reconcile_rebuilds_on_divergence() {
        let journal = TradeJournal::open_in_memory().unwrap();
        journal.insert(&trade(99, "Manual Close")).unwrap(); // stray row

        let authoritative = vec![trade(1, "TP1 Hit"), trade(2, "TP2 Hit")];
        journal.reconcile(&authoritative).unwrap();

        assert_eq!(journal.count().unwrap(), 2);
        assert_eq!(journal.tickets().unwrap(), vec![1, 2]);
    }

    #[test]
    fn reconcile_leaves_consistent_journal_alone() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let authoritative = vec![trade(1, "TP1 Hit")];
        journal.insert(&authoritative[0]).unwrap();
        journal.reconcile(&authoritative).unwrap();
        assert_eq!(journal.count().unwrap(), 1);
    }

    #[test]
    fn file_backed_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.db");

        {
            let journal = TradeJournal::open(&path).unwrap();
            journal.insert(&trade(7, "TP3 Hit")).unwrap();
        }

        let reopened = TradeJournal::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert_eq!(reopened.tickets().unwrap(), vec![7]);
    }
}
