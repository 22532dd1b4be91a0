// =============================================================================
// Terminal Port — contract between the core and the broker terminal
// =============================================================================
//
// The engine is broker-facing but adapter-agnostic: everything it needs
// from the trading terminal is expressed by this trait. The concrete
// adapter (terminal IPC, REST bridge, replay harness) lives outside the
// core; tests supply mocks.
//
// Contract notes:
//   - `fetch_bars` returns CLOSED bars only, oldest first, the last element
//     being the most recent closed bar.
//   - Ticket numbers are opaque identifiers; the core never interprets
//     them beyond equality.
//   - Every call is bounded by the adapter's own timeout; a failure maps to
//     `EngineError::TerminalUnavailable` and aborts the tick cleanly.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Bar;

/// Opaque broker ticket.
pub type Ticket = u64;

/// Account summary returned by `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: String,
    pub server: String,
    pub currency: String,
    pub balance: f64,
    pub equity: f64,
}

/// A position as the broker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: Ticket,
    pub symbol: String,
    pub volume: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub open_time: DateTime<Utc>,
}

/// Fill details for a market order or a close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FillInfo {
    pub price: f64,
    pub time: DateTime<Utc>,
}

/// Order side. The engine only ever sends `Buy`, but the port speaks both
/// so adapters can be shared with other tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// The broker terminal as the core sees it.
#[async_trait]
pub trait TerminalPort: Send + Sync {
    /// Establish the session. Credentials come from the environment; the
    /// core passes them through without logging them.
    async fn connect(
        &self,
        login: &str,
        password: &str,
        server: &str,
        terminal_path: &str,
    ) -> Result<AccountInfo>;

    /// Tear the session down. Idempotent.
    async fn disconnect(&self);

    /// Heartbeat. `false` triggers the reconnection protocol.
    async fn ping(&self) -> bool;

    /// The latest `count` CLOSED bars for `symbol`, oldest first.
    async fn fetch_bars(&self, symbol: &str, period_minutes: u32, count: usize)
        -> Result<Vec<Bar>>;

    /// All open positions on the account.
    async fn fetch_open_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Place a market order with protective levels attached.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        volume: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<Ticket>;

    /// Move the stop of an existing position.
    async fn modify_stop(&self, ticket: Ticket, new_stop_loss: f64) -> Result<()>;

    /// Close a position at market.
    async fn close_position(&self, ticket: Ticket) -> Result<FillInfo>;
}
