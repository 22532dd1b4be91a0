// =============================================================================
// Controller — the per-bar decision loop
// =============================================================================
//
// Single cooperative loop driving the whole engine:
//
//   tick:  verify connection -> fetch closed bars -> indicators / pattern /
//          regime -> exits (stop-loss strictly first) -> entries -> persist
//          -> publish UI events
//
// Bar-close is the ONLY decision epoch: a full decision pass runs when a
// new closed bar appears, and each position is evaluated exactly once per
// closed bar (tracked per ticket, persisted, so neither an aborted tick nor
// a restart can double-count). Between bar closes the loop only watches the
// connection, detects externally closed positions, and flushes batched
// writes.
//
// Connection loss triggers exponential-backoff reconnects (3 s, 6 s, 9 s);
// while disconnected no new trades are initiated and all open positions
// are logged. A sticky persistence failure also gates new entries; exits
// are never gated.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, EngineConfig};
use crate::entry::{EntryEngine, EntryInput, EntryProposal};
use crate::error::{EngineError, Result};
use crate::events::{TpLevel, UiEvent, UiEventBus};
use crate::exit::arbiter::{ExitArbiter, ExitCommand, ExitOutcome, TickContext};
use crate::guard;
use crate::indicators::{self, IndicatorSnapshot};
use crate::ladder;
use crate::momentum;
use crate::pattern;
use crate::regime;
use crate::store::{Position, StateStore};
use crate::terminal::{AccountInfo, OrderSide, TerminalPort};
use crate::types::Verdict;

/// Reconnect backoff schedule in seconds.
const RECONNECT_BACKOFF_SECS: [u64; 3] = [3, 6, 9];

/// Bars scanned for the structure classifier.
const STRUCTURE_LOOKBACK: usize = 60;

/// Bars scanned for the trailing-stop swing anchor.
const SWING_LOOKBACK: usize = 10;

/// The engine controller. Owns nothing shared except through `Arc`s handed
/// in at construction — no globals anywhere.
pub struct Controller<T: TerminalPort> {
    terminal: Arc<T>,
    store: Arc<StateStore>,
    config: EngineConfig,
    credentials: Credentials,
    events: UiEventBus,
    entry_engine: EntryEngine,
    arbiter: ExitArbiter,

    account: Option<AccountInfo>,
    connected: bool,
    last_entry_time: Option<DateTime<Utc>>,
    /// Open time of the last closed bar a full decision pass completed on.
    last_processed_bar: Option<DateTime<Utc>>,
    last_heartbeat: Instant,
}

impl<T: TerminalPort> Controller<T> {
    pub fn new(
        terminal: Arc<T>,
        store: Arc<StateStore>,
        config: EngineConfig,
        credentials: Credentials,
        events: UiEventBus,
    ) -> Self {
        let entry_engine = EntryEngine::from_config(&config);
        let arbiter = ExitArbiter::new(config.point_size, config.trailing_offsets);
        Self {
            terminal,
            store,
            config,
            credentials,
            events,
            entry_engine,
            arbiter,
            account: None,
            connected: false,
            last_entry_time: None,
            last_processed_bar: None,
            last_heartbeat: Instant::now(),
        }
    }

    // ── Startup ─────────────────────────────────────────────────────────

    /// Connect, recover persisted state, and reconcile it against the
    /// broker's open-position list.
    pub async fn startup(&mut self) -> Result<()> {
        let account = self
            .terminal
            .connect(
                &self.credentials.login,
                &self.credentials.password,
                &self.credentials.server,
                &self.credentials.terminal_path,
            )
            .await?;
        info!(balance = account.balance, equity = account.equity, "terminal connected");
        self.account = Some(account);
        self.connected = true;
        self.events.publish(UiEvent::ConnectionStatus {
            connected: true,
            detail: "terminal session established".into(),
        });

        let report = self
            .store
            .recover(self.config.rr_ratios, self.config.recovery_synthesize_ladder)?;
        for item in &report.unreconciled {
            warn!(item = %item, "recovery item needs operator attention");
        }

        self.reconcile_with_broker(true).await?;
        Ok(())
    }

    /// Compare the store against the broker's open positions.
    ///
    /// A store position absent at the broker is closed with "Recovery Mode"
    /// during startup and "Closed Externally" mid-run. Broker positions
    /// unknown to the store are never adopted — only surfaced.
    async fn reconcile_with_broker(&mut self, startup: bool) -> Result<()> {
        let broker_positions = self.terminal.fetch_open_positions().await?;
        let broker_tickets: HashSet<u64> =
            broker_positions.iter().map(|p| p.ticket).collect();

        let reason = if startup { "Recovery Mode" } else { "Closed Externally" };
        for position in self.store.get_all_positions() {
            if !broker_tickets.contains(&position.ticket) {
                warn!(
                    ticket = position.ticket,
                    reason,
                    "position missing at broker — closing in store"
                );
                let trade = self.store.close_position(
                    position.ticket,
                    position.entry_price,
                    reason,
                    Utc::now(),
                )?;
                self.events.publish(UiEvent::PositionClosed {
                    trade,
                    stats: self.store.journal_stats(),
                });
            }
        }

        let known: HashSet<u64> = self
            .store
            .get_all_positions()
            .iter()
            .map(|p| p.ticket)
            .collect();
        for broker_pos in &broker_positions {
            if broker_pos.symbol == self.config.symbol && !known.contains(&broker_pos.ticket) {
                let item = format!(
                    "broker position {} ({} {:.2} lots) unknown to the store",
                    broker_pos.ticket, broker_pos.symbol, broker_pos.volume
                );
                if self.config.adopt_external_positions {
                    error!(item = %item, "unadopted broker position (adoption not supported)");
                } else {
                    warn!(item = %item, "unreconciled broker position");
                }
            }
        }
        Ok(())
    }

    // ── Main loop ───────────────────────────────────────────────────────

    /// Run until the shutdown signal flips. Flushes state and disconnects
    /// on the way out.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(StdDuration::from_secs(self.config.tick_seconds));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        if e.is_recoverable() {
                            warn!(error = %e, "tick aborted — retrying next tick");
                        } else {
                            error!(error = %e, "tick failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutdown: flushing state and disconnecting");
        if let Err(e) = self.store.flush_now() {
            error!(error = %e, "final flush failed — state may lag one batch");
        }
        self.terminal.disconnect().await;
        self.events.publish(UiEvent::ConnectionStatus {
            connected: false,
            detail: "graceful shutdown".into(),
        });
    }

    /// One controller tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        // ── 1. Connection watchdog ──────────────────────────────────────
        if !self.ensure_connection().await {
            // No decisions while disconnected; open positions are logged
            // so the operator sees what is at risk.
            for position in self.store.get_all_positions() {
                warn!(
                    ticket = position.ticket,
                    state = %position.tp_state,
                    sl = position.current_stop_loss,
                    "open position during connection loss"
                );
            }
            return Err(EngineError::TerminalUnavailable(
                "connection down after backoff".into(),
            ));
        }

        self.heartbeat();

        // Positions that vanished at the broker close as external.
        self.reconcile_with_broker(false).await?;

        // ── 2. Fetch closed bars ────────────────────────────────────────
        let bars = self
            .terminal
            .fetch_bars(
                &self.config.symbol,
                self.config.period_minutes,
                self.config.bars_to_fetch,
            )
            .await?;

        let usable: Vec<_> = bars.into_iter().filter(|b| b.is_coherent()).collect();
        if usable.len() < self.config.min_bars_required {
            return Err(EngineError::InsufficientHistory {
                got: usable.len(),
                required: self.config.min_bars_required,
            });
        }

        let reference = usable.last().expect("non-empty after length check");
        if let Err(reason) = guard::validate(reference, self.config.bar_period(), now) {
            return Err(EngineError::InvalidInputData(reason));
        }

        // Bar-close is the only decision epoch.
        if self.last_processed_bar == Some(reference.open_time) {
            self.store.flush_if_due()?;
            return Ok(());
        }

        // ── 3. Indicators, pattern, regime ──────────────────────────────
        let snapshot = indicators::compute(&usable)?;
        let regime_snap = regime::evaluate(reference.close, snapshot.ema50, snapshot.ema200);
        let detected =
            pattern::detect(&usable, snapshot.atr14, self.config.pip_size);

        self.events.publish(UiEvent::MarketData {
            symbol: self.config.symbol.clone(),
            close: reference.close,
            ema50: snapshot.ema50,
            ema200: snapshot.ema200,
            atr14: snapshot.atr14,
            bar_time: reference.open_time,
        });
        self.events.publish(UiEvent::Regime(regime_snap));

        // ── 4. Exits before entries ─────────────────────────────────────
        self.evaluate_exits(&usable, &snapshot, &regime_snap).await?;

        // ── 5. Entry ────────────────────────────────────────────────────
        self.evaluate_entry_and_open(&usable, &snapshot, &regime_snap, detected.as_ref(), now)
            .await?;

        // ── 6. Persist + mark the bar done ──────────────────────────────
        self.store.flush_if_due()?;
        self.last_processed_bar = Some(reference.open_time);
        Ok(())
    }

    // ── Connection management ───────────────────────────────────────────

    /// Ping; on failure walk the 3/6/9 s backoff ladder once.
    async fn ensure_connection(&mut self) -> bool {
        if self.terminal.ping().await {
            if !self.connected {
                self.connected = true;
                self.events.publish(UiEvent::ConnectionStatus {
                    connected: true,
                    detail: "connection restored".into(),
                });
            }
            return true;
        }

        if self.connected {
            self.connected = false;
            warn!("terminal ping failed — entering reconnect protocol");
            self.events.publish(UiEvent::ConnectionStatus {
                connected: false,
                detail: "terminal unreachable".into(),
            });
        }

        for (attempt, secs) in RECONNECT_BACKOFF_SECS.iter().enumerate() {
            tokio::time::sleep(StdDuration::from_secs(*secs)).await;
            info!(attempt = attempt + 1, delay_secs = *secs, "reconnection attempt");
            match self
                .terminal
                .connect(
                    &self.credentials.login,
                    &self.credentials.password,
                    &self.credentials.server,
                    &self.credentials.terminal_path,
                )
                .await
            {
                Ok(account) => {
                    info!("terminal reconnected");
                    self.account = Some(account);
                    self.connected = true;
                    self.events.publish(UiEvent::ConnectionStatus {
                        connected: true,
                        detail: "reconnected".into(),
                    });
                    return true;
                }
                Err(e) => warn!(error = %e, "reconnection attempt failed"),
            }
        }
        false
    }

    /// Emit the periodic connection heartbeat on the UI cadence.
    fn heartbeat(&mut self) {
        if self.last_heartbeat.elapsed()
            >= StdDuration::from_secs(self.config.ui_refresh_seconds)
        {
            self.last_heartbeat = Instant::now();
            self.events.publish(UiEvent::ConnectionStatus {
                connected: self.connected,
                detail: format!("{} open position(s)", self.store.open_count()),
            });
        }
    }

    // ── Exit side ───────────────────────────────────────────────────────

    async fn evaluate_exits(
        &mut self,
        bars: &[crate::types::Bar],
        snapshot: &IndicatorSnapshot,
        regime_snap: &regime::RegimeSnapshot,
    ) -> Result<()> {
        let reference = bars.last().expect("bars checked non-empty");
        let structure_window = &bars[bars.len().saturating_sub(STRUCTURE_LOOKBACK)..];
        let ctx = TickContext {
            closed_bars: bars,
            indicators: snapshot,
            regime: regime_snap,
            momentum: momentum::classify(bars, snapshot.atr14),
            structure: pattern::classify_structure(structure_window),
            swing_low: pattern::swing_low(bars, SWING_LOOKBACK),
            closed_at: reference.open_time + self.config.bar_period(),
        };

        for position in self.store.get_all_positions() {
            // Exactly-once per closed bar, surviving aborted ticks and
            // restarts.
            if position.last_evaluated_bar_time == Some(reference.open_time) {
                debug!(ticket = position.ticket, "bar already evaluated for position");
                continue;
            }

            let (work, outcome) = self.arbiter.evaluate_exit(&position, &ctx);

            match outcome {
                ExitOutcome::Exit(command) => {
                    self.apply_exit(command).await?;
                }
                ExitOutcome::NoExit { ref reason } => {
                    self.commit_position_progress(&position, &work, reference.open_time)?;
                    debug!(ticket = position.ticket, reason = %reason, "position held");

                    // Broker-side stop follows any in-core improvement.
                    if work.current_stop_loss > position.current_stop_loss {
                        self.terminal
                            .modify_stop(position.ticket, work.current_stop_loss)
                            .await?;
                    }

                    if let (Some(decision), Some(reason_text)) =
                        (work.post_tp2_decision, work.tp2_exit_reason.clone())
                    {
                        if work.post_tp2_decision != position.post_tp2_decision
                            || work.tp2_exit_reason != position.tp2_exit_reason
                        {
                            self.events.publish(UiEvent::TpDecision {
                                ticket: work.ticket,
                                level: TpLevel::Tp2,
                                decision,
                                reason: reason_text,
                            });
                        }
                    } else if let (Some(decision), Some(reason_text)) =
                        (work.post_tp1_decision, work.tp1_exit_reason.clone())
                    {
                        if work.post_tp1_decision != position.post_tp1_decision
                            || work.tp1_exit_reason != position.tp1_exit_reason
                        {
                            self.events.publish(UiEvent::TpDecision {
                                ticket: work.ticket,
                                level: TpLevel::Tp1,
                                decision,
                                reason: reason_text,
                            });
                        }
                    }

                    self.events.publish(UiEvent::TpLadder {
                        ticket: work.ticket,
                        tp_state: work.tp_state,
                        tp1_price: work.tp1_price,
                        tp2_price: work.tp2_price,
                        tp3_price: work.tp3_price,
                        current_stop_loss: work.current_stop_loss,
                        trailing_sl_level: work.trailing_sl_level,
                    });
                }
            }
        }
        Ok(())
    }

    /// Commit the arbiter's mutated copy through the store API.
    fn commit_position_progress(
        &self,
        original: &Position,
        work: &Position,
        bar_time: DateTime<Utc>,
    ) -> Result<()> {
        self.store.update_position_tp_state(
            work.ticket,
            work.tp_state,
            Some(work.current_stop_loss),
            work.bars_held_after_tp1,
            work.bars_held_after_tp2,
            work.tp_state_changed_at,
        )?;
        if work.post_tp1_decision != original.post_tp1_decision
            || work.post_tp2_decision != original.post_tp2_decision
            || work.tp1_exit_reason != original.tp1_exit_reason
            || work.tp2_exit_reason != original.tp2_exit_reason
            || work.trailing_sl_level != original.trailing_sl_level
            || work.trailing_sl_enabled != original.trailing_sl_enabled
        {
            self.store.update_tp_exit_metadata(
                work.ticket,
                work.post_tp1_decision,
                work.tp1_exit_reason.clone(),
                work.post_tp2_decision,
                work.tp2_exit_reason.clone(),
                work.trailing_sl_level,
                Some(work.trailing_sl_enabled),
            )?;
        }
        self.store.mark_bar_evaluated(work.ticket, bar_time)?;
        Ok(())
    }

    /// Execute a validated exit: broker first, then the store (the closure
    /// flush happens inside `close_position`).
    async fn apply_exit(&mut self, command: ExitCommand) -> Result<()> {
        if let Some(ref original) = command.corrected_from {
            warn!(
                ticket = command.ticket,
                original = %original,
                corrected = %command.exit_reason,
                "exit reason corrected before persistence"
            );
        }

        let fill = self.terminal.close_position(command.ticket).await?;
        let exit_price = if fill.price > 0.0 {
            fill.price
        } else {
            command.exit_price
        };

        let trade = self.store.close_position(
            command.ticket,
            exit_price,
            &command.exit_reason,
            fill.time,
        )?;

        info!(
            ticket = trade.ticket,
            profit = format!("{:.2}", trade.profit),
            reason = %trade.exit_reason,
            "exit applied"
        );
        self.events.publish(UiEvent::PositionClosed {
            trade,
            stats: self.store.journal_stats(),
        });
        Ok(())
    }

    // ── Entry side ──────────────────────────────────────────────────────

    async fn evaluate_entry_and_open(
        &mut self,
        bars: &[crate::types::Bar],
        snapshot: &IndicatorSnapshot,
        regime_snap: &regime::RegimeSnapshot,
        detected: Option<&pattern::Pattern>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.store.open_count() >= self.config.max_open_positions {
            debug!(
                open = self.store.open_count(),
                limit = self.config.max_open_positions,
                "pyramid limit reached — no entry evaluation"
            );
            return Ok(());
        }
        if !self.store.persistence_healthy() {
            warn!("persistence degraded — new entries gated");
            return Ok(());
        }

        let balance = self.account.as_ref().map(|a| a.balance).unwrap_or(0.0);
        let decision = self.entry_engine.evaluate_entry(&EntryInput {
            closed_bars: bars,
            pattern: detected,
            indicators: snapshot,
            regime: regime_snap,
            last_entry_time: self.last_entry_time,
            now,
            account_balance: balance,
        });

        self.events
            .publish(UiEvent::EntryConditions(decision.clone()));

        if decision.verdict != Verdict::EnterLong {
            return Ok(());
        }
        let proposal = decision
            .proposal
            .expect("EnterLong always carries a proposal");

        self.open_from_proposal(proposal, now).await
    }

    /// Place the order, poll the fill, compute the ladder, and commit the
    /// new position. An invalid ladder refuses the position BEFORE any
    /// order reaches the broker.
    async fn open_from_proposal(
        &mut self,
        proposal: EntryProposal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Fail-fast ladder check on the proposed prices (scenario: R = 0).
        let provisional = ladder::calculate_tp_levels(
            proposal.entry_price,
            proposal.stop_loss,
            proposal.volume,
            self.config.rr_ratios,
            self.config.contract_size,
        )?;

        let ticket = self
            .terminal
            .place_market_order(
                &self.config.symbol,
                OrderSide::Buy,
                proposal.volume,
                proposal.stop_loss,
                provisional.tp3_price,
            )
            .await?;

        // Poll the fill: the broker's own view of the entry wins.
        let fill_price = self
            .terminal
            .fetch_open_positions()
            .await?
            .iter()
            .find(|p| p.ticket == ticket)
            .map(|p| p.entry_price)
            .unwrap_or(proposal.entry_price);

        // Recompute the ladder from the actual fill, keeping the same risk
        // distance below it.
        let stop_loss = fill_price - proposal.risk_unit;
        let levels = ladder::calculate_tp_levels(
            fill_price,
            stop_loss,
            proposal.volume,
            self.config.rr_ratios,
            self.config.contract_size,
        )?;

        let position = Position::new(ticket, fill_price, stop_loss, levels, proposal.volume, now);
        let snapshot_for_event = position.clone();
        self.store.open_position(position)?;
        self.last_entry_time = Some(now);

        self.events
            .publish(UiEvent::PositionOpened(snapshot_for_event.clone()));
        self.events.publish(UiEvent::TpLadder {
            ticket,
            tp_state: snapshot_for_event.tp_state,
            tp1_price: levels.tp1_price,
            tp2_price: levels.tp2_price,
            tp3_price: levels.tp3_price,
            current_stop_loss: stop_loss,
            trailing_sl_level: None,
        });

        info!(
            ticket,
            fill_price,
            stop_loss,
            tp1 = levels.tp1_price,
            tp2 = levels.tp2_price,
            tp3 = levels.tp3_price,
            "position opened from proposal"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ClosedTrade;
    use crate::terminal::{BrokerPosition, FillInfo, Ticket};
    use crate::types::{Bar, TpState};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;

    // ── Mock terminal ───────────────────────────────────────────────────

    #[derive(Default)]
    struct MockState {
        bars: Vec<Bar>,
        broker_positions: Vec<BrokerPosition>,
        ping_ok: bool,
        next_ticket: Ticket,
        placed_orders: Vec<(OrderSide, f64, f64, f64)>,
        closed_tickets: Vec<Ticket>,
        modified_stops: Vec<(Ticket, f64)>,
    }

    struct MockTerminal {
        state: Mutex<MockState>,
    }

    impl MockTerminal {
        fn new(bars: Vec<Bar>) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockState {
                    bars,
                    ping_ok: true,
                    next_ticket: 100,
                    ..Default::default()
                }),
            })
        }

        fn add_broker_position(&self, ticket: Ticket, entry_price: f64) {
            self.state.lock().broker_positions.push(BrokerPosition {
                ticket,
                symbol: "XAUUSD".into(),
                volume: 0.10,
                entry_price,
                stop_loss: 0.0,
                take_profit: 0.0,
                open_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            });
        }
    }

    #[async_trait]
    impl TerminalPort for MockTerminal {
        async fn connect(
            &self,
            _login: &str,
            _password: &str,
            _server: &str,
            _terminal_path: &str,
        ) -> Result<AccountInfo> {
            Ok(AccountInfo {
                login: "mock".into(),
                server: "mock".into(),
                currency: "USD".into(),
                balance: 10_000.0,
                equity: 10_000.0,
            })
        }

        async fn disconnect(&self) {}

        async fn ping(&self) -> bool {
            self.state.lock().ping_ok
        }

        async fn fetch_bars(
            &self,
            _symbol: &str,
            _period_minutes: u32,
            count: usize,
        ) -> Result<Vec<Bar>> {
            let state = self.state.lock();
            let start = state.bars.len().saturating_sub(count);
            Ok(state.bars[start..].to_vec())
        }

        async fn fetch_open_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.state.lock().broker_positions.clone())
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            volume: f64,
            stop_loss: f64,
            take_profit: f64,
        ) -> Result<Ticket> {
            let mut state = self.state.lock();
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let entry_price = state.bars.last().map(|b| b.close).unwrap_or(0.0);
            state
                .placed_orders
                .push((side, volume, stop_loss, take_profit));
            state.broker_positions.push(BrokerPosition {
                ticket,
                symbol: symbol.into(),
                volume,
                entry_price,
                stop_loss,
                take_profit,
                open_time: Utc::now(),
            });
            Ok(ticket)
        }

        async fn modify_stop(&self, ticket: Ticket, new_stop_loss: f64) -> Result<()> {
            self.state.lock().modified_stops.push((ticket, new_stop_loss));
            Ok(())
        }

        async fn close_position(&self, ticket: Ticket) -> Result<FillInfo> {
            let mut state = self.state.lock();
            state.closed_tickets.push(ticket);
            state.broker_positions.retain(|p| p.ticket != ticket);
            let price = state.bars.last().map(|b| b.close).unwrap_or(0.0);
            Ok(FillInfo {
                price,
                time: Utc::now(),
            })
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────────

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    /// Hourly bars from a mid-price path, the last bar closing two hours
    /// before `now` so the guard accepts it.
    fn bars_from_mids(mids: &[f64]) -> Vec<Bar> {
        let n = mids.len();
        mids.iter()
            .enumerate()
            .map(|(i, &mid)| Bar {
                open_time: now() - Duration::hours((n - i + 1) as i64),
                open: mid - 0.5,
                high: mid + 1.5,
                low: mid - 1.5,
                close: mid + 0.5,
            })
            .collect()
    }

    /// 300 coherent bars drifting around 2000.
    fn flat_market() -> Vec<Bar> {
        let mids: Vec<f64> = (0..300)
            .map(|i| 2000.0 + (i as f64 * 0.15).sin() * 3.0)
            .collect();
        bars_from_mids(&mids)
    }

    /// A rising market ending in a fresh double-bottom breakout on the
    /// final closed bar.
    fn breakout_market() -> Vec<Bar> {
        let mut mids: Vec<f64> = (0..280)
            .map(|i| 1900.0 + i as f64 * (120.0 / 280.0))
            .collect();
        // W: descent, first low, rebound to the neckline (2034), second
        // equal low, recovery below the neckline, breakout on the LAST bar.
        mids.extend_from_slice(&[2016.0, 2012.0, 2008.0, 2004.0]);
        mids.extend_from_slice(&[2000.0, 1998.0, 1999.5, 2001.0]);
        mids.extend_from_slice(&[2010.0, 2020.0, 2034.0, 2028.0, 2018.0, 2008.0]);
        mids.extend_from_slice(&[2002.0, 1998.1, 1999.5, 2002.0]);
        mids.extend_from_slice(&[2010.0, 2020.0, 2030.0, 2042.0]);
        bars_from_mids(&mids)
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
    }

    fn creds() -> Credentials {
        Credentials {
            login: String::new(),
            password: String::new(),
            server: String::new(),
            terminal_path: String::new(),
        }
    }

    fn store() -> Arc<StateStore> {
        Arc::new(StateStore::in_memory("XAUUSD", 100.0))
    }

    fn seeded_position(ticket: u64, entry: f64, stop: f64) -> Position {
        let levels =
            ladder::calculate_tp_levels(entry, stop, 0.10, (1.4, 1.9, 2.5), 100.0).unwrap();
        Position::new(ticket, entry, stop, levels, 0.10, now() - Duration::days(1))
    }

    fn controller(
        terminal: Arc<MockTerminal>,
        store: Arc<StateStore>,
    ) -> (Controller<MockTerminal>, tokio::sync::mpsc::UnboundedReceiver<UiEvent>) {
        let (bus, rx) = UiEventBus::channel();
        (
            Controller::new(terminal, store, test_config(), creds(), bus),
            rx,
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ── Startup / recovery ──────────────────────────────────────────────

    #[tokio::test]
    async fn startup_closes_missing_position_as_recovery_mode() {
        let terminal = MockTerminal::new(flat_market());
        let store = store();
        store.open_position(seeded_position(5, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal, store.clone());
        controller.startup().await.unwrap();

        assert_eq!(store.open_count(), 0);
        let closed = store.get_closed_trades();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, "Recovery Mode");
    }

    #[tokio::test]
    async fn startup_keeps_position_present_at_broker() {
        let terminal = MockTerminal::new(flat_market());
        terminal.add_broker_position(5, 2000.0);
        let store = store();
        store.open_position(seeded_position(5, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal, store.clone());
        controller.startup().await.unwrap();

        assert_eq!(store.open_count(), 1);
        assert!(store.get_closed_trades().is_empty());
    }

    #[tokio::test]
    async fn mid_run_disappearance_closes_externally() {
        let terminal = MockTerminal::new(flat_market());
        let store = store();
        store.open_position(seeded_position(6, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal, store.clone());
        controller.connected = true;
        controller.account = Some(AccountInfo {
            login: "t".into(),
            server: "t".into(),
            currency: "USD".into(),
            balance: 10_000.0,
            equity: 10_000.0,
        });

        controller.tick(now()).await.unwrap();

        let closed = store.get_closed_trades();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, "Closed Externally");
    }

    // ── Exit flow ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_loss_exit_flows_through_broker_then_store() {
        let mut bars = flat_market();
        // Final bar collapses through the 1950 stop.
        let last_open = bars.last().unwrap().open_time;
        *bars.last_mut().unwrap() = Bar {
            open_time: last_open,
            open: 1960.0,
            high: 1961.0,
            low: 1938.0,
            close: 1940.0,
        };

        let terminal = MockTerminal::new(bars);
        terminal.add_broker_position(7, 2000.0);
        let store = store();
        store.open_position(seeded_position(7, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal.clone(), store.clone());
        controller.connected = true;
        controller.account = Some(AccountInfo {
            login: "t".into(),
            server: "t".into(),
            currency: "USD".into(),
            balance: 10_000.0,
            equity: 10_000.0,
        });

        controller.tick(now()).await.unwrap();

        // Broker close first, then the store record.
        assert_eq!(terminal.state.lock().closed_tickets, vec![7]);
        let closed = store.get_closed_trades();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, "Stop Loss");
        assert!((closed[0].exit_price - 1940.0).abs() < 1e-9);
        // Loss: (1940 - 2000) * 0.10 * 100 = -600.
        assert!((closed[0].profit + 600.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn same_closed_bar_is_never_evaluated_twice() {
        let mut bars = flat_market();
        // Final close sits just above TP1 (2070) so the position advances
        // and then holds.
        let last_open = bars.last().unwrap().open_time;
        *bars.last_mut().unwrap() = Bar {
            open_time: last_open,
            open: 2068.0,
            high: 2073.0,
            low: 2067.0,
            close: 2071.0,
        };

        let terminal = MockTerminal::new(bars);
        terminal.add_broker_position(8, 2000.0);
        let store = store();
        store.open_position(seeded_position(8, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal.clone(), store.clone());
        controller.connected = true;
        controller.account = Some(AccountInfo {
            login: "t".into(),
            server: "t".into(),
            currency: "USD".into(),
            balance: 10_000.0,
            equity: 10_000.0,
        });

        controller.tick(now()).await.unwrap();
        let after_first = store.get_position(8).unwrap();
        assert_eq!(after_first.tp_state, TpState::Tp1Reached);
        let counter_after_first = after_first.bars_held_after_tp1;
        // The breakeven-plus-cushion stop was pushed to the broker.
        let stops = terminal.state.lock().modified_stops.clone();
        assert_eq!(stops.len(), 1);
        assert!(stops[0].1 >= 2000.0);

        // Replaying the identical bar must not advance counters again.
        controller.tick(now()).await.unwrap();
        let after_second = store.get_position(8).unwrap();
        assert_eq!(after_second.bars_held_after_tp1, counter_after_first);
        assert_eq!(after_second.tp_state, TpState::Tp1Reached);
        assert_eq!(terminal.state.lock().modified_stops.len(), 1);
    }

    // ── Entry flow ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn breakout_market_opens_a_position() {
        let terminal = MockTerminal::new(breakout_market());
        let store = store();

        let (mut controller, mut rx) = controller(terminal.clone(), store.clone());
        controller.connected = true;
        controller.account = Some(AccountInfo {
            login: "t".into(),
            server: "t".into(),
            currency: "USD".into(),
            balance: 10_000.0,
            equity: 10_000.0,
        });

        controller.tick(now()).await.unwrap();

        assert_eq!(store.open_count(), 1, "expected an opened position");
        let placed = terminal.state.lock().placed_orders.clone();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].0, OrderSide::Buy);
        assert!(controller.last_entry_time.is_some());

        let position = &store.get_all_positions()[0];
        assert!(position.has_ladder());
        assert!(position.tp1_price < position.tp2_price);
        assert!(position.tp2_price < position.tp3_price);
        assert!(position.current_stop_loss < position.entry_price);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, UiEvent::PositionOpened(_))));
        assert!(events.iter().any(|e| matches!(e, UiEvent::TpLadder { .. })));
    }

    #[tokio::test]
    async fn pyramid_limit_blocks_second_entry() {
        let terminal = MockTerminal::new(breakout_market());
        terminal.add_broker_position(9, 2000.0);
        let store = store();
        store.open_position(seeded_position(9, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal.clone(), store.clone());
        controller.connected = true;
        controller.account = Some(AccountInfo {
            login: "t".into(),
            server: "t".into(),
            currency: "USD".into(),
            balance: 10_000.0,
            equity: 10_000.0,
        });

        controller.tick(now()).await.unwrap();

        // The breakout is valid but the symbol is already at its limit.
        assert!(terminal.state.lock().placed_orders.is_empty());
        assert_eq!(store.open_count(), 1);
    }

    #[tokio::test]
    async fn invalid_proposal_is_refused_without_an_order() {
        // Scenario S6: entry == stop, R = 0.
        let terminal = MockTerminal::new(flat_market());
        let store = store();
        let (mut controller, _rx) = controller(terminal.clone(), store.clone());

        let result = controller
            .open_from_proposal(
                EntryProposal {
                    entry_price: 2000.0,
                    stop_loss: 2000.0,
                    risk_unit: 0.0,
                    volume: 0.10,
                },
                now(),
            )
            .await;

        assert!(matches!(result, Err(EngineError::TpConfigurationInvalid(_))));
        assert_eq!(store.open_count(), 0);
        assert!(terminal.state.lock().placed_orders.is_empty());
    }

    #[tokio::test]
    async fn closed_trades_always_carry_textual_reasons() {
        let terminal = MockTerminal::new(flat_market());
        let store = store();
        store.open_position(seeded_position(5, 2000.0, 1950.0)).unwrap();

        let (mut controller, _rx) = controller(terminal, store.clone());
        controller.startup().await.unwrap();

        let trades: Vec<ClosedTrade> = store.get_closed_trades();
        for trade in trades {
            assert!(!trade.exit_reason.is_empty());
            assert!(trade.exit_reason.parse::<f64>().is_err());
        }
    }
}
