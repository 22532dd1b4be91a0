// =============================================================================
// Aurum — Double-Bottom decision and lifecycle engine for XAUUSD
// =============================================================================
//
// The core of an algorithmic gold-trading system: detects Double-Bottom
// patterns on 1-hour bars and manages long-only positions through a
// three-level take-profit ladder with dynamic stop-loss progression.
//
// The crate is broker-facing but adapter-agnostic. It exposes no CLI; a
// host wrapper links a concrete [`terminal::TerminalPort`] implementation
// and calls [`run_with_terminal`]:
//
// ```ignore
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let adapter = std::sync::Arc::new(MyTerminalAdapter::new());
//     aurum_bot::run_with_terminal(adapter, None).await
// }
// ```
//
// Decisions happen on confirmed closed bars only — no intrabar logic, no
// shorts, no repainting.
// =============================================================================

pub mod config;
pub mod controller;
pub mod entry;
pub mod error;
pub mod events;
pub mod exit;
pub mod guard;
pub mod indicators;
pub mod ladder;
pub mod momentum;
pub mod pattern;
pub mod regime;
pub mod store;
pub mod terminal;
pub mod types;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Credentials, EngineConfig};
use crate::controller::Controller;
use crate::events::{UiEvent, UiEventBus};
use crate::store::StateStore;
use crate::terminal::TerminalPort;

/// Initialise logging from `RUST_LOG`, defaulting to `info`. Safe to call
/// once per process; hosts that configure their own subscriber skip it.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Full engine bootstrap: environment, config, state store, event queue,
/// controller — then run until ctrl-c flips the shutdown signal.
///
/// `event_consumer` receives the UI stream; pass `None` to drain events
/// into debug logs (headless operation). Configuration is read from the
/// file named by `AURUM_CONFIG` (default `aurum_config.json`), credentials
/// from the environment only.
pub async fn run_with_terminal<T: TerminalPort + 'static>(
    terminal: Arc<T>,
    event_consumer: Option<mpsc::UnboundedSender<UiEvent>>,
) -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("AURUM_CONFIG").unwrap_or_else(|_| "aurum_config.json".into());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config — using defaults");
        EngineConfig::default()
    });
    let credentials = Credentials::from_env();

    info!(
        symbol = %config.symbol,
        period_minutes = config.period_minutes,
        tick_seconds = config.tick_seconds,
        "engine configured"
    );

    let store = Arc::new(StateStore::with_persistence(&config)?);

    // Single producer; the consumer either forwards to the host's UI or
    // drains into debug logs.
    let (event_bus, mut event_rx) = UiEventBus::channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match &event_consumer {
                Some(sink) => {
                    let _ = sink.send(event);
                }
                None => tracing::debug!(event = ?event, "ui"),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received — shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut controller = Controller::new(terminal, store, config, credentials, event_bus);
    controller.startup().await?;
    controller.run(shutdown_rx).await;

    info!("engine stopped");
    Ok(())
}
