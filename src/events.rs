// =============================================================================
// UI Event Stream — one-way queue from the core to any dashboard consumer
// =============================================================================
//
// The core is the SOLE producer. Events are tagged, serialisable values
// pushed through an unbounded channel; consumers (a TUI, a web bridge, a
// log sink) read and render, never mutate. The controller batches at most
// one event group per tick and never emits from background I/O.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::entry::EntryDecision;
use crate::exit::PostTpDecision;
use crate::regime::RegimeSnapshot;
use crate::store::{ClosedTrade, JournalStats, Position};
use crate::types::TpState;

/// Which TP engine a `TpDecision` event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TpLevel {
    Tp1,
    Tp2,
}

/// Tagged event vocabulary of the UI surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    MarketData {
        symbol: String,
        close: f64,
        ema50: f64,
        ema200: f64,
        atr14: f64,
        bar_time: DateTime<Utc>,
    },
    Regime(RegimeSnapshot),
    EntryConditions(EntryDecision),
    TpLadder {
        ticket: u64,
        tp_state: TpState,
        tp1_price: f64,
        tp2_price: f64,
        tp3_price: f64,
        current_stop_loss: f64,
        trailing_sl_level: Option<f64>,
    },
    TpDecision {
        ticket: u64,
        level: TpLevel,
        decision: PostTpDecision,
        reason: String,
    },
    PositionOpened(Position),
    PositionClosed {
        trade: ClosedTrade,
        stats: Option<JournalStats>,
    },
    ConnectionStatus {
        connected: bool,
        detail: String,
    },
}

/// Producer handle held by the controller.
#[derive(Clone)]
pub struct UiEventBus {
    sender: mpsc::UnboundedSender<UiEvent>,
}

impl UiEventBus {
    /// Create the bus and the single consumer end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Publish one event. A missing consumer is not an error: the engine
    /// runs headless just as well.
    pub fn publish(&self, event: UiEvent) {
        trace!(event = ?std::mem::discriminant(&event), "ui event");
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for UiEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiEventBus").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::Regime;

    #[test]
    fn events_flow_in_order() {
        let (bus, mut rx) = UiEventBus::channel();

        bus.publish(UiEvent::ConnectionStatus {
            connected: true,
            detail: "session up".into(),
        });
        bus.publish(UiEvent::Regime(RegimeSnapshot {
            regime: Regime::Bull,
            confidence: 0.9,
            ema_gap_pct: 1.2,
            price_ema50_gap_pct: 0.4,
        }));

        match rx.try_recv().unwrap() {
            UiEvent::ConnectionStatus { connected, .. } => assert!(connected),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            UiEvent::Regime(snap) => assert_eq!(snap.regime, Regime::Bull),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_consumer_is_harmless() {
        let (bus, rx) = UiEventBus::channel();
        drop(rx);
        bus.publish(UiEvent::ConnectionStatus {
            connected: false,
            detail: "consumer gone".into(),
        });
    }

    #[test]
    fn events_serialise_with_type_tag() {
        let event = UiEvent::ConnectionStatus {
            connected: true,
            detail: "ok".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ConnectionStatus\""));
    }
}
