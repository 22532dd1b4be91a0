// =============================================================================
// Bar-Close Guard — bar integrity and closure enforcement
// =============================================================================
//
// Every decision the engine takes happens on a confirmed CLOSED bar. The
// guard runs before anything else on each tick and rejects:
//
//   - non-finite or non-positive OHLC values
//   - OHLC ordering violations (high below body, low above body)
//   - bars whose period has not elapsed yet (bar not closed)
//
// Two optional filters are gated by config flags, both default OFF:
//   - Tick-noise: blocks bars whose total movement is below a pip threshold.
//   - Anti-FOMO:  WARNS when signals arrive too close together, but never
//     blocks — cadence must not suppress a good setup.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::types::Bar;

/// Validate that `bar` is a coherent, fully closed bar as of `now`.
///
/// Returns `Err(reason)` with a human-readable reason on the first failed
/// check. This guard always runs; it cannot be disabled.
pub fn validate(bar: &Bar, period: Duration, now: DateTime<Utc>) -> Result<(), String> {
    for (name, value) in [
        ("open", bar.open),
        ("high", bar.high),
        ("low", bar.low),
        ("close", bar.close),
    ] {
        if !value.is_finite() {
            return Err(format!("bar {name} is not finite"));
        }
        if value <= 0.0 {
            return Err(format!("bar {name} is non-positive ({value})"));
        }
    }

    if bar.high < bar.open.max(bar.close) {
        return Err(format!(
            "bar high {} below body top {}",
            bar.high,
            bar.open.max(bar.close)
        ));
    }
    if bar.low > bar.open.min(bar.close) {
        return Err(format!(
            "bar low {} above body bottom {}",
            bar.low,
            bar.open.min(bar.close)
        ));
    }

    let closes_at = bar.open_time + period;
    if closes_at > now {
        return Err(format!(
            "bar not closed yet: opens {} closes {} now {}",
            bar.open_time, closes_at, now
        ));
    }

    Ok(())
}

/// Optional filters layered on top of [`validate`]. Constructed from config
/// once and applied per reference bar.
#[derive(Debug, Clone)]
pub struct BarFilters {
    tick_noise_enabled: bool,
    tick_noise_threshold: f64,
    anti_fomo_enabled: bool,
    anti_fomo_min_bars: u32,
}

impl BarFilters {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            tick_noise_enabled: config.tick_noise_filter_enabled,
            // Threshold arrives in pips, comparisons happen in quote units.
            tick_noise_threshold: config.tick_noise_threshold_pips * config.pip_size,
            anti_fomo_enabled: config.anti_fomo_enabled,
            anti_fomo_min_bars: config.anti_fomo_min_bars,
        }
    }

    /// Tick-noise filter: blocks when the bar's full range moved less than
    /// the configured threshold. Returns `Some(reason)` to block.
    pub fn tick_noise_block(&self, bar: &Bar) -> Option<String> {
        if !self.tick_noise_enabled {
            return None;
        }
        let movement = bar.high - bar.low;
        if movement < self.tick_noise_threshold {
            return Some(format!(
                "tick-noise: movement {:.3} below threshold {:.3}",
                movement, self.tick_noise_threshold
            ));
        }
        debug!(movement = format!("{:.3}", movement), "tick-noise filter passed");
        None
    }

    /// Anti-FOMO check: emits a warning when fewer than the configured
    /// number of bars have passed since the previous signal. NEVER blocks.
    pub fn anti_fomo_warn(&self, bars_since_last_signal: Option<u32>) {
        if !self.anti_fomo_enabled {
            return;
        }
        if let Some(elapsed) = bars_since_last_signal {
            if elapsed < self.anti_fomo_min_bars {
                warn!(
                    bars_since_last_signal = elapsed,
                    min_bars = self.anti_fomo_min_bars,
                    "anti-FOMO: signals arriving close together (not blocking)"
                );
            }
        }
    }
}
