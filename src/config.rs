// =============================================================================
// Engine Configuration — tunable settings with atomic save
// =============================================================================
//
// Central configuration hub for the Aurum trading engine. Every tunable
// parameter lives here; the host wrapper decides where the file comes from.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Credentials are NOT part of this struct: they are read from environment
// variables at startup and never serialised or logged.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "XAUUSD".to_string()
}

fn default_period_minutes() -> u32 {
    60
}

fn default_risk_percent() -> f64 {
    1.0
}

fn default_atr_multiplier_stop() -> f64 {
    1.5
}

fn default_rr_ratios() -> (f64, f64, f64) {
    (1.4, 1.9, 2.5)
}

fn default_momentum_atr_threshold() -> f64 {
    0.3
}

fn default_cooldown_hours() -> f64 {
    24.0
}

fn default_true() -> bool {
    true
}

fn default_tick_seconds() -> u64 {
    10
}

fn default_ui_refresh_seconds() -> u64 {
    5
}

fn default_bars_to_fetch() -> usize {
    500
}

fn default_min_bars_required() -> usize {
    220
}

fn default_quality_gate_threshold() -> f64 {
    6.5
}

fn default_trailing_offsets() -> (f64, f64) {
    (0.3, 0.1)
}

fn default_pip_size() -> f64 {
    0.1
}

fn default_point_size() -> f64 {
    0.01
}

fn default_contract_size() -> f64 {
    100.0
}

fn default_max_open_positions() -> usize {
    1
}

fn default_tick_noise_threshold_pips() -> f64 {
    0.5
}

fn default_anti_fomo_min_bars() -> u32 {
    3
}

fn default_state_file() -> String {
    "aurum_state.json".to_string()
}

fn default_backup_dir() -> String {
    "aurum_state_backups".to_string()
}

fn default_journal_db() -> String {
    "aurum_trades.db".to_string()
}

fn default_backup_ring_size() -> usize {
    10
}

fn default_persist_batch_seconds() -> u64 {
    5
}

fn default_max_persist_failures() -> u32 {
    3
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Aurum engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Instrument ----------------------------------------------------------

    /// Traded symbol.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Bar period in minutes (1-hour bars by default).
    #[serde(default = "default_period_minutes")]
    pub period_minutes: u32,

    /// Size of one pip in quote units (0.1 USD for gold).
    #[serde(default = "default_pip_size")]
    pub pip_size: f64,

    /// Size of one point, the smallest price increment.
    #[serde(default = "default_point_size")]
    pub point_size: f64,

    /// Contract size: quote-currency value of one full lot per unit of
    /// price movement (100 oz for gold).
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,

    // --- Risk & ladder -------------------------------------------------------

    /// Account percentage risked per trade.
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,

    /// ATR multiple used for the initial stop-loss distance.
    #[serde(default = "default_atr_multiplier_stop")]
    pub atr_multiplier_stop: f64,

    /// Risk:reward multiples for TP1/TP2/TP3.
    #[serde(default = "default_rr_ratios")]
    pub rr_ratios: (f64, f64, f64),

    /// ATR offsets (atr_offset, swing_offset) for the post-TP2 trailing
    /// stop.
    #[serde(default = "default_trailing_offsets")]
    pub trailing_offsets: (f64, f64),

    /// Maximum simultaneously open positions on the symbol.
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,

    // --- Entry gates ---------------------------------------------------------

    /// Whether the candle-body momentum filter participates in gate 4.
    #[serde(default)]
    pub momentum_filter_enabled: bool,

    /// Minimum candle body as an ATR multiple when the momentum filter is
    /// enabled.
    #[serde(default = "default_momentum_atr_threshold")]
    pub momentum_atr_threshold: f64,

    /// Minimum time between entries.
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: f64,

    /// When false the cooldown gate only warns instead of blocking.
    #[serde(default = "default_true")]
    pub cooldown_blocking: bool,

    /// Composite quality score required for an entry.
    #[serde(default = "default_quality_gate_threshold")]
    pub quality_gate_threshold: f64,

    // --- Optional bar filters (default off) ----------------------------------

    /// Reject bars whose total movement is below a pip threshold.
    #[serde(default)]
    pub tick_noise_filter_enabled: bool,

    /// Movement threshold for the tick-noise filter, in pips.
    #[serde(default = "default_tick_noise_threshold_pips")]
    pub tick_noise_threshold_pips: f64,

    /// Warn (never block) when signals arrive closer together than
    /// `anti_fomo_min_bars`.
    #[serde(default)]
    pub anti_fomo_enabled: bool,

    /// Minimum bars between signals before the anti-FOMO warning fires.
    #[serde(default = "default_anti_fomo_min_bars")]
    pub anti_fomo_min_bars: u32,

    // --- Loop timing ---------------------------------------------------------

    /// Controller tick period in seconds.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    /// UI heartbeat period in seconds (independent of the tick).
    #[serde(default = "default_ui_refresh_seconds")]
    pub ui_refresh_seconds: u64,

    /// Closed bars requested from the terminal per tick.
    #[serde(default = "default_bars_to_fetch")]
    pub bars_to_fetch: usize,

    /// Minimum usable closed bars before any decision is taken.
    #[serde(default = "default_min_bars_required")]
    pub min_bars_required: usize,

    // --- Persistence ---------------------------------------------------------

    /// Path of the authoritative JSON snapshot.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Directory holding the rolling ring of snapshot backups.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,

    /// Path of the SQLite trades journal.
    #[serde(default = "default_journal_db")]
    pub journal_db: String,

    /// Number of timestamped backups retained.
    #[serde(default = "default_backup_ring_size")]
    pub backup_ring_size: usize,

    /// Batching window for non-critical snapshot writes, in seconds.
    #[serde(default = "default_persist_batch_seconds")]
    pub persist_batch_seconds: u64,

    /// Consecutive write failures tolerated before new entries are gated.
    #[serde(default = "default_max_persist_failures")]
    pub max_persist_failures: u32,

    // --- Recovery ------------------------------------------------------------

    /// Synthesize a TP ladder from the risk unit for legacy positions that
    /// persisted only a single take-profit.
    #[serde(default = "default_true")]
    pub recovery_synthesize_ladder: bool,

    /// Escalate broker positions unknown to the store to error level
    /// instead of a warning. They are never adopted automatically.
    #[serde(default)]
    pub adopt_external_positions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // serde_json never fails on an empty object because every field has
        // a default.
        serde_json::from_str("{}").expect("EngineConfig defaults are total")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            period_minutes = config.period_minutes,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Cooldown as a chrono duration.
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.cooldown_hours * 3600.0) as i64)
    }

    /// Bar period as a chrono duration.
    pub fn bar_period(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.period_minutes as i64)
    }
}

// =============================================================================
// Credentials — environment only, never serialised
// =============================================================================

/// Terminal credentials, sourced exclusively from environment variables.
/// The Debug impl redacts everything so an accidental `{:?}` leaks nothing.
#[derive(Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    pub server: String,
    pub terminal_path: String,
}

impl Credentials {
    /// Read credentials from `AURUM_MT_LOGIN`, `AURUM_MT_PASSWORD`,
    /// `AURUM_MT_SERVER`, and `AURUM_MT_TERMINAL_PATH`. Missing variables
    /// become empty strings; the terminal adapter decides whether that is
    /// acceptable.
    pub fn from_env() -> Self {
        Self {
            login: std::env::var("AURUM_MT_LOGIN").unwrap_or_default(),
            password: std::env::var("AURUM_MT_PASSWORD").unwrap_or_default(),
            server: std::env::var("AURUM_MT_SERVER").unwrap_or_default(),
            terminal_path: std::env::var("AURUM_MT_TERMINAL_PATH").unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &"<redacted>")
            .field("password", &"<redacted>")
            .field("server", &"<redacted>")
            .field("terminal_path", &"<redacted>")
            .finish()
    }
}
