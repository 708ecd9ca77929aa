//! Configuration management for the spread hedger.
//!
//! Loads settings from a JSON config file, environment variables and `.env`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::exchange::MarginMode;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Route orders to the venues' demo/testnet environments
    #[serde(default = "default_sim_mode")]
    pub sim_mode: bool,
    /// OKX API credentials (venue A)
    #[serde(default)]
    pub okx: OkxConfig,
    /// Bybit API credentials (venue B)
    #[serde(default)]
    pub bybit: BybitConfig,
    /// Scheduler and venue call parameters
    #[serde(default)]
    pub engine: EngineConfig,
    /// Hedged pairs keyed by logical symbol
    #[serde(default)]
    pub hedge: BTreeMap<String, HedgeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OkxConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BybitConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Main loop period in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound for a single price fetch
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Concurrent fetch limit; defaults to two per symbol
    #[serde(default)]
    pub fetch_concurrency: Option<usize>,
    /// Subtract cycle duration from the sleep so ticks stay on a fixed grid
    #[serde(default = "default_drift_correction")]
    pub drift_correction: bool,
    /// Leverage applied at startup when a pair does not override it
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub margin_mode: MarginMode,
    /// Attempts per position read during reconciliation
    #[serde(default = "default_reconcile_retries")]
    pub reconcile_retries: u32,
    /// How often frozen symbols are re-reconciled (0 = never)
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    /// Cycles between cumulative status lines (0 = never)
    #[serde(default = "default_status_interval_cycles")]
    pub status_interval_cycles: u64,
}

/// Per-symbol hedge parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Venue A (OKX) instrument id, e.g. "BTC-USDT-SWAP"
    #[serde(alias = "okx", alias = "venue_a_instrument", alias = "venueA_instrument", alias = "venuea_instrument")]
    pub venue_a: String,
    /// Venue B (Bybit) instrument id, e.g. "BTCUSDT"
    #[serde(alias = "bybit", alias = "venue_b_instrument", alias = "venueB_instrument", alias = "venueb_instrument")]
    pub venue_b: String,
    /// Spread at or beyond which a hedge is opened
    #[serde(default = "default_open_spread")]
    pub open_spread: Decimal,
    /// Spread at or past which an open hedge is closed
    #[serde(default = "default_close_spread")]
    pub close_spread: Decimal,
    /// Size of each leg in venue contract units
    #[serde(default = "default_qty")]
    pub qty: Decimal,
    /// Per-pair leverage override
    #[serde(default)]
    pub leverage: Option<u32>,
}

/// Instrument ids of one logical symbol on both venues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentMapping {
    pub venue_a: String,
    pub venue_b: String,
}

impl HedgeConfig {
    pub fn instruments(&self) -> InstrumentMapping {
        InstrumentMapping {
            venue_a: self.venue_a.clone(),
            venue_b: self.venue_b.clone(),
        }
    }
}

fn default_sim_mode() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

fn default_drift_correction() -> bool {
    true
}

fn default_leverage() -> u32 {
    1
}

fn default_reconcile_retries() -> u32 {
    3
}

fn default_recovery_interval_secs() -> u64 {
    60
}

fn default_status_interval_cycles() -> u64 {
    60
}

fn default_open_spread() -> Decimal {
    Decimal::new(4, 3) // 0.004
}

fn default_close_spread() -> Decimal {
    Decimal::ZERO
}

fn default_qty() -> Decimal {
    Decimal::ONE
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Option<Duration> {
        (self.recovery_interval_secs > 0).then(|| Duration::from_secs(self.recovery_interval_secs))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            fetch_concurrency: None,
            drift_correction: default_drift_correction(),
            leverage: default_leverage(),
            margin_mode: MarginMode::default(),
            reconcile_retries: default_reconcile_retries(),
            recovery_interval_secs: default_recovery_interval_secs(),
            status_interval_cycles: default_status_interval_cycles(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sim_mode: default_sim_mode(),
            okx: OkxConfig::default(),
            bybit: BybitConfig::default(),
            engine: EngineConfig::default(),
            hedge: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, environment variables and `.env`.
    ///
    /// Environment overrides use the `HEDGE` prefix and `__` as separator,
    /// e.g. `HEDGE__OKX__API_KEY`. Symbols keep the spelling used in the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let json = std::fs::read_to_string(path.as_ref())?;
        let config = config::Config::builder()
            .add_source(config::File::from_str(&json, config::FileFormat::Json))
            .add_source(config::Environment::with_prefix("HEDGE").separator("__"))
            .build()?;

        let mut loaded: Self = config.try_deserialize()?;
        loaded.restore_symbol_case(&json)?;
        Ok(loaded)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()?;

        let mut loaded: Self = config.try_deserialize()?;
        loaded.restore_symbol_case(json)?;
        Ok(loaded)
    }

    /// The `config` crate lowercases map keys; put back the file's spelling.
    fn restore_symbol_case(&mut self, json: &str) -> Result<(), ConfigError> {
        let raw: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let Some(symbols) = raw.get("hedge").and_then(serde_json::Value::as_object) else {
            return Ok(());
        };

        for symbol in symbols.keys() {
            let folded = symbol.to_lowercase();
            if folded == *symbol {
                continue;
            }
            if let Some(pair) = self.hedge.remove(&folded) {
                self.hedge.insert(symbol.clone(), pair);
            }
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.hedge.is_empty(), "hedge map must contain at least one symbol")?;
        ensure(self.engine.tick_interval_ms > 0, "tick_interval_ms must be > 0")?;
        ensure(self.engine.fetch_timeout_ms > 0, "fetch_timeout_ms must be > 0")?;
        ensure(self.engine.leverage >= 1, "leverage must be >= 1")?;
        ensure(
            self.engine.fetch_concurrency != Some(0),
            "fetch_concurrency must be > 0",
        )?;

        for (symbol, pair) in &self.hedge {
            ensure(
                !pair.venue_a.trim().is_empty() && !pair.venue_b.trim().is_empty(),
                &format!("{symbol}: both venue instruments are required"),
            )?;
            ensure(pair.qty > Decimal::ZERO, &format!("{symbol}: qty must be > 0"))?;
            ensure(
                pair.open_spread > Decimal::ZERO,
                &format!("{symbol}: open_spread must be > 0"),
            )?;
            ensure(
                pair.close_spread < pair.open_spread && pair.close_spread > -pair.open_spread,
                &format!("{symbol}: close_spread must lie strictly between -open_spread and open_spread"),
            )?;
            ensure(
                pair.leverage.map_or(true, |l| l >= 1),
                &format!("{symbol}: leverage must be >= 1"),
            )?;
        }

        Ok(())
    }

    /// Credentials are only needed when orders reach the real venues.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        if self.okx.api_key.is_empty()
            || self.okx.secret_key.is_empty()
            || self.okx.passphrase.is_empty()
        {
            return Err(ConfigError::MissingCredentials("okx"));
        }
        if self.bybit.api_key.is_empty() || self.bybit.secret_key.is_empty() {
            return Err(ConfigError::MissingCredentials("bybit"));
        }
        Ok(())
    }

    /// Leverage for a pair, falling back to the engine default.
    pub fn leverage_for(&self, symbol: &str) -> u32 {
        self.hedge
            .get(symbol)
            .and_then(|pair| pair.leverage)
            .unwrap_or(self.engine.leverage)
    }
}

fn ensure(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.to_string()))
    }
}
