//! Startup configuration. The file is JSON, read once; the resulting object
//! is treated as immutable for the process lifetime.

use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::types::{Qty, TickerId};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Io: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("MissingCredentials: {0}")]
    MissingCredentials(String),
    #[error("UnknownExchange: {0}")]
    UnknownExchange(String),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum TradingMode {
    #[default]
    #[serde(rename = "PAPER")]
    Paper,
    #[serde(rename = "LIVE")]
    Live,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Hash)]
pub enum ExchangeType {
    #[default]
    #[serde(rename = "ZERODHA")]
    Zerodha,
    #[serde(rename = "BINANCE")]
    Binance,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Zerodha => "ZERODHA",
            ExchangeType::Binance => "BINANCE",
        }
    }
}

impl std::str::FromStr for ExchangeType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ZERODHA" => Ok(ExchangeType::Zerodha),
            "BINANCE" => Ok(ExchangeType::Binance),
            other => Err(ConfigError::UnknownExchange(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StrategyConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
}

fn default_fill_probability() -> f64 {
    0.9
}

fn default_min_latency_ms() -> u64 {
    50
}

fn default_max_latency_ms() -> u64 {
    200
}

fn default_slippage_factor() -> f64 {
    0.001
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PaperTradingConfig {
    #[serde(default = "default_fill_probability")]
    pub fill_probability: f64,
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_slippage_factor", alias = "slippage_model")]
    pub slippage_factor: f64,
    /// When set, a simulated fill is split into a partial and a final fill.
    #[serde(default)]
    pub partial_fill: bool,
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            fill_probability: default_fill_probability(),
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            slippage_factor: default_slippage_factor(),
            partial_fill: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TradingSystemConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub active_exchange: ExchangeType,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub paper_trading: PaperTradingConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApiCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Session token issued by the auth collaborator; required by the
    /// equity venue's feed and order endpoints.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub totp_secret: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_ttl_hours() -> u64 {
    24
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub instruments_dir: String,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            instruments_dir: String::new(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub api_credentials: ApiCredentials,
    #[serde(default)]
    pub cache_config: CacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub exchange: String,
    pub ticker_id: TickerId,
    #[serde(default)]
    pub is_futures: bool,
    #[serde(default)]
    pub expiry_date: Option<String>,
    pub clip: Qty,
    pub threshold: f64,
    /// Zero disables the per-order size bound.
    #[serde(default)]
    pub max_order_size: Qty,
    pub max_position: i64,
    pub max_loss: f64,
}

fn default_max_daily_loss() -> f64 {
    1e9
}

fn default_max_position_value() -> f64 {
    1e12
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,
    #[serde(default)]
    pub enforce_circuit_limits: bool,
    #[serde(default)]
    pub enforce_trading_hours: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_position_value: default_max_position_value(),
            enforce_circuit_limits: false,
            enforce_trading_hours: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading_system: TradingSystemConfig,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Config {
    /// Parses the file; callers validate after applying any command-line
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Live mode requires credentials for the active exchange; paper mode
    /// only needs them when the venue feed itself is authenticated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.trading_system.active_exchange.as_str();
        let exchange = self
            .exchanges
            .get(name)
            .ok_or_else(|| ConfigError::UnknownExchange(name.to_string()))?;
        if self.trading_system.trading_mode == TradingMode::Live
            && (exchange.api_credentials.api_key.is_empty()
                || exchange.api_credentials.api_secret.is_empty())
        {
            return Err(ConfigError::MissingCredentials(name.to_string()));
        }
        Ok(())
    }

    pub fn active_exchange_config(&self) -> Option<&ExchangeConfig> {
        self.exchanges
            .get(self.trading_system.active_exchange.as_str())
    }
}
