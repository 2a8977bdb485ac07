use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::exchange::binance::BINANCE_API_BASE;
use crate::execution::ExecutorConfig;
use crate::risk::RiskLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration
///
/// Sources, later ones winning: built-in defaults, an optional
/// `Settings.toml`, then environment variables (after loading `.env`).
/// Keys are the field names; `BINANCE_API_KEY` sets `binance_api_key`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_base_url: String,

    pub trading_pairs: Vec<String>,
    pub quote_asset: String,

    pub initial_investment: f64,
    pub max_drawdown: f64,
    pub risk_per_trade: f64,
    pub aggressive_factor: f64,
    pub enable_compounding: bool,
    /// Smallest BUY, in quote currency
    pub min_order_size: f64,
    pub fee_rate: f64,

    pub poll_interval_secs: u64,
    pub connect_max_attempts: u32,

    pub database_url: Option<String>,

    pub telegram_token: String,
    pub telegram_chat_id: String,
}

impl AppConfig {
    /// Builder preloaded with a default for every key
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("binance_api_key", "")?
            .set_default("binance_api_secret", "")?
            .set_default("binance_base_url", BINANCE_API_BASE)?
            .set_default("trading_pairs", vec!["BTCUSDT"])?
            .set_default("quote_asset", "USDT")?
            // Zero means unset; `validate` requires a positive amount to trade
            .set_default("initial_investment", 0.0)?
            .set_default("max_drawdown", 0.10)?
            .set_default("risk_per_trade", 0.02)?
            .set_default("aggressive_factor", 1.5)?
            .set_default("enable_compounding", true)?
            .set_default("min_order_size", 10.0)?
            .set_default("fee_rate", 0.001)?
            .set_default("poll_interval_secs", 10)?
            .set_default("connect_max_attempts", 10)?
            .set_default("telegram_token", "")?
            .set_default("telegram_chat_id", "")?)
    }

    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            .add_source(File::with_name("Settings").required(false))
            .add_source(
                Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("trading_pairs"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Checks needed before trading; read-only commands skip them
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binance_api_key.is_empty() || self.binance_api_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "Binance API key and secret are required".to_string(),
            ));
        }
        if self.trading_pairs.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid("no trading pairs configured".to_string()));
        }
        if self.initial_investment <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "initial_investment must be positive, got {}",
                self.initial_investment
            )));
        }
        for (name, value) in [
            ("max_drawdown", self.max_drawdown),
            ("risk_per_trade", self.risk_per_trade),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(ConfigError::Invalid(format!(
                "fee_rate must be in [0, 1), got {}",
                self.fee_rate
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured pairs, trimmed and upper-cased, blanks dropped
    pub fn pairs(&self) -> Vec<String> {
        self.trading_pairs
            .iter()
            .map(|p| p.trim().to_uppercase())
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_drawdown: self.max_drawdown,
            risk_per_trade: self.risk_per_trade,
            aggressive_factor: self.aggressive_factor,
            enable_compounding: self.enable_compounding,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            quote_asset: self.quote_asset.clone(),
            ..ExecutorConfig::default()
        }
    }

    /// Database URL, treating an empty value as unset
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref().filter(|url| !url.is_empty())
    }
}
