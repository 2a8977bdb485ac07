// Exchange connectivity module
pub mod binance;
pub mod lot_size;

pub use binance::BinanceClient;
pub use lot_size::round_to_valid_quantity;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Order, TradeSide};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange rejected request ({code}): {msg}")]
    Api { code: i64, msg: String },

    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    #[error("no price found for symbol {0}")]
    NoPrice(String),

    #[error("failed to sign request: {0}")]
    Signing(String),
}

/// Free and locked amounts of one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

/// Outcome of a filled market order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    /// Average executed price
    pub price: f64,
    /// Executed base quantity
    pub quantity: f64,
}

/// Exchange operations the trading engine depends on
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn ping(&self) -> Result<(), ExchangeError>;

    /// Measure the offset between exchange and local clocks (milliseconds)
    /// and apply it to subsequent signed requests
    async fn sync_time(&self) -> Result<i64, ExchangeError>;

    async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn account_balances(&self) -> Result<Vec<AssetBalance>, ExchangeError>;

    /// Submit a market order and wait for its full fill report
    async fn place_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError>;

    /// Submit a good-till-cancelled stop-loss-limit sell, returning its order id
    async fn place_stop_loss_limit(&self, order: &Order) -> Result<String, ExchangeError>;

    /// Cancel every open order on `symbol`, returning how many were cancelled
    async fn cancel_open_orders(&self, symbol: &str) -> Result<usize, ExchangeError>;

    /// Free balances keyed by asset, zero balances omitted
    async fn get_balances(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self
            .account_balances()
            .await?
            .into_iter()
            .filter(|b| b.free > 0.0)
            .map(|b| (b.asset, b.free))
            .collect())
    }

    /// Free plus locked balances keyed by asset, empty balances omitted
    ///
    /// Funds held by resting orders (the protective stop) count here.
    async fn get_total_balances(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self
            .account_balances()
            .await?
            .into_iter()
            .map(|b| (b.asset, b.free + b.locked))
            .filter(|(_, total)| *total > 0.0)
            .collect())
    }
}

/// Startup handshake: clock sync, ping, then account access with retries
///
/// Account access is retried up to `max_attempts` times with a linear
/// backoff of `attempt * base_delay`. Returns the account balances.
pub async fn verify_connectivity(
    exchange: &dyn Exchange,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<Vec<AssetBalance>, ExchangeError> {
    let offset = exchange.sync_time().await?;
    tracing::info!("Time offset with exchange: {}ms", offset);

    exchange.ping().await?;
    tracing::info!("✓ Ping successful");

    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match exchange.account_balances().await {
            Ok(balances) => {
                tracing::info!("✓ Account access successful after {} attempt(s)", attempt);
                return Ok(balances);
            }
            Err(e) if attempt < max_attempts => {
                let backoff = base_delay * attempt;
                tracing::warn!(
                    "Attempt {}: failed to get account info: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "Failed to get account info after {} attempts: {}",
                    max_attempts,
                    e
                );
                return Err(e);
            }
        }
    }
}
