use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

use crate::exchange::{round_to_valid_quantity, Exchange, ExchangeError};
use crate::models::{base_asset, Order, OrderStatus, OrderType, TradeSide};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("market sell blocked: price {price:.2} < stop loss {stop_loss:.2}")]
    StopLossBreached { price: f64, stop_loss: f64 },

    #[error("insufficient {asset} balance: have {available:.8}, need {required:.8}")]
    InsufficientBalance {
        asset: String,
        available: f64,
        required: f64,
    },

    #[error("order quantity too small: {0:.8}")]
    QuantityTooSmall(f64),
}

/// State of the protective stop that follows a BUY fill
#[derive(Debug, Clone, PartialEq)]
pub enum Protection {
    /// Sells are not followed by a stop
    NotRequired,
    Protected {
        order_id: String,
        stop_price: f64,
        limit_price: f64,
    },
    /// The buy filled but no stop could be placed; needs attention
    Unprotected { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub order_id: String,
    pub protection: Protection,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub quote_asset: String,
    /// Stop trigger below the executed buy price, as a fraction
    pub stop_loss_pct: f64,
    /// Limit price below the stop trigger, as a fraction
    pub stop_limit_offset_pct: f64,
    pub stop_max_attempts: u32,
    pub stop_retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            stop_loss_pct: 0.005,
            stop_limit_offset_pct: 0.002,
            stop_max_attempts: 3,
            stop_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Places market orders against live prices and balances
pub struct Executor {
    exchange: Arc<dyn Exchange>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(exchange: Arc<dyn Exchange>, config: ExecutorConfig) -> Self {
        Self { exchange, config }
    }

    /// Validate and submit a market order
    ///
    /// On success `order` carries the executed price and quantity and is
    /// marked filled. BUY fills are followed by a stop-loss-limit sell.
    pub async fn execute(&self, order: &mut Order) -> Result<Execution, ExecutionError> {
        let live_price = self.exchange.get_price(&order.symbol).await?;
        order.price = live_price;

        if order.side == TradeSide::Sell
            && order.order_type == OrderType::Market
            && live_price < order.stop_loss_price
        {
            order.status = OrderStatus::Rejected;
            return Err(ExecutionError::StopLossBreached {
                price: live_price,
                stop_loss: order.stop_loss_price,
            });
        }

        let balances = self.exchange.get_balances().await?;
        let (asset, available, required) = match order.side {
            TradeSide::Buy => {
                let asset = self.config.quote_asset.as_str();
                (asset, balance_of(&balances, asset), live_price * order.quantity)
            }
            TradeSide::Sell => {
                let asset = base_asset(&order.symbol, &self.config.quote_asset);
                (asset, balance_of(&balances, asset), order.quantity)
            }
        };
        if available < required {
            order.status = OrderStatus::Rejected;
            return Err(ExecutionError::InsufficientBalance {
                asset: asset.to_string(),
                available,
                required,
            });
        }

        let quantity = round_to_valid_quantity(order.quantity);
        if quantity.is_zero() {
            order.status = OrderStatus::Rejected;
            return Err(ExecutionError::QuantityTooSmall(order.quantity));
        }

        let fill = self
            .exchange
            .place_market_order(&order.symbol, order.side, quantity)
            .await?;

        order.price = fill.price;
        order.quantity = fill.quantity;
        order.status = OrderStatus::Filled;

        tracing::info!(
            "✓ {} {} filled: {:.8} @ {:.2} (order {})",
            order.side,
            order.symbol,
            order.quantity,
            order.price,
            fill.order_id
        );

        let protection = match order.side {
            TradeSide::Buy => {
                self.protect(&order.symbol, order.quantity, order.price)
                    .await
            }
            TradeSide::Sell => Protection::NotRequired,
        };

        Ok(Execution {
            order_id: fill.order_id,
            protection,
        })
    }

    /// Place a protective stop for `quantity` held at `entry_price`
    ///
    /// Retries a bounded number of times; the stop sells exactly `quantity`,
    /// rounded like any other order.
    pub async fn protect(&self, symbol: &str, quantity: f64, entry_price: f64) -> Protection {
        let stop_price = entry_price * (1.0 - self.config.stop_loss_pct);
        let limit_price = stop_price * (1.0 - self.config.stop_limit_offset_pct);

        if stop_price <= 0.0 || !stop_price.is_finite() {
            return Protection::Unprotected {
                reason: format!("invalid stop loss price: {:.2}", stop_price),
            };
        }

        let rounded = round_to_valid_quantity(quantity).to_f64().unwrap_or(0.0);
        if rounded <= 0.0 {
            return Protection::Unprotected {
                reason: format!("stop quantity too small: {:.8}", quantity),
            };
        }

        let stop_order = Order::stop_loss_limit(symbol, rounded, stop_price, limit_price);

        let max_attempts = self.config.stop_max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.exchange.place_stop_loss_limit(&stop_order).await {
                Ok(order_id) => {
                    tracing::info!(
                        "🛡️ Stop loss placed for {}: trigger {:.2}, limit {:.2} (order {})",
                        symbol,
                        stop_price,
                        limit_price,
                        order_id
                    );
                    return Protection::Protected {
                        order_id,
                        stop_price,
                        limit_price,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        "Stop loss attempt {}/{} for {} failed: {}",
                        attempt,
                        max_attempts,
                        symbol,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.stop_retry_delay).await;
                    }
                }
            }
        }

        Protection::Unprotected {
            reason: format!(
                "stop loss not placed after {} attempts: {}",
                max_attempts, last_error
            ),
        }
    }
}

fn balance_of(balances: &std::collections::HashMap<String, f64>, asset: &str) -> f64 {
    balances.get(asset).copied().unwrap_or(0.0)
}
