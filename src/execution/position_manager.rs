use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{StoreError, TradeStore};
use crate::execution::exit_policy::{ExitPlan, ExitPolicy};
use crate::models::{Order, Trade, TradeSide, TradeStatus};

/// Default exchange fee per leg (0.1%)
pub const DEFAULT_FEE_RATE: f64 = 0.001;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("no open position for {0}")]
    NoOpenPosition(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Profit of `price` against `entry`, in percent
pub fn unrealized_pct(entry: f64, price: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    (price - entry) / entry * 100.0
}

/// Trade record for a filled BUY, opening a new position
pub fn build_buy_trade(order: &Order, fee_rate: f64) -> Trade {
    let now = Utc::now();
    let value = order.price * order.quantity;

    Trade {
        id: Uuid::new_v4(),
        position_id: Uuid::new_v4(),
        symbol: order.symbol.clone(),
        side: TradeSide::Buy,
        price: order.price,
        quantity: order.quantity,
        value,
        fee: value * fee_rate,
        timestamp: order.timestamp,
        pnl: 0.0,
        pnl_percent: 0.0,
        status: TradeStatus::Open,
        created_at: now,
        updated_at: now,
    }
}

/// Trade record for a filled SELL closing (part of) `buy`
///
/// PnL is net of fees on both legs, computed for the sold quantity only.
pub fn build_sell_trade(buy: &Trade, order: &Order, fee_rate: f64) -> Trade {
    let now = Utc::now();
    let quantity = order.quantity;
    let value = order.price * quantity;

    let cost = buy.price * quantity;
    let fees = cost * fee_rate + value * fee_rate;
    let pnl = (order.price - buy.price) * quantity - fees;
    let pnl_percent = if cost > 0.0 { pnl / cost * 100.0 } else { 0.0 };

    Trade {
        id: Uuid::new_v4(),
        position_id: buy.position_id,
        symbol: order.symbol.clone(),
        side: TradeSide::Sell,
        price: order.price,
        quantity,
        value,
        fee: value * fee_rate,
        timestamp: order.timestamp,
        pnl,
        pnl_percent,
        status: TradeStatus::Closed,
        created_at: now,
        updated_at: now,
    }
}

/// Tracks positions through their BUY and SELL trades
pub struct PositionManager {
    store: Arc<dyn TradeStore>,
    fee_rate: f64,
    exit_policy: ExitPolicy,
}

impl PositionManager {
    pub fn new(store: Arc<dyn TradeStore>, fee_rate: f64, exit_policy: ExitPolicy) -> Self {
        Self {
            store,
            fee_rate,
            exit_policy,
        }
    }

    /// Most recent open BUY for the symbol
    pub async fn find_open_position(&self, symbol: &str) -> Result<Option<Trade>, StoreError> {
        self.store.get_last_open_buy(symbol).await
    }

    /// Run the exit table for an open position at the current price
    pub fn evaluate_exit(&self, entry: &Trade, price: f64, sell_signal: bool) -> Option<ExitPlan> {
        self.exit_policy
            .evaluate(unrealized_pct(entry.price, price), sell_signal)
    }

    /// Record a filled BUY as a new open position
    ///
    /// The trade is returned even if it could not be stored.
    pub async fn open_position(&self, order: &Order) -> Trade {
        let trade = build_buy_trade(order, self.fee_rate);

        if let Err(e) = self.store.save_trade(&trade).await {
            tracing::error!("Failed to save BUY trade for {}: {}", trade.symbol, e);
        }

        tracing::info!(
            "📂 Opened position {} for {}: {:.8} @ {:.2}",
            trade.position_id,
            trade.symbol,
            trade.quantity,
            trade.price
        );

        trade
    }

    /// Record a filled SELL against the most recent open BUY and close it
    pub async fn close_position(&self, order: &Order) -> Result<Trade, PositionError> {
        let buy = self
            .store
            .get_last_open_buy(&order.symbol)
            .await?
            .ok_or_else(|| PositionError::NoOpenPosition(order.symbol.clone()))?;

        let sell = build_sell_trade(&buy, order, self.fee_rate);

        if let Err(e) = self
            .store
            .update_trade_status(buy.position_id, TradeStatus::Closed)
            .await
        {
            tracing::error!("Failed to close position {}: {}", buy.position_id, e);
        }
        if let Err(e) = self.store.save_trade(&sell).await {
            tracing::error!("Failed to save SELL trade for {}: {}", sell.symbol, e);
        }

        tracing::info!(
            "📁 Closed position {} for {}: PnL ${:.4} ({:.2}%)",
            sell.position_id,
            sell.symbol,
            sell.pnl,
            sell.pnl_percent
        );

        Ok(sell)
    }
}
