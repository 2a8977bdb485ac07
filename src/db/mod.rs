// Trade persistence module
pub mod memory;
pub mod postgres;

pub use memory::MemoryTradeStore;
pub use postgres::PostgresTradeStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Trade, TradeSide, TradeStatus, TradingSummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt trade record: {0}")]
    Corrupt(String),
}

/// Durable record of trades and the positions they form
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    /// Most recent BUY for the symbol that is still `Open`
    async fn get_last_open_buy(&self, symbol: &str) -> Result<Option<Trade>, StoreError>;

    /// Set the status of every trade belonging to the position
    async fn update_trade_status(
        &self,
        position_id: Uuid,
        status: TradeStatus,
    ) -> Result<(), StoreError>;

    /// Trades for one symbol, newest first
    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError>;

    /// Every stored trade, newest first
    async fn get_all_trades(&self) -> Result<Vec<Trade>, StoreError>;

    async fn get_open_positions(&self) -> Result<Vec<Trade>, StoreError>;

    async fn get_recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError>;

    async fn trading_summary(&self) -> Result<Vec<TradingSummary>, StoreError>;
}

/// Aggregate trades into one summary per symbol, ordered by symbol
pub fn summarize(trades: &[Trade]) -> Vec<TradingSummary> {
    let mut by_symbol: BTreeMap<&str, Vec<&Trade>> = BTreeMap::new();
    for trade in trades {
        by_symbol.entry(trade.symbol.as_str()).or_default().push(trade);
    }

    by_symbol
        .into_iter()
        .filter_map(|(symbol, trades)| {
            let first_trade = trades.iter().map(|t| t.timestamp).min()?;
            let last_trade = trades.iter().map(|t| t.timestamp).max()?;
            let total_trades = trades.len();

            Some(TradingSummary {
                symbol: symbol.to_string(),
                total_trades,
                winning_trades: trades.iter().filter(|t| t.pnl > 0.0).count(),
                losing_trades: trades.iter().filter(|t| t.pnl < 0.0).count(),
                total_pnl: trades.iter().map(|t| t.pnl).sum(),
                avg_pnl_percent: trades.iter().map(|t| t.pnl_percent).sum::<f64>()
                    / total_trades as f64,
                total_volume: trades.iter().map(|t| t.value).sum(),
                first_trade,
                last_trade,
            })
        })
        .collect()
}

/// Realized PnL keyed by position, taken from the closing SELL trades
pub fn realized_pnl_by_position(trades: &[Trade]) -> BTreeMap<Uuid, f64> {
    let mut pnl = BTreeMap::new();
    for trade in trades.iter().filter(|t| t.side == TradeSide::Sell) {
        *pnl.entry(trade.position_id).or_insert(0.0) += trade.pnl;
    }
    pnl
}
