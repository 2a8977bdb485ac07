use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{summarize, StoreError, TradeStore};
use crate::models::{Trade, TradeSide, TradeStatus, TradingSummary};

/// Process-local trade store
///
/// Used when no database is configured and in tests. Contents are lost on
/// restart.
#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    trades: RwLock<Vec<Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.trades.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trades.read().await.is_empty()
    }
}

fn newest_first(mut trades: Vec<Trade>) -> Vec<Trade> {
    trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    trades
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades.write().await.push(trade.clone());
        Ok(())
    }

    async fn get_last_open_buy(&self, symbol: &str) -> Result<Option<Trade>, StoreError> {
        let trades = self.trades.read().await;
        Ok(trades
            .iter()
            .filter(|t| {
                t.symbol == symbol && t.side == TradeSide::Buy && t.status == TradeStatus::Open
            })
            .max_by_key(|t| t.timestamp)
            .cloned())
    }

    async fn update_trade_status(
        &self,
        position_id: Uuid,
        status: TradeStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut trades = self.trades.write().await;
        for trade in trades.iter_mut().filter(|t| t.position_id == position_id) {
            trade.status = status;
            trade.updated_at = now;
        }
        Ok(())
    }

    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.read().await;
        Ok(newest_first(
            trades.iter().filter(|t| t.symbol == symbol).cloned().collect(),
        ))
    }

    async fn get_all_trades(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(newest_first(self.trades.read().await.clone()))
    }

    async fn get_open_positions(&self) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.read().await;
        Ok(newest_first(
            trades
                .iter()
                .filter(|t| t.status == TradeStatus::Open)
                .cloned()
                .collect(),
        ))
    }

    async fn get_recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let mut trades = self.get_all_trades().await?;
        trades.truncate(limit);
        Ok(trades)
    }

    async fn trading_summary(&self) -> Result<Vec<TradingSummary>, StoreError> {
        Ok(summarize(&self.trades.read().await))
    }
}
