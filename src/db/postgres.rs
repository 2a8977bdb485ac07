use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::{StoreError, TradeStore};
use crate::models::{Trade, TradeSide, TradeStatus, TradingSummary};

const TRADE_COLUMNS: &str = r#"
    id, position_id, symbol, side, price, quantity, value, fee,
    timestamp, pnl, pnl_percent, status, created_at, updated_at
"#;

/// Postgres persistence for trades
pub struct PostgresTradeStore {
    pool: PgPool,
}

impl PostgresTradeStore {
    /// Connect to Postgres and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres trade store");

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn clear_all_trades(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM trades").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_trades(
        &self,
        filter: &str,
        bind: Option<&str>,
    ) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {} FROM trades {} ORDER BY timestamp DESC",
            TRADE_COLUMNS, filter
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }

        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(trade_from_row)
            .collect()
    }
}

fn trade_from_row(row: &PgRow) -> Result<Trade, StoreError> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;

    Ok(Trade {
        id: row.try_get("id")?,
        position_id: row.try_get("position_id")?,
        symbol: row.try_get("symbol")?,
        side: side.parse::<TradeSide>().map_err(StoreError::Corrupt)?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        value: row.try_get("value")?,
        fee: row.try_get("fee")?,
        timestamp: row.try_get("timestamp")?,
        pnl: row.try_get("pnl")?,
        pnl_percent: row.try_get("pnl_percent")?,
        status: status.parse::<TradeStatus>().map_err(StoreError::Corrupt)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TradeStore for PostgresTradeStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, position_id, symbol, side, price, quantity, value, fee,
                timestamp, pnl, pnl_percent, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                pnl = EXCLUDED.pnl,
                pnl_percent = EXCLUDED.pnl_percent,
                updated_at = NOW()
            "#,
        )
        .bind(trade.id)
        .bind(trade.position_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.value)
        .bind(trade.fee)
        .bind(trade.timestamp)
        .bind(trade.pnl)
        .bind(trade.pnl_percent)
        .bind(trade.status.as_str())
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved {} trade {} for {} to Postgres",
            trade.side,
            trade.id,
            trade.symbol
        );

        Ok(())
    }

    async fn get_last_open_buy(&self, symbol: &str) -> Result<Option<Trade>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM trades
            WHERE symbol = $1 AND side = 'BUY' AND status = 'OPEN'
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
            TRADE_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trade_from_row).transpose()
    }

    async fn update_trade_status(
        &self,
        position_id: Uuid,
        status: TradeStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trades
            SET status = $1, updated_at = NOW()
            WHERE position_id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(position_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        self.fetch_trades("WHERE symbol = $1", Some(symbol)).await
    }

    async fn get_all_trades(&self) -> Result<Vec<Trade>, StoreError> {
        self.fetch_trades("", None).await
    }

    async fn get_open_positions(&self) -> Result<Vec<Trade>, StoreError> {
        self.fetch_trades("WHERE status = 'OPEN'", None).await
    }

    async fn get_recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {} FROM trades ORDER BY timestamp DESC LIMIT $1",
            TRADE_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(trade_from_row)
            .collect()
    }

    async fn trading_summary(&self) -> Result<Vec<TradingSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                symbol,
                COUNT(*) AS total_trades,
                COUNT(*) FILTER (WHERE pnl > 0) AS winning_trades,
                COUNT(*) FILTER (WHERE pnl < 0) AS losing_trades,
                COALESCE(SUM(pnl), 0) AS total_pnl,
                COALESCE(AVG(pnl_percent), 0) AS avg_pnl_percent,
                COALESCE(SUM(value), 0) AS total_volume,
                MIN(timestamp) AS first_trade,
                MAX(timestamp) AS last_trade
            FROM trades
            GROUP BY symbol
            ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let total_trades: i64 = row.try_get("total_trades")?;
            let winning_trades: i64 = row.try_get("winning_trades")?;
            let losing_trades: i64 = row.try_get("losing_trades")?;
            let first_trade: DateTime<Utc> = row.try_get("first_trade")?;
            let last_trade: DateTime<Utc> = row.try_get("last_trade")?;

            summaries.push(TradingSummary {
                symbol: row.try_get("symbol")?,
                total_trades: total_trades.max(0) as usize,
                winning_trades: winning_trades.max(0) as usize,
                losing_trades: losing_trades.max(0) as usize,
                total_pnl: row.try_get("total_pnl")?,
                avg_pnl_percent: row.try_get("avg_pnl_percent")?,
                total_volume: row.try_get("total_volume")?,
                first_trade,
                last_trade,
            });
        }

        Ok(summaries)
    }
}
