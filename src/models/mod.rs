use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Latest observed price for a pair, produced once per polling tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PricePoint {
    pub fn now(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp: Utc::now(),
        }
    }
}

/// Side of an order, a signal or a stored trade
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Wire/storage representation (`BUY` / `SELL`)
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("invalid trade side: {}", other)),
        }
    }
}

/// Trading signal emitted by a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: TradeSide,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, action: TradeSide, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            price: None,
            quantity: None,
            timestamp,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn is_sell(&self) -> bool {
        self.action == TradeSide::Sell
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    StopLossLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::StopLossLimit => "STOP_LOSS_LIMIT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    Filled,
    Rejected,
}

/// Order handed to the executor
///
/// `price` and `quantity` start out as the requested values and are
/// overwritten with the executed ones once the exchange reports a fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: TradeSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss_price: f64,
    pub timestamp: DateTime<Utc>,
    pub status: OrderStatus,
}

impl Order {
    pub fn market(symbol: impl Into<String>, side: TradeSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price,
            stop_loss_price: 0.0,
            timestamp: Utc::now(),
            status: OrderStatus::New,
        }
    }

    /// Protective sell placed right after a buy fill
    pub fn stop_loss_limit(
        symbol: impl Into<String>,
        quantity: f64,
        stop_price: f64,
        limit_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: TradeSide::Sell,
            order_type: OrderType::StopLossLimit,
            quantity,
            price: limit_price,
            stop_loss_price: stop_price,
            timestamp: Utc::now(),
            status: OrderStatus::New,
        }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("invalid trade status: {}", other)),
        }
    }
}

/// Persisted record of a filled order
///
/// A BUY starts `Open` with zero PnL; the SELL that closes it is stored
/// `Closed`, shares the BUY's `position_id` and carries the realized PnL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub value: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated per-symbol statistics over stored trades
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingSummary {
    pub symbol: String,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl: f64,
    pub avg_pnl_percent: f64,
    pub total_volume: f64,
    pub first_trade: DateTime<Utc>,
    pub last_trade: DateTime<Utc>,
}

/// Split a pair symbol into its base asset, e.g. `BTCUSDT` -> `BTC`
pub fn base_asset<'a>(symbol: &'a str, quote_asset: &str) -> &'a str {
    symbol.strip_suffix(quote_asset).unwrap_or(symbol)
}
