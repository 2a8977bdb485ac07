use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::config::AppConfig;
use crate::db::StoreError;
use crate::exchange::{Exchange, ExchangeError};
use crate::execution::position_manager::unrealized_pct;
use crate::execution::{
    ExecutionError, Executor, ExitPlan, PositionError, PositionManager, Protection,
};
use crate::models::{base_asset, Order, PricePoint, Signal, Trade, TradeSide};
use crate::notifications::Notifier;
use crate::risk::{RiskError, RiskManager};
use crate::strategy::Strategy;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("position lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// What happened to one pair during a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Hold,
    Bought(Trade),
    Sold(Trade),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pairs: Vec<String>,
    pub quote_asset: String,
    pub poll_interval: Duration,
    /// Smallest BUY, in quote currency
    pub min_order_size: f64,
    /// Stop distance assumed when sizing a BUY, as a fraction of price
    pub sizing_stop_pct: f64,
    /// Share of free quote balance a single BUY may spend
    pub max_quote_fraction: f64,
    /// Base balance at or below this is treated as nothing to sell
    pub dust_threshold: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pairs: vec!["BTCUSDT".to_string()],
            quote_asset: "USDT".to_string(),
            poll_interval: Duration::from_secs(10),
            min_order_size: 10.0,
            sizing_stop_pct: 0.005,
            max_quote_fraction: 0.95,
            dust_threshold: 0.0001,
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            pairs: config.pairs(),
            quote_asset: config.quote_asset.clone(),
            poll_interval: config.poll_interval(),
            min_order_size: config.min_order_size,
            ..Self::default()
        }
    }
}

/// Single-loop trading engine
///
/// Each tick every configured pair is processed in turn: fetch the price,
/// feed the strategy, then either manage the open position through the exit
/// policy or open a new one on a BUY signal. A failing pair is logged and
/// alerted; the others still run.
pub struct TradingEngine {
    exchange: Arc<dyn Exchange>,
    executor: Executor,
    positions: PositionManager,
    strategy: Box<dyn Strategy>,
    risk: RiskManager,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
    last_prices: HashMap<String, f64>,
}

impl TradingEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        executor: Executor,
        positions: PositionManager,
        strategy: Box<dyn Strategy>,
        risk: RiskManager,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            exchange,
            executor,
            positions,
            strategy,
            risk,
            notifier,
            settings,
            last_prices: HashMap::new(),
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    /// Tick until `shutdown` resolves; a cycle in progress always completes
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(
            "🔄 Trading loop started: {} pair(s) every {:?} using {}",
            self.settings.pairs.len(),
            self.settings.poll_interval,
            self.strategy.name()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Stopping trading loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }

    /// Process every pair once, then refresh the risk balance
    pub async fn run_cycle(&mut self) -> Vec<(String, Result<PairOutcome, EngineError>)> {
        let pairs = self.settings.pairs.clone();
        let mut results = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let result = self.process_pair(&pair).await;
            match &result {
                Ok(PairOutcome::Skipped(reason)) => {
                    tracing::debug!(token = %pair, "Skipped: {}", reason);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(token = %pair, "Error processing {}: {}", pair, e);
                    self.alert_error(&format!("{}: {}", pair, e)).await;
                }
            }
            results.push((pair, result));
        }

        if let Err(e) = self.refresh_balance().await {
            tracing::warn!("Failed to refresh account balance: {}", e);
        }

        results
    }

    pub async fn process_pair(&mut self, pair: &str) -> Result<PairOutcome, EngineError> {
        let price = self.exchange.get_price(pair).await?;
        self.last_prices.insert(pair.to_string(), price);

        // Without a reliable lookup a BUY could open a second position
        let open = self.positions.find_open_position(pair).await?;

        if let Some(entry) = &open {
            let pnl_pct = unrealized_pct(entry.price, price);
            tracing::info!(
                "📊 {} Current Price: {:.2} | Entry: {:.2} | PnL: {:.2}%",
                pair,
                price,
                entry.price,
                pnl_pct
            );
        }

        let signal = self.strategy.analyze(&PricePoint::now(pair, price));
        if let Some(signal) = &signal {
            tracing::info!(
                "🔍 {} Analysis - Price: {:.2} {}, Signal: {}",
                pair,
                price,
                self.settings.quote_asset,
                signal.action
            );
        }

        match (open, signal) {
            (Some(entry), signal) => {
                let sell_signal = signal.as_ref().is_some_and(Signal::is_sell);
                let buy_signal = signal.is_some() && !sell_signal;
                match self.positions.evaluate_exit(&entry, price, sell_signal) {
                    Some(plan) => self.sell(pair, price, &entry, plan).await,
                    None if buy_signal => Ok(PairOutcome::Skipped(
                        "already have open position".to_string(),
                    )),
                    None => Ok(PairOutcome::Hold),
                }
            }
            (None, Some(signal)) if signal.action == TradeSide::Buy => self.buy(pair, price).await,
            (None, Some(_)) => Ok(PairOutcome::Skipped("no position to sell".to_string())),
            (None, None) => Ok(PairOutcome::Hold),
        }
    }

    async fn buy(&mut self, pair: &str, price: f64) -> Result<PairOutcome, EngineError> {
        if self.risk.check_drawdown() {
            tracing::warn!(
                "🛑 Drawdown limit reached (balance {:.2}), not opening {}",
                self.risk.current_balance(),
                pair
            );
            return Ok(PairOutcome::Skipped("drawdown limit reached".to_string()));
        }

        let balances = self.exchange.get_balances().await?;
        let quote_balance = balances
            .get(&self.settings.quote_asset)
            .copied()
            .unwrap_or(0.0);

        if quote_balance < self.settings.min_order_size {
            return Ok(PairOutcome::Skipped(format!(
                "insufficient {} balance ({:.2}) for trading",
                self.settings.quote_asset, quote_balance
            )));
        }

        tracing::info!(
            "🟢 BUY Signal - {} at {:.2} {} (Balance: {:.2} {})",
            pair,
            price,
            self.settings.quote_asset,
            quote_balance,
            self.settings.quote_asset
        );

        let stop_loss = price * (1.0 - self.settings.sizing_stop_pct);
        let quantity = self
            .risk
            .calculate_position_size(price, stop_loss)?
            .min(quote_balance * self.settings.max_quote_fraction / price);

        let order_value = quantity * price;
        if order_value < self.settings.min_order_size {
            return Ok(PairOutcome::Skipped(format!(
                "order value ({:.2}) below minimum ({:.2})",
                order_value, self.settings.min_order_size
            )));
        }

        let mut order = Order::market(pair, TradeSide::Buy, quantity, price);
        let execution = self.executor.execute(&mut order).await?;

        if let Protection::Unprotected { reason } = &execution.protection {
            self.alert_unprotected(pair, order.quantity, reason).await;
        }

        let trade = self.positions.open_position(&order).await;
        self.alert_trade(&order).await;

        tracing::info!(
            "✅ BUY Order Filled - {}: {:.8} at {:.2} {} (Total: {:.2} {})",
            pair,
            order.quantity,
            order.price,
            self.settings.quote_asset,
            order.notional(),
            self.settings.quote_asset
        );

        Ok(PairOutcome::Bought(trade))
    }

    async fn sell(
        &mut self,
        pair: &str,
        price: f64,
        entry: &Trade,
        plan: ExitPlan,
    ) -> Result<PairOutcome, EngineError> {
        // Count the base locked by the protective stop as held
        let balances = self.exchange.get_total_balances().await?;
        let asset = base_asset(pair, &self.settings.quote_asset);
        let held = balances.get(asset).copied().unwrap_or(0.0);

        if held <= self.settings.dust_threshold {
            return Ok(PairOutcome::Skipped(format!(
                "no {} balance to sell ({:.8})",
                asset, held
            )));
        }

        let pnl_pct = unrealized_pct(entry.price, price);
        tracing::info!(
            "🔴 SELL {:?} - {} at {:.2} (Entry: {:.2}, PnL: {:.2}%), selling {:.0}% of {:.8} {}",
            plan.reason,
            pair,
            price,
            entry.price,
            pnl_pct,
            plan.fraction * 100.0,
            held,
            asset
        );

        let cancelled = self.exchange.cancel_open_orders(pair).await?;
        if cancelled > 0 {
            tracing::info!("Cancelled {} open order(s) on {} to free {}", cancelled, pair, asset);
        }

        let mut order = Order::market(pair, TradeSide::Sell, held * plan.fraction, price);
        if let Err(e) = self.executor.execute(&mut order).await {
            if cancelled > 0 {
                self.restore_protection(pair, held, entry.price).await;
            }
            return Err(e.into());
        }

        let remaining = held - order.quantity;
        if remaining > self.settings.dust_threshold {
            self.restore_protection(pair, remaining, entry.price).await;
        }

        let trade = self.positions.close_position(&order).await?;
        self.alert_trade(&order).await;

        tracing::info!(
            "✅ SELL Order Filled - {}: {:.8} at {:.2} {} (PnL: {:.4}, {:.2}%)",
            pair,
            order.quantity,
            order.price,
            self.settings.quote_asset,
            trade.pnl,
            trade.pnl_percent
        );

        Ok(PairOutcome::Sold(trade))
    }

    /// Stop for base still held after a partial exit or a failed sell
    async fn restore_protection(&self, pair: &str, quantity: f64, entry_price: f64) {
        if let Protection::Unprotected { reason } =
            self.executor.protect(pair, quantity, entry_price).await
        {
            self.alert_unprotected(pair, quantity, &reason).await;
        }
    }

    /// Mark the account to market: quote plus held base assets at last price,
    /// free and locked alike
    async fn refresh_balance(&mut self) -> Result<(), EngineError> {
        let balances = self.exchange.get_total_balances().await?;

        let mut total = balances
            .get(&self.settings.quote_asset)
            .copied()
            .unwrap_or(0.0);
        for (pair, price) in &self.last_prices {
            let asset = base_asset(pair, &self.settings.quote_asset);
            total += balances.get(asset).copied().unwrap_or(0.0) * price;
        }

        self.risk.update_balance(total);
        tracing::debug!("Account value: {:.2} {}", total, self.settings.quote_asset);
        Ok(())
    }

    async fn alert_trade(&self, order: &Order) {
        if let Err(e) = self
            .notifier
            .notify_trade(&order.symbol, order.side, order.price, order.quantity)
            .await
        {
            tracing::warn!("Failed to send trade notification: {}", e);
        }
    }

    async fn alert_unprotected(&self, pair: &str, quantity: f64, reason: &str) {
        tracing::error!(
            "🚨 UNPROTECTED POSITION - {}: {:.8} held without stop loss: {}",
            pair,
            quantity,
            reason
        );
        if let Err(e) = self
            .notifier
            .notify_unprotected(pair, quantity, reason)
            .await
        {
            tracing::warn!("Failed to send unprotected alert: {}", e);
        }
    }

    async fn alert_error(&self, message: &str) {
        if let Err(e) = self.notifier.notify_error(message).await {
            tracing::warn!("Failed to send error notification: {}", e);
        }
    }
}
