use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use spot_trader::db::{MemoryTradeStore, StoreError, TradeStore};
use spot_trader::engine::{EngineError, EngineSettings, PairOutcome, TradingEngine};
use spot_trader::exchange::{AssetBalance, Exchange, ExchangeError, Fill};
use spot_trader::execution::{ExitPolicy, Executor, ExecutorConfig, PositionManager};
use spot_trader::notifications::{Notifier, NotifyError};
use spot_trader::risk::{RiskLimits, RiskManager};
use spot_trader::strategy::MeanReversionStrategy;
use spot_trader::{Order, Trade, TradeSide, TradeStatus, TradingSummary};

// ============================================================================
// Fakes
// ============================================================================

/// Exchange that fills every market order at the current price
///
/// Like the real venue, a resting stop-loss-limit sell moves its quantity
/// from free to locked until it is cancelled.
#[derive(Default)]
struct SimulatedExchange {
    prices: Mutex<HashMap<String, f64>>,
    free: Mutex<HashMap<String, f64>>,
    locked: Mutex<HashMap<String, f64>>,
    stop_orders: Mutex<Vec<Order>>,
    reject_stops: bool,
}

impl SimulatedExchange {
    fn with_balances(balances: &[(&str, f64)]) -> Self {
        let exchange = Self::default();
        {
            let mut free = exchange.free.lock().unwrap();
            for (asset, amount) in balances {
                free.insert(asset.to_string(), *amount);
            }
        }
        exchange
    }

    fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    /// Free plus locked
    fn balance(&self, asset: &str) -> f64 {
        self.free_balance(asset) + self.locked_balance(asset)
    }

    fn free_balance(&self, asset: &str) -> f64 {
        self.free.lock().unwrap().get(asset).copied().unwrap_or(0.0)
    }

    fn locked_balance(&self, asset: &str) -> f64 {
        self.locked.lock().unwrap().get(asset).copied().unwrap_or(0.0)
    }
}

fn base_of(symbol: &str) -> String {
    symbol.trim_end_matches("USDT").to_string()
}

#[async_trait]
impl Exchange for SimulatedExchange {
    async fn ping(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn sync_time(&self) -> Result<i64, ExchangeError> {
        Ok(0)
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::NoPrice(symbol.to_string()))
    }

    async fn account_balances(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let free = self.free.lock().unwrap();
        let locked = self.locked.lock().unwrap();

        let mut assets: Vec<&String> = free.keys().chain(locked.keys()).collect();
        assets.sort();
        assets.dedup();

        Ok(assets
            .into_iter()
            .map(|asset| AssetBalance {
                asset: asset.clone(),
                free: free.get(asset).copied().unwrap_or(0.0),
                locked: locked.get(asset).copied().unwrap_or(0.0),
            })
            .collect())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        let price = self.get_price(symbol).await?;
        let quantity = quantity.to_f64().unwrap();

        let mut free = self.free.lock().unwrap();
        let sign = match side {
            TradeSide::Buy => 1.0,
            TradeSide::Sell => -1.0,
        };
        *free.entry(base_of(symbol)).or_insert(0.0) += sign * quantity;
        *free.entry("USDT".to_string()).or_insert(0.0) -= sign * quantity * price;

        Ok(Fill {
            order_id: "1".to_string(),
            price,
            quantity,
        })
    }

    async fn place_stop_loss_limit(&self, order: &Order) -> Result<String, ExchangeError> {
        let base = base_of(&order.symbol);
        let available = self.free_balance(&base);
        if self.reject_stops || available < order.quantity {
            return Err(ExchangeError::Api {
                code: -2010,
                msg: "Account has insufficient balance for requested action.".to_string(),
            });
        }

        *self.free.lock().unwrap().entry(base.clone()).or_insert(0.0) -= order.quantity;
        *self.locked.lock().unwrap().entry(base).or_insert(0.0) += order.quantity;
        self.stop_orders.lock().unwrap().push(order.clone());
        Ok("stop".to_string())
    }

    async fn cancel_open_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        let mut stops = self.stop_orders.lock().unwrap();
        let (cancelled, kept): (Vec<Order>, Vec<Order>) =
            stops.drain(..).partition(|o| o.symbol == symbol);
        *stops = kept;

        let base = base_of(symbol);
        let released: f64 = cancelled.iter().map(|o| o.quantity).sum();
        *self.locked.lock().unwrap().entry(base.clone()).or_insert(0.0) -= released;
        *self.free.lock().unwrap().entry(base).or_insert(0.0) += released;

        Ok(cancelled.len())
    }
}

/// Memory store whose open-position lookup can be switched to fail
struct FlakyLookupStore {
    inner: MemoryTradeStore,
    fail_lookups: AtomicBool,
}

#[async_trait]
impl TradeStore for FlakyLookupStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.inner.save_trade(trade).await
    }

    async fn get_last_open_buy(&self, symbol: &str) -> Result<Option<Trade>, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("connection reset".to_string()));
        }
        self.inner.get_last_open_buy(symbol).await
    }

    async fn update_trade_status(
        &self,
        position_id: Uuid,
        status: TradeStatus,
    ) -> Result<(), StoreError> {
        self.inner.update_trade_status(position_id, status).await
    }

    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        self.inner.get_trades(symbol).await
    }

    async fn get_all_trades(&self) -> Result<Vec<Trade>, StoreError> {
        self.inner.get_all_trades().await
    }

    async fn get_open_positions(&self) -> Result<Vec<Trade>, StoreError> {
        self.inner.get_open_positions().await
    }

    async fn get_recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        self.inner.get_recent_trades(limit).await
    }

    async fn trading_summary(&self) -> Result<Vec<TradingSummary>, StoreError> {
        self.inner.trading_summary().await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_trade(
        &self,
        symbol: &str,
        side: TradeSide,
        price: f64,
        quantity: f64,
    ) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap()
            .push(format!("trade {} {} {:.2} {:.8}", symbol, side, price, quantity));
        Ok(())
    }

    async fn notify_error(&self, error: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(format!("error {}", error));
        Ok(())
    }

    async fn notify_unprotected(
        &self,
        symbol: &str,
        _quantity: f64,
        reason: &str,
    ) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap()
            .push(format!("unprotected {} {}", symbol, reason));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Harness<S> {
    exchange: Arc<SimulatedExchange>,
    store: Arc<S>,
    notifier: Arc<RecordingNotifier>,
    engine: TradingEngine,
}

fn harness(
    exchange: SimulatedExchange,
    pairs: &[&str],
    initial_balance: f64,
) -> Harness<MemoryTradeStore> {
    harness_with_store(exchange, MemoryTradeStore::new(), pairs, initial_balance)
}

fn harness_with_store<S: TradeStore + 'static>(
    exchange: SimulatedExchange,
    store: S,
    pairs: &[&str],
    initial_balance: f64,
) -> Harness<S> {
    let exchange = Arc::new(exchange);
    let store = Arc::new(store);
    let notifier = Arc::new(RecordingNotifier::default());

    let executor = Executor::new(
        exchange.clone(),
        ExecutorConfig {
            stop_retry_delay: Duration::from_millis(1),
            ..ExecutorConfig::default()
        },
    );
    let settings = EngineSettings {
        pairs: pairs.iter().map(|p| p.to_string()).collect(),
        ..EngineSettings::default()
    };

    let engine = TradingEngine::new(
        exchange.clone(),
        executor,
        PositionManager::new(store.clone(), 0.001, ExitPolicy::default()),
        Box::new(MeanReversionStrategy::default()),
        RiskManager::new(initial_balance, RiskLimits::default()),
        notifier.clone(),
        settings,
    );

    Harness {
        exchange,
        store,
        notifier,
        engine,
    }
}

impl<S> Harness<S> {
    /// Run one cycle per price for a single pair, returning each outcome
    async fn drive(&mut self, symbol: &str, prices: &[f64]) -> Vec<PairOutcome> {
        let mut outcomes = Vec::new();
        for &price in prices {
            self.exchange.set_price(symbol, price);
            let results = self.engine.run_cycle().await;
            let (_, result) = results
                .into_iter()
                .find(|(pair, _)| pair == symbol)
                .expect("pair not processed");
            outcomes.push(result.expect("cycle failed"));
        }
        outcomes
    }
}

/// Falling prices that end with a BUY signal at 100
const DIP: [f64; 6] = [110.0, 108.0, 106.0, 104.0, 102.0, 100.0];

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_buy_on_dip_places_stop_and_records_position() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["BTCUSDT"],
        1000.0,
    );

    let outcomes = h.drive("BTCUSDT", &DIP).await;

    assert!(outcomes[..5].iter().all(|o| *o == PairOutcome::Hold));
    let buy = match &outcomes[5] {
        PairOutcome::Bought(trade) => trade.clone(),
        other => panic!("expected buy, got {:?}", other),
    };

    // Risk size 10 capped at 95% of 1000 USDT / 100
    assert!((buy.quantity - 9.5).abs() < 1e-9);
    assert_eq!(buy.price, 100.0);
    assert_eq!(buy.status, TradeStatus::Open);
    // The whole fill rests under the protective stop
    assert!((h.exchange.locked_balance("BTC") - 9.5).abs() < 1e-9);
    assert!(h.exchange.free_balance("BTC").abs() < 1e-9);

    let stops = h.exchange.stop_orders.lock().unwrap().clone();
    assert_eq!(stops.len(), 1);
    assert!((stops[0].stop_loss_price - 99.5).abs() < 1e-9);

    let open = h.store.get_last_open_buy("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(open.id, buy.id);
    assert!(h.notifier.messages().iter().any(|m| m.starts_with("trade BTCUSDT BUY")));
}

#[tokio::test]
async fn test_profit_target_closes_position() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["BTCUSDT"],
        1000.0,
    );
    h.drive("BTCUSDT", &DIP).await;

    let outcomes = h.drive("BTCUSDT", &[102.5]).await;
    let sell = match &outcomes[0] {
        PairOutcome::Sold(trade) => trade.clone(),
        other => panic!("expected sell, got {:?}", other),
    };

    // 2.5 * 9.5 gross minus 0.1% on both legs (950 + 973.75)
    assert!((sell.quantity - 9.5).abs() < 1e-9);
    assert!((sell.pnl - 21.82625).abs() < 1e-6);
    assert_eq!(sell.status, TradeStatus::Closed);

    assert!(h.store.get_last_open_buy("BTCUSDT").await.unwrap().is_none());
    assert!(h.exchange.balance("BTC").abs() < 1e-9);
    // Stop was cancelled to release the base before selling
    assert!(h.exchange.stop_orders.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_tiered_take_profit_sells_half() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["BTCUSDT"],
        1000.0,
    );
    h.drive("BTCUSDT", &DIP).await;

    let outcomes = h.drive("BTCUSDT", &[106.0]).await;
    match &outcomes[0] {
        PairOutcome::Sold(trade) => assert!((trade.quantity - 4.75).abs() < 1e-9),
        other => panic!("expected partial sell, got {:?}", other),
    }

    // The remainder is protected again at the original stop level
    let stops = h.exchange.stop_orders.lock().unwrap().clone();
    assert_eq!(stops.len(), 1);
    assert!((stops[0].quantity - 4.75).abs() < 1e-9);
    assert!((stops[0].stop_loss_price - 99.5).abs() < 1e-9);
    assert!((h.exchange.locked_balance("BTC") - 4.75).abs() < 1e-9);
    assert!(!h
        .notifier
        .messages()
        .iter()
        .any(|m| m.starts_with("unprotected")));
}

#[tokio::test]
async fn test_emergency_exit_overrides_buy_signal() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["BTCUSDT"],
        1000.0,
    );
    h.drive("BTCUSDT", &DIP).await;

    // New low: the strategy would buy again, but the position is down 6%
    let outcomes = h.drive("BTCUSDT", &[94.0]).await;
    let sell = match &outcomes[0] {
        PairOutcome::Sold(trade) => trade.clone(),
        other => panic!("expected emergency sell, got {:?}", other),
    };

    assert!((sell.quantity - 9.5).abs() < 1e-9);
    assert!(sell.pnl < 0.0);
}

#[tokio::test]
async fn test_small_loss_holds_position() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["BTCUSDT"],
        1000.0,
    );
    h.drive("BTCUSDT", &DIP).await;

    let outcomes = h.drive("BTCUSDT", &[99.0, 101.0]).await;
    for outcome in outcomes {
        assert!(matches!(outcome, PairOutcome::Hold | PairOutcome::Skipped(_)));
    }
    assert!(h.store.get_last_open_buy("BTCUSDT").await.unwrap().is_some());
}

#[tokio::test]
async fn test_drawdown_blocks_new_buys() {
    // Account is worth half of the configured initial investment
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 500.0)]),
        &["BTCUSDT"],
        1000.0,
    );

    let outcomes = h.drive("BTCUSDT", &DIP).await;

    assert_eq!(
        outcomes[5],
        PairOutcome::Skipped("drawdown limit reached".to_string())
    );
    assert!(h.store.is_empty().await);
    assert!(h.engine.risk().check_drawdown());
}

#[tokio::test]
async fn test_buy_skipped_below_min_order_size() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 5.0)]),
        &["BTCUSDT"],
        5.0,
    );

    let outcomes = h.drive("BTCUSDT", &DIP).await;

    assert!(matches!(&outcomes[5], PairOutcome::Skipped(reason) if reason.contains("insufficient")));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_unprotected_buy_is_alerted() {
    let exchange = SimulatedExchange {
        reject_stops: true,
        ..SimulatedExchange::with_balances(&[("USDT", 1000.0)])
    };
    let mut h = harness(exchange, &["BTCUSDT"], 1000.0);

    let outcomes = h.drive("BTCUSDT", &DIP).await;

    assert!(matches!(outcomes[5], PairOutcome::Bought(_)));
    assert!(h
        .notifier
        .messages()
        .iter()
        .any(|m| m.starts_with("unprotected BTCUSDT")));
}

#[tokio::test]
async fn test_failing_pair_does_not_stop_others() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["ETHUSDT", "BTCUSDT"],
        1000.0,
    );
    // No price is ever set for ETHUSDT
    h.exchange.set_price("BTCUSDT", 100.0);

    let results = h.engine.run_cycle().await;

    assert_eq!(results.len(), 2);
    assert!(matches!(
        results[0],
        (ref pair, Err(EngineError::Exchange(ExchangeError::NoPrice(_)))) if pair == "ETHUSDT"
    ));
    assert!(matches!(results[1], (_, Ok(PairOutcome::Hold))));
    assert!(h
        .notifier
        .messages()
        .iter()
        .any(|m| m.starts_with("error ETHUSDT")));
}

#[tokio::test]
async fn test_locked_stop_quantity_counts_toward_account_value() {
    let mut h = harness(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        &["BTCUSDT"],
        1000.0,
    );

    let outcomes = h.drive("BTCUSDT", &DIP).await;
    assert!(matches!(outcomes[5], PairOutcome::Bought(_)));
    assert!(h.exchange.free_balance("BTC").abs() < 1e-9);

    // Price unchanged: 50 USDT left plus 9.5 BTC locked at 100
    h.drive("BTCUSDT", &[100.0]).await;

    assert!((h.engine.risk().current_balance() - 1000.0).abs() < 1e-6);
    assert!(!h.engine.risk().check_drawdown());
}

#[tokio::test]
async fn test_failed_position_lookup_skips_pair() {
    let store = FlakyLookupStore {
        inner: MemoryTradeStore::new(),
        fail_lookups: AtomicBool::new(false),
    };
    let mut h = harness_with_store(
        SimulatedExchange::with_balances(&[("USDT", 1000.0)]),
        store,
        &["BTCUSDT"],
        1000.0,
    );
    h.drive("BTCUSDT", &DIP).await;

    // A new low would be a BUY signal, but the open position cannot be seen
    h.store.fail_lookups.store(true, Ordering::SeqCst);
    h.exchange.set_price("BTCUSDT", 99.0);
    let results = h.engine.run_cycle().await;

    assert!(matches!(
        results[0],
        (_, Err(EngineError::Store(StoreError::Corrupt(_))))
    ));
    let buys = h
        .store
        .inner
        .get_all_trades()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.side == TradeSide::Buy)
        .count();
    assert_eq!(buys, 1);
    assert!(h
        .notifier
        .messages()
        .iter()
        .any(|m| m.starts_with("error BTCUSDT")));
}
