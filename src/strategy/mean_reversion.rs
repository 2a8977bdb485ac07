use std::collections::HashMap;

use crate::indicators::RsiCalculator;
use crate::models::{PricePoint, Signal, TradeSide};
use crate::strategy::range::{RangeTracker, DEFAULT_WINDOW};
use crate::strategy::Strategy;

/// Mean reversion trading strategy
///
/// Buys when price sits near the bottom of its observed range while momentum
/// is oversold, and sells near the top of the range when momentum is
/// overbought and the remembered entry is in profit.
///
/// Entry conditions (ALL must be true):
/// - Position in range below `buy_range_pct` (e.g. 20%)
/// - RSI below `rsi_oversold` (e.g. 40)
///
/// Exit conditions (ALL must be true):
/// - Position in range above `sell_range_pct` (e.g. 80%)
/// - RSI above `rsi_overbought` (e.g. 60)
/// - Unrealized profit against the last entry is positive
#[derive(Debug, Clone)]
pub struct MeanReversionStrategy {
    config: MeanReversionConfig,
    ranges: RangeTracker,
    oscillators: HashMap<String, RsiCalculator>,
}

#[derive(Debug, Clone)]
pub struct MeanReversionConfig {
    /// RSI period (number of price changes averaged)
    pub rsi_period: usize,

    /// Number of recent prices kept per symbol
    pub window: usize,

    /// Position in range (percent) below which a buy is considered
    pub buy_range_pct: f64,

    /// Position in range (percent) above which a sell is considered
    pub sell_range_pct: f64,

    /// RSI level for "oversold"
    pub rsi_oversold: f64,

    /// RSI level for "overbought"
    pub rsi_overbought: f64,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            rsi_period: 5,
            window: DEFAULT_WINDOW,
            buy_range_pct: 20.0,
            sell_range_pct: 80.0,
            rsi_oversold: 40.0,
            rsi_overbought: 60.0,
        }
    }
}

impl MeanReversionStrategy {
    pub fn new(config: MeanReversionConfig) -> Self {
        Self {
            ranges: RangeTracker::new(config.window),
            oscillators: HashMap::new(),
            config,
        }
    }

    /// Tracked range state for a symbol
    pub fn ranges(&self) -> &RangeTracker {
        &self.ranges
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new(MeanReversionConfig::default())
    }
}

impl Strategy for MeanReversionStrategy {
    fn analyze(&mut self, data: &PricePoint) -> Option<Signal> {
        let symbol = data.symbol.as_str();
        let price = data.price;

        let state = self.ranges.observe(symbol, price);
        let position_in_range = state.position_in_range(price);
        let unrealized_pct = state.unrealized_profit_pct(price);

        let rsi_period = self.config.rsi_period;
        let rsi = self
            .oscillators
            .entry(symbol.to_string())
            .or_insert_with(|| RsiCalculator::new(rsi_period))
            .update(price);

        tracing::debug!(
            token = %symbol,
            "price={:.2} rsi={:.2} range_position={:.2}%",
            price,
            rsi,
            position_in_range
        );

        if position_in_range < self.config.buy_range_pct && rsi < self.config.rsi_oversold {
            tracing::info!(
                "🟢 BUY SIGNAL - {}: price near low ({:.2}%) and RSI oversold ({:.2})",
                symbol,
                position_in_range,
                rsi
            );
            self.ranges.set_entry_price(symbol, price);
            return Some(Signal::new(symbol, TradeSide::Buy, data.timestamp).with_price(price));
        }

        if position_in_range > self.config.sell_range_pct
            && rsi > self.config.rsi_overbought
            && unrealized_pct > 0.0
        {
            tracing::info!(
                "🔴 SELL SIGNAL - {}: price near high ({:.2}%) and RSI overbought ({:.2})",
                symbol,
                position_in_range,
                rsi
            );
            return Some(Signal::new(symbol, TradeSide::Sell, data.timestamp).with_price(price));
        }

        None
    }

    fn name(&self) -> &str {
        "Mean Reversion"
    }
}
