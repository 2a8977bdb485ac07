use std::collections::{HashMap, VecDeque};

/// Default number of recent prices kept per symbol
pub const DEFAULT_WINDOW: usize = 30;

/// Per-symbol price memory for the range tracker
///
/// `local_high` / `local_low` cover every price seen since the symbol was
/// first observed. They are never reset, so the range only widens over the
/// lifetime of the process.
#[derive(Debug, Clone)]
pub struct SymbolState {
    prices: VecDeque<f64>,
    local_high: f64,
    local_low: f64,
    entry_price: Option<f64>,
}

impl SymbolState {
    fn new(first_price: f64, capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity + 1),
            local_high: first_price,
            local_low: first_price,
            entry_price: None,
        }
    }

    pub fn prices(&self) -> &VecDeque<f64> {
        &self.prices
    }

    pub fn local_high(&self) -> f64 {
        self.local_high
    }

    pub fn local_low(&self) -> f64 {
        self.local_low
    }

    pub fn entry_price(&self) -> Option<f64> {
        self.entry_price
    }

    /// Placement of `price` between the observed low and high, in percent
    pub fn position_in_range(&self, price: f64) -> f64 {
        let range = self.local_high - self.local_low;
        if range > 0.0 {
            (price - self.local_low) / range * 100.0
        } else {
            0.0
        }
    }

    /// Unrealized profit in percent against the remembered entry (0 without one)
    pub fn unrealized_profit_pct(&self, price: f64) -> f64 {
        match self.entry_price {
            Some(entry) if entry > 0.0 => (price - entry) / entry * 100.0,
            _ => 0.0,
        }
    }
}

/// Rolling window, local high/low and entry price, keyed by symbol
#[derive(Debug, Clone)]
pub struct RangeTracker {
    window: usize,
    symbols: HashMap<String, SymbolState>,
}

impl RangeTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            symbols: HashMap::new(),
        }
    }

    /// Record a price and return the updated state for the symbol
    pub fn observe(&mut self, symbol: &str, price: f64) -> &SymbolState {
        let window = self.window;
        let state = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(price, window));

        state.prices.push_back(price);
        while state.prices.len() > window {
            state.prices.pop_front();
        }

        if price > state.local_high {
            state.local_high = price;
        }
        if price < state.local_low {
            state.local_low = price;
        }

        state
    }

    pub fn set_entry_price(&mut self, symbol: &str, price: f64) {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.entry_price = Some(price);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolState> {
        self.symbols.get(symbol)
    }
}

impl Default for RangeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
