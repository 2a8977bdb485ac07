// Trading strategy module
pub mod mean_reversion;
pub mod range;

pub use mean_reversion::{MeanReversionConfig, MeanReversionStrategy};
pub use range::{RangeTracker, SymbolState};

use crate::models::{PricePoint, Signal};

/// Base trait for all trading strategies
///
/// Strategies are fed one price per tick and keep whatever per-symbol state
/// they need between calls.
pub trait Strategy: Send {
    /// Analyze the latest price and optionally emit a signal
    fn analyze(&mut self, data: &PricePoint) -> Option<Signal>;

    /// Get strategy name
    fn name(&self) -> &str;
}
