// Technical indicators module
// Streaming RSI used by the mean reversion strategy

pub mod rsi;

pub use rsi::{RsiCalculator, NEUTRAL_RSI};
