use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("stop loss equals entry price ({0}), cannot size position")]
    ZeroStopDistance(f64),

    #[error("invalid entry price: {0}")]
    InvalidPrice(f64),
}

/// Risk limits applied to every new position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Fractional drawdown from the initial balance that halts new buys
    pub max_drawdown: f64,
    /// Fraction of the risk base put at risk per trade
    pub risk_per_trade: f64,
    /// Multiplier applied while the account is above its initial balance
    pub aggressive_factor: f64,
    /// Let the risk base grow with profits (capped at 2x initial)
    pub enable_compounding: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown: 0.10,
            risk_per_trade: 0.02,
            aggressive_factor: 1.5,
            enable_compounding: true,
        }
    }
}

/// Balance-aware position sizer
#[derive(Debug, Clone)]
pub struct RiskManager {
    limits: RiskLimits,
    initial_balance: f64,
    current_balance: f64,
}

impl RiskManager {
    pub fn new(initial_balance: f64, limits: RiskLimits) -> Self {
        Self {
            limits,
            initial_balance,
            current_balance: initial_balance,
        }
    }

    pub fn current_balance(&self) -> f64 {
        self.current_balance
    }

    pub fn update_balance(&mut self, new_balance: f64) {
        self.current_balance = new_balance;
    }

    /// Quantity to buy at `entry` so that hitting `stop_loss` loses the
    /// per-trade risk amount, never more than the balance can pay for
    pub fn calculate_position_size(&self, entry: f64, stop_loss: f64) -> Result<f64, RiskError> {
        if entry <= 0.0 || !entry.is_finite() {
            return Err(RiskError::InvalidPrice(entry));
        }

        let stop_distance = (entry - stop_loss).abs();
        if stop_distance == 0.0 {
            return Err(RiskError::ZeroStopDistance(entry));
        }

        let cap = if self.limits.enable_compounding {
            self.initial_balance * 2.0
        } else {
            self.initial_balance
        };
        let risk_base = self.current_balance.min(cap);
        let mut risk_amount = risk_base * self.limits.risk_per_trade;

        if self.current_balance > self.initial_balance {
            risk_amount *= self.limits.aggressive_factor;
        }

        let quantity = risk_amount / stop_distance;
        let max_quantity = self.current_balance / entry;

        Ok(quantity.min(max_quantity))
    }

    /// True once losses reach the configured drawdown, or the balance is gone
    pub fn check_drawdown(&self) -> bool {
        if self.current_balance <= 0.0 {
            return true;
        }
        if self.initial_balance <= 0.0 {
            return false;
        }

        let drawdown = (self.initial_balance - self.current_balance) / self.initial_balance;
        drawdown >= self.limits.max_drawdown
    }
}
