use serde::{Deserialize, Serialize};

/// Why an open position is being (partly) sold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Loss beyond the emergency threshold, sold regardless of signals
    EmergencyLoss,
    /// Partial profit taken at a tier
    TieredTakeProfit,
    /// Full exit at the minimum profit target
    ProfitTarget,
    /// Strategy emitted SELL while the position is not losing
    StrategySell,
}

/// Decision for an open position: why and what share of the held balance to sell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPlan {
    pub reason: ExitReason,
    /// Fraction of the held base balance in `(0, 1]`
    pub fraction: f64,
}

/// Threshold in percent of unrealized profit paired with an exit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitTier {
    pub min_profit_pct: f64,
    pub fraction: f64,
}

/// Ordered exit rules evaluated against unrealized profit
///
/// First match wins:
/// 1. loss below `-emergency_loss_pct`: sell everything
/// 2. take-profit tiers, highest first: sell the tier fraction
/// 3. profit at or above `profit_target_pct`: sell everything
/// 4. strategy SELL with non-negative profit: sell everything
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPolicy {
    pub emergency_loss_pct: f64,
    pub take_profit_tiers: Vec<ExitTier>,
    pub profit_target_pct: f64,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            emergency_loss_pct: 5.0,
            take_profit_tiers: vec![
                ExitTier {
                    min_profit_pct: 5.0,
                    fraction: 0.5,
                },
                ExitTier {
                    min_profit_pct: 3.0,
                    fraction: 0.3,
                },
            ],
            profit_target_pct: 2.0,
        }
    }
}

impl ExitPolicy {
    pub fn evaluate(&self, unrealized_pct: f64, sell_signal: bool) -> Option<ExitPlan> {
        if unrealized_pct < -self.emergency_loss_pct {
            return Some(ExitPlan {
                reason: ExitReason::EmergencyLoss,
                fraction: 1.0,
            });
        }

        let mut tiers: Vec<&ExitTier> = self.take_profit_tiers.iter().collect();
        tiers.sort_by(|a, b| b.min_profit_pct.total_cmp(&a.min_profit_pct));
        if let Some(tier) = tiers.into_iter().find(|t| unrealized_pct >= t.min_profit_pct) {
            return Some(ExitPlan {
                reason: ExitReason::TieredTakeProfit,
                fraction: tier.fraction,
            });
        }

        if unrealized_pct >= self.profit_target_pct {
            return Some(ExitPlan {
                reason: ExitReason::ProfitTarget,
                fraction: 1.0,
            });
        }

        if sell_signal && unrealized_pct >= 0.0 {
            return Some(ExitPlan {
                reason: ExitReason::StrategySell,
                fraction: 1.0,
            });
        }

        None
    }
}
