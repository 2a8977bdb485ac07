// Risk management module
pub mod risk_manager;

pub use risk_manager::{RiskError, RiskLimits, RiskManager};
