// Alerting module
pub mod telegram;

pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::TradeSide;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification API returned status {0}")]
    Status(u16),
}

/// Out-of-band alerts about trading activity
///
/// Delivery failures are reported to the caller, who logs them; they never
/// affect trading.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_trade(
        &self,
        symbol: &str,
        side: TradeSide,
        price: f64,
        quantity: f64,
    ) -> Result<(), NotifyError>;

    async fn notify_error(&self, error: &str) -> Result<(), NotifyError>;

    /// A buy filled but has no protective stop on the exchange
    async fn notify_unprotected(
        &self,
        symbol: &str,
        quantity: f64,
        reason: &str,
    ) -> Result<(), NotifyError>;
}
