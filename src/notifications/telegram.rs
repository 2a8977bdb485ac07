use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::models::TradeSide;
use crate::notifications::{Notifier, NotifyError};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Sends alerts to a Telegram chat through the Bot API
///
/// Disabled (every call is a no-op) when the token or chat id is empty.
pub struct TelegramNotifier {
    client: Client,
    token: String,
    chat_id: String,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::with_base_url(token, chat_id, TELEGRAM_API_BASE)
    }

    pub fn with_base_url(
        token: impl Into<String>,
        chat_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            token: token.into(),
            chat_id: chat_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty() && !self.chat_id.is_empty()
    }

    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let response = self
            .client
            .post(&url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_trade(
        &self,
        symbol: &str,
        side: TradeSide,
        price: f64,
        quantity: f64,
    ) -> Result<(), NotifyError> {
        let message = format!(
            "Trade Executed:\n\nSymbol: {}\nSide: {}\nPrice: {:.2}\nQuantity: {:.8}",
            symbol, side, price, quantity
        );
        self.send_message(&message).await
    }

    async fn notify_error(&self, error: &str) -> Result<(), NotifyError> {
        self.send_message(&format!("⚠️ Error\n\n{}", error)).await
    }

    async fn notify_unprotected(
        &self,
        symbol: &str,
        quantity: f64,
        reason: &str,
    ) -> Result<(), NotifyError> {
        let message = format!(
            "🚨 UNPROTECTED POSITION\n\nSymbol: {}\nQuantity: {:.8}\nNo stop loss is active: {}",
            symbol, quantity, reason
        );
        self.send_message(&message).await
    }
}
