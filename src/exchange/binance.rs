use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;

use crate::exchange::{AssetBalance, Exchange, ExchangeError, Fill};
use crate::models::{Order, TradeSide};

pub const BINANCE_API_BASE: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 10_000;
const REQUESTS_PER_SECOND: u32 = 10;
/// Returned by cancel endpoints when there is nothing to cancel
const UNKNOWN_ORDER: i64 = -2011;

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance spot REST client
///
/// Signed endpoints use HMAC-SHA256 over the urlencoded query. The clock
/// offset measured by [`Exchange::sync_time`] is added to every signed
/// timestamp. All clones share one rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    time_offset_ms: Arc<AtomicI64>,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawFill {
    price: String,
    qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    fills: Vec<RawFill>,
}

impl BinanceClient {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            time_offset_ms: Arc::new(AtomicI64::new(0)),
            rate_limiter,
        })
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn sign(&self, params: &mut Vec<(&str, String)>) -> Result<String, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis() + self.time_offset_ms();
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", timestamp.to_string()));

        let query = serde_urlencoded::to_string(&*params)
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&signature={}", query, signature))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.client.get(&url).query(params).send().await?;
        decode(response).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let query = self.sign(&mut params)?;
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        decode(response).await
    }
}

/// Turn a response into `T`, mapping Binance `{code, msg}` bodies to `Api` errors
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => ExchangeError::Api {
                code: err.code,
                msg: err.msg,
            },
            Err(_) => ExchangeError::Api {
                code: i64::from(status.as_u16()),
                msg: body,
            },
        });
    }

    serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(e.to_string()))
}

fn parse_f64(field: &str, value: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("invalid {}: {:?}", field, value)))
}

/// Average executed price and quantity of a FULL order response
fn executed_price_and_qty(resp: &OrderResponse) -> Result<(f64, f64), ExchangeError> {
    let executed_qty = match &resp.executed_qty {
        Some(q) => parse_f64("executedQty", q)?,
        None => 0.0,
    };

    if executed_qty > 0.0 {
        if let Some(quote) = &resp.cummulative_quote_qty {
            let quote = parse_f64("cummulativeQuoteQty", quote)?;
            if quote > 0.0 {
                return Ok((quote / executed_qty, executed_qty));
            }
        }
    }

    // Fall back to the individual fills
    let mut qty = 0.0;
    let mut notional = 0.0;
    for fill in &resp.fills {
        let price = parse_f64("fill price", &fill.price)?;
        let fill_qty = parse_f64("fill qty", &fill.qty)?;
        qty += fill_qty;
        notional += price * fill_qty;
    }

    if qty > 0.0 {
        Ok((notional / qty, qty))
    } else {
        Err(ExchangeError::Decode(format!(
            "order {} reported no executed quantity",
            resp.order_id
        )))
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn ping(&self) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self.public_get("/api/v3/ping", &[]).await?;
        Ok(())
    }

    async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let time: ServerTime = self.public_get("/api/v3/time", &[]).await?;
        let offset = time.server_time - Utc::now().timestamp_millis();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        Ok(offset)
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/api/v3/ticker/price", &[("symbol", symbol)])
            .await?;

        let price = parse_f64("price", &ticker.price)?;
        if price <= 0.0 {
            return Err(ExchangeError::NoPrice(symbol.to_string()));
        }
        Ok(price)
    }

    async fn account_balances(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let account: AccountInfo = self
            .signed_request(Method::GET, "/api/v3/account", vec![])
            .await?;

        account
            .balances
            .into_iter()
            .map(|b| {
                Ok(AssetBalance {
                    free: parse_f64("free", &b.free)?,
                    locked: parse_f64("locked", &b.locked)?,
                    asset: b.asset,
                })
            })
            .collect()
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        tracing::info!("🚀 Sending order: {} {} {} @ MARKET", side, quantity, symbol);

        let resp: OrderResponse = self
            .signed_request(Method::POST, "/api/v3/order", params)
            .await?;
        let (price, quantity) = executed_price_and_qty(&resp)?;

        Ok(Fill {
            order_id: resp.order_id.to_string(),
            price,
            quantity,
        })
    }

    async fn place_stop_loss_limit(&self, order: &Order) -> Result<String, ExchangeError> {
        let params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", format!("{:.8}", order.quantity)),
            ("price", format!("{:.2}", order.price)),
            ("stopPrice", format!("{:.2}", order.stop_loss_price)),
        ];

        let resp: OrderResponse = self
            .signed_request(Method::POST, "/api/v3/order", params)
            .await?;

        Ok(resp.order_id.to_string())
    }

    async fn cancel_open_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        let params = vec![("symbol", symbol.to_string())];

        match self
            .signed_request::<Vec<serde_json::Value>>(Method::DELETE, "/api/v3/openOrders", params)
            .await
        {
            Ok(cancelled) => Ok(cancelled.len()),
            Err(ExchangeError::Api { code, .. }) if code == UNKNOWN_ORDER => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::str::FromStr;

    fn client(base_url: &str) -> BinanceClient {
        BinanceClient::new("test_key", "test_secret", base_url).unwrap()
    }

    #[tokio::test]
    async fn test_get_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"42000.50000000"}"#)
            .create_async()
            .await;

        let price = client(&server.url()).get_price("BTCUSDT").await.unwrap();

        assert_eq!(price, 42000.5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_is_decoded() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .create_async()
            .await;

        let err = client(&server.url()).get_price("NOPE").await.unwrap_err();

        match err {
            ExchangeError::Api { code, msg } => {
                assert_eq!(code, -1121);
                assert_eq!(msg, "Invalid symbol.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_time_records_offset() {
        let mut server = mockito::Server::new_async().await;
        let server_time = Utc::now().timestamp_millis() + 60_000;
        server
            .mock("GET", "/api/v3/time")
            .with_status(200)
            .with_body(format!(r#"{{"serverTime":{}}}"#, server_time))
            .create_async()
            .await;

        let client = client(&server.url());
        let offset = client.sync_time().await.unwrap();

        assert!(offset > 55_000 && offset <= 60_000, "offset {}", offset);
        assert_eq!(client.time_offset_ms(), offset);
    }

    #[tokio::test]
    async fn test_account_balances_are_signed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/account")
            .match_header("X-MBX-APIKEY", "test_key")
            .match_query(Matcher::AllOf(vec![
                Matcher::Regex("timestamp=\\d+".into()),
                Matcher::Regex("recvWindow=10000".into()),
                Matcher::Regex("signature=[0-9a-f]{64}".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"balances":[
                    {"asset":"BTC","free":"0.00500000","locked":"0.00000000"},
                    {"asset":"USDT","free":"120.50","locked":"10.00"},
                    {"asset":"ETH","free":"0.00000000","locked":"0.00000000"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = client(&server.url());
        let balances = client.get_balances().await.unwrap();

        assert_eq!(balances.len(), 2);
        assert_eq!(balances["BTC"], 0.005);
        assert_eq!(balances["USDT"], 120.5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_market_order_uses_average_fill_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("side".into(), "BUY".into()),
                Matcher::UrlEncoded("type".into(), "MARKET".into()),
                Matcher::UrlEncoded("quantity".into(), "0.002".into()),
                Matcher::UrlEncoded("newOrderRespType".into(), "FULL".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"symbol":"BTCUSDT","orderId":28,"price":"0.00000000",
                    "executedQty":"0.00200000","cummulativeQuoteQty":"100.00000000",
                    "status":"FILLED","fills":[]}"#,
            )
            .create_async()
            .await;

        let fill = client(&server.url())
            .place_market_order("BTCUSDT", TradeSide::Buy, Decimal::from_str("0.002").unwrap())
            .await
            .unwrap();

        assert_eq!(fill.order_id, "28");
        assert!((fill.price - 50_000.0).abs() < 1e-6);
        assert!((fill.quantity - 0.002).abs() < 1e-12);
        mock.assert_async().await;
    }

    #[test]
    fn test_executed_price_falls_back_to_fills() {
        let resp = OrderResponse {
            order_id: 7,
            executed_qty: None,
            cummulative_quote_qty: None,
            fills: vec![
                RawFill {
                    price: "100.0".to_string(),
                    qty: "1.0".to_string(),
                },
                RawFill {
                    price: "102.0".to_string(),
                    qty: "1.0".to_string(),
                },
            ],
        };

        let (price, qty) = executed_price_and_qty(&resp).unwrap();
        assert_eq!(price, 101.0);
        assert_eq!(qty, 2.0);
    }

    #[tokio::test]
    async fn test_stop_loss_limit_order_params() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("side".into(), "SELL".into()),
                Matcher::UrlEncoded("type".into(), "STOP_LOSS_LIMIT".into()),
                Matcher::UrlEncoded("timeInForce".into(), "GTC".into()),
                Matcher::UrlEncoded("stopPrice".into(), "49750.00".into()),
                Matcher::UrlEncoded("price".into(), "49650.50".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","orderId":29,"status":"NEW"}"#)
            .create_async()
            .await;

        let order = Order::stop_loss_limit("BTCUSDT", 0.002, 49_750.0, 49_650.5);
        let id = client(&server.url())
            .place_stop_loss_limit(&order)
            .await
            .unwrap();

        assert_eq!(id, "29");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_open_orders() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/v3/openOrders")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .match_header("X-MBX-APIKEY", "test_key")
            .with_status(200)
            .with_body(r#"[{"symbol":"BTCUSDT","orderId":29,"status":"CANCELED"}]"#)
            .create_async()
            .await;

        let cancelled = client(&server.url())
            .cancel_open_orders("BTCUSDT")
            .await
            .unwrap();

        assert_eq!(cancelled, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_with_nothing_open() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/api/v3/openOrders")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2011,"msg":"Unknown order sent."}"#)
            .create_async()
            .await;

        let cancelled = client(&server.url())
            .cancel_open_orders("BTCUSDT")
            .await
            .unwrap();

        assert_eq!(cancelled, 0);
    }
}
