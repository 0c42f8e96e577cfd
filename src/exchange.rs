//! Exchange API client
//!
//! The `ExchangeClient` trait is the sole boundary to the exchange. The REST
//! implementation signs requests with HMAC-SHA256 and maps transport errors
//! into the session error taxonomy instead of leaking reqwest errors upward.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::oms::OrderRequest;
use crate::types::{SessionError, Symbol};

type HmacSha256 = Hmac<Sha256>;

const API_BASE_URL: &str = "https://api.exchange.example.com";

/// Raw ticker payload as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTicker {
    pub market: String,
    pub bid: String,
    pub ask: String,
    pub last_price: String,
    pub timestamp: i64,
}

/// Raw fill notification as reported by the exchange.
///
/// Duplicates and replays are expected; the feed adapter deduplicates by
/// `fill_id` before anything downstream sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFill {
    pub fill_id: String,
    pub order_id: String,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Exchange acknowledgment of a placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub status: String,
}

/// Boundary trait for exchange I/O. Backtests never touch it; the live
/// session drives it through the feed adapter.
pub trait ExchangeClient: Send + Sync {
    fn fetch_ticker(
        &self,
        instrument: &Symbol,
    ) -> impl std::future::Future<Output = Result<RawTicker, SessionError>> + Send;

    fn fetch_fills(
        &self,
        instrument: &Symbol,
    ) -> impl std::future::Future<Output = Result<Vec<RawFill>, SessionError>> + Send;

    fn place_order(
        &self,
        request: &OrderRequest,
    ) -> impl std::future::Future<Output = Result<OrderAck, SessionError>> + Send;

    fn cancel_order(
        &self,
        exchange_order_id: &str,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

/// HMAC-signed REST client
#[derive(Debug, Clone)]
pub struct RestClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    side: &'a str,
    order_type: &'a str,
    market: &'a str,
    price_per_unit: f64,
    total_quantity: f64,
    client_order_id: u64,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct CancelOrderBody<'a> {
    id: &'a str,
    timestamp: i64,
}

impl RestClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        RestClient {
            api_key,
            api_secret,
            base_url: API_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn sign(&self, payload: &str) -> Result<String, SessionError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| SessionError::ExchangeConnectivityLoss(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn transport(e: reqwest::Error) -> SessionError {
        SessionError::ExchangeConnectivityLoss(e.to_string())
    }
}

impl ExchangeClient for RestClient {
    async fn fetch_ticker(&self, instrument: &Symbol) -> Result<RawTicker, SessionError> {
        let url = format!("{}/exchange/ticker", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport)?;

        let tickers: Vec<RawTicker> = response.json().await.map_err(Self::transport)?;
        tickers
            .into_iter()
            .find(|t| t.market == instrument.as_str())
            .ok_or_else(|| {
                SessionError::ExchangeConnectivityLoss(format!(
                    "ticker not found for {}",
                    instrument
                ))
            })
    }

    async fn fetch_fills(&self, instrument: &Symbol) -> Result<Vec<RawFill>, SessionError> {
        let url = format!("{}/exchange/v1/fills", self.base_url);
        let timestamp = Utc::now().timestamp_millis();
        let payload = format!(
            "{{\"market\":\"{}\",\"timestamp\":{}}}",
            instrument.as_str(),
            timestamp
        );
        let signature = self.sign(&payload)?;

        let response = self
            .client
            .post(&url)
            .header("X-AUTH-APIKEY", &self.api_key)
            .header("X-AUTH-SIGNATURE", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(Self::transport)?;

        response.json().await.map_err(Self::transport)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, SessionError> {
        let url = format!("{}/exchange/v1/orders/create", self.base_url);
        let body = PlaceOrderBody {
            side: match request.side {
                crate::types::Side::Buy => "buy",
                crate::types::Side::Sell => "sell",
            },
            order_type: "limit_order",
            market: request.instrument.as_str(),
            price_per_unit: request.price.to_f64(),
            total_quantity: request.quantity.to_f64(),
            client_order_id: request.client_id,
            timestamp: Utc::now().timestamp_millis(),
        };

        let payload = serde_json::to_string(&body)
            .map_err(|e| SessionError::ExchangeConnectivityLoss(e.to_string()))?;
        let signature = self.sign(&payload)?;

        let response = self
            .client
            .post(&url)
            .header("X-AUTH-APIKEY", &self.api_key)
            .header("X-AUTH-SIGNATURE", signature)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            let reason = response.text().await.unwrap_or_default();
            return Err(SessionError::OrderRejected {
                client_id: request.client_id,
                reason,
            });
        }

        response.json().await.map_err(Self::transport)
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), SessionError> {
        let url = format!("{}/exchange/v1/orders/cancel", self.base_url);
        let body = CancelOrderBody {
            id: exchange_order_id,
            timestamp: Utc::now().timestamp_millis(),
        };

        let payload = serde_json::to_string(&body)
            .map_err(|e| SessionError::ExchangeConnectivityLoss(e.to_string()))?;
        let signature = self.sign(&payload)?;

        self.client
            .post(&url)
            .header("X-AUTH-APIKEY", &self.api_key)
            .header("X-AUTH-SIGNATURE", signature)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport)?;

        Ok(())
    }
}

// ============================================================================
// Paper trading
// ============================================================================

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    side: crate::types::Side,
    price: f64,
    quantity: f64,
}

/// Paper-trading client: real market data from the wrapped client, orders
/// held in a local book and filled when the fetched ticker crosses them.
/// No order ever reaches the exchange.
pub struct PaperClient<C: ExchangeClient> {
    inner: C,
    book: Mutex<Vec<PaperOrder>>,
    pending_fills: Mutex<Vec<RawFill>>,
    next_id: AtomicU64,
}

impl<C: ExchangeClient> PaperClient<C> {
    pub fn new(inner: C) -> Self {
        PaperClient {
            inner,
            book: Mutex::new(Vec::new()),
            pending_fills: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Move crossed orders from the book to the pending fill queue
    fn match_price(&self, last: f64) {
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        let mut fills = self
            .pending_fills
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        book.retain(|order| {
            let crossed = match order.side {
                crate::types::Side::Buy => last <= order.price,
                crate::types::Side::Sell => last >= order.price,
            };
            if crossed {
                fills.push(RawFill {
                    fill_id: format!("paper-fill-{}", order.id),
                    order_id: order.id.clone(),
                    price: order.price,
                    quantity: order.quantity,
                    timestamp: Utc::now(),
                });
            }
            !crossed
        });
    }
}

impl<C: ExchangeClient> ExchangeClient for PaperClient<C> {
    async fn fetch_ticker(&self, instrument: &Symbol) -> Result<RawTicker, SessionError> {
        let ticker = self.inner.fetch_ticker(instrument).await?;
        if let Ok(last) = ticker.last_price.parse::<f64>() {
            self.match_price(last);
        }
        Ok(ticker)
    }

    async fn fetch_fills(&self, _instrument: &Symbol) -> Result<Vec<RawFill>, SessionError> {
        let mut fills = self
            .pending_fills
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(std::mem::take(&mut *fills))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, SessionError> {
        let id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let order = PaperOrder {
            id: id.clone(),
            side: request.side,
            price: request.price.to_f64(),
            quantity: request.quantity.to_f64(),
        };
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(order);
        Ok(OrderAck {
            id,
            status: "open".to_string(),
        })
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), SessionError> {
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|o| o.id != exchange_order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Money, Side};

    struct FixedTicker(f64);

    impl ExchangeClient for FixedTicker {
        async fn fetch_ticker(&self, instrument: &Symbol) -> Result<RawTicker, SessionError> {
            Ok(RawTicker {
                market: instrument.as_str().to_string(),
                bid: format!("{}", self.0 - 0.5),
                ask: format!("{}", self.0 + 0.5),
                last_price: format!("{}", self.0),
                timestamp: Utc::now().timestamp_millis(),
            })
        }

        async fn fetch_fills(&self, _instrument: &Symbol) -> Result<Vec<RawFill>, SessionError> {
            Ok(Vec::new())
        }

        async fn place_order(&self, _request: &OrderRequest) -> Result<OrderAck, SessionError> {
            unreachable!("paper client never forwards orders")
        }

        async fn cancel_order(&self, _exchange_order_id: &str) -> Result<(), SessionError> {
            unreachable!("paper client never forwards cancels")
        }
    }

    fn request(side: Side, price: f64) -> OrderRequest {
        OrderRequest::new(
            Symbol::new("BTCUSDT"),
            side,
            Money::from_f64(price),
            Money::from_f64(1.0),
            0,
        )
    }

    #[tokio::test]
    async fn test_paper_client_fills_on_cross() {
        let sym = Symbol::new("BTCUSDT");
        let paper = PaperClient::new(FixedTicker(94.0));

        let ack = paper.place_order(&request(Side::Buy, 95.0)).await.unwrap();
        assert!(ack.id.starts_with("paper-"));

        // Ticker at 94 crosses the 95 buy
        paper.fetch_ticker(&sym).await.unwrap();
        let fills = paper.fetch_fills(&sym).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, ack.id);

        // Queue drains once
        assert!(paper.fetch_fills(&sym).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paper_client_resting_order_not_filled() {
        let sym = Symbol::new("BTCUSDT");
        let paper = PaperClient::new(FixedTicker(100.0));

        paper.place_order(&request(Side::Buy, 95.0)).await.unwrap();
        paper.fetch_ticker(&sym).await.unwrap();
        assert!(paper.fetch_fills(&sym).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paper_client_cancel_removes_order() {
        let sym = Symbol::new("BTCUSDT");
        let paper = PaperClient::new(FixedTicker(100.0));

        let ack = paper.place_order(&request(Side::Sell, 99.0)).await.unwrap();
        paper.cancel_order(&ack.id).await.unwrap();

        // Would have crossed at 100 if still resting
        paper.fetch_ticker(&sym).await.unwrap();
        assert!(paper.fetch_fills(&sym).await.unwrap().is_empty());
    }
}
