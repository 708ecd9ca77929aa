//! Bybit REST v5 client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use super::types::*;
use crate::config::BybitConfig;
use crate::error::{FetchError, OrderError};
use crate::exchange::{MarginMode, OrderAck, PositionSnapshot, Venue, VenueAdapter};

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";

/// Bybit API client for linear perpetuals.
pub struct BybitClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    /// Suffix for unique `orderLinkId`s within this process
    link_counter: AtomicU64,
}

impl BybitClient {
    /// Create a new Bybit client from configuration.
    pub fn new(config: &BybitConfig, testnet: bool) -> Result<Self> {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(config, base_url)
    }

    /// Create a new Bybit client with a custom base URL.
    pub fn with_base_url(config: &BybitConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            link_counter: AtomicU64::new(1),
        })
    }

    /// Hex HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(timestamp.as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(RECV_WINDOW.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn next_order_link_id(&self) -> String {
        let n = self.link_counter.fetch_add(1, Ordering::Relaxed);
        format!("sh-{}-{}", Self::timestamp(), n)
    }

    /// Send a request and decode the response envelope.
    ///
    /// For GET the payload is the query string, for POST the JSON body.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: String,
        private: bool,
    ) -> Result<BybitResponse<T>, FetchError> {
        let url = if method == Method::GET && !payload.is_empty() {
            format!("{}{}?{}", self.base_url, path, payload)
        } else {
            format!("{}{}", self.base_url, path)
        };

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");

        if private {
            let timestamp = Self::timestamp().to_string();
            let signature = self.sign(&timestamp, &payload);
            request = request
                .header("X-BAPI-API-KEY", &self.api_key)
                .header("X-BAPI-SIGN", signature)
                .header("X-BAPI-TIMESTAMP", timestamp)
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW);
        }
        if method == Method::POST {
            request = request.body(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<BybitResponse<T>>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => {
                Err(FetchError::Transport(format!("HTTP {}: {}", status, text)))
            }
            Err(e) => Err(FetchError::Malformed(e.to_string())),
        }
    }

    async fn get_positions(&self, symbol: &str) -> Result<Vec<BybitPosition>, FetchError> {
        let query = format!("category={}&symbol={}", CATEGORY, urlencoding::encode(symbol));
        let response: BybitResponse<BybitList<BybitPosition>> = self
            .request(Method::GET, "/v5/position/list", query, true)
            .await?;

        if !response.is_ok() {
            return Err(FetchError::Api {
                code: response.ret_code.to_string(),
                message: response.ret_msg,
            });
        }

        Ok(response
            .result
            .map(|r| r.list)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .collect())
    }

    /// Place a hedge-mode market order.
    #[instrument(skip(self), name = "bybit_place_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        position_idx: u8,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, OrderError> {
        let order = BybitOrderRequest {
            category: CATEGORY.to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: "Market".to_string(),
            qty: qty.normalize().to_string(),
            position_idx,
            reduce_only,
            order_link_id: self.next_order_link_id(),
        };
        let body = serde_json::to_string(&order).map_err(|e| OrderError::Malformed(e.to_string()))?;

        let response: BybitResponse<BybitOrderResult> = self
            .request(Method::POST, "/v5/order/create", body, true)
            .await?;

        if !response.is_ok() {
            return Err(OrderError::Rejected {
                code: response.ret_code.to_string(),
                message: response.ret_msg,
            });
        }

        let result = response
            .result
            .ok_or_else(|| OrderError::Malformed("order response without result".to_string()))?;

        info!(%symbol, %side, position_idx, %qty, reduce_only, order_id = %result.order_id, "Bybit order accepted");
        Ok(OrderAck::new(result.order_id, qty))
    }

    /// Put `symbol` in both-sides mode; orders use `positionIdx` 1/2.
    async fn ensure_hedge_mode(&self, symbol: &str) -> Result<(), OrderError> {
        let request = BybitSwitchModeRequest {
            category: CATEGORY.to_string(),
            symbol: symbol.to_string(),
            mode: HEDGE_MODE,
        };
        let body =
            serde_json::to_string(&request).map_err(|e| OrderError::Malformed(e.to_string()))?;

        let response: BybitResponse<serde_json::Value> = self
            .request(Method::POST, "/v5/position/switch-mode", body, true)
            .await?;

        match response.ret_code {
            0 => info!(%symbol, "Bybit switched to hedge mode"),
            POSITION_MODE_NOT_MODIFIED => debug!(%symbol, "Bybit already in hedge mode"),
            code => {
                return Err(OrderError::Rejected {
                    code: code.to_string(),
                    message: response.ret_msg,
                })
            }
        }
        Ok(())
    }

    async fn close_side(&self, symbol: &str, held_side: &str) -> Result<OrderAck, OrderError> {
        let qty: Decimal = self
            .get_positions(symbol)
            .await?
            .iter()
            .filter(|p| p.side == held_side)
            .map(BybitPosition::size)
            .sum();

        if qty <= Decimal::ZERO {
            warn!(%symbol, side = %held_side, "No Bybit position to close");
            return Ok(OrderAck::nothing_to_close());
        }

        // A long (Buy, idx 1) is closed by selling; a short (Sell, idx 2) by buying.
        let (side, position_idx) = if held_side == "Buy" { ("Sell", 1) } else { ("Buy", 2) };
        self.place_market_order(symbol, side, position_idx, qty, true)
            .await
    }
}

#[async_trait]
impl VenueAdapter for BybitClient {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    #[instrument(skip(self), name = "bybit_fetch_price")]
    async fn fetch_price(&self, instrument: &str) -> Result<Decimal, FetchError> {
        let query = format!("category={}&symbol={}", CATEGORY, urlencoding::encode(instrument));
        let response: BybitResponse<BybitList<BybitTicker>> = self
            .request(Method::GET, "/v5/market/tickers", query, false)
            .await?;

        if !response.is_ok() {
            return Err(FetchError::Api {
                code: response.ret_code.to_string(),
                message: response.ret_msg,
            });
        }

        let ticker = response
            .result
            .map(|r| r.list)
            .unwrap_or_default()
            .into_iter()
            .find(|t| t.symbol == instrument)
            .ok_or_else(|| FetchError::NotFound(instrument.to_string()))?;

        Decimal::from_str(ticker.last_price.trim()).map_err(|e| {
            FetchError::Malformed(format!("lastPrice {:?}: {}", ticker.last_price, e))
        })
    }

    #[instrument(skip(self), name = "bybit_fetch_position")]
    async fn fetch_position(&self, instrument: &str) -> Result<PositionSnapshot, FetchError> {
        let mut snapshot = PositionSnapshot::flat();

        for position in self.get_positions(instrument).await? {
            match position.side.as_str() {
                "Buy" => snapshot.long_qty += position.size(),
                "Sell" => snapshot.short_qty += position.size(),
                _ => {}
            }
        }

        debug!(%instrument, long = %snapshot.long_qty, short = %snapshot.short_qty, "Bybit position");
        Ok(snapshot)
    }

    async fn open_long(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
        self.place_market_order(instrument, "Buy", 1, qty, false)
            .await
    }

    async fn open_short(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
        self.place_market_order(instrument, "Sell", 2, qty, false)
            .await
    }

    async fn close_long(&self, instrument: &str) -> Result<OrderAck, OrderError> {
        self.close_side(instrument, "Buy").await
    }

    async fn close_short(&self, instrument: &str) -> Result<OrderAck, OrderError> {
        self.close_side(instrument, "Sell").await
    }

    #[instrument(skip(self), name = "bybit_set_leverage")]
    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), OrderError> {
        self.ensure_hedge_mode(instrument).await?;

        let request = BybitLeverageRequest {
            category: CATEGORY.to_string(),
            symbol: instrument.to_string(),
            buy_leverage: leverage.to_string(),
            sell_leverage: leverage.to_string(),
        };
        let body =
            serde_json::to_string(&request).map_err(|e| OrderError::Malformed(e.to_string()))?;

        let response: BybitResponse<serde_json::Value> = self
            .request(Method::POST, "/v5/position/set-leverage", body, true)
            .await?;

        match response.ret_code {
            0 => {}
            LEVERAGE_NOT_MODIFIED => debug!(%instrument, leverage, "Bybit leverage already set"),
            code => {
                return Err(OrderError::Rejected {
                    code: code.to_string(),
                    message: response.ret_msg,
                })
            }
        }

        // Unified accounts choose isolated/cross at account level.
        info!(%instrument, leverage, margin_mode = margin_mode.as_str(), "Bybit leverage set");
        Ok(())
    }
}
