//! OKX REST v5 client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::types::*;
use crate::config::OkxConfig;
use crate::error::{FetchError, OrderError};
use crate::exchange::{MarginMode, OrderAck, PositionSnapshot, Venue, VenueAdapter};

const BASE_URL: &str = "https://www.okx.com";

/// OKX API client for perpetual swaps.
pub struct OkxClient {
    http: Client,
    api_key: String,
    secret_key: String,
    passphrase: String,
    base_url: String,
    /// Send `x-simulated-trading: 1` (demo trading)
    simulated: bool,
    /// Margin mode used for `tdMode` on orders
    margin_mode: MarginMode,
}

impl OkxClient {
    /// Create a new OKX client from configuration.
    pub fn new(config: &OkxConfig, simulated: bool, margin_mode: MarginMode) -> Result<Self> {
        Self::with_base_url(config, simulated, margin_mode, BASE_URL)
    }

    /// Create a new OKX client with a custom base URL.
    pub fn with_base_url(
        config: &OkxConfig,
        simulated: bool,
        margin_mode: MarginMode,
        base_url: &str,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            passphrase: config.passphrase.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            simulated,
            margin_mode,
        })
    }

    /// Base64 HMAC-SHA256 over `timestamp + method + request_path + body`.
    fn sign(&self, timestamp: &str, method: &Method, request_path: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_str().as_bytes());
        mac.update(request_path.as_bytes());
        mac.update(body.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// ISO-8601 timestamp with millisecond precision, as OKX expects.
    fn timestamp() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    /// Send a request and decode the response envelope.
    ///
    /// `request_path` includes the query string. Private requests are signed.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        request_path: &str,
        body: Option<String>,
        private: bool,
    ) -> Result<OkxResponse<T>, FetchError> {
        let url = format!("{}{}", self.base_url, request_path);
        let body = body.unwrap_or_default();

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");

        if private {
            let timestamp = Self::timestamp();
            let signature = self.sign(&timestamp, &method, request_path, &body);
            request = request
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
        }
        if self.simulated {
            request = request.header("x-simulated-trading", "1");
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<OkxResponse<T>>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => {
                Err(FetchError::Transport(format!("HTTP {}: {}", status, text)))
            }
            Err(e) => Err(FetchError::Malformed(e.to_string())),
        }
    }

    /// Fetch all swap positions for one instrument.
    async fn get_positions(&self, inst_id: &str) -> Result<Vec<OkxPosition>, FetchError> {
        let path = format!(
            "/api/v5/account/positions?instType=SWAP&instId={}",
            urlencoding::encode(inst_id)
        );
        let response: OkxResponse<OkxPosition> =
            self.request(Method::GET, &path, None, true).await?;

        if !response.is_ok() {
            return Err(FetchError::Api {
                code: response.code,
                message: response.msg,
            });
        }

        Ok(response
            .data
            .into_iter()
            .filter(|p| p.inst_id == inst_id)
            .collect())
    }

    /// Place a market order in long/short position mode.
    #[instrument(skip(self), name = "okx_place_order")]
    async fn place_market_order(
        &self,
        inst_id: &str,
        side: &str,
        pos_side: &str,
        qty: Decimal,
    ) -> Result<OrderAck, OrderError> {
        let order = OkxOrderRequest {
            inst_id: inst_id.to_string(),
            td_mode: self.margin_mode.as_str().to_string(),
            side: side.to_string(),
            ord_type: "market".to_string(),
            sz: qty.normalize().to_string(),
            pos_side: pos_side.to_string(),
        };
        let body = serde_json::to_string(&order).map_err(|e| OrderError::Malformed(e.to_string()))?;

        let response: OkxResponse<OkxOrderData> = self
            .request(Method::POST, "/api/v5/trade/order", Some(body), true)
            .await?;

        let data = response.data.into_iter().next();
        match data {
            Some(d) if response.code == "0" && d.s_code == "0" => {
                info!(%inst_id, %side, %pos_side, %qty, order_id = %d.ord_id, "OKX order accepted");
                Ok(OrderAck::new(d.ord_id, qty))
            }
            // Per-order codes are more specific than the envelope code.
            Some(d) if !d.s_code.is_empty() && d.s_code != "0" => Err(OrderError::Rejected {
                code: d.s_code,
                message: d.s_msg,
            }),
            _ => Err(OrderError::Rejected {
                code: response.code,
                message: response.msg,
            }),
        }
    }

    async fn close_side(&self, inst_id: &str, pos_side: &str) -> Result<OrderAck, OrderError> {
        let qty: Decimal = self
            .get_positions(inst_id)
            .await?
            .iter()
            .filter(|p| p.pos_side == pos_side)
            .map(OkxPosition::closable)
            .sum();

        if qty <= Decimal::ZERO {
            warn!(%inst_id, %pos_side, "No OKX position to close");
            return Ok(OrderAck::nothing_to_close());
        }

        // Closing a long sells, closing a short buys.
        let side = if pos_side == "long" { "sell" } else { "buy" };
        self.place_market_order(inst_id, side, pos_side, qty).await
    }

    async fn post_leverage(&self, request: &OkxLeverageRequest) -> Result<(), OrderError> {
        let body =
            serde_json::to_string(request).map_err(|e| OrderError::Malformed(e.to_string()))?;
        let response: OkxResponse<serde_json::Value> = self
            .request(Method::POST, "/api/v5/account/set-leverage", Some(body), true)
            .await?;

        if response.is_ok() {
            Ok(())
        } else {
            Err(OrderError::Rejected {
                code: response.code,
                message: response.msg,
            })
        }
    }
}

#[async_trait]
impl VenueAdapter for OkxClient {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    #[instrument(skip(self), name = "okx_fetch_price")]
    async fn fetch_price(&self, instrument: &str) -> Result<Decimal, FetchError> {
        let path = format!(
            "/api/v5/market/ticker?instId={}",
            urlencoding::encode(instrument)
        );
        let response: OkxResponse<OkxTicker> =
            self.request(Method::GET, &path, None, false).await?;

        if !response.is_ok() {
            return Err(FetchError::Api {
                code: response.code,
                message: response.msg,
            });
        }

        let ticker = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::NotFound(instrument.to_string()))?;

        Decimal::from_str(ticker.last.trim())
            .map_err(|e| FetchError::Malformed(format!("last price {:?}: {}", ticker.last, e)))
    }

    #[instrument(skip(self), name = "okx_fetch_position")]
    async fn fetch_position(&self, instrument: &str) -> Result<PositionSnapshot, FetchError> {
        let mut snapshot = PositionSnapshot::flat();

        for position in self.get_positions(instrument).await? {
            let size = position.size();
            match position.pos_side.as_str() {
                "long" => snapshot.long_qty += size.abs(),
                "short" => snapshot.short_qty += size.abs(),
                // Net mode carries the direction in the sign.
                _ if size > Decimal::ZERO => snapshot.long_qty += size,
                _ => snapshot.short_qty += size.abs(),
            }
        }

        debug!(%instrument, long = %snapshot.long_qty, short = %snapshot.short_qty, "OKX position");
        Ok(snapshot)
    }

    async fn open_long(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
        self.place_market_order(instrument, "buy", "long", qty).await
    }

    async fn open_short(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
        self.place_market_order(instrument, "sell", "short", qty).await
    }

    async fn close_long(&self, instrument: &str) -> Result<OrderAck, OrderError> {
        self.close_side(instrument, "long").await
    }

    async fn close_short(&self, instrument: &str) -> Result<OrderAck, OrderError> {
        self.close_side(instrument, "short").await
    }

    #[instrument(skip(self), name = "okx_set_leverage")]
    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), OrderError> {
        // Isolated margin in long/short mode is configured per position side.
        let pos_sides: &[Option<&str>] = match margin_mode {
            MarginMode::Isolated => &[Some("long"), Some("short")],
            MarginMode::Cross => &[None],
        };

        for pos_side in pos_sides.iter().copied() {
            let request = OkxLeverageRequest {
                inst_id: instrument.to_string(),
                lever: leverage.to_string(),
                mgn_mode: margin_mode.as_str().to_string(),
                pos_side: pos_side.map(str::to_string),
            };
            self.post_leverage(&request).await?;
        }

        info!(%instrument, leverage, margin_mode = margin_mode.as_str(), "OKX leverage set");
        Ok(())
    }
}
