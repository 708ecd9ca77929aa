//! Type definitions for Bybit v5 API requests and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Bybit return code for "leverage not modified".
pub const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Bybit return code for "position mode is not modified".
pub const POSITION_MODE_NOT_MODIFIED: i64 = 110025;

/// `mode` value of `/v5/position/switch-mode` for both-sides (hedge) mode.
pub const HEDGE_MODE: u8 = 3;

/// Common response envelope. `retCode == 0` means success.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitResponse<T> {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> BybitResponse<T> {
    pub fn is_ok(&self) -> bool {
        self.ret_code == 0
    }
}

/// Paged list wrapper used by tickers and positions.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct BybitList<T> {
    #[serde(default)]
    pub list: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitTicker {
    pub symbol: String,
    pub last_price: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// "Buy", "Sell", or "" when the slot is empty
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
}

impl BybitPosition {
    pub fn size(&self) -> Decimal {
        Decimal::from_str(self.size.trim()).unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrderRequest {
    pub category: String,
    pub symbol: String,
    /// "Buy" or "Sell"
    pub side: String,
    pub order_type: String,
    pub qty: String,
    /// Hedge mode slot: 1 = long, 2 = short
    pub position_idx: u8,
    pub reduce_only: bool,
    pub order_link_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrderResult {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitLeverageRequest {
    pub category: String,
    pub symbol: String,
    pub buy_leverage: String,
    pub sell_leverage: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitSwitchModeRequest {
    pub category: String,
    pub symbol: String,
    pub mode: u8,
}
