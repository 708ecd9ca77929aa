//! Type definitions for OKX v5 API requests and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Common response envelope. `code == "0"` means success.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct OkxResponse<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Vec<T>,
}

impl<T> OkxResponse<T> {
    pub fn is_ok(&self) -> bool {
        self.code == "0"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxTicker {
    pub inst_id: String,
    pub last: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxPosition {
    pub inst_id: String,
    /// "long", "short" or "net"
    pub pos_side: String,
    /// Signed in net mode, unsigned in long/short mode
    #[serde(default)]
    pub pos: String,
    /// Size that can currently be closed
    #[serde(default)]
    pub avail_pos: String,
}

impl OkxPosition {
    pub fn size(&self) -> Decimal {
        parse_or_zero(&self.pos)
    }

    /// Closable size, falling back to the total size when OKX leaves
    /// `availPos` empty.
    pub fn closable(&self) -> Decimal {
        if self.avail_pos.trim().is_empty() {
            self.size().abs()
        } else {
            parse_or_zero(&self.avail_pos).abs()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxOrderRequest {
    pub inst_id: String,
    /// Margin mode: "isolated" or "cross"
    pub td_mode: String,
    /// "buy" or "sell"
    pub side: String,
    pub ord_type: String,
    pub sz: String,
    /// "long" or "short"
    pub pos_side: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxOrderData {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub s_code: String,
    #[serde(default)]
    pub s_msg: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxLeverageRequest {
    pub inst_id: String,
    pub lever: String,
    pub mgn_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_side: Option<String>,
}

fn parse_or_zero(value: &str) -> Decimal {
    Decimal::from_str(value.trim()).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_envelope_without_data() {
        let json = r#"{"code":"51001","msg":"Instrument ID does not exist"}"#;
        let response: OkxResponse<OkxTicker> = serde_json::from_str(json).unwrap();
        assert!(!response.is_ok());
        assert!(response.data.is_empty());

        let json = r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","last":"64000.5"}]}"#;
        let response: OkxResponse<OkxTicker> = serde_json::from_str(json).unwrap();
        assert_eq!(response.data[0].last, "64000.5");
    }

    #[test]
    fn test_position_sizes() {
        let json = r#"{"instId":"BTC-USDT-SWAP","posSide":"short","pos":"3","availPos":""}"#;
        let pos: OkxPosition = serde_json::from_str(json).unwrap();
        assert_eq!(pos.size(), dec!(3));
        assert_eq!(pos.closable(), dec!(3));

        let json = r#"{"instId":"BTC-USDT-SWAP","posSide":"long","pos":"3","availPos":"2"}"#;
        let pos: OkxPosition = serde_json::from_str(json).unwrap();
        assert_eq!(pos.closable(), dec!(2));
    }

    #[test]
    fn test_order_request_field_names() {
        let request = OkxOrderRequest {
            inst_id: "BTC-USDT-SWAP".to_string(),
            td_mode: "isolated".to_string(),
            side: "sell".to_string(),
            ord_type: "market".to_string(),
            sz: "1".to_string(),
            pos_side: "short".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["instId"], "BTC-USDT-SWAP");
        assert_eq!(json["tdMode"], "isolated");
        assert_eq!(json["posSide"], "short");
    }
}
