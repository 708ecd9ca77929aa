//! Bybit exchange integration (venue B).
//!
//! Trades linear USDT perpetuals (`BTCUSDT` style symbols). The account must
//! be in hedge position mode: long legs use `positionIdx` 1 and short legs
//! `positionIdx` 2. With `sim_mode` enabled the testnet host is used.

mod client;
mod types;

pub use client::BybitClient;
pub use types::*;
