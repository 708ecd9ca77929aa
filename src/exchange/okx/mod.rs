//! OKX exchange integration (venue A).
//!
//! Trades USDT-margined perpetual swaps (`BTC-USDT-SWAP` style instrument ids)
//! in long/short position mode. With `sim_mode` enabled every request carries
//! the demo-trading header.

mod client;
mod types;

pub use client::OkxClient;
pub use types::*;
