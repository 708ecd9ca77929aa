//! Venue integrations for spread hedging.
//!
//! ## OKX (venue A)
//! REST v5 client for USDT-margined perpetual swaps: tickers, positions,
//! market orders and leverage.
//!
//! ## Bybit (venue B)
//! REST v5 client for linear perpetuals in hedge position mode.
//!
//! ## Mock
//! In-memory venue used by tests and paper trading.

pub mod bybit;
pub mod mock;
pub mod okx;
mod traits;

pub use bybit::BybitClient;
pub use mock::{MockOrder, MockVenue};
pub use okx::OkxClient;
pub use traits::*;
