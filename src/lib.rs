//! # Spread Hedger
//!
//! Cross-venue perpetual spread hedging between two exchanges.
//!
//! When a symbol's price on venue A trades far enough above or below venue B,
//! the engine opens offsetting positions on both venues and closes them once
//! the spread converges.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `error`: Typed venue and configuration errors
//! - `exchange`: Venue adapter trait with OKX, Bybit and in-memory implementations
//! - `strategy`: Quote aggregation, hedge state machines, execution and the engine loop
//! - `risk`: Operator alerts for hedge integrity problems
//! - `utils`: Decimal helpers

pub mod config;
pub mod error;
pub mod exchange;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
