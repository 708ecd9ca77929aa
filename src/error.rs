//! Error taxonomy for the hedge engine.
//!
//! Venue calls never panic on ordinary failures. They return one of these
//! typed errors so the engine can decide per symbol whether to skip a cycle
//! (`FetchError`) or freeze the symbol (`OrderError` on a single leg).

use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::PositionSnapshot;

/// Failure to read market or account data from a venue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("venue returned error {code}: {message}")]
    Api { code: String, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid price {0}")]
    InvalidPrice(Decimal),
    #[error("instrument {0} not found")]
    NotFound(String),
}

/// Failure to place an order or change account settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("order rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl From<FetchError> for OrderError {
    /// Close orders read the live position size first; a failed read fails
    /// the order.
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Api { code, message } => OrderError::Rejected { code, message },
            FetchError::Malformed(msg) => OrderError::Malformed(msg),
            other => OrderError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

impl From<reqwest::Error> for OrderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OrderError::Malformed(err.to_string())
        } else {
            OrderError::Transport(err.to_string())
        }
    }
}

/// Live venue positions that match neither hedge pattern.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "{symbol}: positions match no hedge pattern (venue A long {a_long} short {a_short}, \
     venue B long {b_long} short {b_short})",
    a_long = .venue_a.long_qty,
    a_short = .venue_a.short_qty,
    b_long = .venue_b.long_qty,
    b_short = .venue_b.short_qty
)]
pub struct ReconcileAmbiguous {
    pub symbol: String,
    pub venue_a: PositionSnapshot,
    pub venue_b: PositionSnapshot,
}

/// Fatal startup configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fetch_error_converts_to_order_error() {
        let err: OrderError = FetchError::Api {
            code: "51001".to_string(),
            message: "Instrument ID does not exist".to_string(),
        }
        .into();
        assert!(matches!(err, OrderError::Rejected { ref code, .. } if code == "51001"));

        let err: OrderError = FetchError::Timeout(2000).into();
        assert!(matches!(err, OrderError::Transport(_)));
    }

    #[test]
    fn test_ambiguous_message_lists_both_venues() {
        let err = ReconcileAmbiguous {
            symbol: "BTC".to_string(),
            venue_a: PositionSnapshot::new(dec!(1), dec!(0)),
            venue_b: PositionSnapshot::new(dec!(1), dec!(0)),
        };
        let msg = err.to_string();
        assert!(msg.contains("BTC"));
        assert!(msg.contains("venue A long 1"));
        assert!(msg.contains("venue B long 1"));
    }
}
