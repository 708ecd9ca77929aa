//! Venue-agnostic trading primitives.
//!
//! The hedge engine only talks to venues through [`VenueAdapter`]. Each
//! implementation hides authentication, request formatting and instrument id
//! conventions, and reports ordinary failures as typed errors instead of
//! panicking so the engine can apply its own isolation policy.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FetchError, OrderError};

/// Venue identifier for logs and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Venue {
    Okx,
    Bybit,
    Mock,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Okx => write!(f, "OKX"),
            Venue::Bybit => write!(f, "Bybit"),
            Venue::Mock => write!(f, "Mock"),
        }
    }
}

/// Which of the two hedged venues a leg belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VenueSide {
    A,
    B,
}

impl fmt::Display for VenueSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueSide::A => write!(f, "A"),
            VenueSide::B => write!(f, "B"),
        }
    }
}

/// Margin mode applied together with leverage at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Cross => "cross",
        }
    }
}

/// Open long and short size of one instrument on one venue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PositionSnapshot {
    pub long_qty: Decimal,
    pub short_qty: Decimal,
}

impl PositionSnapshot {
    pub fn new(long_qty: Decimal, short_qty: Decimal) -> Self {
        Self { long_qty, short_qty }
    }

    pub fn flat() -> Self {
        Self::default()
    }

    pub fn has_long(&self) -> bool {
        self.long_qty > Decimal::ZERO
    }

    pub fn has_short(&self) -> bool {
        self.short_qty > Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        !self.has_long() && !self.has_short()
    }
}

/// The four order primitives of a hedge leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::OpenLong => write!(f, "open_long"),
            OrderKind::OpenShort => write!(f, "open_short"),
            OrderKind::CloseLong => write!(f, "close_long"),
            OrderKind::CloseShort => write!(f, "close_short"),
        }
    }
}

/// Acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    /// Venue order id; `None` when nothing had to be sent
    pub order_id: Option<String>,
    pub qty: Decimal,
}

impl OrderAck {
    pub fn new(order_id: impl Into<String>, qty: Decimal) -> Self {
        Self {
            order_id: Some(order_id.into()),
            qty,
        }
    }

    /// A close request that found no position to close.
    pub fn nothing_to_close() -> Self {
        Self {
            order_id: None,
            qty: Decimal::ZERO,
        }
    }
}

/// Trading primitives the hedge engine needs from a venue.
///
/// Close operations close the full open size of the requested side with a
/// reduce-only market order. When no such position exists they succeed with
/// [`OrderAck::nothing_to_close`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Returns the venue identifier.
    fn venue(&self) -> Venue;

    /// Latest traded price of an instrument.
    async fn fetch_price(&self, instrument: &str) -> Result<Decimal, FetchError>;

    /// Current long and short size of an instrument.
    async fn fetch_position(&self, instrument: &str) -> Result<PositionSnapshot, FetchError>;

    async fn open_long(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError>;

    async fn open_short(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError>;

    async fn close_long(&self, instrument: &str) -> Result<OrderAck, OrderError>;

    async fn close_short(&self, instrument: &str) -> Result<OrderAck, OrderError>;

    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), OrderError>;
}
