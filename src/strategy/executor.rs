//! Two-leg order dispatch.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::InstrumentMapping;
use crate::error::OrderError;
use crate::exchange::{MarginMode, OrderAck, OrderKind, Venue, VenueAdapter, VenueSide};
use crate::strategy::state_machine::Transition;

/// Result of one leg of a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LegOutcome {
    pub side: VenueSide,
    pub venue: Venue,
    pub instrument: String,
    pub kind: OrderKind,
    pub result: Result<OrderAck, OrderError>,
}

impl LegOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Results of both legs, each dispatched exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct LegPairOutcome {
    pub a: LegOutcome,
    pub b: LegOutcome,
}

impl LegPairOutcome {
    pub fn both_ok(&self) -> bool {
        self.a.is_ok() && self.b.is_ok()
    }

    /// The single failed leg, if exactly one failed.
    pub fn failed_leg(&self) -> Option<&LegOutcome> {
        match (self.a.is_ok(), self.b.is_ok()) {
            (true, false) => Some(&self.b),
            (false, true) => Some(&self.a),
            _ => None,
        }
    }
}

/// Sends the two legs of a hedge transition to their venues.
pub struct LegExecutor {
    venue_a: Arc<dyn VenueAdapter>,
    venue_b: Arc<dyn VenueAdapter>,
}

impl LegExecutor {
    pub fn new(venue_a: Arc<dyn VenueAdapter>, venue_b: Arc<dyn VenueAdapter>) -> Self {
        Self { venue_a, venue_b }
    }

    /// Dispatch both legs of `transition` concurrently.
    ///
    /// Each leg is sent once with no retry; an order whose outcome is unknown
    /// must not be repeated. `qty` only applies to opening legs, closes use
    /// the venue's full open size.
    pub async fn execute(
        &self,
        symbol: &str,
        instruments: &InstrumentMapping,
        transition: Transition,
        qty: Decimal,
    ) -> LegPairOutcome {
        let (kind_a, kind_b) = transition.legs();

        info!(
            %symbol,
            %transition,
            leg_a = %kind_a,
            leg_b = %kind_b,
            %qty,
            "Dispatching hedge legs"
        );

        let (result_a, result_b) = tokio::join!(
            send(self.venue_a.as_ref(), &instruments.venue_a, kind_a, qty),
            send(self.venue_b.as_ref(), &instruments.venue_b, kind_b, qty),
        );

        let outcome = LegPairOutcome {
            a: LegOutcome {
                side: VenueSide::A,
                venue: self.venue_a.venue(),
                instrument: instruments.venue_a.clone(),
                kind: kind_a,
                result: result_a,
            },
            b: LegOutcome {
                side: VenueSide::B,
                venue: self.venue_b.venue(),
                instrument: instruments.venue_b.clone(),
                kind: kind_b,
                result: result_b,
            },
        };

        for leg in [&outcome.a, &outcome.b] {
            match &leg.result {
                Ok(ack) => info!(
                    %symbol,
                    side = %leg.side,
                    venue = %leg.venue,
                    instrument = %leg.instrument,
                    kind = %leg.kind,
                    order_id = ack.order_id.as_deref().unwrap_or("-"),
                    qty = %ack.qty,
                    "Leg accepted"
                ),
                Err(e) => error!(
                    %symbol,
                    side = %leg.side,
                    venue = %leg.venue,
                    instrument = %leg.instrument,
                    kind = %leg.kind,
                    error = %e,
                    "Leg failed"
                ),
            }
        }

        outcome
    }

    /// Apply leverage and margin mode to both instruments of a symbol.
    ///
    /// Failures are logged and returned but never stop the engine.
    pub async fn prepare_symbol(
        &self,
        symbol: &str,
        instruments: &InstrumentMapping,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> (Result<(), OrderError>, Result<(), OrderError>) {
        let (a, b) = tokio::join!(
            self.venue_a
                .set_leverage(&instruments.venue_a, leverage, margin_mode),
            self.venue_b
                .set_leverage(&instruments.venue_b, leverage, margin_mode),
        );

        for (side, instrument, result) in [
            (VenueSide::A, &instruments.venue_a, &a),
            (VenueSide::B, &instruments.venue_b, &b),
        ] {
            match result {
                Ok(()) => info!(
                    %symbol,
                    %side,
                    %instrument,
                    leverage,
                    margin_mode = margin_mode.as_str(),
                    "Leverage set"
                ),
                Err(e) => warn!(%symbol, %side, %instrument, error = %e, "Failed to set leverage"),
            }
        }

        (a, b)
    }
}

async fn send(
    venue: &dyn VenueAdapter,
    instrument: &str,
    kind: OrderKind,
    qty: Decimal,
) -> Result<OrderAck, OrderError> {
    match kind {
        OrderKind::OpenLong => venue.open_long(instrument, qty).await,
        OrderKind::OpenShort => venue.open_short(instrument, qty).await,
        OrderKind::CloseLong => venue.close_long(instrument).await,
        OrderKind::CloseShort => venue.close_short(instrument).await,
    }
}
