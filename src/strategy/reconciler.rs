//! Startup and recovery position reconciliation.
//!
//! Reads live positions from both venues and derives the hedge state they
//! imply. Reconciliation never places orders.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::InstrumentMapping;
use crate::error::{FetchError, ReconcileAmbiguous};
use crate::exchange::{PositionSnapshot, VenueAdapter, VenueSide};
use crate::strategy::state_machine::{Direction, HedgeState, Inconsistency};

/// Delay unit between position read attempts; attempt `n` waits `n` units.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// What the venue positions say about a symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Hedged(Direction),
    Flat,
    /// Positions exist but fit no hedge direction; treated as flat
    Ambiguous(ReconcileAmbiguous),
    /// Positions could not be read
    Unavailable { side: VenueSide, error: FetchError },
}

impl Reconciliation {
    /// Classify a pair of position snapshots.
    ///
    /// Rules are checked in order; the first match wins.
    pub fn classify(symbol: &str, a: PositionSnapshot, b: PositionSnapshot) -> Self {
        if a.has_short() && b.has_long() {
            Reconciliation::Hedged(Direction::Positive)
        } else if a.has_long() && b.has_short() {
            Reconciliation::Hedged(Direction::Negative)
        } else if a.is_flat() && b.is_flat() {
            Reconciliation::Flat
        } else {
            Reconciliation::Ambiguous(ReconcileAmbiguous {
                symbol: symbol.to_string(),
                venue_a: a,
                venue_b: b,
            })
        }
    }

    /// Hedge state to seed.
    pub fn state(&self) -> HedgeState {
        match self {
            Reconciliation::Hedged(direction) => HedgeState::hedged(*direction),
            Reconciliation::Flat | Reconciliation::Ambiguous(_) => HedgeState::Flat,
            Reconciliation::Unavailable { .. } => {
                HedgeState::Inconsistent(Inconsistency::PositionsUnavailable)
            }
        }
    }

    /// A clean result lets a frozen symbol resume trading.
    pub fn is_clean(&self) -> bool {
        matches!(self, Reconciliation::Hedged(_) | Reconciliation::Flat)
    }
}

/// Derives hedge state from live venue positions.
pub struct PositionReconciler {
    venue_a: Arc<dyn VenueAdapter>,
    venue_b: Arc<dyn VenueAdapter>,
    /// Attempts per position read
    attempts: u32,
}

impl PositionReconciler {
    pub fn new(
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
        attempts: u32,
    ) -> Self {
        Self {
            venue_a,
            venue_b,
            attempts: attempts.max(1),
        }
    }

    /// Reconcile one symbol.
    #[instrument(skip(self, instruments))]
    pub async fn reconcile_symbol(
        &self,
        symbol: &str,
        instruments: &InstrumentMapping,
    ) -> Reconciliation {
        let (a, b) = tokio::join!(
            self.fetch_with_retry(VenueSide::A, &instruments.venue_a),
            self.fetch_with_retry(VenueSide::B, &instruments.venue_b),
        );

        let (a, b) = match (a, b) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(error), _) => {
                return Reconciliation::Unavailable {
                    side: VenueSide::A,
                    error,
                }
            }
            (_, Err(error)) => {
                return Reconciliation::Unavailable {
                    side: VenueSide::B,
                    error,
                }
            }
        };

        let result = Reconciliation::classify(symbol, a, b);
        if let Reconciliation::Hedged(direction) = &result {
            let (leg_a, leg_b) = match direction {
                Direction::Positive => (a.short_qty, b.long_qty),
                Direction::Negative => (a.long_qty, b.short_qty),
            };
            if leg_a != leg_b {
                warn!(%symbol, %leg_a, %leg_b, "Hedge legs differ in size");
            }
        }

        info!(
            %symbol,
            a_long = %a.long_qty,
            a_short = %a.short_qty,
            b_long = %b.long_qty,
            b_short = %b.short_qty,
            state = result.state().label(),
            "Reconciled positions"
        );

        result
    }

    /// Reconcile many symbols concurrently.
    pub async fn reconcile_all(
        &self,
        pairs: &BTreeMap<String, InstrumentMapping>,
    ) -> BTreeMap<String, Reconciliation> {
        let results = join_all(pairs.iter().map(|(symbol, instruments)| async move {
            (
                symbol.clone(),
                self.reconcile_symbol(symbol, instruments).await,
            )
        }))
        .await;

        results.into_iter().collect()
    }

    async fn fetch_with_retry(
        &self,
        side: VenueSide,
        instrument: &str,
    ) -> Result<PositionSnapshot, FetchError> {
        let venue = match side {
            VenueSide::A => &self.venue_a,
            VenueSide::B => &self.venue_b,
        };

        let mut attempt = 1;
        loop {
            match venue.fetch_position(instrument).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        %side,
                        %instrument,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Position fetch failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
