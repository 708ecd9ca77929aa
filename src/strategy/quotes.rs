//! Same-round price acquisition across both venues.
//!
//! Every round fetches both legs of every symbol concurrently, each fetch
//! bounded by its own timeout, and returns only after all of them have
//! resolved. Fetch workers only return values; quotes are assembled after the
//! barrier, so a [`Quote`] never mixes prices from different rounds.

use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::config::InstrumentMapping;
use crate::error::FetchError;
use crate::exchange::{VenueAdapter, VenueSide};
use crate::utils::decimal::{relative_spread, to_basis_points, to_percent};

/// Both venue prices of one symbol from a single aggregation round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub round: u64,
    pub price_a: Decimal,
    pub price_b: Decimal,
    /// `(price_a - price_b) / price_b`
    pub spread: Decimal,
}

impl Quote {
    /// Build a quote, rejecting non-positive prices.
    pub fn new(
        symbol: impl Into<String>,
        round: u64,
        price_a: Decimal,
        price_b: Decimal,
    ) -> Result<Self, FetchError> {
        if price_a <= Decimal::ZERO {
            return Err(FetchError::InvalidPrice(price_a));
        }
        if price_b <= Decimal::ZERO {
            return Err(FetchError::InvalidPrice(price_b));
        }
        let spread =
            relative_spread(price_a, price_b).ok_or(FetchError::InvalidPrice(price_b))?;

        Ok(Self {
            symbol: symbol.into(),
            round,
            price_a,
            price_b,
            spread,
        })
    }

    /// Spread in percent, for logs.
    pub fn spread_pct(&self) -> Decimal {
        to_percent(self.spread)
    }

    /// Spread in basis points, for logs.
    pub fn spread_bps(&self) -> Decimal {
        to_basis_points(self.spread).round_dp(2)
    }
}

/// One failed leg fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub symbol: String,
    pub side: VenueSide,
    pub instrument: String,
    pub error: FetchError,
}

/// Result of one aggregation round.
#[derive(Debug, Clone, Default)]
pub struct QuoteRound {
    pub round: u64,
    pub quotes: BTreeMap<String, Quote>,
    pub failures: Vec<FetchFailure>,
    pub elapsed: Duration,
}

impl QuoteRound {
    pub fn quote(&self, symbol: &str) -> Option<&Quote> {
        self.quotes.get(symbol)
    }
}

/// Fetches both venues' prices for every configured symbol.
pub struct QuoteAggregator {
    venue_a: Arc<dyn VenueAdapter>,
    venue_b: Arc<dyn VenueAdapter>,
    fetch_timeout: Duration,
    /// Concurrent fetch limit; `None` means two per symbol
    concurrency: Option<usize>,
    next_round: u64,
}

impl QuoteAggregator {
    pub fn new(
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
        fetch_timeout: Duration,
        concurrency: Option<usize>,
    ) -> Self {
        Self {
            venue_a,
            venue_b,
            fetch_timeout,
            concurrency,
            next_round: 1,
        }
    }

    /// Run one aggregation round over all symbols.
    #[instrument(skip_all, name = "quote_round")]
    pub async fn fetch_round(
        &mut self,
        pairs: &BTreeMap<String, InstrumentMapping>,
    ) -> QuoteRound {
        let round = self.next_round;
        self.next_round += 1;
        let started = Instant::now();

        let jobs: Vec<(&str, VenueSide, &str)> = pairs
            .iter()
            .flat_map(|(symbol, mapping)| {
                [
                    (symbol.as_str(), VenueSide::A, mapping.venue_a.as_str()),
                    (symbol.as_str(), VenueSide::B, mapping.venue_b.as_str()),
                ]
            })
            .collect();

        let limit = self
            .concurrency
            .unwrap_or(jobs.len())
            .max(1);
        let timeout = self.fetch_timeout;
        let venue_a = self.venue_a.as_ref();
        let venue_b = self.venue_b.as_ref();

        let results: Vec<(&str, VenueSide, &str, Result<Decimal, FetchError>)> =
            stream::iter(jobs)
                .map(|(symbol, side, instrument)| async move {
                    let venue = match side {
                        VenueSide::A => venue_a,
                        VenueSide::B => venue_b,
                    };
                    let result = fetch_leg(venue, instrument, timeout).await;
                    (symbol, side, instrument, result)
                })
                .buffer_unordered(limit)
                .collect()
                .await;

        let mut legs: BTreeMap<&str, (Option<Decimal>, Option<Decimal>)> = BTreeMap::new();
        let mut failures = Vec::new();

        for (symbol, side, instrument, result) in results {
            match result {
                Ok(price) => {
                    let entry = legs.entry(symbol).or_default();
                    match side {
                        VenueSide::A => entry.0 = Some(price),
                        VenueSide::B => entry.1 = Some(price),
                    }
                }
                Err(error) => failures.push(FetchFailure {
                    symbol: symbol.to_string(),
                    side,
                    instrument: instrument.to_string(),
                    error,
                }),
            }
        }

        let mut quotes = BTreeMap::new();
        for (symbol, prices) in legs {
            if let (Some(price_a), Some(price_b)) = prices {
                match Quote::new(symbol, round, price_a, price_b) {
                    Ok(quote) => {
                        quotes.insert(symbol.to_string(), quote);
                    }
                    Err(error) => failures.push(FetchFailure {
                        symbol: symbol.to_string(),
                        side: if price_a <= Decimal::ZERO { VenueSide::A } else { VenueSide::B },
                        instrument: String::new(),
                        error,
                    }),
                }
            }
        }

        QuoteRound {
            round,
            quotes,
            failures,
            elapsed: started.elapsed(),
        }
    }
}

/// Fetch one leg's price within the timeout.
async fn fetch_leg(
    venue: &dyn VenueAdapter,
    instrument: &str,
    timeout: Duration,
) -> Result<Decimal, FetchError> {
    match tokio::time::timeout(timeout, venue.fetch_price(instrument)).await {
        Ok(Ok(price)) if price > Decimal::ZERO => Ok(price),
        Ok(Ok(price)) => Err(FetchError::InvalidPrice(price)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(FetchError::Timeout(timeout.as_millis() as u64)),
    }
}
