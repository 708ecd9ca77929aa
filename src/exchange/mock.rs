//! In-memory venue for paper trading and tests.
//!
//! Positions and orders are simulated. Prices are either scripted with
//! [`MockVenue::set_price`] or delegated to a live venue, which is how
//! `--paper` mode trades real spreads without sending orders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::traits::*;
use crate::error::{FetchError, OrderError};

/// A simulated order accepted by the mock venue.
#[derive(Debug, Clone, PartialEq)]
pub struct MockOrder {
    pub order_id: String,
    pub instrument: String,
    pub kind: OrderKind,
    pub qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Simulated venue state.
#[derive(Debug, Default)]
struct MockState {
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, PositionSnapshot>,
    orders: Vec<MockOrder>,
    leverage: HashMap<String, (u32, MarginMode)>,
}

/// Mock venue that simulates fills at the requested size.
pub struct MockVenue {
    name: String,
    state: Arc<RwLock<MockState>>,
    order_id_counter: AtomicU64,
    /// Live venue used for prices in paper mode
    price_source: Option<Arc<dyn VenueAdapter>>,
    fail_orders: AtomicBool,
    fail_positions: AtomicBool,
    price_latency: RwLock<Option<Duration>>,
}

impl MockVenue {
    /// Create a mock venue with scripted prices.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(MockState::default())),
            order_id_counter: AtomicU64::new(1),
            price_source: None,
            fail_orders: AtomicBool::new(false),
            fail_positions: AtomicBool::new(false),
            price_latency: RwLock::new(None),
        }
    }

    /// Create a paper venue that quotes a live venue's prices.
    pub fn with_price_source(source: Arc<dyn VenueAdapter>) -> Self {
        let mut venue = Self::new(format!("paper-{}", source.venue()));
        venue.price_source = Some(source);
        venue
    }

    pub async fn set_price(&self, instrument: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(instrument.to_string(), price);
    }

    pub async fn set_position(&self, instrument: &str, position: PositionSnapshot) {
        self.state
            .write()
            .await
            .positions
            .insert(instrument.to_string(), position);
    }

    pub async fn position(&self, instrument: &str) -> PositionSnapshot {
        self.state
            .read()
            .await
            .positions
            .get(instrument)
            .copied()
            .unwrap_or_default()
    }

    /// Make every subsequent order call fail until reset.
    pub fn fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent position read fail until reset.
    pub fn fail_positions(&self, fail: bool) {
        self.fail_positions.store(fail, Ordering::SeqCst);
    }

    /// Delay every price fetch, e.g. to exercise timeouts.
    pub async fn set_price_latency(&self, latency: Option<Duration>) {
        *self.price_latency.write().await = latency;
    }

    /// All orders accepted so far, oldest first.
    pub async fn orders(&self) -> Vec<MockOrder> {
        self.state.read().await.orders.clone()
    }

    pub async fn order_kinds(&self) -> Vec<OrderKind> {
        self.state.read().await.orders.iter().map(|o| o.kind).collect()
    }

    pub async fn leverage(&self, instrument: &str) -> Option<(u32, MarginMode)> {
        self.state.read().await.leverage.get(instrument).copied()
    }

    async fn execute(
        &self,
        instrument: &str,
        kind: OrderKind,
        qty: Option<Decimal>,
    ) -> Result<OrderAck, OrderError> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(OrderError::Simulated(format!(
                "{} {} on {}",
                self.name, kind, instrument
            )));
        }

        let mut state = self.state.write().await;
        let position = state.positions.entry(instrument.to_string()).or_default();

        let filled = match kind {
            OrderKind::OpenLong => {
                let qty = qty.unwrap_or_default();
                position.long_qty += qty;
                qty
            }
            OrderKind::OpenShort => {
                let qty = qty.unwrap_or_default();
                position.short_qty += qty;
                qty
            }
            OrderKind::CloseLong => std::mem::take(&mut position.long_qty),
            OrderKind::CloseShort => std::mem::take(&mut position.short_qty),
        };

        if filled <= Decimal::ZERO {
            warn!(venue = %self.name, %instrument, %kind, "[MOCK] Nothing to close");
            return Ok(OrderAck::nothing_to_close());
        }

        let order_id = format!(
            "{}-{}",
            self.name,
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        );
        state.orders.push(MockOrder {
            order_id: order_id.clone(),
            instrument: instrument.to_string(),
            kind,
            qty: filled,
            timestamp: Utc::now(),
        });

        info!(venue = %self.name, %instrument, %kind, qty = %filled, %order_id, "[MOCK] Order filled");
        Ok(OrderAck::new(order_id, filled))
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn venue(&self) -> Venue {
        Venue::Mock
    }

    async fn fetch_price(&self, instrument: &str) -> Result<Decimal, FetchError> {
        let latency = *self.price_latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(source) = &self.price_source {
            return source.fetch_price(instrument).await;
        }

        self.state
            .read()
            .await
            .prices
            .get(instrument)
            .copied()
            .ok_or_else(|| FetchError::NotFound(instrument.to_string()))
    }

    async fn fetch_position(&self, instrument: &str) -> Result<PositionSnapshot, FetchError> {
        if self.fail_positions.load(Ordering::SeqCst) {
            return Err(FetchError::Transport(format!(
                "{}: simulated position failure",
                self.name
            )));
        }
        Ok(self.position(instrument).await)
    }

    async fn open_long(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
        self.execute(instrument, OrderKind::OpenLong, Some(qty)).await
    }

    async fn open_short(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
        self.execute(instrument, OrderKind::OpenShort, Some(qty)).await
    }

    async fn close_long(&self, instrument: &str) -> Result<OrderAck, OrderError> {
        self.execute(instrument, OrderKind::CloseLong, None).await
    }

    async fn close_short(&self, instrument: &str) -> Result<OrderAck, OrderError> {
        self.execute(instrument, OrderKind::CloseShort, None).await
    }

    async fn set_leverage(
        &self,
        instrument: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), OrderError> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(OrderError::Simulated(format!(
                "{} set_leverage on {}",
                self.name, instrument
            )));
        }
        self.state
            .write()
            .await
            .leverage
            .insert(instrument.to_string(), (leverage, margin_mode));
        Ok(())
    }
}
