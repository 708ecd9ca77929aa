//! Engine loop.
//!
//! Startup applies leverage and reconciles positions. Each cycle then fetches
//! one quote round, and every symbol with a complete quote is evaluated and
//! traded in isolation: a failure or panic on one symbol never affects the
//! others. Frozen symbols are periodically re-reconciled and resume trading
//! once their positions are clean again.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EngineConfig, InstrumentMapping};
use crate::exchange::VenueAdapter;
use crate::risk::HedgeAlert;
use crate::strategy::executor::{LegExecutor, LegPairOutcome};
use crate::strategy::quotes::{Quote, QuoteAggregator};
use crate::strategy::reconciler::{PositionReconciler, Reconciliation};
use crate::strategy::state_machine::{
    Commit, HedgeState, HedgeStateMachine, Inconsistency, Transition,
};

/// Running counters for status reports.
#[derive(Debug, Clone)]
pub struct RunnerMetrics {
    pub start_time: DateTime<Utc>,
    pub cycles: u64,
    pub quotes: u64,
    pub fetch_failures: u64,
    pub transitions: u64,
    /// Transitions where both legs failed
    pub unchanged: u64,
    pub leg_mismatches: u64,
    pub panics: u64,
    pub recoveries: u64,
}

impl Default for RunnerMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            cycles: 0,
            quotes: 0,
            fetch_failures: 0,
            transitions: 0,
            unchanged: 0,
            leg_mismatches: 0,
            panics: 0,
            recoveries: 0,
        }
    }
}

/// What happened to a symbol in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolAction {
    /// No complete quote this cycle
    NoQuote,
    /// Quote seen, thresholds not crossed
    Hold,
    /// Symbol is frozen; quote ignored
    Frozen,
    Executed(Transition, Commit),
    Panicked,
}

impl SymbolAction {
    fn label(&self) -> String {
        match self {
            SymbolAction::NoQuote => "no_quote".to_string(),
            SymbolAction::Hold => "none".to_string(),
            SymbolAction::Frozen => "frozen".to_string(),
            SymbolAction::Executed(transition, Commit::Completed) => transition.to_string(),
            SymbolAction::Executed(transition, Commit::Unchanged) => {
                format!("{transition}_failed")
            }
            SymbolAction::Executed(transition, Commit::Frozen(_)) => {
                format!("{transition}_partial")
            }
            SymbolAction::Panicked => "panicked".to_string(),
        }
    }
}

/// Symbols per hedge state, plus those carrying the ambiguity flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub flat: usize,
    pub hedged_long: usize,
    pub hedged_short: usize,
    pub frozen: usize,
    pub ambiguous: usize,
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub round: u64,
    pub actions: BTreeMap<String, SymbolAction>,
}

impl CycleReport {
    pub fn action(&self, symbol: &str) -> Option<&SymbolAction> {
        self.actions.get(symbol)
    }
}

/// Drives all hedge state machines.
pub struct Runner {
    engine: EngineConfig,
    machines: BTreeMap<String, HedgeStateMachine>,
    instruments: BTreeMap<String, InstrumentMapping>,
    leverage: BTreeMap<String, u32>,
    aggregator: QuoteAggregator,
    reconciler: PositionReconciler,
    executor: LegExecutor,
    metrics: RunnerMetrics,
    last_recovery: Instant,
}

impl Runner {
    pub fn new(
        config: &Config,
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
    ) -> Self {
        let engine = config.engine.clone();

        let machines = config
            .hedge
            .iter()
            .map(|(symbol, pair)| (symbol.clone(), HedgeStateMachine::new(symbol, pair.clone())))
            .collect();
        let instruments = config
            .hedge
            .iter()
            .map(|(symbol, pair)| (symbol.clone(), pair.instruments()))
            .collect();
        let leverage = config
            .hedge
            .keys()
            .map(|symbol| (symbol.clone(), config.leverage_for(symbol)))
            .collect();

        Self {
            aggregator: QuoteAggregator::new(
                venue_a.clone(),
                venue_b.clone(),
                engine.fetch_timeout(),
                engine.fetch_concurrency,
            ),
            reconciler: PositionReconciler::new(
                venue_a.clone(),
                venue_b.clone(),
                engine.reconcile_retries,
            ),
            executor: LegExecutor::new(venue_a, venue_b),
            engine,
            machines,
            instruments,
            leverage,
            metrics: RunnerMetrics::default(),
            last_recovery: Instant::now(),
        }
    }

    pub fn state(&self, symbol: &str) -> Option<&HedgeState> {
        self.machines.get(symbol).map(HedgeStateMachine::state)
    }

    pub fn machine(&self, symbol: &str) -> Option<&HedgeStateMachine> {
        self.machines.get(symbol)
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    /// Apply leverage, then seed every symbol's state from venue positions.
    pub async fn startup(&mut self) {
        info!(symbols = self.machines.len(), "🚀 [INIT] Starting hedge engine");
        self.apply_leverage().await;
        self.reconcile().await;
    }

    /// Set leverage and margin mode on both venues for every symbol.
    ///
    /// Failures are logged and never stop startup.
    pub async fn apply_leverage(&self) {
        let margin_mode = self.engine.margin_mode;
        let executor = &self.executor;

        join_all(self.instruments.iter().map(|(symbol, instruments)| {
            let leverage = self
                .leverage
                .get(symbol)
                .copied()
                .unwrap_or(self.engine.leverage);
            executor.prepare_symbol(symbol, instruments, leverage, margin_mode)
        }))
        .await;
    }

    /// Reconcile all symbols and seed their states.
    pub async fn reconcile(&mut self) {
        let results = self.reconciler.reconcile_all(&self.instruments).await;

        for (symbol, result) in results {
            let Some(machine) = self.machines.get_mut(&symbol) else {
                continue;
            };
            machine.apply_reconciliation(&result);
            raise_reconcile_alert(&symbol, &result);
            info!(%symbol, state = %machine.state(), "[INIT] State seeded");
        }
    }

    /// Re-reconcile frozen symbols; clean ones resume trading.
    ///
    /// Returns the number of recovered symbols.
    pub async fn recover_frozen(&mut self) -> usize {
        self.last_recovery = Instant::now();

        let frozen: BTreeMap<String, InstrumentMapping> = self
            .machines
            .iter()
            .filter(|(_, machine)| machine.state().is_frozen())
            .filter_map(|(symbol, _)| {
                self.instruments
                    .get(symbol)
                    .map(|instruments| (symbol.clone(), instruments.clone()))
            })
            .collect();

        if frozen.is_empty() {
            return 0;
        }

        let results = self.reconciler.reconcile_all(&frozen).await;
        let mut recovered = 0;

        for (symbol, result) in results {
            let Some(machine) = self.machines.get_mut(&symbol) else {
                continue;
            };

            if result.is_clean() {
                machine.apply_reconciliation(&result);
                HedgeAlert::symbol_recovered(&symbol, machine.state().clone()).emit();
                recovered += 1;
            } else {
                warn!(%symbol, state = %machine.state(), "Symbol still inconsistent, staying frozen");
                raise_reconcile_alert(&symbol, &result);
            }
        }

        self.metrics.recoveries += recovered as u64;
        recovered
    }

    /// Run one full cycle: fetch a quote round and process every symbol.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.metrics.cycles += 1;

        let round = self.aggregator.fetch_round(&self.instruments).await;
        self.metrics.quotes += round.quotes.len() as u64;
        self.metrics.fetch_failures += round.failures.len() as u64;
        debug!(
            round = round.round,
            quotes = round.quotes.len(),
            failures = round.failures.len(),
            fetch_ms = round.elapsed.as_millis() as u64,
            "Quote round complete"
        );

        for failure in &round.failures {
            warn!(
                symbol = %failure.symbol,
                side = %failure.side,
                instrument = %failure.instrument,
                error = %failure.error,
                "Price fetch failed, symbol skipped this cycle"
            );
        }

        let mut report = CycleReport {
            round: round.round,
            actions: BTreeMap::new(),
        };

        for (symbol, machine) in self.machines.iter_mut() {
            let Some(quote) = round.quote(symbol) else {
                log_no_quote(symbol, round.round, machine);
                report.actions.insert(symbol.clone(), SymbolAction::NoQuote);
                continue;
            };

            if machine.state().is_frozen() {
                log_tick(quote, machine, &SymbolAction::Frozen);
                report.actions.insert(symbol.clone(), SymbolAction::Frozen);
                continue;
            }

            let step = AssertUnwindSafe(step(&self.executor, machine, quote))
                .catch_unwind()
                .await;

            let action = match step {
                Ok(None) => SymbolAction::Hold,
                Ok(Some((transition, outcome))) => {
                    let commit = machine.commit(transition, &outcome);
                    match commit {
                        Commit::Completed => self.metrics.transitions += 1,
                        Commit::Unchanged => {
                            self.metrics.unchanged += 1;
                            error!(%symbol, %transition, "Both legs failed, state unchanged");
                        }
                        Commit::Frozen(failed) => {
                            self.metrics.leg_mismatches += 1;
                            let reason = outcome
                                .failed_leg()
                                .and_then(|leg| leg.result.as_ref().err())
                                .map(ToString::to_string)
                                .unwrap_or_default();
                            HedgeAlert::leg_mismatch(symbol, transition, failed, reason).emit();
                        }
                    }
                    SymbolAction::Executed(transition, commit)
                }
                Err(panic) => {
                    self.metrics.panics += 1;
                    let message = panic_message(panic.as_ref());
                    error!(%symbol, %message, "Symbol processing panicked");
                    machine.freeze(Inconsistency::Panicked);
                    HedgeAlert::processing_panic(symbol, message).emit();
                    SymbolAction::Panicked
                }
            };

            log_tick(quote, machine, &action);
            report.actions.insert(symbol.clone(), action);
        }

        report
    }

    /// Run cycles until `shutdown` flips to true or its sender is dropped.
    ///
    /// Shutdown is only observed between cycles, so a cycle that is
    /// dispatching orders always completes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let tick = self.engine.tick_interval();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.engine.tick_interval_ms,
            drift_correction = self.engine.drift_correction,
            "Starting main hedge loop..."
        );

        loop {
            if self.engine.drift_correction {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            self.run_cycle().await;
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Cycle completed"
            );

            if let Some(interval) = self.engine.recovery_interval() {
                if self.last_recovery.elapsed() >= interval {
                    self.recover_frozen().await;
                }
            }

            let every = self.engine.status_interval_cycles;
            if every > 0 && self.metrics.cycles % every == 0 {
                self.log_status();
            }

            if !self.engine.drift_correction {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        info!("🛑 Shutdown requested, stopping after completed cycle");
        self.log_status();
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for machine in self.machines.values() {
            match machine.state() {
                HedgeState::Flat => counts.flat += 1,
                HedgeState::HedgedLong => counts.hedged_long += 1,
                HedgeState::HedgedShort => counts.hedged_short += 1,
                HedgeState::Inconsistent(_) => counts.frozen += 1,
            }
            if machine.is_ambiguous() {
                counts.ambiguous += 1;
            }
        }
        counts
    }

    /// Log aggregate counters and per-state symbol counts.
    pub fn log_status(&self) {
        let counts = self.state_counts();
        let uptime = Utc::now() - self.metrics.start_time;

        info!(
            uptime_secs = uptime.num_seconds(),
            cycles = self.metrics.cycles,
            quotes = self.metrics.quotes,
            fetch_failures = self.metrics.fetch_failures,
            transitions = self.metrics.transitions,
            unchanged = self.metrics.unchanged,
            leg_mismatches = self.metrics.leg_mismatches,
            panics = self.metrics.panics,
            recoveries = self.metrics.recoveries,
            flat = counts.flat,
            hedged_long = counts.hedged_long,
            hedged_short = counts.hedged_short,
            frozen = counts.frozen,
            ambiguous = counts.ambiguous,
            "📊 [STATUS] Hedge engine status"
        );
    }
}

/// Evaluate one symbol and dispatch its legs if a threshold was crossed.
async fn step(
    executor: &LegExecutor,
    machine: &HedgeStateMachine,
    quote: &Quote,
) -> Option<(Transition, LegPairOutcome)> {
    let transition = machine.evaluate(quote)?;
    let pair = machine.pair();
    let outcome = executor
        .execute(machine.symbol(), &pair.instruments(), transition, pair.qty)
        .await;
    Some((transition, outcome))
}

fn log_tick(quote: &Quote, machine: &HedgeStateMachine, action: &SymbolAction) {
    info!(
        symbol = %quote.symbol,
        round = quote.round,
        price_a = %quote.price_a,
        price_b = %quote.price_b,
        spread = %quote.spread,
        spread_pct = %quote.spread_pct(),
        spread_bps = %quote.spread_bps(),
        state = machine.state().label(),
        direction = machine.direction(),
        ambiguous = machine.is_ambiguous(),
        action = %action.label(),
        "tick"
    );
}

fn log_no_quote(symbol: &str, round: u64, machine: &HedgeStateMachine) {
    info!(
        %symbol,
        round,
        state = machine.state().label(),
        direction = machine.direction(),
        ambiguous = machine.is_ambiguous(),
        action = %SymbolAction::NoQuote.label(),
        "tick"
    );
}

fn raise_reconcile_alert(symbol: &str, result: &Reconciliation) {
    match result {
        Reconciliation::Ambiguous(ambiguous) => {
            HedgeAlert::ambiguous_positions(symbol, ambiguous.venue_a, ambiguous.venue_b).emit()
        }
        Reconciliation::Unavailable { side, error } => {
            HedgeAlert::positions_unavailable(symbol, *side, error.to_string()).emit()
        }
        Reconciliation::Hedged(_) | Reconciliation::Flat => {}
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HedgeConfig;
    use crate::error::{FetchError, OrderError};
    use crate::exchange::{
        MarginMode, MockVenue, MockVenueAdapter, OrderAck, OrderKind, PositionSnapshot, Venue,
        VenueSide,
    };
    use crate::strategy::state_machine::Direction;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const BTC_A: &str = "BTC-USDT-SWAP";
    const BTC_B: &str = "BTCUSDT";
    const ETH_A: &str = "ETH-USDT-SWAP";
    const ETH_B: &str = "ETHUSDT";

    fn pair(venue_a: &str, venue_b: &str) -> HedgeConfig {
        HedgeConfig {
            venue_a: venue_a.to_string(),
            venue_b: venue_b.to_string(),
            open_spread: dec!(0.01),
            close_spread: dec!(0.002),
            qty: dec!(1),
            leverage: None,
        }
    }

    fn config(symbols: &[(&str, &str, &str)]) -> Config {
        let mut config = Config::default();
        config.engine.reconcile_retries = 1;
        config.engine.fetch_timeout_ms = 200;
        for (symbol, a, b) in symbols {
            config.hedge.insert(symbol.to_string(), pair(a, b));
        }
        config
    }

    fn btc_config() -> Config {
        config(&[("btc", BTC_A, BTC_B)])
    }

    struct Venues {
        a: Arc<MockVenue>,
        b: Arc<MockVenue>,
    }

    impl Venues {
        fn new() -> Self {
            Self {
                a: Arc::new(MockVenue::new("a")),
                b: Arc::new(MockVenue::new("b")),
            }
        }

        fn runner(&self, config: &Config) -> Runner {
            Runner::new(config, self.a.clone(), self.b.clone())
        }

        async fn prices(&self, instrument_a: &str, a: Decimal, instrument_b: &str, b: Decimal) {
            self.a.set_price(instrument_a, a).await;
            self.b.set_price(instrument_b, b).await;
        }
    }

    #[tokio::test]
    async fn test_positive_spread_opens_then_closes() {
        let venues = Venues::new();
        let mut runner = venues.runner(&btc_config());
        runner.startup().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));

        venues.prices(BTC_A, dec!(101), BTC_B, dec!(100)).await;
        let report = runner.run_cycle().await;
        assert_eq!(
            report.action("btc"),
            Some(&SymbolAction::Executed(
                Transition::Open(Direction::Positive),
                Commit::Completed
            ))
        );
        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedLong));
        assert_eq!(venues.a.order_kinds().await, vec![OrderKind::OpenShort]);
        assert_eq!(venues.b.order_kinds().await, vec![OrderKind::OpenLong]);

        // Still rich: no new orders
        runner.run_cycle().await;
        assert_eq!(venues.a.orders().await.len(), 1);

        venues.prices(BTC_A, dec!(100.1), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(
            venues.a.order_kinds().await,
            vec![OrderKind::OpenShort, OrderKind::CloseShort]
        );
        assert_eq!(
            venues.b.order_kinds().await,
            vec![OrderKind::OpenLong, OrderKind::CloseLong]
        );
        assert!(venues.a.position(BTC_A).await.is_flat());
        assert!(venues.b.position(BTC_B).await.is_flat());
    }

    #[tokio::test]
    async fn test_scenario_open_then_close_on_reversal() {
        let venues = Venues::new();
        let mut config = btc_config();
        if let Some(pair) = config.hedge.get_mut("btc") {
            pair.close_spread = dec!(0);
        }
        let mut runner = venues.runner(&config);
        runner.startup().await;

        venues.prices(BTC_A, dec!(101), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedLong));
        assert_eq!(runner.machine("btc").map(|m| m.direction()), Some(1));
        let opens = venues.a.orders().await;
        assert_eq!(opens[0].qty, dec!(1));

        venues.prices(BTC_A, dec!(99), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(
            venues.a.order_kinds().await,
            vec![OrderKind::OpenShort, OrderKind::CloseShort]
        );
        assert_eq!(
            venues.b.order_kinds().await,
            vec![OrderKind::OpenLong, OrderKind::CloseLong]
        );

        // Still at or below close_spread but short of the opposite open
        venues.prices(BTC_A, dec!(99.5), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(venues.a.orders().await.len(), 2);
        assert_eq!(venues.b.orders().await.len(), 2);

        // Back at 99/100 a flat symbol opens the short hedge; it never closes again
        venues.prices(BTC_A, dec!(99), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedShort));
        assert_eq!(
            venues.a.order_kinds().await,
            vec![OrderKind::OpenShort, OrderKind::CloseShort, OrderKind::OpenLong]
        );
    }

    #[tokio::test]
    async fn test_negative_spread_opens_short_hedge() {
        let venues = Venues::new();
        let mut runner = venues.runner(&btc_config());

        venues.prices(BTC_A, dec!(99), BTC_B, dec!(100)).await;
        runner.run_cycle().await;

        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedShort));
        assert_eq!(runner.machine("btc").map(|m| m.direction()), Some(-1));
        assert_eq!(venues.a.order_kinds().await, vec![OrderKind::OpenLong]);
        assert_eq!(venues.b.order_kinds().await, vec![OrderKind::OpenShort]);

        // Still below close_spread: hedge stays open
        venues.prices(BTC_A, dec!(100.1), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedShort));

        venues.prices(BTC_A, dec!(100.2), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(
            venues.a.order_kinds().await,
            vec![OrderKind::OpenLong, OrderKind::CloseLong]
        );
    }

    #[tokio::test]
    async fn test_startup_reconciles_existing_hedge() {
        let venues = Venues::new();
        venues
            .a
            .set_position(BTC_A, PositionSnapshot::new(dec!(0), dec!(2)))
            .await;
        venues
            .b
            .set_position(BTC_B, PositionSnapshot::new(dec!(2), dec!(0)))
            .await;

        let mut runner = venues.runner(&btc_config());
        runner.startup().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedLong));
        assert_eq!(runner.machine("btc").map(|m| m.direction()), Some(1));

        // Rich spread while already hedged must not open again
        venues.prices(BTC_A, dec!(103), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert!(venues.a.orders().await.is_empty());
        assert!(venues.b.orders().await.is_empty());
        assert_eq!(venues.a.leverage(BTC_A).await, Some((1, MarginMode::Isolated)));
    }

    #[tokio::test]
    async fn test_missing_price_skips_symbol_without_orders() {
        let venues = Venues::new();
        let mut runner = venues.runner(&config(&[("btc", BTC_A, BTC_B), ("eth", ETH_A, ETH_B)]));

        venues.a.set_price(BTC_A, dec!(101)).await;
        venues.prices(ETH_A, dec!(3030), ETH_B, dec!(3000)).await;

        let report = runner.run_cycle().await;
        assert_eq!(report.action("btc"), Some(&SymbolAction::NoQuote));
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(runner.state("eth"), Some(&HedgeState::HedgedLong));
        assert_eq!(runner.metrics().fetch_failures, 1);

        let btc_orders = venues
            .a
            .orders()
            .await
            .into_iter()
            .filter(|o| o.instrument == BTC_A)
            .count();
        assert_eq!(btc_orders, 0);
    }

    #[tokio::test]
    async fn test_one_leg_failure_freezes_symbol() {
        let venues = Venues::new();
        let mut runner = venues.runner(&btc_config());
        venues.b.fail_orders(true);

        venues.prices(BTC_A, dec!(101), BTC_B, dec!(100)).await;
        let report = runner.run_cycle().await;

        assert_eq!(
            report.action("btc"),
            Some(&SymbolAction::Executed(
                Transition::Open(Direction::Positive),
                Commit::Frozen(VenueSide::B)
            ))
        );
        assert!(runner.state("btc").is_some_and(HedgeState::is_frozen));
        assert_eq!(runner.metrics().leg_mismatches, 1);

        // Frozen: no orders in either direction
        venues.b.fail_orders(false);
        venues.prices(BTC_A, dec!(97), BTC_B, dec!(100)).await;
        let report = runner.run_cycle().await;
        assert_eq!(report.action("btc"), Some(&SymbolAction::Frozen));
        assert_eq!(venues.a.orders().await.len(), 1);
        assert!(venues.b.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_both_legs_failing_keeps_state_and_retries() {
        let venues = Venues::new();
        let mut runner = venues.runner(&btc_config());
        venues.a.fail_orders(true);
        venues.b.fail_orders(true);

        venues.prices(BTC_A, dec!(101), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(runner.metrics().unchanged, 1);

        venues.a.fail_orders(false);
        venues.b.fail_orders(false);
        runner.run_cycle().await;
        assert_eq!(runner.state("btc"), Some(&HedgeState::HedgedLong));
    }

    #[tokio::test]
    async fn test_recovery_unfreezes_clean_symbol() {
        let venues = Venues::new();
        let mut runner = venues.runner(&btc_config());
        venues.b.fail_orders(true);
        venues.prices(BTC_A, dec!(101), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert!(runner.state("btc").is_some_and(HedgeState::is_frozen));

        // A short only: still ambiguous, stays frozen
        assert_eq!(runner.recover_frozen().await, 0);
        assert!(runner.state("btc").is_some_and(HedgeState::is_frozen));

        // Operator flattens venue A by hand
        venues.a.set_position(BTC_A, PositionSnapshot::flat()).await;
        assert_eq!(runner.recover_frozen().await, 1);
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert_eq!(runner.metrics().recoveries, 1);
    }

    #[tokio::test]
    async fn test_unavailable_positions_freeze_at_startup() {
        let venues = Venues::new();
        venues.a.fail_positions(true);
        let mut runner = venues.runner(&btc_config());
        runner.startup().await;

        assert_eq!(
            runner.state("btc"),
            Some(&HedgeState::Inconsistent(Inconsistency::PositionsUnavailable))
        );

        venues.prices(BTC_A, dec!(101), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        assert!(venues.a.orders().await.is_empty());

        venues.a.fail_positions(false);
        assert_eq!(runner.recover_frozen().await, 1);
        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
    }

    #[tokio::test]
    async fn test_ambiguous_positions_start_flat() {
        let venues = Venues::new();
        venues
            .a
            .set_position(BTC_A, PositionSnapshot::new(dec!(1), dec!(0)))
            .await;
        venues
            .b
            .set_position(BTC_B, PositionSnapshot::new(dec!(1), dec!(0)))
            .await;

        let mut runner = venues.runner(&btc_config());
        runner.startup().await;

        assert_eq!(runner.state("btc"), Some(&HedgeState::Flat));
        assert!(runner.machine("btc").is_some_and(|m| m.is_ambiguous()));
        assert_eq!(
            runner.state_counts(),
            StateCounts {
                flat: 1,
                ambiguous: 1,
                ..StateCounts::default()
            }
        );

        // The flag persists on every tick line until a clean reconcile
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        runner.run_cycle().await;
        venues.prices(BTC_A, dec!(100), BTC_B, dec!(100)).await;
        runner.run_cycle().await;
        let lines = logs.lines();
        let ticks: Vec<&String> = lines.iter().filter(|l| l.contains(" tick ")).collect();
        assert_eq!(ticks.len(), 2);
        assert!(ticks.iter().all(|l| l.contains("ambiguous=true")));
        assert!(ticks[0].contains("action=no_quote"));
        assert!(ticks[1].contains("spread=0"));
        assert!(ticks[1].contains("action=none"));
    }

    /// Collects formatted log output of the current thread.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut out) = self.0.lock() {
                out.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::INFO)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn lines(&self) -> Vec<String> {
            let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
            String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()
        }
    }

    #[tokio::test]
    async fn test_each_leg_sent_exactly_once() {
        let mut a = MockVenueAdapter::new();
        a.expect_venue().return_const(Venue::Okx);
        a.expect_fetch_price().returning(|_| Ok(dec!(101)));
        a.expect_open_short()
            .times(1)
            .returning(|_, qty| Ok(OrderAck::new("a-1", qty)));
        a.expect_open_long().times(0);

        let mut b = MockVenueAdapter::new();
        b.expect_venue().return_const(Venue::Bybit);
        b.expect_fetch_price().returning(|_| Ok(dec!(100)));
        b.expect_open_long().times(1).returning(|_, _| {
            Err(OrderError::Rejected {
                code: "110007".to_string(),
                message: "insufficient balance".to_string(),
            })
        });
        b.expect_open_short().times(0);

        let mut runner = Runner::new(&btc_config(), Arc::new(a), Arc::new(b));
        for _ in 0..3 {
            runner.run_cycle().await;
        }
        assert!(runner.state("btc").is_some_and(HedgeState::is_frozen));
    }

    #[tokio::test]
    async fn test_slow_venue_does_not_block_other_symbols() {
        let mut a = MockVenueAdapter::new();
        a.expect_venue().return_const(Venue::Okx);
        a.expect_fetch_price().returning(|instrument| {
            if instrument == BTC_A {
                Err(FetchError::Timeout(200))
            } else {
                Ok(dec!(3030))
            }
        });
        a.expect_open_short()
            .times(1)
            .returning(|_, qty| Ok(OrderAck::new("a-1", qty)));

        let venue_b = Arc::new(MockVenue::new("b"));
        venue_b.set_price(BTC_B, dec!(100)).await;
        venue_b.set_price(ETH_B, dec!(3000)).await;

        let mut runner = Runner::new(
            &config(&[("btc", BTC_A, BTC_B), ("eth", ETH_A, ETH_B)]),
            Arc::new(a),
            venue_b.clone(),
        );
        let report = runner.run_cycle().await;

        assert_eq!(report.action("btc"), Some(&SymbolAction::NoQuote));
        assert_eq!(runner.state("eth"), Some(&HedgeState::HedgedLong));
        assert_eq!(venue_b.order_kinds().await, vec![OrderKind::OpenLong]);
    }

    /// Venue whose order calls panic, for isolation tests.
    struct PanickingVenue {
        inner: MockVenue,
        panic_instrument: &'static str,
    }

    #[async_trait]
    impl VenueAdapter for PanickingVenue {
        fn venue(&self) -> Venue {
            Venue::Mock
        }

        async fn fetch_price(&self, instrument: &str) -> Result<Decimal, FetchError> {
            self.inner.fetch_price(instrument).await
        }

        async fn fetch_position(&self, instrument: &str) -> Result<PositionSnapshot, FetchError> {
            self.inner.fetch_position(instrument).await
        }

        async fn open_long(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
            self.inner.open_long(instrument, qty).await
        }

        async fn open_short(&self, instrument: &str, qty: Decimal) -> Result<OrderAck, OrderError> {
            if instrument == self.panic_instrument {
                panic!("order book exploded");
            }
            self.inner.open_short(instrument, qty).await
        }

        async fn close_long(&self, instrument: &str) -> Result<OrderAck, OrderError> {
            self.inner.close_long(instrument).await
        }

        async fn close_short(&self, instrument: &str) -> Result<OrderAck, OrderError> {
            self.inner.close_short(instrument).await
        }

        async fn set_leverage(
            &self,
            instrument: &str,
            leverage: u32,
            margin_mode: MarginMode,
        ) -> Result<(), OrderError> {
            self.inner.set_leverage(instrument, leverage, margin_mode).await
        }
    }

    #[tokio::test]
    async fn test_panic_is_isolated_to_symbol() {
        let a = Arc::new(PanickingVenue {
            inner: MockVenue::new("a"),
            panic_instrument: BTC_A,
        });
        a.inner.set_price(BTC_A, dec!(101)).await;
        a.inner.set_price(ETH_A, dec!(3030)).await;

        let b = Arc::new(MockVenue::new("b"));
        b.set_price(BTC_B, dec!(100)).await;
        b.set_price(ETH_B, dec!(3000)).await;

        let mut runner = Runner::new(
            &config(&[("btc", BTC_A, BTC_B), ("eth", ETH_A, ETH_B)]),
            a,
            b,
        );
        let report = runner.run_cycle().await;

        assert_eq!(report.action("btc"), Some(&SymbolAction::Panicked));
        assert_eq!(
            runner.state("btc"),
            Some(&HedgeState::Inconsistent(Inconsistency::Panicked))
        );
        assert_eq!(runner.state("eth"), Some(&HedgeState::HedgedLong));
        assert_eq!(runner.metrics().panics, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_between_cycles_on_shutdown() {
        let venues = Venues::new();
        venues.prices(BTC_A, dec!(100), BTC_B, dec!(100)).await;
        let mut runner = venues.runner(&btc_config());

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            tx.send(true).ok();
        });

        runner.run(rx).await;
        assert_eq!(runner.metrics().cycles, 3);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_shut_down() {
        let venues = Venues::new();
        let mut runner = venues.runner(&btc_config());

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        runner.run(rx).await;
        assert_eq!(runner.metrics().cycles, 0);
    }
}
