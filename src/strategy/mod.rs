//! Spread hedging strategy.
//!
//! Contains the core logic for:
//! - Same-round quote aggregation across both venues
//! - Per-symbol hedge state machines
//! - Two-leg order dispatch
//! - Position reconciliation at startup and during recovery
//! - The engine loop tying them together

mod executor;
mod quotes;
mod reconciler;
mod runner;
mod state_machine;

pub use executor::{LegExecutor, LegOutcome, LegPairOutcome};
pub use quotes::{FetchFailure, Quote, QuoteAggregator, QuoteRound};
pub use reconciler::{PositionReconciler, Reconciliation};
pub use runner::{CycleReport, Runner, RunnerMetrics, SymbolAction};
pub use state_machine::{
    decide, Commit, Direction, HedgeState, HedgeStateMachine, Inconsistency, Transition,
};
