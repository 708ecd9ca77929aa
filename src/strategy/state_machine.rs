//! Per-symbol hedge lifecycle.
//!
//! A symbol is `Flat`, hedged in one direction, or frozen as `Inconsistent`.
//! Direction +1 (`HedgedLong`) means venue A short and venue B long, entered
//! when A trades rich; direction -1 (`HedgedShort`) is the mirror image.
//!
//! ```text
//!   Flat --spread >= open--> HedgedLong --spread <= close--> Flat
//!   Flat --spread <= -open-> HedgedShort --spread >= close--> Flat
//!   any --one leg fails--> Inconsistent --recovery--> Flat | Hedged*
//! ```
//!
//! Decisions are pure; a state only changes after both legs of a transition
//! have resolved.

use serde::Serialize;
use std::fmt;

use crate::config::HedgeConfig;
use crate::exchange::{OrderKind, VenueSide};
use crate::strategy::executor::LegPairOutcome;
use crate::strategy::quotes::Quote;
use crate::strategy::reconciler::Reconciliation;

/// Hedge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Venue A short, venue B long
    Positive,
    /// Venue A long, venue B short
    Negative,
}

impl Direction {
    pub fn sign(self) -> i8 {
        match self {
            Direction::Positive => 1,
            Direction::Negative => -1,
        }
    }

    /// Order kinds on (A, B) that open this direction.
    pub fn open_legs(self) -> (OrderKind, OrderKind) {
        match self {
            Direction::Positive => (OrderKind::OpenShort, OrderKind::OpenLong),
            Direction::Negative => (OrderKind::OpenLong, OrderKind::OpenShort),
        }
    }

    /// Order kinds on (A, B) that close this direction.
    pub fn close_legs(self) -> (OrderKind, OrderKind) {
        match self {
            Direction::Positive => (OrderKind::CloseShort, OrderKind::CloseLong),
            Direction::Negative => (OrderKind::CloseLong, OrderKind::CloseShort),
        }
    }
}

/// Why a symbol was frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason")]
pub enum Inconsistency {
    /// Exactly one leg of a transition failed
    LegMismatch {
        transition: Transition,
        failed: VenueSide,
    },
    /// Positions could not be read during reconciliation
    PositionsUnavailable,
    /// Processing the symbol panicked mid-cycle
    Panicked,
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::LegMismatch { transition, failed } => {
                write!(f, "leg {failed} failed during {transition}")
            }
            Inconsistency::PositionsUnavailable => write!(f, "positions unavailable"),
            Inconsistency::Panicked => write!(f, "processing panicked"),
        }
    }
}

/// Hedge state of one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HedgeState {
    Flat,
    HedgedLong,
    HedgedShort,
    /// Frozen until recovery; no orders are placed
    Inconsistent(Inconsistency),
}

impl HedgeState {
    pub fn hedged(direction: Direction) -> Self {
        match direction {
            Direction::Positive => HedgeState::HedgedLong,
            Direction::Negative => HedgeState::HedgedShort,
        }
    }

    pub fn hedge_direction(&self) -> Option<Direction> {
        match self {
            HedgeState::HedgedLong => Some(Direction::Positive),
            HedgeState::HedgedShort => Some(Direction::Negative),
            _ => None,
        }
    }

    /// Signed direction: +1, -1, or 0 when flat or frozen.
    pub fn direction(&self) -> i8 {
        self.hedge_direction().map_or(0, Direction::sign)
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, HedgeState::Inconsistent(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            HedgeState::Flat => "flat",
            HedgeState::HedgedLong => "hedged_long",
            HedgeState::HedgedShort => "hedged_short",
            HedgeState::Inconsistent(_) => "inconsistent",
        }
    }
}

impl fmt::Display for HedgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HedgeState::Inconsistent(reason) => write!(f, "inconsistent ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// A state change that requires placing both legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    Open(Direction),
    Close(Direction),
}

impl Transition {
    /// Order kinds on (A, B).
    pub fn legs(self) -> (OrderKind, OrderKind) {
        match self {
            Transition::Open(direction) => direction.open_legs(),
            Transition::Close(direction) => direction.close_legs(),
        }
    }

    /// State after both legs succeed.
    pub fn target(self) -> HedgeState {
        match self {
            Transition::Open(direction) => HedgeState::hedged(direction),
            Transition::Close(_) => HedgeState::Flat,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Open(Direction::Positive) => write!(f, "open_long"),
            Transition::Open(Direction::Negative) => write!(f, "open_short"),
            Transition::Close(Direction::Positive) => write!(f, "close_long"),
            Transition::Close(Direction::Negative) => write!(f, "close_short"),
        }
    }
}

/// How a transition's leg results were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Both legs succeeded; the target state was entered
    Completed,
    /// Both legs failed; the state is unchanged and retried next cycle
    Unchanged,
    /// One leg failed; the symbol is frozen
    Frozen(VenueSide),
}

/// Pure transition rule.
///
/// Thresholds are inclusive. Opening checks the positive side first, so a
/// quote can never open both directions.
pub fn decide(state: &HedgeState, quote: &Quote, pair: &HedgeConfig) -> Option<Transition> {
    let spread = quote.spread;

    match state {
        HedgeState::Flat if spread >= pair.open_spread => {
            Some(Transition::Open(Direction::Positive))
        }
        HedgeState::Flat if spread <= -pair.open_spread => {
            Some(Transition::Open(Direction::Negative))
        }
        HedgeState::HedgedLong if spread <= pair.close_spread => {
            Some(Transition::Close(Direction::Positive))
        }
        HedgeState::HedgedShort if spread >= pair.close_spread => {
            Some(Transition::Close(Direction::Negative))
        }
        _ => None,
    }
}

/// Hedge state and thresholds of one symbol.
#[derive(Debug, Clone)]
pub struct HedgeStateMachine {
    symbol: String,
    pair: HedgeConfig,
    state: HedgeState,
    /// Last reconciliation found positions that fit no hedge direction
    ambiguous: bool,
}

impl HedgeStateMachine {
    /// New machines start flat until reconciled.
    pub fn new(symbol: impl Into<String>, pair: HedgeConfig) -> Self {
        Self {
            symbol: symbol.into(),
            pair,
            state: HedgeState::Flat,
            ambiguous: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn pair(&self) -> &HedgeConfig {
        &self.pair
    }

    pub fn state(&self) -> &HedgeState {
        &self.state
    }

    pub fn direction(&self) -> i8 {
        self.state.direction()
    }

    pub fn is_ambiguous(&self) -> bool {
        self.ambiguous
    }

    /// Transition implied by `quote`, if any. Frozen symbols never trade.
    pub fn evaluate(&self, quote: &Quote) -> Option<Transition> {
        decide(&self.state, quote, &self.pair)
    }

    /// Apply the leg results of `transition`.
    pub fn commit(&mut self, transition: Transition, outcome: &LegPairOutcome) -> Commit {
        if outcome.both_ok() {
            self.state = transition.target();
            return Commit::Completed;
        }
        let Some(failed_leg) = outcome.failed_leg() else {
            return Commit::Unchanged;
        };

        let failed = failed_leg.side;
        self.state = HedgeState::Inconsistent(Inconsistency::LegMismatch { transition, failed });
        Commit::Frozen(failed)
    }

    /// Seed state from venue positions.
    pub fn apply_reconciliation(&mut self, reconciliation: &Reconciliation) {
        self.state = reconciliation.state();
        self.ambiguous = matches!(reconciliation, Reconciliation::Ambiguous(_));
    }

    pub fn freeze(&mut self, reason: Inconsistency) {
        self.state = HedgeState::Inconsistent(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OrderError, ReconcileAmbiguous};
    use crate::exchange::{OrderAck, PositionSnapshot, Venue};
    use crate::strategy::executor::LegOutcome;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn pair() -> HedgeConfig {
        HedgeConfig {
            venue_a: "BTC-USDT-SWAP".to_string(),
            venue_b: "BTCUSDT".to_string(),
            open_spread: dec!(0.01),
            close_spread: dec!(0.002),
            qty: dec!(1),
            leverage: None,
        }
    }

    fn quote(price_a: Decimal, price_b: Decimal) -> Quote {
        Quote::new("BTC", 1, price_a, price_b).unwrap()
    }

    fn leg(side: VenueSide, ok: bool) -> LegOutcome {
        LegOutcome {
            side,
            venue: Venue::Mock,
            instrument: "X".to_string(),
            kind: OrderKind::OpenLong,
            result: if ok {
                Ok(OrderAck::new("1", dec!(1)))
            } else {
                Err(OrderError::Simulated("down".to_string()))
            },
        }
    }

    fn outcome(a: bool, b: bool) -> LegPairOutcome {
        LegPairOutcome {
            a: leg(VenueSide::A, a),
            b: leg(VenueSide::B, b),
        }
    }

    #[test]
    fn test_open_thresholds_are_inclusive() {
        let pair = pair();
        assert_eq!(
            decide(&HedgeState::Flat, &quote(dec!(101), dec!(100)), &pair),
            Some(Transition::Open(Direction::Positive))
        );
        assert_eq!(
            decide(&HedgeState::Flat, &quote(dec!(99), dec!(100)), &pair),
            Some(Transition::Open(Direction::Negative))
        );
        assert_eq!(
            decide(&HedgeState::Flat, &quote(dec!(100.5), dec!(100)), &pair),
            None
        );
    }

    #[test]
    fn test_close_thresholds() {
        let pair = pair();
        // 0.002 closes a positive hedge, 0.003 does not
        assert_eq!(
            decide(&HedgeState::HedgedLong, &quote(dec!(100.2), dec!(100)), &pair),
            Some(Transition::Close(Direction::Positive))
        );
        assert_eq!(
            decide(&HedgeState::HedgedLong, &quote(dec!(100.3), dec!(100)), &pair),
            None
        );
        // Both directions exit against the same close_spread level
        assert_eq!(
            decide(&HedgeState::HedgedShort, &quote(dec!(100.2), dec!(100)), &pair),
            Some(Transition::Close(Direction::Negative))
        );
        assert_eq!(
            decide(&HedgeState::HedgedShort, &quote(dec!(100.1), dec!(100)), &pair),
            None
        );
        assert_eq!(
            decide(&HedgeState::HedgedShort, &quote(dec!(99.8), dec!(100)), &pair),
            None
        );
    }

    #[test]
    fn test_hedged_state_never_opens_again() {
        let pair = pair();
        assert_eq!(
            decide(&HedgeState::HedgedLong, &quote(dec!(105), dec!(100)), &pair),
            None
        );
        // A deep negative spread closes the long hedge rather than flipping it
        assert_eq!(
            decide(&HedgeState::HedgedLong, &quote(dec!(95), dec!(100)), &pair),
            Some(Transition::Close(Direction::Positive))
        );
    }

    #[test]
    fn test_frozen_state_never_trades() {
        let frozen = HedgeState::Inconsistent(Inconsistency::PositionsUnavailable);
        assert_eq!(decide(&frozen, &quote(dec!(120), dec!(100)), &pair()), None);
        assert_eq!(decide(&frozen, &quote(dec!(80), dec!(100)), &pair()), None);
        assert_eq!(frozen.direction(), 0);
    }

    #[test]
    fn test_leg_mapping() {
        assert_eq!(
            Transition::Open(Direction::Positive).legs(),
            (OrderKind::OpenShort, OrderKind::OpenLong)
        );
        assert_eq!(
            Transition::Close(Direction::Positive).legs(),
            (OrderKind::CloseShort, OrderKind::CloseLong)
        );
        assert_eq!(
            Transition::Open(Direction::Negative).legs(),
            (OrderKind::OpenLong, OrderKind::OpenShort)
        );
        assert_eq!(
            Transition::Close(Direction::Negative).legs(),
            (OrderKind::CloseLong, OrderKind::CloseShort)
        );
    }

    #[test]
    fn test_commit_outcomes() {
        let open = Transition::Open(Direction::Positive);

        let mut machine = HedgeStateMachine::new("BTC", pair());
        assert_eq!(machine.commit(open, &outcome(true, true)), Commit::Completed);
        assert_eq!(machine.state(), &HedgeState::HedgedLong);
        assert_eq!(machine.direction(), 1);

        let mut machine = HedgeStateMachine::new("BTC", pair());
        assert_eq!(machine.commit(open, &outcome(false, false)), Commit::Unchanged);
        assert_eq!(machine.state(), &HedgeState::Flat);

        let mut machine = HedgeStateMachine::new("BTC", pair());
        assert_eq!(
            machine.commit(open, &outcome(true, false)),
            Commit::Frozen(VenueSide::B)
        );
        assert_eq!(
            machine.state(),
            &HedgeState::Inconsistent(Inconsistency::LegMismatch {
                transition: open,
                failed: VenueSide::B,
            })
        );
        assert_eq!(machine.evaluate(&quote(dec!(90), dec!(100))), None);

        let mut machine = HedgeStateMachine::new("BTC", pair());
        assert_eq!(
            machine.commit(open, &outcome(false, true)),
            Commit::Frozen(VenueSide::A)
        );
        assert!(machine.state().is_frozen());
    }

    #[test]
    fn test_reconciliation_seeds_state() {
        let mut machine = HedgeStateMachine::new("BTC", pair());

        machine.apply_reconciliation(&Reconciliation::Hedged(Direction::Negative));
        assert_eq!(machine.state(), &HedgeState::HedgedShort);
        assert!(!machine.is_ambiguous());

        machine.apply_reconciliation(&Reconciliation::Ambiguous(ReconcileAmbiguous {
            symbol: "BTC".to_string(),
            venue_a: PositionSnapshot::new(dec!(1), dec!(0)),
            venue_b: PositionSnapshot::new(dec!(1), dec!(0)),
        }));
        assert_eq!(machine.state(), &HedgeState::Flat);
        assert!(machine.is_ambiguous());
    }

    #[test]
    fn test_display() {
        assert_eq!(Transition::Close(Direction::Negative).to_string(), "close_short");
        let frozen = HedgeState::Inconsistent(Inconsistency::LegMismatch {
            transition: Transition::Open(Direction::Positive),
            failed: VenueSide::A,
        });
        assert_eq!(frozen.to_string(), "inconsistent (leg A failed during open_long)");
    }
}
