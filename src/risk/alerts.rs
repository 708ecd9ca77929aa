//! Operator alerts for hedge integrity problems.
//!
//! Alerts are emitted as one JSON document per log line under the
//! `hedge_alert` target so they can be filtered out of the regular log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

use crate::exchange::{PositionSnapshot, VenueSide};
use crate::strategy::{HedgeState, Transition};

/// Log target for alerts.
pub const ALERT_TARGET: &str = "hedge_alert";

static ALERT_SEQ: AtomicU64 = AtomicU64::new(1);

/// What went wrong.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// One leg of a transition failed; the pair is unhedged
    LegMismatch {
        symbol: String,
        transition: Transition,
        failed_leg: VenueSide,
        error: String,
    },
    /// Venue positions fit no hedge pattern
    AmbiguousPositions {
        symbol: String,
        venue_a: PositionSnapshot,
        venue_b: PositionSnapshot,
    },
    /// Positions could not be read after retries
    PositionsUnavailable {
        symbol: String,
        venue: VenueSide,
        error: String,
    },
    /// Processing a symbol panicked
    ProcessingPanic { symbol: String, message: String },
    /// A frozen symbol reconciled cleanly and resumes trading
    SymbolRecovered { symbol: String, state: HedgeState },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// A structured operator alert.
#[derive(Debug, Clone, Serialize)]
pub struct HedgeAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub suggested_action: &'static str,
}

impl HedgeAlert {
    fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        suggested_action: &'static str,
    ) -> Self {
        let timestamp = Utc::now();
        let alert_id = format!(
            "hedge-{}-{}",
            timestamp.timestamp(),
            ALERT_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            alert_id,
            timestamp,
            kind,
            severity,
            message,
            suggested_action,
        }
    }

    pub fn leg_mismatch(
        symbol: &str,
        transition: Transition,
        failed_leg: VenueSide,
        error: String,
    ) -> Self {
        Self::new(
            AlertKind::LegMismatch {
                symbol: symbol.to_string(),
                transition,
                failed_leg,
                error,
            },
            AlertSeverity::Critical,
            format!("{symbol}: leg {failed_leg} failed during {transition}, pair is unhedged"),
            "Inspect both venues and flatten or complete the hedge manually; trading is frozen until positions reconcile",
        )
    }

    pub fn ambiguous_positions(
        symbol: &str,
        venue_a: PositionSnapshot,
        venue_b: PositionSnapshot,
    ) -> Self {
        Self::new(
            AlertKind::AmbiguousPositions {
                symbol: symbol.to_string(),
                venue_a,
                venue_b,
            },
            AlertSeverity::Warning,
            format!("{symbol}: venue positions match no hedge pattern, treating as flat"),
            "Close the stray positions manually before the next open signal",
        )
    }

    pub fn positions_unavailable(symbol: &str, venue: VenueSide, error: String) -> Self {
        Self::new(
            AlertKind::PositionsUnavailable {
                symbol: symbol.to_string(),
                venue,
                error,
            },
            AlertSeverity::Warning,
            format!("{symbol}: positions on venue {venue} could not be read, symbol frozen"),
            "Check venue connectivity and credentials",
        )
    }

    pub fn processing_panic(symbol: &str, message: String) -> Self {
        Self::new(
            AlertKind::ProcessingPanic {
                symbol: symbol.to_string(),
                message,
            },
            AlertSeverity::Critical,
            format!("{symbol}: processing panicked, symbol frozen"),
            "Check logs for the panic and verify venue positions",
        )
    }

    pub fn symbol_recovered(symbol: &str, state: HedgeState) -> Self {
        let message = format!("{symbol}: positions reconciled as {state}, trading resumes");
        Self::new(
            AlertKind::SymbolRecovered {
                symbol: symbol.to_string(),
                state,
            },
            AlertSeverity::Info,
            message,
            "None",
        )
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: ALERT_TARGET, "HEDGE_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: ALERT_TARGET, "HEDGE_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: ALERT_TARGET, "HEDGE_ALERT: {}", json),
        }
    }
}
