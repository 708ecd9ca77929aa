//! Hedge integrity alerts.
//!
//! Raised when a pair becomes unhedged, when venue positions cannot be
//! explained, and when a frozen symbol recovers.

mod alerts;

pub use alerts::{AlertKind, AlertSeverity, HedgeAlert, ALERT_TARGET};
