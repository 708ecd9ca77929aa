//! Decimal helpers for spread arithmetic.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Relative spread of `a` over `b`: `(a - b) / b`.
///
/// Returns `None` when `b` is zero.
pub fn relative_spread(a: Decimal, b: Decimal) -> Option<Decimal> {
    if b == Decimal::ZERO {
        return None;
    }
    Some((a - b) / b)
}

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Spread rate as a rounded percentage, for logs.
pub fn to_percent(rate: Decimal) -> Decimal {
    (rate * dec!(100)).round_dp(4)
}
