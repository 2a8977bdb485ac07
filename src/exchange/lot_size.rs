use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Smallest quantity the exchange accepts for the traded pairs
pub const MIN_LOT: f64 = 0.00001;

/// Round a base quantity down to a precision the exchange accepts
///
/// Tiers: below 0.00001 nothing can be traded, below 0.001 five decimals,
/// below 0.1 three decimals, otherwise two. Never rounds up.
pub fn round_to_valid_quantity(quantity: f64) -> Decimal {
    if !quantity.is_finite() || quantity < MIN_LOT {
        return Decimal::ZERO;
    }

    let dp = if quantity < 0.001 {
        5
    } else if quantity < 0.1 {
        3
    } else {
        2
    };

    Decimal::from_f64(quantity)
        .map(|q| q.round_dp_with_strategy(dp, RoundingStrategy::ToZero).normalize())
        .unwrap_or(Decimal::ZERO)
}
