//! Risk-fraction position sizing.
//!
//! The stake never exceeds the configured fraction of the balance in
//! notional risk: `amount = balance × fraction × multiplier / sl_distance`
//! with a broker-minimum floor of 0.10.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Broker minimum stake.
pub const MIN_STAKE: Decimal = dec!(0.10);

/// Compute the stake for a contract with the given stop distance.
///
/// `sl_distance_points` is the per-tick distance to the stop; a zero or
/// negative distance degrades to the floor.
pub fn stake_amount(
    balance: Decimal,
    risk_fraction: Decimal,
    multiplier: Decimal,
    sl_distance_points: Decimal,
) -> Decimal {
    if sl_distance_points <= Decimal::ZERO {
        return MIN_STAKE;
    }
    let sized = balance * risk_fraction * multiplier / sl_distance_points;
    sized.round_dp(2).max(MIN_STAKE)
}
