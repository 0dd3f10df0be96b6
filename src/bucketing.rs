// ===============================
// src/bucketing.rs
// ===============================
//
// Price bucketing:
// - bucket            : floor(price / grouping) * grouping, exact decimal
// - optimal_grouping  : price-tier base, clipped to the canonical ladder so
//                       that grouping / tick is an integer
// - tick_decimals     : display precision implied by the tick size
//
// Semua operasi pakai Decimal, bukan f64: pembulatan biner bikin harga tepat
// di batas bucket jatuh ke bucket sebelah.
//
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Canonical grouping increments, ascending.
pub const GROUPING_LADDER: [Decimal; 8] = [
    dec!(0.00001),
    dec!(0.0001),
    dec!(0.001),
    dec!(0.01),
    dec!(0.1),
    dec!(1),
    dec!(10),
    dec!(100),
];

const MAX_TICK_DECIMALS: u32 = 10;

/// Grouping base for a price tier.
fn tier_base(price: Decimal) -> Decimal {
    if price >= dec!(100) {
        dec!(10)
    } else if price >= dec!(10) {
        dec!(1)
    } else if price >= dec!(1) {
        dec!(0.1)
    } else if price >= dec!(0.1) {
        dec!(0.01)
    } else if price >= dec!(0.01) {
        dec!(0.001)
    } else if price >= dec!(0.001) {
        dec!(0.0001)
    } else {
        dec!(0.00001)
    }
}

fn divides(value: Decimal, tick: Decimal) -> bool {
    (value % tick).is_zero()
}

/// Largest ladder increment not above the price-tier base that is an exact
/// multiple of `tick_size`. Falls back to `tick_size` on any anomaly.
pub fn optimal_grouping(tick_size: Decimal, current_price: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO || current_price <= Decimal::ZERO {
        return tick_size;
    }
    let base = tier_base(current_price);
    GROUPING_LADDER
        .iter()
        .rev()
        .copied()
        .find(|level| *level <= base && divides(*level, tick_size))
        .unwrap_or(tick_size)
}

/// Snap `price` down to its bucket. Non-positive grouping leaves it as is.
pub fn bucket(price: Decimal, grouping: Decimal) -> Decimal {
    if grouping <= Decimal::ZERO {
        return price;
    }
    ((price / grouping).floor() * grouping).normalize()
}

/// Number of significant fractional digits in the tick size.
pub fn tick_decimals(tick_size: Decimal) -> u32 {
    tick_size.normalize().scale().min(MAX_TICK_DECIMALS)
}

/// A persisted grouping is only usable if it still fits the tick size.
pub fn is_valid_grouping(grouping: Decimal, tick_size: Decimal) -> bool {
    grouping > Decimal::ZERO && tick_size > Decimal::ZERO && divides(grouping, tick_size)
}
