// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sisi yang dipantau: Long dari shock bid, Short dari shock ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side { Long, Short }
impl Side {
    pub fn label(&self) -> &'static str { match self { Side::Long => "long", Side::Short => "short" } }
}

/// Full depth snapshot. Prices and quantities stay exact decimals end to end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShockLevel { pub price: Decimal, pub quantity: Decimal }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPair { pub entry: Decimal, pub stop: Decimal }

impl LevelPair {
    /// Fixed entry→stop distance in percent of entry.
    pub fn stop_distance_pct(&self) -> Decimal {
        if self.entry.is_zero() { return Decimal::ZERO; }
        ((self.stop - self.entry) / self.entry * Decimal::ONE_HUNDRED).abs()
    }
}

/// Both sides are always replaced together; never patch one field in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLevels { pub long: Option<LevelPair>, pub short: Option<LevelPair> }

impl ActiveLevels {
    pub fn get(&self, side: Side) -> Option<LevelPair> {
        match side { Side::Long => self.long, Side::Short => self.short }
    }
    pub fn is_empty(&self) -> bool { self.long.is_none() && self.short.is_none() }
}

/// Which side(s) of an instrument changed since the last drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideSet { pub long: bool, pub short: bool }

impl SideSet {
    pub const BOTH: SideSet = SideSet { long: true, short: true };
    pub fn only(side: Side) -> Self {
        match side { Side::Long => SideSet { long: true, short: false }, Side::Short => SideSet { long: false, short: true } }
    }
    pub fn merge(&mut self, other: SideSet) { self.long |= other.long; self.short |= other.short; }
    pub fn is_empty(&self) -> bool { !self.long && !self.short }
}

/// Last two observed prices plus the distances derived from them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTrack {
    pub last: Option<Decimal>,
    pub previous: Option<Decimal>,
    pub long_distance_pct: Option<Decimal>,
    pub short_distance_pct: Option<Decimal>,
}

// ---- Observer surface ----
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideView { pub entry: Decimal, pub stop: Decimal, pub distance_pct: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentUpdate {
    pub symbol: String,
    pub price: Option<Decimal>,
    pub decimals: u32,
    pub long: Option<SideView>,
    pub short: Option<SideView>,
    pub changed: SideSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyBatch {
    pub ts: DateTime<Utc>,
    pub updates: Vec<InstrumentUpdate>,
    pub rerank: bool,
}

// ---- Journal ----
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Crossing { ts: DateTime<Utc>, symbol: String, side: Side, price: Decimal, entry: Decimal },
    Levels { ts: DateTime<Utc>, symbol: String, levels: ActiveLevels },
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stop_distance_is_absolute_pct_of_entry() {
        let p = LevelPair { entry: dec!(100), stop: dec!(98) };
        assert_eq!(p.stop_distance_pct(), dec!(2));
        let s = LevelPair { entry: dec!(200), stop: dec!(205) };
        assert_eq!(s.stop_distance_pct(), dec!(2.5));
    }

    #[test]
    fn side_set_merge() {
        let mut s = SideSet::only(Side::Long);
        s.merge(SideSet::only(Side::Short));
        assert_eq!(s, SideSet::BOTH);
        assert!(SideSet::default().is_empty());
    }
}
