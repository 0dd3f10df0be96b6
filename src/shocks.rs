// ===============================
// src/shocks.rs
// ===============================
//
// Shock analysis: turn one depth snapshot into ranked liquidity levels.
//
//   1) bucket tiap (price, qty) per sisi, jumlahkan qty per bucket
//   2) ambil TOP_BUCKETS bucket dengan qty terbesar
//   3) harga shock = rata-rata tertimbang qty dari harga mentah di bucket,
//      lalu snap ke bawah ke kelipatan tick
//   4) bid: descending (paling dekat market dulu), ask: ascending
//
// Tie-break on equal bucket totals: the bucket nearer the market wins
// (higher price on bids, lower price on asks).
//
use std::collections::BTreeMap;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::bucketing::{bucket, tick_decimals};
use crate::domain::{ActiveLevels, LevelPair, OrderBookSnapshot, ShockLevel, Side};

pub const TOP_BUCKETS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct ShockAnalysis {
    pub long: Vec<ShockLevel>,
    pub short: Vec<ShockLevel>,
    pub decimals: u32,
}

#[derive(Debug, Default)]
struct BucketAcc {
    total_qty: Decimal,
    points: BTreeMap<Decimal, Decimal>,
}

impl BucketAcc {
    fn weighted_price(&self) -> Option<Decimal> {
        if self.total_qty <= Decimal::ZERO {
            return None;
        }
        let notional: Decimal = self.points.iter().map(|(p, q)| *p * *q).sum();
        Some(notional / self.total_qty)
    }
}

fn accumulate(levels: &BTreeMap<Decimal, Decimal>, grouping: Decimal) -> BTreeMap<Decimal, BucketAcc> {
    let mut buckets: BTreeMap<Decimal, BucketAcc> = BTreeMap::new();
    for (&price, &qty) in levels {
        let acc = buckets.entry(bucket(price, grouping)).or_default();
        acc.total_qty += qty;
        *acc.points.entry(price).or_insert(Decimal::ZERO) += qty;
    }
    buckets
}

fn side_levels(levels: &BTreeMap<Decimal, Decimal>, side: Side, grouping: Decimal, tick_size: Decimal) -> Vec<ShockLevel> {
    let buckets = accumulate(levels, grouping);
    let mut ranked: Vec<(&Decimal, &BucketAcc)> = buckets.iter().collect();
    ranked.sort_by(|(ka, a), (kb, b)| {
        b.total_qty.cmp(&a.total_qty).then_with(|| match side {
            Side::Long => kb.cmp(ka),
            Side::Short => ka.cmp(kb),
        })
    });

    let mut out: Vec<ShockLevel> = ranked
        .into_iter()
        .take(TOP_BUCKETS)
        .filter_map(|(_, acc)| {
            acc.weighted_price().map(|avg| ShockLevel {
                price: bucket(avg, tick_size),
                quantity: acc.total_qty,
            })
        })
        .collect();

    match side {
        Side::Long => out.sort_by(|a, b| b.price.cmp(&a.price)),
        Side::Short => out.sort_by(|a, b| a.price.cmp(&b.price)),
    }
    out
}

/// Rank the most liquid levels on both sides of `book`.
pub fn analyze(book: &OrderBookSnapshot, grouping: Decimal, tick_size: Decimal) -> ShockAnalysis {
    ShockAnalysis {
        long: side_levels(&book.bids, Side::Long, grouping, tick_size),
        short: side_levels(&book.asks, Side::Short, grouping, tick_size),
        decimals: tick_decimals(tick_size),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("min_levels ({min_levels}) must cover entry rank {entry_rank} and its stop")]
    TooFewRanks { min_levels: usize, entry_rank: usize },
    #[error("min_levels ({0}) exceeds the 6 ranked buckets per side")]
    TooManyRanks(usize),
}

/// Which ranks of the ordered shock list become entry and stop.
///
/// Two selections have been used in practice: at least 4 levels with
/// entry/stop at ranks 2/3, and at least 6 levels with ranks 3/4. Both are
/// expressible here; the default is the former.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPolicy {
    min_levels: usize,
    entry_rank: usize,
}

impl Default for LevelPolicy {
    fn default() -> Self { Self { min_levels: 4, entry_rank: 2 } }
}

impl LevelPolicy {
    pub fn new(min_levels: usize, entry_rank: usize) -> Result<Self, PolicyError> {
        if min_levels < entry_rank + 2 {
            return Err(PolicyError::TooFewRanks { min_levels, entry_rank });
        }
        if min_levels > TOP_BUCKETS {
            return Err(PolicyError::TooManyRanks(min_levels));
        }
        Ok(Self { min_levels, entry_rank })
    }

    pub fn min_levels(&self) -> usize { self.min_levels }
    pub fn entry_rank(&self) -> usize { self.entry_rank }

    pub fn select(&self, levels: &[ShockLevel]) -> Option<LevelPair> {
        if levels.len() < self.min_levels {
            return None;
        }
        let entry = levels.get(self.entry_rank)?;
        let stop = levels.get(self.entry_rank + 1)?;
        Some(LevelPair { entry: entry.price, stop: stop.price })
    }

    pub fn active_levels(&self, analysis: &ShockAnalysis) -> ActiveLevels {
        ActiveLevels { long: self.select(&analysis.long), short: self.select(&analysis.short) }
    }
}

// Dipakai saat logging: urutan shock apa adanya, bukan untuk perhitungan.
pub fn describe(levels: &[ShockLevel], decimals: u32) -> String {
    levels
        .iter()
        .map(|l| format!("{:.*}", decimals as usize, l.price))
        .collect::<Vec<_>>()
        .join(" ")
}
