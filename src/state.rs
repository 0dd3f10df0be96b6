// ===============================
// src/state.rs
// ===============================
//
// Shared state:
// - PriceCache : last trade price per symbol, written by the feed, read by monitors
// - Instrument : tick/grouping + price track + active levels of one symbol
// - Registry   : symbol -> Arc<Instrument>
//
// Levels and price track live in `watch` channels: writers replace the whole
// value, readers clone a consistent copy out of `borrow()`.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::bucketing::tick_decimals;
use crate::domain::{ActiveLevels, PriceTrack};

#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    inner: Arc<DashMap<String, Decimal>>,
}

impl PriceCache {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, symbol: &str, price: Decimal) {
        if price > Decimal::ZERO {
            self.inner.insert(symbol.to_string(), price);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.inner.get(symbol).map(|p| *p)
    }

    pub fn len(&self) -> usize { self.inner.len() }
}

pub struct Instrument {
    pub symbol: String,
    pub tick_size: Decimal,
    pub grouping: Decimal,
    pub decimals: u32,
    track: watch::Sender<PriceTrack>,
    levels: watch::Sender<ActiveLevels>,
    recomputing: AtomicBool,
    retired: AtomicBool,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("symbol", &self.symbol)
            .field("tick_size", &self.tick_size)
            .field("grouping", &self.grouping)
            .field("levels", &self.levels())
            .field("track", &self.track())
            .finish()
    }
}

impl Instrument {
    pub fn new(symbol: String, tick_size: Decimal, grouping: Decimal, price: Decimal, levels: ActiveLevels) -> Self {
        let (track, _) = watch::channel(PriceTrack { last: Some(price), previous: Some(price), ..Default::default() });
        let (levels, _) = watch::channel(levels);
        Self {
            symbol,
            tick_size,
            grouping,
            decimals: tick_decimals(tick_size),
            track,
            levels,
            recomputing: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn levels(&self) -> ActiveLevels { *self.levels.borrow() }

    pub fn subscribe_levels(&self) -> watch::Receiver<ActiveLevels> { self.levels.subscribe() }

    /// Replace both sides at once; returns the pair that was active before.
    pub fn replace_levels(&self, next: ActiveLevels) -> ActiveLevels {
        self.levels.send_replace(next)
    }

    pub fn track(&self) -> PriceTrack { *self.track.borrow() }

    /// Shift last -> previous and store `price`. Returns the updated track.
    pub fn push_price(&self, price: Decimal) -> PriceTrack {
        self.track.send_modify(|t| {
            t.previous = t.last.or(Some(price));
            t.last = Some(price);
        });
        self.track()
    }

    pub fn set_distances(&self, long: Option<Decimal>, short: Option<Decimal>) {
        self.track.send_modify(|t| {
            t.long_distance_pct = long;
            t.short_distance_pct = short;
        });
    }

    /// Claim the recompute slot. `None` when one is already in flight.
    pub fn try_begin_recompute(self: &Arc<Self>) -> Option<RecomputeGuard> {
        self.recomputing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecomputeGuard { instrument: Arc::clone(self) })
    }

    pub fn is_recomputing(&self) -> bool { self.recomputing.load(Ordering::Acquire) }

    /// Superseded by a rebuilt record; its monitor exits on the next poll.
    pub fn retire(&self) { self.retired.store(true, Ordering::Release); }

    pub fn is_retired(&self) -> bool { self.retired.load(Ordering::Acquire) }
}

/// Releases the per-instrument recompute flag on drop.
pub struct RecomputeGuard {
    instrument: Arc<Instrument>,
}

impl Drop for RecomputeGuard {
    fn drop(&mut self) {
        self.instrument.recomputing.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<DashMap<String, Arc<Instrument>>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, symbol: &str) -> Option<Arc<Instrument>> {
        self.inner.get(symbol).map(|e| Arc::clone(e.value()))
    }

    /// Insert on first scan. A later scan with the same tick and grouping only
    /// swaps the levels, so monitors holding the old Arc keep seeing updates.
    /// If the tick or grouping changed, the old record is retired and replaced.
    pub fn upsert(&self, instrument: Instrument) -> Arc<Instrument> {
        if let Some(existing) = self.get(&instrument.symbol) {
            if existing.tick_size == instrument.tick_size && existing.grouping == instrument.grouping {
                existing.replace_levels(instrument.levels());
                return existing;
            }
            existing.retire();
        }
        let arc = Arc::new(instrument);
        self.inner.insert(arc.symbol.clone(), Arc::clone(&arc));
        arc
    }

    pub fn all(&self) -> Vec<Arc<Instrument>> {
        self.inner.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize { self.inner.len() }
}
