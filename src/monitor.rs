// ===============================
// src/monitor.rs
// ===============================
//
// SymbolMonitor: satu task per instrument.
//
//   Idle ──(ada level)──> Watching ──(harga menembus entry)──> Recalculating
//     ^                      ^                                      │
//     └──(level kosong)──────┴──────────(recompute selesai)─────────┘
//   any ──(shutdown)──> Stopped
//
// Crossing is an edge trigger: long fires when previous > entry >= current,
// short when previous < entry <= current. Price lingering past the level
// does not fire again.
//
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use crate::domain::{ActiveLevels, Event, SideSet, Side};
use crate::metrics::{ACTIVE_MONITORS, CROSSINGS, DISTANCE_PCT};
use crate::state::{Instrument, PriceCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase { Idle, Watching, Recalculating, Stopped }

impl MonitorPhase {
    pub fn label(&self) -> &'static str {
        match self {
            MonitorPhase::Idle => "idle",
            MonitorPhase::Watching => "watching",
            MonitorPhase::Recalculating => "recalculating",
            MonitorPhase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing { pub side: Side, pub entry: Decimal, pub price: Decimal }

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub crossings: Vec<Crossing>,
    pub request_recompute: bool,
    pub long_distance_pct: Option<Decimal>,
    pub short_distance_pct: Option<Decimal>,
}

/// |entry - price| / price * 100
pub fn distance_pct(entry: Decimal, price: Decimal) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    Some(((entry - price) / price * Decimal::ONE_HUNDRED).abs().round_dp(6))
}

fn crossed(side: Side, entry: Decimal, previous: Decimal, current: Decimal) -> bool {
    match side {
        Side::Long => previous > entry && current <= entry,
        Side::Short => previous < entry && current >= entry,
    }
}

/// Runtime-free part of the monitor: phase + crossing decision.
#[derive(Debug)]
pub struct MonitorCore {
    phase: MonitorPhase,
}

impl MonitorCore {
    pub fn new(levels: &ActiveLevels) -> Self {
        let phase = if levels.is_empty() { MonitorPhase::Idle } else { MonitorPhase::Watching };
        Self { phase }
    }

    pub fn phase(&self) -> MonitorPhase { self.phase }

    pub fn on_price(&mut self, previous: Decimal, current: Decimal, levels: &ActiveLevels) -> TickOutcome {
        let mut out = TickOutcome::default();
        if self.phase == MonitorPhase::Stopped {
            return out;
        }
        out.long_distance_pct = levels.long.and_then(|p| distance_pct(p.entry, current));
        out.short_distance_pct = levels.short.and_then(|p| distance_pct(p.entry, current));

        if self.phase != MonitorPhase::Watching {
            return out;
        }
        for side in [Side::Long, Side::Short] {
            if let Some(pair) = levels.get(side) {
                if crossed(side, pair.entry, previous, current) {
                    out.crossings.push(Crossing { side, entry: pair.entry, price: current });
                }
            }
        }
        if !out.crossings.is_empty() {
            out.request_recompute = true;
            self.phase = MonitorPhase::Recalculating;
        }
        out
    }

    /// New pair(s) were installed (by recompute or a rescan).
    pub fn on_levels_replaced(&mut self, levels: &ActiveLevels) {
        if self.phase == MonitorPhase::Stopped {
            return;
        }
        self.phase = if levels.is_empty() { MonitorPhase::Idle } else { MonitorPhase::Watching };
    }

    /// Recompute ended without touching the levels (fetch failed).
    pub fn on_recompute_finished(&mut self, levels: &ActiveLevels) {
        if self.phase == MonitorPhase::Recalculating {
            self.on_levels_replaced(levels);
        }
    }

    pub fn stop(&mut self) { self.phase = MonitorPhase::Stopped; }
}

/// What a monitor needs from whoever supervises it.
pub trait MonitorLink: Send + Sync + 'static {
    /// Ask for fresh levels; false if one is already in flight.
    fn request_recompute(&self, symbol: &str) -> bool;
    fn mark_dirty(&self, symbol: &str, sides: SideSet);
    fn record(&self, ev: Event);
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorCfg {
    pub poll_interval: Duration,
    pub idle_rescan: Duration,
}

impl Default for MonitorCfg {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1), idle_rescan: Duration::from_secs(60) }
    }
}

fn changed_sides(before: (Option<Decimal>, Option<Decimal>), after: (Option<Decimal>, Option<Decimal>)) -> SideSet {
    SideSet { long: before.0 != after.0, short: before.1 != after.1 }
}

fn publish_distance(symbol: &str, side: Side, d: Option<Decimal>) {
    use rust_decimal::prelude::ToPrimitive;
    if let Some(v) = d.and_then(|d| d.to_f64()) {
        DISTANCE_PCT.with_label_values(&[symbol, side.label()]).set(v);
    }
}

/// One poll: read the cached price, advance the track, detect crossings.
fn tick(instrument: &Instrument, prices: &PriceCache, core: &mut MonitorCore, link: &dyn MonitorLink) {
    let symbol = instrument.symbol.as_str();
    let Some(price) = prices.get(symbol) else {
        trace!(%symbol, "no price yet, skip tick");
        return;
    };
    let before = instrument.track();
    let track = instrument.push_price(price);
    let previous = track.previous.unwrap_or(price);
    let levels = instrument.levels();

    let out = core.on_price(previous, price, &levels);
    instrument.set_distances(out.long_distance_pct, out.short_distance_pct);
    publish_distance(symbol, Side::Long, out.long_distance_pct);
    publish_distance(symbol, Side::Short, out.short_distance_pct);

    for c in &out.crossings {
        info!(%symbol, side = c.side.label(), price = %c.price, entry = %c.entry, "entry level crossed");
        CROSSINGS.with_label_values(&[c.side.label()]).inc();
        link.record(Event::Crossing { ts: Utc::now(), symbol: symbol.to_string(), side: c.side, price: c.price, entry: c.entry });
    }
    if out.request_recompute && !link.request_recompute(symbol) {
        debug!(%symbol, "recompute already in flight");
    }

    let changed = changed_sides(
        (before.long_distance_pct, before.short_distance_pct),
        (out.long_distance_pct, out.short_distance_pct),
    );
    if !changed.is_empty() {
        link.mark_dirty(symbol, changed);
    }
}

/// Monitor loop; returns once `shutdown` flips to true (or its sender is gone).
pub async fn run(
    instrument: Arc<Instrument>,
    prices: PriceCache,
    link: Arc<dyn MonitorLink>,
    cfg: MonitorCfg,
    mut shutdown: watch::Receiver<bool>,
) -> MonitorPhase {
    let symbol = instrument.symbol.clone();
    let mut levels_rx = instrument.subscribe_levels();
    let mut core = MonitorCore::new(&levels_rx.borrow_and_update());
    let mut last_idle_request = Instant::now();
    ACTIVE_MONITORS.inc();
    info!(%symbol, phase = core.phase().label(), "monitor started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if instrument.is_retired() {
            info!(%symbol, "instrument rebuilt, monitor handing over");
            break;
        }

        if levels_rx.has_changed().unwrap_or(false) {
            let levels = *levels_rx.borrow_and_update();
            let from = core.phase();
            core.on_levels_replaced(&levels);
            debug!(%symbol, from = from.label(), to = core.phase().label(), "levels replaced");
            link.mark_dirty(&symbol, SideSet::BOTH);
        } else if core.phase() == MonitorPhase::Recalculating && !instrument.is_recomputing() {
            core.on_recompute_finished(&instrument.levels());
        }

        tick(&instrument, &prices, &mut core, link.as_ref());

        if core.phase() == MonitorPhase::Idle && last_idle_request.elapsed() >= cfg.idle_rescan {
            last_idle_request = Instant::now();
            link.request_recompute(&symbol);
        }

        tokio::select! {
            _ = sleep(cfg.poll_interval) => {}
            res = shutdown.changed() => if res.is_err() { break },
        }
    }

    core.stop();
    ACTIVE_MONITORS.dec();
    info!(%symbol, "monitor stopped");
    core.phase()
}
