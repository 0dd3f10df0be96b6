// ===============================
// src/supervisor.rs
// ===============================
//
// MonitorSupervisor:
// - initial_scan     : discovery -> tick -> harga -> grouping -> snapshot -> level
// - start_monitors   : tepat satu monitor per instrument (tanpa level -> Idle)
// - rescan_missing   : instrument yang terlewat saat scan dicoba lagi berkala
// - request_recompute: snapshot baru untuk satu instrument, serial per instrument
// - run_notifier     : kuras pending set tiap NOTIFY_INTERVAL, kirim satu batch
//
// Rerank is a separate, coarser signal: only when some distance moved more
// than the threshold since the last rerank, and not more often than
// rerank_min_interval. A move inside the interval is held and emitted once
// the interval has passed, even without new updates.
//
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::board::format_volume;
use crate::bucketing::{is_valid_grouping, optimal_grouping};
use crate::domain::{ActiveLevels, Event, InstrumentUpdate, NotifyBatch, ShockLevel, Side, SideSet, SideView};
use crate::grouping_store::GroupingStore;
use crate::metrics::{INSTRUMENTS, NOTIFY_BATCHES, RECOMPUTES, SCAN_SECONDS};
use crate::monitor::{self, distance_pct, MonitorCfg, MonitorLink, MonitorPhase};
use crate::shocks::{analyze, describe, LevelPolicy, ShockAnalysis};
use crate::source::{MarketSource, SourceError};
use crate::state::{Instrument, PriceCache, Registry};

#[derive(Debug, Clone)]
pub struct SupervisorCfg {
    pub monitor: MonitorCfg,
    pub notify_interval: Duration,
    pub rerank_threshold_pct: Decimal,
    pub rerank_min_interval: Duration,
    pub rescan_backoff: Duration,
    pub scan_concurrency: usize,
}

impl Default for SupervisorCfg {
    fn default() -> Self {
        Self {
            monitor: MonitorCfg::default(),
            notify_interval: Duration::from_millis(50),
            rerank_threshold_pct: Decimal::new(1, 1),
            rerank_min_interval: Duration::from_secs(1),
            rescan_backoff: Duration::from_secs(10),
            scan_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("instrument discovery returned nothing")]
    NoInstruments,
    #[error("no instrument produced a usable snapshot")]
    NoSnapshots,
    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error("unknown instrument {0}")]
    UnknownSymbol(String),
    #[error("recompute already in flight for {0}")]
    InFlight(String),
    #[error("snapshot fetch failed: {0}")]
    Fetch(#[from] SourceError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    pub scanned: usize,
    pub longs: usize,
    pub shorts: usize,
}

#[derive(Debug, Default)]
struct RerankState {
    last_at: Option<Instant>,
    ranked: HashMap<(String, Side), Decimal>,
    // moved past the threshold while throttled
    held: bool,
}

struct MonitorSlot {
    instrument: Arc<Instrument>,
    handle: JoinHandle<MonitorPhase>,
}

struct Inner {
    source: Arc<dyn MarketSource>,
    store: Arc<GroupingStore>,
    registry: Registry,
    prices: PriceCache,
    policy: LevelPolicy,
    cfg: SupervisorCfg,
    pending: Mutex<HashMap<String, SideSet>>,
    monitors: Mutex<HashMap<String, MonitorSlot>>,
    rerank: Mutex<RerankState>,
    recorder: Option<mpsc::Sender<Event>>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct MonitorSupervisor {
    inner: Arc<Inner>,
}

impl MonitorSupervisor {
    pub fn new(
        source: Arc<dyn MarketSource>,
        store: Arc<GroupingStore>,
        prices: PriceCache,
        policy: LevelPolicy,
        cfg: SupervisorCfg,
        recorder: Option<mpsc::Sender<Event>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                registry: Registry::new(),
                prices,
                policy,
                cfg,
                pending: Mutex::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
                rerank: Mutex::new(RerankState::default()),
                recorder,
                shutdown,
            }),
        }
    }

    pub fn registry(&self) -> &Registry { &self.inner.registry }

    fn is_shutting_down(&self) -> bool { *self.inner.shutdown.borrow() }

    // ---------------------------------------------------------------------
    // Scan
    // ---------------------------------------------------------------------

    async fn grouping_for(&self, symbol: &str, tick: Decimal, price: Decimal) -> Decimal {
        if let Some(g) = self.inner.store.get(symbol).await {
            if is_valid_grouping(g, tick) {
                return g;
            }
            debug!(%symbol, grouping = %g, tick = %tick, "persisted grouping no longer fits tick");
        }
        let g = optimal_grouping(tick, price);
        self.inner.store.put(symbol, g).await;
        g
    }

    fn log_analysis(symbol: &str, analysis: &ShockAnalysis, levels: &ActiveLevels) {
        let vol = |a: &[ShockLevel]| {
            a.iter().map(|l| format_volume(l.quantity)).collect::<Vec<_>>().join(" ")
        };
        debug!(
            %symbol,
            long = %describe(&analysis.long, analysis.decimals),
            long_qty = %vol(&analysis.long[..]),
            short = %describe(&analysis.short, analysis.decimals),
            short_qty = %vol(&analysis.short[..]),
            has_long = levels.long.is_some(),
            has_short = levels.short.is_some(),
            "shocks"
        );
    }

    /// Tick, price, grouping and one snapshot for `symbol`. Any missing piece
    /// skips the instrument for this scan.
    pub async fn scan_instrument(&self, symbol: &str) -> Option<Arc<Instrument>> {
        let src = &self.inner.source;
        let tick = match src.tick_size(symbol).await {
            Ok(t) if t > Decimal::ZERO => t,
            Ok(t) => {
                warn!(%symbol, tick = %t, "degenerate tick size, skip");
                return None;
            }
            Err(e) => {
                warn!(%symbol, ?e, "tick size lookup failed, skip");
                return None;
            }
        };
        let price = match self.inner.prices.get(symbol) {
            Some(p) => p,
            None => match src.last_price(symbol).await {
                Ok(p) => {
                    self.inner.prices.set(symbol, p);
                    p
                }
                Err(e) => {
                    warn!(%symbol, ?e, "no current price, skip");
                    return None;
                }
            },
        };
        let grouping = self.grouping_for(symbol, tick, price).await;
        let book = match src.order_book(symbol).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%symbol, ?e, "order book fetch failed, skip");
                return None;
            }
        };
        let analysis = analyze(&book, grouping, tick);
        let levels = self.inner.policy.active_levels(&analysis);
        Self::log_analysis(symbol, &analysis, &levels);

        let inst = self
            .inner
            .registry
            .upsert(Instrument::new(symbol.to_string(), tick, grouping, price, levels));
        Some(inst)
    }

    async fn scan_many(&self, symbols: Vec<String>) -> Vec<Arc<Instrument>> {
        let this = self.clone();
        stream::iter(symbols)
            .map(move |s| {
                let this = this.clone();
                async move { this.scan_instrument(&s).await }
            })
            .buffer_unordered(self.inner.cfg.scan_concurrency.max(1))
            .filter_map(|x| async move { x })
            .collect()
            .await
    }

    fn announce(&self, scanned: &[Arc<Instrument>]) {
        for inst in scanned {
            self.record(Event::Levels { ts: Utc::now(), symbol: inst.symbol.clone(), levels: inst.levels() });
            self.mark_dirty(&inst.symbol, SideSet::BOTH);
        }
    }

    /// Full scan over every discovered instrument.
    pub async fn initial_scan(&self) -> Result<ScanReport, ScanError> {
        if self.is_shutting_down() {
            return Err(ScanError::Shutdown);
        }
        let started = Instant::now();
        info!("initial scan: discovering instruments");
        let symbols = match self.inner.source.symbols().await {
            Ok(s) if !s.is_empty() => s,
            Ok(_) => return Err(ScanError::NoInstruments),
            Err(e) => {
                warn!(?e, "instrument discovery failed");
                return Err(ScanError::NoInstruments);
            }
        };

        let scanned = self.scan_many(symbols.clone()).await;

        SCAN_SECONDS.observe(started.elapsed().as_secs_f64());
        INSTRUMENTS.set(self.inner.registry.len() as i64);
        if scanned.is_empty() {
            return Err(ScanError::NoSnapshots);
        }
        let report = ScanReport {
            discovered: symbols.len(),
            scanned: scanned.len(),
            longs: scanned.iter().filter(|i| i.levels().long.is_some()).count(),
            shorts: scanned.iter().filter(|i| i.levels().short.is_some()).count(),
        };
        info!(
            discovered = report.discovered,
            scanned = report.scanned,
            longs = report.longs,
            shorts = report.shorts,
            "initial scan complete"
        );
        self.announce(&scanned);
        Ok(report)
    }

    /// Scan discovered instruments that are not in the registry yet (skipped
    /// earlier, or listed since). Returns how many were added.
    pub async fn rescan_missing(&self) -> usize {
        let symbols = match self.inner.source.symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(?e, "rescan: discovery failed");
                return 0;
            }
        };
        let missing: Vec<String> =
            symbols.into_iter().filter(|s| self.inner.registry.get(s).is_none()).collect();
        if missing.is_empty() {
            return 0;
        }
        debug!(missing = missing.len(), "rescan: scanning missing instruments");
        let scanned = self.scan_many(missing).await;
        INSTRUMENTS.set(self.inner.registry.len() as i64);
        if !scanned.is_empty() {
            info!(added = scanned.len(), "rescan: instruments added");
        }
        self.announce(&scanned);
        scanned.len()
    }

    // ---------------------------------------------------------------------
    // Monitors
    // ---------------------------------------------------------------------

    /// Spawn one monitor per registered instrument; one without levels starts
    /// Idle and asks for levels every idle_rescan. A symbol whose monitor is
    /// still running on the current record is left alone. Returns how many
    /// started.
    pub fn start_monitors(&self) -> usize {
        let mut monitors = self.inner.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        let mut started = 0;
        for inst in self.inner.registry.all() {
            let current = monitors
                .get(&inst.symbol)
                .map(|m| !m.handle.is_finished() && Arc::ptr_eq(&m.instrument, &inst))
                .unwrap_or(false);
            if current {
                continue;
            }
            let link: Arc<dyn MonitorLink> = Arc::new(self.clone());
            let handle = tokio::spawn(monitor::run(
                Arc::clone(&inst),
                self.inner.prices.clone(),
                link,
                self.inner.cfg.monitor,
                self.inner.shutdown.clone(),
            ));
            // monitor lama (record yang sudah retired) keluar sendiri
            monitors.insert(inst.symbol.clone(), MonitorSlot { instrument: inst, handle });
            started += 1;
        }
        if started > 0 {
            info!(started, total = monitors.len(), "monitors started");
        }
        started
    }

    pub fn live_monitors(&self) -> usize {
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|m| !m.handle.is_finished())
            .count()
    }

    /// Wait for every monitor to return (after shutdown was signalled).
    pub async fn join_monitors(&self) {
        let slots: Vec<(String, MonitorSlot)> = self
            .inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (symbol, slot) in slots {
            match slot.handle.await {
                Ok(phase) => debug!(%symbol, phase = phase.label(), "monitor joined"),
                Err(e) => warn!(%symbol, ?e, "monitor task failed"),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Recompute
    // ---------------------------------------------------------------------

    /// Fire-and-forget recompute. False when the symbol is unknown or one is
    /// already running for it.
    pub fn request_recompute(&self, symbol: &str) -> bool {
        let Some(inst) = self.inner.registry.get(symbol) else { return false };
        let Some(guard) = inst.try_begin_recompute() else {
            RECOMPUTES.with_label_values(&["in_flight"]).inc();
            return false;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.recompute_locked(&inst).await;
            drop(guard);
        });
        true
    }

    /// Fetch one fresh snapshot for `symbol` and replace both sides' pairs.
    pub async fn recompute(&self, symbol: &str) -> Result<ActiveLevels, RecomputeError> {
        let inst = self
            .inner
            .registry
            .get(symbol)
            .ok_or_else(|| RecomputeError::UnknownSymbol(symbol.to_string()))?;
        let _guard = inst
            .try_begin_recompute()
            .ok_or_else(|| RecomputeError::InFlight(symbol.to_string()))?;
        self.recompute_locked(&inst).await
    }

    async fn recompute_locked(&self, inst: &Arc<Instrument>) -> Result<ActiveLevels, RecomputeError> {
        let symbol = inst.symbol.as_str();
        info!(%symbol, "recomputing levels");
        let book = match self.inner.source.order_book(symbol).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%symbol, ?e, "recompute: snapshot fetch failed, keep current levels");
                RECOMPUTES.with_label_values(&["fetch_failed"]).inc();
                return Err(e.into());
            }
        };
        let analysis = analyze(&book, inst.grouping, inst.tick_size);
        let next = self.inner.policy.active_levels(&analysis);
        Self::log_analysis(symbol, &analysis, &next);
        let prev = inst.replace_levels(next);
        RECOMPUTES.with_label_values(&["ok"]).inc();
        info!(
            %symbol,
            long_entry = ?next.long.map(|p| p.entry),
            short_entry = ?next.short.map(|p| p.entry),
            long_cleared = prev.long.is_some() && next.long.is_none(),
            short_cleared = prev.short.is_some() && next.short.is_none(),
            "levels updated"
        );
        self.record(Event::Levels { ts: Utc::now(), symbol: symbol.to_string(), levels: next });
        self.mark_dirty(symbol, SideSet::BOTH);
        Ok(next)
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    pub fn mark_dirty(&self, symbol: &str, sides: SideSet) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.entry(symbol.to_string()).or_default().merge(sides);
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.inner.recorder {
            match tx.try_send(ev) {
                Ok(()) => {}
                Err(TrySendError::Full(ev)) => debug!(?ev, "recorder channel full, event dropped"),
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    fn drain_pending(&self) -> Vec<(String, SideSet)> {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(String, SideSet)> = pending.drain().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn side_view(inst: &Instrument, side: Side, price: Option<Decimal>, cached: Option<Decimal>) -> Option<SideView> {
        let pair = inst.levels().get(side)?;
        let distance = cached
            .or_else(|| price.and_then(|p| distance_pct(pair.entry, p)))
            .unwrap_or(Decimal::ZERO);
        Some(SideView { entry: pair.entry, stop: pair.stop, distance_pct: distance })
    }

    fn update_for(&self, symbol: &str, changed: SideSet) -> Option<InstrumentUpdate> {
        let inst = self.inner.registry.get(symbol)?;
        let track = inst.track();
        Some(InstrumentUpdate {
            symbol: symbol.to_string(),
            price: track.last,
            decimals: inst.decimals,
            long: Self::side_view(&inst, Side::Long, track.last, track.long_distance_pct),
            short: Self::side_view(&inst, Side::Short, track.last, track.short_distance_pct),
            changed,
        })
    }

    fn needs_rerank(&self, updates: &[InstrumentUpdate], now: Instant) -> bool {
        let mut st = self.inner.rerank.lock().unwrap_or_else(PoisonError::into_inner);
        let threshold = self.inner.cfg.rerank_threshold_pct;
        let moved = updates.iter().any(|u| {
            [(Side::Long, &u.long), (Side::Short, &u.short)].into_iter().any(|(side, view)| {
                let last = st.ranked.get(&(u.symbol.clone(), side)).copied();
                match (view, last) {
                    (Some(v), Some(l)) => (v.distance_pct - l).abs() > threshold,
                    (Some(_), None) | (None, Some(_)) => true,
                    (None, None) => false,
                }
            })
        });
        st.held |= moved;
        let due = st.last_at.map(|t| now.duration_since(t) >= self.inner.cfg.rerank_min_interval).unwrap_or(true);
        if !(st.held && due) {
            return false;
        }
        st.held = false;
        st.last_at = Some(now);
        // baseline = seluruh registry, bukan hanya batch ini
        st.ranked.clear();
        for inst in self.inner.registry.all() {
            let track = inst.track();
            for (side, cached) in [(Side::Long, track.long_distance_pct), (Side::Short, track.short_distance_pct)] {
                if let Some(v) = Self::side_view(&inst, side, track.last, cached) {
                    st.ranked.insert((inst.symbol.clone(), side), v.distance_pct);
                }
            }
        }
        true
    }

    /// Drain pending updates into one batch. `None` when nothing changed and
    /// no held rerank became due.
    pub fn build_batch(&self) -> Option<NotifyBatch> {
        let updates: Vec<InstrumentUpdate> = self
            .drain_pending()
            .into_iter()
            .filter_map(|(symbol, changed)| self.update_for(&symbol, changed))
            .collect();
        let rerank = self.needs_rerank(&updates, Instant::now());
        if updates.is_empty() && !rerank {
            return None;
        }
        Some(NotifyBatch { ts: Utc::now(), updates, rerank })
    }

    /// Bounded-rate emitter: at most one batch per notify interval.
    pub async fn run_notifier(self, tx: mpsc::Sender<NotifyBatch>) {
        let mut shutdown = self.inner.shutdown.clone();
        let mut tick = interval(self.inner.cfg.notify_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                res = shutdown.changed() => if res.is_err() || *shutdown.borrow() { break },
            }
            if *shutdown.borrow() {
                break;
            }
            let Some(batch) = self.build_batch() else { continue };
            NOTIFY_BATCHES.inc();
            if tx.send(batch).await.is_err() {
                warn!("observer gone, notifier stopped");
                return;
            }
        }
        debug!("notifier stopped");
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Scan (retrying after `rescan_backoff`), start monitors, pick up missing
    /// instruments every idle_rescan, then join monitors on shutdown.
    pub async fn run(self) {
        let mut shutdown = self.inner.shutdown.clone();
        loop {
            match self.initial_scan().await {
                Ok(_) => break,
                Err(ScanError::Shutdown) => return,
                Err(e) => {
                    warn!(%e, backoff_s = self.inner.cfg.rescan_backoff.as_secs(), "scan failed, retrying");
                    tokio::select! {
                        _ = sleep(self.inner.cfg.rescan_backoff) => {}
                        res = shutdown.changed() => if res.is_err() { return },
                    }
                }
            }
        }
        self.start_monitors();

        // instrument yang terlewat/baru dicoba lagi tiap idle_rescan
        let mut rescan = interval(self.inner.cfg.monitor.idle_rescan);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rescan.tick().await;
        while !*shutdown.borrow() {
            tokio::select! {
                _ = rescan.tick() => {
                    if self.rescan_missing().await > 0 {
                        self.start_monitors();
                    }
                }
                res = shutdown.changed() => if res.is_err() { break },
            }
        }
        info!("supervisor: shutdown, joining monitors");
        self.join_monitors().await;
    }
}

impl MonitorLink for MonitorSupervisor {
    fn request_recompute(&self, symbol: &str) -> bool {
        MonitorSupervisor::request_recompute(self, symbol)
    }
    fn mark_dirty(&self, symbol: &str, sides: SideSet) {
        MonitorSupervisor::mark_dirty(self, symbol, sides)
    }
    fn record(&self, ev: Event) {
        MonitorSupervisor::record(self, ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LevelPair, OrderBookSnapshot};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted venue: each order_book call pops the next book for the
    /// symbol (the last one repeats). `None` entries fail the fetch; a listed
    /// symbol with no tick fails the tick lookup.
    struct Scripted {
        ticks: Mutex<HashMap<String, Option<Decimal>>>,
        books: Mutex<HashMap<String, VecDeque<Option<OrderBookSnapshot>>>>,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(delay: Duration) -> Self {
            Self { ticks: Mutex::new(HashMap::new()), books: Mutex::new(HashMap::new()), fetches: AtomicUsize::new(0), delay }
        }
        fn listed(self, symbol: &str, tick: Option<Decimal>, books: Vec<Option<OrderBookSnapshot>>) -> Self {
            self.ticks.lock().unwrap().insert(symbol.to_string(), tick);
            self.books.lock().unwrap().insert(symbol.to_string(), books.into());
            self
        }
        fn with(self, symbol: &str, tick: Decimal, books: Vec<Option<OrderBookSnapshot>>) -> Self {
            self.listed(symbol, Some(tick), books)
        }
        fn set_tick(&self, symbol: &str, tick: Decimal) {
            self.ticks.lock().unwrap().insert(symbol.to_string(), Some(tick));
        }
    }

    #[async_trait]
    impl MarketSource for Scripted {
        async fn symbols(&self) -> Result<Vec<String>, SourceError> {
            let mut s: Vec<String> = self.ticks.lock().unwrap().keys().cloned().collect();
            s.sort();
            Ok(s)
        }
        async fn tick_size(&self, symbol: &str) -> Result<Decimal, SourceError> {
            self.ticks.lock().unwrap().get(symbol).copied().flatten().ok_or_else(|| SourceError::UnknownSymbol(symbol.into()))
        }
        async fn last_price(&self, _symbol: &str) -> Result<Decimal, SourceError> {
            Ok(dec!(100))
        }
        async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let next = {
                let mut books = self.books.lock().unwrap();
                let q = books.get_mut(symbol).ok_or_else(|| SourceError::UnknownSymbol(symbol.into()))?;
                if q.len() > 1 { q.pop_front().flatten() } else { q.front().cloned().flatten() }
            };
            next.ok_or_else(|| SourceError::Decode("scripted failure".into()))
        }
    }

    /// Bids from 99 down, asks from 101 up, one level per unit bucket.
    fn ladder(n_bids: usize, n_asks: usize) -> OrderBookSnapshot {
        let mut b = OrderBookSnapshot::default();
        for i in 0..n_bids {
            b.bids.insert(dec!(99) - Decimal::from(i as i64), Decimal::from(10 + i as i64));
        }
        for i in 0..n_asks {
            b.asks.insert(dec!(101) + Decimal::from(i as i64), Decimal::from(10 + i as i64));
        }
        b
    }

    async fn supervisor(src: Scripted, cfg: SupervisorCfg) -> (MonitorSupervisor, watch::Sender<bool>, PriceCache, TempDir) {
        shared(Arc::new(src), cfg, None).await
    }

    async fn shared(
        src: Arc<Scripted>,
        cfg: SupervisorCfg,
        recorder: Option<mpsc::Sender<Event>>,
    ) -> (MonitorSupervisor, watch::Sender<bool>, PriceCache, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GroupingStore::load(dir.path().join("g.json")).await);
        let prices = PriceCache::new();
        // 10 <= price < 100 -> grouping 1 with tick 0.01
        prices.set("AAAUSDT", dec!(99.5));
        prices.set("BBBUSDT", dec!(99.5));
        let (tx, rx) = watch::channel(false);
        let sup = MonitorSupervisor::new(src, store, prices.clone(), LevelPolicy::default(), cfg, recorder, rx);
        (sup, tx, prices, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn scan_populates_registry_and_persists_grouping() {
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))])
            .with("BBBUSDT", dec!(0.01), vec![Some(ladder(2, 6))]);
        let (sup, _tx, _p, dir) = supervisor(src, SupervisorCfg::default()).await;
        let report = sup.initial_scan().await.unwrap();
        assert_eq!(report, ScanReport { discovered: 2, scanned: 2, longs: 1, shorts: 2 });

        let a = sup.registry().get("AAAUSDT").unwrap();
        assert_eq!(a.grouping, dec!(1));
        // bids 99..94 descending -> ranks 2/3 = 97/96
        assert_eq!(a.levels().long, Some(LevelPair { entry: dec!(97), stop: dec!(96) }));
        assert_eq!(sup.registry().get("BBBUSDT").unwrap().levels().long, None);

        let reloaded = GroupingStore::load(dir.path().join("g.json")).await;
        assert_eq!(reloaded.get("AAAUSDT").await, Some(dec!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_never_duplicates_monitors() {
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))])
            .with("BBBUSDT", dec!(0.01), vec![Some(ladder(6, 6))]);
        let (sup, tx, _p, _dir) = supervisor(src, SupervisorCfg::default()).await;
        sup.initial_scan().await.unwrap();
        assert_eq!(sup.start_monitors(), 2);
        sup.initial_scan().await.unwrap();
        assert_eq!(sup.start_monitors(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sup.live_monitors(), 2);

        tx.send(true).unwrap();
        sup.join_monitors().await;
        assert_eq!(sup.live_monitors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recompute_with_too_few_levels_clears_only_that_side() {
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6)), Some(ladder(3, 6))]);
        let (sup, _tx, _p, _dir) = supervisor(src, SupervisorCfg::default()).await;
        sup.initial_scan().await.unwrap();
        let before = sup.registry().get("AAAUSDT").unwrap().levels();
        assert!(before.long.is_some() && before.short.is_some());

        let after = sup.recompute("AAAUSDT").await.unwrap();
        assert_eq!(after.long, None);
        assert_eq!(after.short, before.short);
        assert_eq!(sup.registry().get("AAAUSDT").unwrap().levels(), after);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_levels() {
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6)), None]);
        let (sup, _tx, _p, _dir) = supervisor(src, SupervisorCfg::default()).await;
        sup.initial_scan().await.unwrap();
        let before = sup.registry().get("AAAUSDT").unwrap().levels();
        assert!(matches!(sup.recompute("AAAUSDT").await, Err(RecomputeError::Fetch(_))));
        assert_eq!(sup.registry().get("AAAUSDT").unwrap().levels(), before);
        assert!(matches!(sup.recompute("NOPE").await, Err(RecomputeError::UnknownSymbol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn recompute_is_serialized_per_instrument() {
        let src = Scripted::new(Duration::from_millis(200))
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))])
            .with("BBBUSDT", dec!(0.01), vec![Some(ladder(6, 6))]);
        let (sup, _tx, _p, _dir) = supervisor(src, SupervisorCfg::default()).await;
        sup.initial_scan().await.unwrap();

        assert!(sup.request_recompute("AAAUSDT"));
        assert!(!sup.request_recompute("AAAUSDT"));
        assert!(matches!(sup.recompute("AAAUSDT").await, Err(RecomputeError::InFlight(_))));
        // another instrument is independent
        assert!(sup.request_recompute("BBBUSDT"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!sup.registry().get("AAAUSDT").unwrap().is_recomputing());
        assert!(sup.request_recompute("AAAUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn crossing_triggers_recompute_and_new_levels() {
        // second book shifts every bid down by 10
        let mut shifted = OrderBookSnapshot::default();
        for i in 0..6i64 {
            shifted.bids.insert(dec!(89) - Decimal::from(i), Decimal::from(10 + i));
            shifted.asks.insert(dec!(101) + Decimal::from(i), Decimal::from(10 + i));
        }
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6)), Some(shifted)]);
        let cfg = SupervisorCfg {
            monitor: MonitorCfg { poll_interval: Duration::from_secs(1), idle_rescan: Duration::from_secs(600) },
            ..Default::default()
        };
        let (sup, tx, prices, _dir) = supervisor(src, cfg).await;
        sup.initial_scan().await.unwrap();
        assert_eq!(sup.start_monitors(), 1);
        let inst = sup.registry().get("AAAUSDT").unwrap();
        assert_eq!(inst.levels().long.unwrap().entry, dec!(97));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        prices.set("AAAUSDT", dec!(96.5));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(inst.levels().long.unwrap().entry, dec!(87));
        tx.send(true).unwrap();
        sup.join_monitors().await;
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_batches_and_throttles_rerank() {
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))])
            .with("BBBUSDT", dec!(0.01), vec![Some(ladder(6, 6))]);
        let (sup, _tx, _p, _dir) = supervisor(src, SupervisorCfg::default()).await;
        sup.initial_scan().await.unwrap();

        // scan marks everything dirty: one consolidated batch, first one reranks
        let b = sup.build_batch().unwrap();
        assert_eq!(b.updates.len(), 2);
        assert!(b.rerank);
        assert_eq!(b.updates[0].symbol, "AAAUSDT");
        assert_eq!(b.updates[0].long.as_ref().unwrap().distance_pct, distance_pct(dec!(97), dec!(99.5)).unwrap());
        assert!(sup.build_batch().is_none());

        // many reports for the same symbol collapse into one update
        let a = sup.registry().get("AAAUSDT").unwrap();
        for px in [dec!(99), dec!(98.9), dec!(98.8)] {
            a.push_price(px);
            a.set_distances(distance_pct(dec!(97), px), distance_pct(dec!(103), px));
            sup.mark_dirty("AAAUSDT", SideSet::only(Side::Long));
        }
        let b = sup.build_batch().unwrap();
        assert_eq!(b.updates.len(), 1);
        assert_eq!(b.updates[0].changed, SideSet::only(Side::Long));
        // moved > 0.1% but inside rerank_min_interval
        assert!(!b.rerank);
    }

    fn quick() -> SupervisorCfg {
        SupervisorCfg {
            monitor: MonitorCfg { poll_interval: Duration::from_secs(1), idle_rescan: Duration::from_secs(5) },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn instrument_without_levels_still_gets_a_monitor() {
        // 2x2 book: nothing to rank at scan time, deep book afterwards
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(2, 2)), Some(ladder(6, 6))]);
        let (sup, tx, _p, _dir) = supervisor(src, quick()).await;
        let run = tokio::spawn(sup.clone().run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let inst = sup.registry().get("AAAUSDT").unwrap();
        assert!(inst.levels().is_empty());
        assert_eq!(sup.live_monitors(), 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(inst.levels().long, Some(LevelPair { entry: dec!(97), stop: dec!(96) }));
        assert_eq!(inst.levels().short, Some(LevelPair { entry: dec!(103), stop: dec!(104) }));
        assert_eq!(sup.live_monitors(), 1);

        tx.send(true).unwrap();
        run.await.unwrap();
        assert_eq!(sup.live_monitors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn instrument_skipped_at_scan_is_picked_up_later() {
        let src = Arc::new(
            Scripted::new(Duration::ZERO)
                .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))])
                .listed("BBBUSDT", None, vec![Some(ladder(6, 6))]),
        );
        let (sup, tx, _p, _dir) = shared(Arc::clone(&src), quick(), None).await;
        let run = tokio::spawn(sup.clone().run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.registry().len(), 1);
        assert_eq!(sup.live_monitors(), 1);

        src.set_tick("BBBUSDT", dec!(0.01));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let b = sup.registry().get("BBBUSDT").unwrap();
        assert_eq!(b.levels().long.unwrap().entry, dec!(97));
        assert_eq!(sup.live_monitors(), 2);
        // picked-up instrument reaches the observer
        let batch = sup.build_batch().unwrap();
        assert!(batch.updates.iter().any(|u| u.symbol == "BBBUSDT"));

        tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rebuilt_instrument_gets_a_fresh_monitor() {
        let src = Arc::new(Scripted::new(Duration::ZERO).with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))]));
        let (sup, tx, _p, _dir) = shared(Arc::clone(&src), SupervisorCfg::default(), None).await;
        sup.initial_scan().await.unwrap();
        assert_eq!(sup.start_monitors(), 1);
        let old = sup.registry().get("AAAUSDT").unwrap();

        src.set_tick("AAAUSDT", dec!(0.1));
        sup.initial_scan().await.unwrap();
        let new = sup.registry().get("AAAUSDT").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_retired());
        assert_eq!(new.decimals, 1);

        assert_eq!(sup.start_monitors(), 1);
        assert_eq!(sup.start_monitors(), 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sup.live_monitors(), 1);

        tx.send(true).unwrap();
        sup.join_monitors().await;
    }

    #[tokio::test(start_paused = true)]
    async fn held_rerank_is_emitted_once_interval_passes() {
        let src = Scripted::new(Duration::ZERO)
            .with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))])
            .with("BBBUSDT", dec!(0.01), vec![Some(ladder(6, 6))]);
        let (sup, _tx, _p, _dir) = supervisor(src, SupervisorCfg::default()).await;
        sup.initial_scan().await.unwrap();
        assert!(sup.build_batch().unwrap().rerank);

        let a = sup.registry().get("AAAUSDT").unwrap();
        a.push_price(dec!(98.8));
        a.set_distances(distance_pct(dec!(97), dec!(98.8)), distance_pct(dec!(103), dec!(98.8)));
        sup.mark_dirty("AAAUSDT", SideSet::BOTH);
        let b = sup.build_batch().unwrap();
        assert_eq!(b.updates.len(), 1);
        assert!(!b.rerank);
        assert!(sup.build_batch().is_none());

        // no further ticks: the held move still gets its rerank
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let b = sup.build_batch().unwrap();
        assert!(b.rerank);
        assert!(b.updates.is_empty());
        assert!(sup.build_batch().is_none());

        // small move against the refreshed baseline stays quiet
        tokio::time::sleep(Duration::from_millis(1100)).await;
        a.push_price(dec!(98.79));
        a.set_distances(distance_pct(dec!(97), dec!(98.79)), distance_pct(dec!(103), dec!(98.79)));
        sup.mark_dirty("AAAUSDT", SideSet::only(Side::Long));
        assert!(!sup.build_batch().unwrap().rerank);
    }

    #[tokio::test(start_paused = true)]
    async fn full_recorder_channel_drops_events() {
        let (rec_tx, mut rec_rx) = mpsc::channel::<Event>(1);
        let src = Arc::new(Scripted::new(Duration::ZERO).with("AAAUSDT", dec!(0.01), vec![Some(ladder(6, 6))]));
        let (sup, _tx, _p, _dir) = shared(src, SupervisorCfg::default(), Some(rec_tx)).await;
        sup.initial_scan().await.unwrap();
        // second Levels event finds the channel full
        sup.recompute("AAAUSDT").await.unwrap();

        assert!(matches!(rec_rx.try_recv(), Ok(Event::Levels { .. })));
        assert!(rec_rx.try_recv().is_err());
    }
}
