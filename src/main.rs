// ===============================
// src/main.rs
// ===============================
/*
 # metrics
 curl -s localhost:9898/metrics | egrep '^(level_crossings_total|recomputes_total|active_monitors)'
 curl -s localhost:9898/metrics | grep '^entry_distance_pct'

 # journal
 RECORD_FILE=data/journal.jsonl cargo run --release
*/
/*
=============================================================================
Project : shock_oracle — order-book shock levels & crossing monitor in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Scans a venue's order books (mock/Binance), derives high-liquidity
          "shock" levels per side, watches live prices for crossings and
          re-derives levels on demand. Exposes Prometheus metrics and
          records JSONL events.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod bucketing;
mod shocks;
mod state;
mod source;
mod binance;          // Binance futures REST / book aggregator API
mod mock;             // synthetic venue for FEED_MODE=mock
mod feed;
mod grouping_store;
mod monitor;
mod supervisor;
mod board;

use std::sync::Arc;

use chrono::Utc;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{timeout, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::FeedMode;
use crate::domain::{Event, NotifyBatch};
use crate::source::MarketSource;
use crate::state::PriceCache;
use crate::supervisor::MonitorSupervisor;

const HEARTBEAT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // ---- Load config ----
    let args = config::load();

    // ---- Logging ----
    // RUST_LOG menang kalau di-set; selain itu LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = args.validate() {
        error!(%e, "invalid configuration");
        std::process::exit(2);
    }
    let policy = match args.level_policy() {
        Ok(p) => p,
        Err(e) => {
            error!(%e, "invalid level policy");
            std::process::exit(2);
        }
    };
    let sup_cfg = args.supervisor_cfg();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        feed_mode = args.feed_mode.label(),
        symbols = ?args.normalized_symbols(),
        book_api = ?args.book_api_url,
        binance_rest = %args.binance_rest_url,
        binance_ws = %args.binance_ws_url,
        grouping_file = %args.grouping_file,
        min_ranks = policy.min_levels(),
        entry_rank = policy.entry_rank(),
        "startup config"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let prices = PriceCache::new();

    // ---- Recorder (optional) ----
    let mut recorder_task = None;
    let recorder_tx = args.record_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel::<Event>(8192);
        recorder_task = Some(tokio::spawn(recorder::run(rx, path)));
        tx
    });

    // ---- Source + price feed ----
    let (source, feed_task): (Arc<dyn MarketSource>, _) = match args.feed_mode {
        FeedMode::Mock => {
            let venue = mock::MockVenue::new(&args.normalized_symbols(), prices.clone());
            let specs = venue.specs().to_vec();
            let task = tokio::spawn(feed::run_mock(prices.clone(), specs, shutdown_rx.clone()));
            (Arc::new(venue), task)
        }
        FeedMode::Binance => {
            let src: Arc<dyn MarketSource> =
                match binance::BinanceSource::new(&args.binance_rest_url, args.book_api_url.as_deref()) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        error!(?e, "cannot build binance client");
                        std::process::exit(1);
                    }
                };
            let task = tokio::spawn(feed::run_discovered(
                Arc::clone(&src),
                prices.clone(),
                args.binance_ws_url.clone(),
                sup_cfg.rescan_backoff,
                shutdown_rx.clone(),
            ));
            (src, task)
        }
    };

    // ---- Persisted groupings ----
    let store = Arc::new(grouping_store::GroupingStore::load(&args.grouping_file).await);
    info!(entries = store.len().await, path = %args.grouping_file, "grouping store loaded");

    // ---- Supervisor + observer ----
    let supervisor = MonitorSupervisor::new(
        source,
        store,
        prices.clone(),
        policy,
        sup_cfg,
        recorder_tx.clone(),
        shutdown_rx.clone(),
    );
    let (notify_tx, notify_rx) = mpsc::channel::<NotifyBatch>(256);
    let board_task = tokio::spawn(board::run(notify_rx, args.board_top));
    let notifier_task = tokio::spawn(supervisor.clone().run_notifier(notify_tx));
    let supervisor_task = tokio::spawn(supervisor.clone().run());

    if let Some(tx) = &recorder_tx {
        let _ = tx.try_send(Event::Note(format!("start {} {}", Utc::now().to_rfc3339(), args.feed_mode.label())));
    }

    // ---- Heartbeat until Ctrl-C ----
    loop {
        select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(?e, "ctrl_c handler failed, shutting down");
                }
                break;
            }
            _ = tokio::time::sleep(HEARTBEAT) => {
                info!(
                    instruments = supervisor.registry().len(),
                    monitors = supervisor.live_monitors(),
                    prices = prices.len(),
                    "heartbeat"
                );
            }
        }
    }

    // ---- Shutdown ----
    info!("shutdown requested");
    if let Some(tx) = &recorder_tx {
        let _ = tx.try_send(Event::Note("shutdown".into()));
    }
    let _ = shutdown_tx.send(true);

    for (name, task) in [("supervisor", supervisor_task), ("notifier", notifier_task), ("feed", feed_task)] {
        if timeout(Duration::from_secs(5), task).await.is_err() {
            warn!(task = name, "did not stop in time");
        }
    }
    let _ = timeout(Duration::from_secs(1), board_task).await;

    // recorder selesai setelah semua sender di-drop
    drop(supervisor);
    drop(recorder_tx);
    if let Some(task) = recorder_task {
        let _ = timeout(Duration::from_secs(2), task).await;
    }
    info!("bye");
}
