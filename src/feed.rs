// ===============================
// src/feed.rs
// ===============================
//
// Price feed adapters (push ke PriceCache):
// - run_mock    : random-walk per symbol (~20 updates/s), snapped to tick
// - run_binance : Binance futures combined stream `<sym>@aggTrade`,
//                 max STREAMS_PER_CONN streams per connection
//
// Feed hanya menulis cache; monitor membaca cache dengan ritme sendiri.
//
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt; // for .next()
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bucketing::bucket;
use crate::metrics::PRICE_UPDATES;
use crate::mock::MockSymbol;
use crate::source::{decimal_from_json, MarketSource};
use crate::state::PriceCache;

pub const STREAMS_PER_CONN: usize = 200;

/// Random walk untuk semua symbol mock sampai shutdown.
pub async fn run_mock(cache: PriceCache, symbols: Vec<MockSymbol>, mut shutdown: watch::Receiver<bool>) {
    for s in &symbols {
        if cache.get(&s.symbol).is_none() {
            cache.set(&s.symbol, s.seed_price);
        }
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        for s in &symbols {
            let Some(px) = cache.get(&s.symbol) else { continue };
            // jangan simpan ThreadRng melewati .await
            let steps = rand::thread_rng().gen_range(-3i64..=3);
            let next = bucket(px + s.tick_size * Decimal::from(steps), s.tick_size);
            cache.set(&s.symbol, next.max(s.tick_size));
            PRICE_UPDATES.with_label_values(&["mock"]).inc();
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(50)) => {}
            res = shutdown.changed() => if res.is_err() { break },
        }
    }
    info!("mock feed stopped");
}

/// Combined-stream URL for one chunk of symbols.
pub fn stream_url(ws_base: &str, symbols: &[String]) -> String {
    let streams = symbols
        .iter()
        .map(|s| format!("{}@aggTrade", s.to_lowercase()))
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/stream?streams={}", ws_base.trim_end_matches('/'), streams)
}

/// (symbol, price) from an aggTrade frame, raw or wrapped in {"stream","data"}.
pub fn parse_trade(txt: &str) -> Option<(String, Decimal)> {
    let v: serde_json::Value = serde_json::from_str(txt).ok()?;
    let d = v.get("data").unwrap_or(&v);
    let sym = d.get("s")?.as_str()?.to_ascii_uppercase();
    let px = d.get("p").and_then(decimal_from_json)?;
    (px > Decimal::ZERO).then_some((sym, px))
}

/// Discover the universe via `source` (retrying every `backoff`), then
/// stream it. Used in binance mode where SYMBOLS is not the universe.
pub async fn run_discovered(
    source: Arc<dyn MarketSource>,
    cache: PriceCache,
    ws_base: String,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let symbols = loop {
        if *shutdown.borrow() {
            return;
        }
        match source.symbols().await {
            Ok(s) if !s.is_empty() => break s,
            Ok(_) => warn!("feed: discovery returned no symbols"),
            Err(e) => warn!(?e, "feed: discovery failed"),
        }
        tokio::select! {
            _ = sleep(backoff) => {}
            res = shutdown.changed() => if res.is_err() { return },
        }
    };
    info!(symbols = symbols.len(), conns = symbols.len().div_ceil(STREAMS_PER_CONN), "feed: streaming aggTrade");
    run_binance(cache, symbols, ws_base, shutdown).await;
}

/// Spawn satu koneksi per chunk symbol; return setelah shutdown.
pub async fn run_binance(cache: PriceCache, symbols: Vec<String>, ws_base: String, shutdown: watch::Receiver<bool>) {
    let mut tasks = Vec::new();
    for chunk in symbols.chunks(STREAMS_PER_CONN) {
        let url = stream_url(&ws_base, chunk);
        tasks.push(tokio::spawn(run_stream(cache.clone(), url, shutdown.clone())));
    }
    for t in tasks {
        let _ = t.await;
    }
}

async fn run_stream(cache: PriceCache, ws_url: String, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                return;
            }
        };

        info!(streams = ws_url.matches("@aggTrade").count(), "connecting binance aggTrade");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                attempt = 0; // reset backoff
                loop {
                    let frame = tokio::select! {
                        f = ws.next() => f,
                        _ = shutdown.changed() => None,
                    };
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(m) if m.is_text() => {
                            // {"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","s":"BTCUSDT","p":"65000.10","q":"0.010",...}}
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            match parse_trade(&txt) {
                                Some((sym, px)) => {
                                    cache.set(&sym, px);
                                    PRICE_UPDATES.with_label_values(&["binance"]).inc();
                                }
                                None => debug!(len = txt.len(), "non-trade frame ignored"),
                            }
                        }
                        Ok(_) => {
                            // ping/pong/binary: abaikan
                        }
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                info!("aggTrade disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);                  // 0..=6
        let factor = 1u64 << shift;                  // 1,2,4,...,64
        let base_ms = 500u64.saturating_mul(factor); // 0.5s..32s
        let jitter = rand::thread_rng().gen_range(0..=250);
        tokio::select! {
            _ = sleep(Duration::from_millis(base_ms + jitter)) => {}
            res = shutdown.changed() => if res.is_err() { break },
        }
    }
    info!("aggTrade stream stopped");
}
