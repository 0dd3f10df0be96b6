// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, GaugeVec,
    Registry, TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static PRICE_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_updates_total", "last-trade prices written to the cache"),
        &["source"],
    )
    .unwrap()
});

// -------- Monitors --------
pub static ACTIVE_MONITORS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_monitors", "running symbol monitors").unwrap());

pub static CROSSINGS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("level_crossings_total", "entry level crossings (label: side)"),
        &["side"],
    )
    .unwrap()
});

pub static DISTANCE_PCT: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("entry_distance_pct", "distance from price to active entry, percent"),
        &["symbol", "side"],
    )
    .unwrap()
});

// -------- Supervisor --------
pub static RECOMPUTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("recomputes_total", "level recomputations (label: outcome)"),
        &["outcome"],
    )
    .unwrap()
});

pub static NOTIFY_BATCHES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("notify_batches_total", "observer batches emitted").unwrap());

pub static SCAN_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "initial_scan_seconds",
        "duration of a full instrument scan",
    ))
    .unwrap()
});

pub static INSTRUMENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("instruments_tracked", "instruments in the registry").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(PRICE_UPDATES.clone())),
        REGISTRY.register(Box::new(ACTIVE_MONITORS.clone())),
        REGISTRY.register(Box::new(CROSSINGS.clone())),
        REGISTRY.register(Box::new(DISTANCE_PCT.clone())),
        REGISTRY.register(Box::new(RECOMPUTES.clone())),
        REGISTRY.register(Box::new(NOTIFY_BATCHES.clone())),
        REGISTRY.register(Box::new(SCAN_SECONDS.clone())),
        REGISTRY.register(Box::new(INSTRUMENTS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let body = encode_metrics();
    let rsp = Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("# encode error\n")));
    Ok(rsp)
}

// Serve GET / or /metrics until the runtime stops
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening (/, /metrics)");
    if let Err(e) = server.await {
        error!(?e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        init();
        CROSSINGS.with_label_values(&["long"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("level_crossings_total"));
    }
}
