// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : shock_oracle — order-book shock levels & crossing monitor in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Scans a venue's order books (mock/Binance), derives high-liquidity
          "shock" levels per side, watches live prices for crossings and
          re-derives levels on demand. Exposes Prometheus metrics and
          records JSONL events.
=============================================================================
*/
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::monitor::MonitorCfg;
use crate::shocks::{LevelPolicy, PolicyError};
use crate::supervisor::SupervisorCfg;

/// Sumber order book + harga
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    Mock,
    Binance,
}

impl FeedMode {
    pub fn label(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Binance => "binance",
        }
    }
}

// Endpoint default (USDⓈ-M futures)
pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";
pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SYMBOLS is empty (required in mock mode)")]
    NoSymbols,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("RERANK_THRESHOLD_PCT must not be negative")]
    NegativeThreshold,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Parser, Clone, Debug)]
#[command(name = "shock_oracle", version, about = "Order-book shock levels & crossing monitor")]
pub struct Args {
    #[arg(long, env = "FEED_MODE", value_enum, default_value_t = FeedMode::Mock)]
    pub feed_mode: FeedMode,

    /// Mock universe; ignored by binance mode (discovery decides)
    #[arg(long, env = "SYMBOLS", value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT,DOGEUSDT")]
    pub symbols: Vec<String>,

    /// Order-book aggregator (GET /symbols, /orderbooks/{symbol})
    #[arg(long, env = "BOOK_API_URL")]
    pub book_api_url: Option<String>,
    #[arg(long, env = "BINANCE_REST_URL", default_value = DEFAULT_REST_URL)]
    pub binance_rest_url: String,
    #[arg(long, env = "BINANCE_WS_URL", default_value = DEFAULT_WS_URL)]
    pub binance_ws_url: String,

    #[arg(long, env = "GROUPING_FILE", default_value = "groupings.json")]
    pub grouping_file: String,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,
    #[arg(long, env = "NOTIFY_INTERVAL_MS", default_value_t = 50)]
    pub notify_interval_ms: u64,
    #[arg(long, env = "RERANK_THRESHOLD_PCT", default_value = "0.1")]
    pub rerank_threshold_pct: Decimal,
    #[arg(long, env = "RERANK_MIN_INTERVAL_MS", default_value_t = 1000)]
    pub rerank_min_interval_ms: u64,
    #[arg(long, env = "RESCAN_BACKOFF_SECS", default_value_t = 10)]
    pub rescan_backoff_secs: u64,
    #[arg(long, env = "IDLE_RESCAN_SECS", default_value_t = 60)]
    pub idle_rescan_secs: u64,
    #[arg(long, env = "SCAN_CONCURRENCY", default_value_t = 8)]
    pub scan_concurrency: usize,

    // rank policy: butuh >= LEVEL_MIN_RANKS shock, entry = rank ke-N (0-based), stop = N+1
    #[arg(long, env = "LEVEL_MIN_RANKS", default_value_t = 4)]
    pub level_min_ranks: usize,
    #[arg(long, env = "LEVEL_ENTRY_RANK", default_value_t = 2)]
    pub level_entry_rank: usize,

    #[arg(long, env = "BOARD_TOP", default_value_t = 10)]
    pub board_top: usize,

    // files/metrics
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Upper-cased, trimmed, de-duplicated symbol list (order kept).
    pub fn normalized_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in &self.symbols {
            let s = s.trim().to_ascii_uppercase();
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }

    pub fn level_policy(&self) -> Result<LevelPolicy, ConfigError> {
        Ok(LevelPolicy::new(self.level_min_ranks, self.level_entry_rank)?)
    }

    pub fn supervisor_cfg(&self) -> SupervisorCfg {
        SupervisorCfg {
            monitor: MonitorCfg {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                idle_rescan: Duration::from_secs(self.idle_rescan_secs),
            },
            notify_interval: Duration::from_millis(self.notify_interval_ms),
            rerank_threshold_pct: self.rerank_threshold_pct,
            rerank_min_interval: Duration::from_millis(self.rerank_min_interval_ms),
            rescan_backoff: Duration::from_secs(self.rescan_backoff_secs),
            scan_concurrency: self.scan_concurrency,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed_mode == FeedMode::Mock && self.normalized_symbols().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        for (name, v) in [
            ("POLL_INTERVAL_MS", self.poll_interval_ms),
            ("NOTIFY_INTERVAL_MS", self.notify_interval_ms),
            ("SCAN_CONCURRENCY", self.scan_concurrency as u64),
        ] {
            if v == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.rerank_threshold_pct.is_sign_negative() {
            return Err(ConfigError::NegativeThreshold);
        }
        self.level_policy()?;
        Ok(())
    }
}

/// .env dulu, lalu CLI > env > default.
pub fn load() -> Args {
    let _ = dotenv();
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["shock_oracle"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let a = parse(&[
            "--feed-mode", "binance",
            "--poll-interval-ms", "250",
            "--rerank-threshold-pct", "0.25",
            "--level-min-ranks", "6",
            "--level-entry-rank", "3",
        ]);
        assert_eq!(a.feed_mode, FeedMode::Binance);
        let cfg = a.supervisor_cfg();
        assert_eq!(cfg.monitor.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.rerank_threshold_pct, Decimal::new(25, 2));
        let p = a.level_policy().unwrap();
        assert_eq!((p.min_levels(), p.entry_rank()), (6, 3));
        assert!(a.validate().is_ok());
    }

    #[test]
    fn symbols_are_normalized() {
        let a = parse(&["--symbols", " btcusdt,ETHUSDT,,btcusdt "]);
        assert_eq!(a.normalized_symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[test]
    fn rejects_bad_values() {
        let a = parse(&["--level-min-ranks", "3", "--level-entry-rank", "2"]);
        assert!(matches!(a.validate(), Err(ConfigError::Policy(_))));
        let a = parse(&["--notify-interval-ms", "0"]);
        assert_eq!(a.validate(), Err(ConfigError::Zero("NOTIFY_INTERVAL_MS")));
        assert!(Args::try_parse_from(["shock_oracle", "--feed-mode", "ftx"]).is_err());
    }
}
