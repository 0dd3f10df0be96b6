// ===============================
// src/source.rs
// ===============================
//
// Kontrak sumber data eksternal (discovery, tick size, harga, order book).
// Callers treat every Err as "no data this round" and retry on their cadence.
//
use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::domain::OrderBookSnapshot;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Currently tradable instrument identifiers.
    async fn symbols(&self) -> Result<Vec<String>, SourceError>;
    async fn tick_size(&self, symbol: &str) -> Result<Decimal, SourceError>;
    async fn last_price(&self, symbol: &str) -> Result<Decimal, SourceError>;
    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, SourceError>;
}

/// Decimal from a JSON string or number without going through f64.
pub fn decimal_from_json(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
}

fn keep(price: Option<Decimal>, qty: Option<Decimal>) -> Option<(Decimal, Decimal)> {
    match (price, qty) {
        (Some(p), Some(q)) if p > Decimal::ZERO && q > Decimal::ZERO => Some((p, q)),
        _ => None,
    }
}

/// One depth side. Accepts `{"price": qty, ...}` or `[["price", "qty"], ...]`;
/// unparsable entries are dropped one by one.
pub fn parse_side(v: Option<&Value>) -> BTreeMap<Decimal, Decimal> {
    let mut out = BTreeMap::new();
    match v {
        Some(Value::Object(map)) => {
            for (k, q) in map {
                match keep(parse_decimal(k), decimal_from_json(q)) {
                    Some((p, q)) => { *out.entry(p).or_insert(Decimal::ZERO) += q; }
                    None => trace!(price = %k, "skip malformed depth entry"),
                }
            }
        }
        Some(Value::Array(rows)) => {
            for row in rows {
                let p = row.get(0).and_then(decimal_from_json);
                let q = row.get(1).and_then(decimal_from_json);
                match keep(p, q) {
                    Some((p, q)) => { *out.entry(p).or_insert(Decimal::ZERO) += q; }
                    None => trace!(?row, "skip malformed depth entry"),
                }
            }
        }
        _ => {}
    }
    out
}

pub fn parse_order_book(v: &Value) -> Result<OrderBookSnapshot, SourceError> {
    if v.get("bids").is_none() && v.get("asks").is_none() {
        return Err(SourceError::Decode("order book without bids/asks".into()));
    }
    Ok(OrderBookSnapshot { bids: parse_side(v.get("bids")), asks: parse_side(v.get("asks")) })
}
