// ===============================
// src/binance.rs
// ===============================
//
// REST source:
// - discovery & depth dari order-book aggregator (BOOK_API_URL) kalau diset,
//   selain itu langsung ke Binance USDⓈ-M futures (exchangeInfo / depth)
// - tick size dari PRICE_FILTER exchangeInfo (di-cache, refresh saat miss)
// - harga terakhir dari /fapi/v1/ticker/price
//
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::OrderBookSnapshot;
use crate::source::{decimal_from_json, parse_order_book, MarketSource, SourceError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEPTH_LIMIT: u32 = 1000;

pub struct BinanceSource {
    http: reqwest::Client,
    rest_base: String,
    book_api: Option<String>,
    ticks: Mutex<HashMap<String, Decimal>>,
}

impl BinanceSource {
    pub fn new(rest_base: &str, book_api: Option<&str>) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            book_api: book_api.map(|b| b.trim_end_matches('/').to_string()),
            ticks: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json(&self, url: String) -> Result<Value, SourceError> {
        let rsp = self.http.get(&url).send().await?;
        if !rsp.status().is_success() {
            return Err(SourceError::Status { status: rsp.status().as_u16(), url });
        }
        Ok(rsp.json::<Value>().await?)
    }

    async fn exchange_info(&self) -> Result<Value, SourceError> {
        self.get_json(format!("{}/fapi/v1/exchangeInfo", self.rest_base)).await
    }

    async fn refresh_ticks(&self) -> Result<(), SourceError> {
        let info = self.exchange_info().await?;
        let parsed = parse_tick_sizes(&info);
        debug!(count = parsed.len(), "tick sizes refreshed");
        self.ticks.lock().await.extend(parsed);
        Ok(())
    }
}

/// symbol -> PRICE_FILTER.tickSize from an exchangeInfo payload.
pub fn parse_tick_sizes(info: &Value) -> HashMap<String, Decimal> {
    let mut out = HashMap::new();
    let Some(symbols) = info.get("symbols").and_then(|s| s.as_array()) else { return out };
    for s in symbols {
        let Some(name) = s.get("symbol").and_then(|x| x.as_str()) else { continue };
        let tick = s
            .get("filters")
            .and_then(|f| f.as_array())
            .and_then(|fs| {
                fs.iter()
                    .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("PRICE_FILTER"))
            })
            .and_then(|f| f.get("tickSize"))
            .and_then(decimal_from_json)
            .filter(|t| *t > Decimal::ZERO);
        if let Some(t) = tick {
            out.insert(name.to_string(), t.normalize());
        }
    }
    out
}

/// TRADING symbols from an exchangeInfo payload.
pub fn parse_trading_symbols(info: &Value) -> Vec<String> {
    info.get("symbols")
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|s| s.get("status").and_then(|x| x.as_str()) == Some("TRADING"))
                .filter_map(|s| s.get("symbol").and_then(|x| x.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl MarketSource for BinanceSource {
    async fn symbols(&self) -> Result<Vec<String>, SourceError> {
        match &self.book_api {
            Some(api) => {
                let v = self.get_json(format!("{api}/symbols")).await?;
                let list = v
                    .get("symbols")
                    .and_then(|s| s.as_array())
                    .ok_or_else(|| SourceError::Decode("symbols: missing array".into()))?;
                Ok(list.iter().filter_map(|s| s.as_str()).map(|s| s.to_ascii_uppercase()).collect())
            }
            None => {
                let info = self.exchange_info().await?;
                self.ticks.lock().await.extend(parse_tick_sizes(&info));
                Ok(parse_trading_symbols(&info))
            }
        }
    }

    async fn tick_size(&self, symbol: &str) -> Result<Decimal, SourceError> {
        if let Some(t) = self.ticks.lock().await.get(symbol) {
            return Ok(*t);
        }
        self.refresh_ticks().await?;
        self.ticks
            .lock()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| SourceError::UnknownSymbol(symbol.to_string()))
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, SourceError> {
        let url = format!(
            "{}/fapi/v1/ticker/price?symbol={}",
            self.rest_base,
            urlencoding::encode(symbol)
        );
        let v = self.get_json(url).await?;
        v.get("price")
            .and_then(decimal_from_json)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| SourceError::Decode(format!("ticker/price {symbol}: no price")))
    }

    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, SourceError> {
        let url = match &self.book_api {
            Some(api) => format!("{api}/orderbooks/{}", urlencoding::encode(symbol)),
            None => format!(
                "{}/fapi/v1/depth?symbol={}&limit={DEPTH_LIMIT}",
                self.rest_base,
                urlencoding::encode(symbol)
            ),
        };
        let v = self.get_json(url).await?;
        parse_order_book(&v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn info() -> Value {
        json!({
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001"}
                ]},
                {"symbol": "1000PEPEUSDT", "status": "TRADING", "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.0000001"}
                ]},
                {"symbol": "OLDUSDT", "status": "SETTLING", "filters": []}
            ]
        })
    }

    #[test]
    fn tick_sizes_come_from_price_filter() {
        let t = parse_tick_sizes(&info());
        assert_eq!(t.get("BTCUSDT"), Some(&dec!(0.1)));
        assert_eq!(t.get("1000PEPEUSDT"), Some(&dec!(0.0000001)));
        assert!(t.get("OLDUSDT").is_none());
    }

    #[test]
    fn only_trading_symbols_are_discovered() {
        assert_eq!(parse_trading_symbols(&info()), vec!["BTCUSDT", "1000PEPEUSDT"]);
        assert!(parse_trading_symbols(&json!({})).is_empty());
    }
}
