// ===============================
// src/mock.rs
// ===============================
//
// Venue mock: tanpa jaringan, untuk FEED_MODE=mock dan demo lokal.
// - symbols/tick dari daftar config (tick & harga awal dari tabel kecil)
// - order book sintetis: 200 level per sisi di sekitar harga terakhir,
//   dengan beberapa "cluster" likuiditas agar shock terlihat
//
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::bucketing::bucket;
use crate::domain::OrderBookSnapshot;
use crate::source::{MarketSource, SourceError};
use crate::state::PriceCache;

const DEPTH_LEVELS: i64 = 200;

#[derive(Debug, Clone)]
pub struct MockSymbol {
    pub symbol: String,
    pub tick_size: Decimal,
    pub seed_price: Decimal,
}

impl MockSymbol {
    pub fn for_symbol(symbol: &str) -> Self {
        let (tick_size, seed_price) = match symbol {
            "BTCUSDT" => (dec!(0.1), dec!(65000)),
            "ETHUSDT" => (dec!(0.01), dec!(3200)),
            "SOLUSDT" => (dec!(0.01), dec!(150)),
            "XRPUSDT" => (dec!(0.0001), dec!(0.55)),
            "DOGEUSDT" => (dec!(0.00001), dec!(0.12)),
            _ => (dec!(0.01), dec!(100)),
        };
        Self { symbol: symbol.to_string(), tick_size, seed_price }
    }
}

pub struct MockVenue {
    symbols: Vec<MockSymbol>,
    prices: PriceCache,
}

impl MockVenue {
    pub fn new(symbols: &[String], prices: PriceCache) -> Self {
        let symbols = symbols.iter().map(|s| MockSymbol::for_symbol(s)).collect();
        Self { symbols, prices }
    }

    pub fn specs(&self) -> &[MockSymbol] { &self.symbols }

    fn spec(&self, symbol: &str) -> Result<&MockSymbol, SourceError> {
        self.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| SourceError::UnknownSymbol(symbol.to_string()))
    }
}

/// Synthetic depth around `mid`. Same (symbol, mid) -> same book.
pub fn synthetic_book(spec: &MockSymbol, mid: Decimal, seed: u64) -> OrderBookSnapshot {
    let mut rng = StdRng::seed_from_u64(seed);
    let tick = spec.tick_size;
    let step = tick * Decimal::from(rng.gen_range(1..=5i64));
    let mid = bucket(mid, tick);
    let mut book = OrderBookSnapshot::default();
    for i in 1..=DEPTH_LEVELS {
        // setiap ~25 level ada tembok likuiditas
        let wall = if i % 25 == 0 { Decimal::from(rng.gen_range(20..=60i64)) } else { Decimal::ONE };
        let bid_qty = Decimal::from(rng.gen_range(1..=10i64)) * wall;
        let ask_qty = Decimal::from(rng.gen_range(1..=10i64)) * wall;
        let off = step * Decimal::from(i);
        let bid = mid - off;
        if bid > Decimal::ZERO {
            book.bids.insert(bid, bid_qty);
        }
        book.asks.insert(mid + off, ask_qty);
    }
    book
}

fn seed_for(symbol: &str, mid: Decimal) -> u64 {
    let s = symbol.bytes().fold(1469598103934665603u64, |h, b| (h ^ b as u64).wrapping_mul(1099511628211));
    s ^ mid.mantissa() as u64
}

#[async_trait]
impl MarketSource for MockVenue {
    async fn symbols(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.symbols.iter().map(|s| s.symbol.clone()).collect())
    }

    async fn tick_size(&self, symbol: &str) -> Result<Decimal, SourceError> {
        Ok(self.spec(symbol)?.tick_size)
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, SourceError> {
        let spec = self.spec(symbol)?;
        Ok(self.prices.get(symbol).unwrap_or(spec.seed_price))
    }

    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, SourceError> {
        let spec = self.spec(symbol)?;
        let mid = self.prices.get(symbol).unwrap_or(spec.seed_price);
        Ok(synthetic_book(spec, mid, seed_for(symbol, mid)))
    }
}
