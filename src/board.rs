// ===============================
// src/board.rs
// ===============================
//
// Board observer (headless):
// - terima NotifyBatch dari supervisor
// - simpan satu baris per (symbol, side)
// - saat rerank: urutkan per side berdasarkan jarak ke entry, log top-N
//
use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{LevelPair, NotifyBatch, Side, SideView};

/// Compact quantity: 1.2k, 3.4m, 5.0b, or two decimals below a thousand.
pub fn format_volume(q: Decimal) -> String {
    let fixed = |mut v: Decimal, dp: u32| {
        v.rescale(dp);
        v.to_string()
    };
    if q >= dec!(1000000000) {
        format!("{}b", fixed(q / dec!(1000000000), 1))
    } else if q >= dec!(1000000) {
        format!("{}m", fixed(q / dec!(1000000), 1))
    } else if q >= dec!(1000) {
        format!("{}k", fixed(q / dec!(1000), 1))
    } else {
        fixed(q, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Proximity { Hot, Near, Warm, Far }

impl Proximity {
    pub fn of(distance_pct: Decimal) -> Self {
        if distance_pct < dec!(0.5) {
            Proximity::Hot
        } else if distance_pct < dec!(1) {
            Proximity::Near
        } else if distance_pct < dec!(2) {
            Proximity::Warm
        } else {
            Proximity::Far
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Proximity::Hot => "HOT",
            Proximity::Near => "near",
            Proximity::Warm => "warm",
            Proximity::Far => "far",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardRow {
    pub symbol: String,
    pub side: Side,
    pub price: Option<Decimal>,
    pub decimals: u32,
    pub entry: Decimal,
    pub stop: Decimal,
    pub distance_pct: Decimal,
}

impl BoardRow {
    pub fn stop_distance_pct(&self) -> Decimal {
        LevelPair { entry: self.entry, stop: self.stop }.stop_distance_pct()
    }

    fn render(&self, rank: usize) -> String {
        let d = self.decimals as usize;
        let px = self.price.map(|p| format!("{:.*}", d, p)).unwrap_or_else(|| "-".into());
        format!(
            "{:<5} #{:<2} {:<14} px {:>14}  entry {:.*} ({:.2}%)  stop {:.*} [{:.2}%]  {}",
            self.side.label().to_uppercase(),
            rank,
            self.symbol,
            px,
            d,
            self.entry,
            self.distance_pct,
            d,
            self.stop,
            self.stop_distance_pct(),
            Proximity::of(self.distance_pct).label(),
        )
    }
}

#[derive(Debug, Default)]
pub struct Board {
    rows: BTreeMap<(String, Side), BoardRow>,
    top: usize,
    batches: u64,
}

impl Board {
    pub fn new(top: usize) -> Self { Self { top: top.max(1), ..Default::default() } }

    fn put(&mut self, symbol: &str, side: Side, price: Option<Decimal>, decimals: u32, view: &Option<SideView>) {
        let key = (symbol.to_string(), side);
        match view {
            Some(v) => {
                self.rows.insert(
                    key,
                    BoardRow {
                        symbol: symbol.to_string(),
                        side,
                        price,
                        decimals,
                        entry: v.entry,
                        stop: v.stop,
                        distance_pct: v.distance_pct,
                    },
                );
            }
            None => {
                self.rows.remove(&key);
            }
        }
    }

    /// Fold one batch in. True when the ranking should be redrawn.
    pub fn apply(&mut self, batch: &NotifyBatch) -> bool {
        self.batches += 1;
        for u in &batch.updates {
            // side tanpa level dihapus apa pun flag `changed`-nya
            self.put(&u.symbol, Side::Long, u.price, u.decimals, &u.long);
            self.put(&u.symbol, Side::Short, u.price, u.decimals, &u.short);
        }
        batch.rerank || self.batches == 1
    }

    /// Rows for `side`, nearest entry first.
    pub fn ranked(&self, side: Side) -> Vec<&BoardRow> {
        let mut rows: Vec<&BoardRow> = self.rows.values().filter(|r| r.side == side).collect();
        rows.sort_by(|a, b| a.distance_pct.cmp(&b.distance_pct).then_with(|| a.symbol.cmp(&b.symbol)));
        rows
    }

    /// (instruments, long rows, short rows)
    pub fn counts(&self) -> (usize, usize, usize) {
        let longs = self.rows.keys().filter(|(_, s)| *s == Side::Long).count();
        let shorts = self.rows.len() - longs;
        let mut symbols: Vec<&str> = self.rows.keys().map(|(s, _)| s.as_str()).collect();
        symbols.dedup();
        (symbols.len(), longs, shorts)
    }

    pub fn render(&self) -> Vec<String> {
        let mut out = Vec::new();
        for side in [Side::Long, Side::Short] {
            for (i, row) in self.ranked(side).into_iter().take(self.top).enumerate() {
                out.push(row.render(i + 1));
            }
        }
        out
    }
}

/// Consume batches until the supervisor side of the channel closes.
pub async fn run(mut rx: mpsc::Receiver<NotifyBatch>, top: usize) {
    let mut board = Board::new(top);
    while let Some(batch) = rx.recv().await {
        if !board.apply(&batch) {
            debug!(updates = batch.updates.len(), "board: rows updated");
            continue;
        }
        let (instruments, longs, shorts) = board.counts();
        info!(instruments, longs, shorts, "board");
        for line in board.render() {
            info!("{line}");
        }
    }
    info!("board: channel closed, stopped");
}
