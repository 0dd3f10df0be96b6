// ===============================
// src/grouping_store.rs
// ===============================
//
// Persisted grouping increments: JSON object {"BTCUSDT": 10, "XRPUSDT": 0.001}.
// File hilang / rusak -> map kosong, grouping diturunkan ulang.
// Gagal tulis hanya di-log; nilai di memori tetap dipakai.
//
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::source::decimal_from_json;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct GroupingStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Decimal>>,
}

fn decode(text: &str) -> Result<BTreeMap<String, Decimal>, StoreError> {
    let v: Value = serde_json::from_str(text)?;
    let mut out = BTreeMap::new();
    if let Value::Object(map) = v {
        for (k, n) in map {
            match decimal_from_json(&n).filter(|d| *d > Decimal::ZERO) {
                Some(d) => { out.insert(k, d); }
                None => debug!(symbol = %k, "grouping store: skip bad value"),
            }
        }
    }
    Ok(out)
}

fn encode(values: &BTreeMap<String, Decimal>) -> Result<String, StoreError> {
    let mut map = Map::new();
    for (k, d) in values {
        // angka JSON dengan teks desimal persis (arbitrary_precision)
        let n = Number::from_str(&d.normalize().to_string())?;
        map.insert(k.clone(), Value::Number(n));
    }
    Ok(serde_json::to_string_pretty(&Value::Object(map))?)
}

impl GroupingStore {
    /// Load from `path`; any read/parse failure starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(text) => decode(&text).unwrap_or_else(|e| {
                warn!(?e, path = %path.display(), "grouping store corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(?e, path = %path.display(), "grouping store unreadable, starting empty");
                BTreeMap::new()
            }
        };
        debug!(count = values.len(), path = %path.display(), "grouping store loaded");
        Self { path, values: Mutex::new(values) }
    }

    pub async fn get(&self, symbol: &str) -> Option<Decimal> {
        self.values.lock().await.get(symbol).copied()
    }

    pub async fn len(&self) -> usize { self.values.lock().await.len() }

    /// Remember `grouping` for `symbol` and rewrite the file.
    pub async fn put(&self, symbol: &str, grouping: Decimal) {
        // lock ditahan selama tulis: penulis berikutnya selalu membawa isi terbaru
        let mut values = self.values.lock().await;
        if values.get(symbol) == Some(&grouping) {
            return;
        }
        values.insert(symbol.to_string(), grouping);
        if let Err(e) = self.persist(&values).await {
            warn!(?e, path = %self.path.display(), "grouping store write failed");
        }
    }

    async fn persist(&self, values: &BTreeMap<String, Decimal>) -> Result<(), StoreError> {
        let text = encode(values)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // tulis ke file sementara lalu rename, supaya file lama tidak terpotong
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trip_reproduces_exact_increment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("groupings.json");
        let store = GroupingStore::load(&path).await;
        assert_eq!(store.len().await, 0);
        store.put("BTCUSDT", dec!(10)).await;
        store.put("XRPUSDT", dec!(0.0001)).await;
        store.put("WEIRDUSDT", dec!(0.00025)).await;

        let reloaded = GroupingStore::load(&path).await;
        assert_eq!(reloaded.get("BTCUSDT").await, Some(dec!(10)));
        assert_eq!(reloaded.get("XRPUSDT").await, Some(dec!(0.0001)));
        assert_eq!(reloaded.get("WEIRDUSDT").await, Some(dec!(0.00025)));

        let text = std::fs::read_to_string(&path).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert!(v["XRPUSDT"].is_number());
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("groupings.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = GroupingStore::load(&path).await;
        assert_eq!(store.len().await, 0);
        assert_eq!(store.get("BTCUSDT").await, None);
    }

    #[tokio::test]
    async fn bad_entries_are_skipped_individually() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("groupings.json");
        std::fs::write(&path, r#"{"BTCUSDT": 10, "ETHUSDT": "x", "SOLUSDT": -1, "XRPUSDT": "0.001"}"#).unwrap();
        let store = GroupingStore::load(&path).await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("XRPUSDT").await, Some(dec!(0.001)));
    }

    #[tokio::test]
    async fn unwritable_path_is_swallowed() {
        let dir = tempdir().unwrap();
        // parent is a regular file, so create_dir_all fails
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let store = GroupingStore::load(blocker.join("groupings.json")).await;
        store.put("BTCUSDT", dec!(10)).await;
        assert_eq!(store.get("BTCUSDT").await, Some(dec!(10)));
    }
}
