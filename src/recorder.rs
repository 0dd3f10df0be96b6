// ===============================
// src/recorder.rs
// ===============================
//
// Journal JSONL untuk crossing & pergantian level:
// - satu Event per baris, append
// - BufWriter, flush tiap FLUSH_EVERY detik atau tiap FLUSH_EVERY_N_EVENTS
// - parent directory dibuat otomatis
// - gagal tulis -> reopen sekali, kalau masih gagal event dibuang
//
// ENV: `RECORD_FILE=/path/to/journal.jsonl` (lihat config.rs).
//
use std::io;
use std::path::{Path, PathBuf};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY: Duration = Duration::from_secs(1);
const FLUSH_EVERY_N_EVENTS: u32 = 256;

struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    pending: u32,
}

impl Journal {
    async fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { path: path.to_path_buf(), writer: BufWriter::new(file), pending: 0 })
    }

    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\n").await?;
        self.pending += 1;
        if self.pending >= FLUSH_EVERY_N_EVENTS {
            self.flush().await;
        }
        Ok(())
    }

    async fn append(&mut self, line: &[u8]) {
        if let Err(e) = self.write_line(line).await {
            warn!(?e, path = %self.path.display(), "recorder: write failed, reopening");
            match Journal::open(&self.path).await {
                Ok(fresh) => {
                    *self = fresh;
                    if let Err(e2) = self.write_line(line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                    }
                }
                Err(e2) => error!(?e2, "recorder: reopen failed, drop event"),
            }
        }
    }

    async fn flush(&mut self) {
        if let Err(e) = self.writer.flush().await {
            warn!(?e, "recorder: flush failed");
        }
        self.pending = 0;
    }
}

/// Drain `rx` into `path` until every sender is dropped.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut journal = match Journal::open(Path::new(&path)).await {
        Ok(j) => j,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            // tetap kuras channel supaya pengirim tidak tertahan
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(FLUSH_EVERY);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    journal.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                match serde_json::to_vec(&ev) {
                    Ok(line) => journal.append(&line).await,
                    Err(e) => error!(?e, "recorder: serialize error, skip event"),
                }
            }
            _ = tick.tick() => journal.flush().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActiveLevels, LevelPair, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/journal.jsonl");
        let (tx, rx) = mpsc::channel(16);
        let h = tokio::spawn(run(rx, path.to_string_lossy().to_string()));

        tx.send(Event::Crossing { ts: Utc::now(), symbol: "BTCUSDT".into(), side: Side::Long, price: dec!(98), entry: dec!(100) })
            .await
            .unwrap();
        let levels = ActiveLevels { long: Some(LevelPair { entry: dec!(95), stop: dec!(94) }), short: None };
        tx.send(Event::Levels { ts: Utc::now(), symbol: "BTCUSDT".into(), levels }).await.unwrap();
        tx.send(Event::Note("bye".into())).await.unwrap();
        drop(tx);
        h.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["Crossing"]["symbol"], "BTCUSDT");
        assert_eq!(first["Crossing"]["entry"], "100");
    }
}
