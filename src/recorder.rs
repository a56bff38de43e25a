// ===============================
// src/recorder.rs
// ===============================
//
// Lightweight JSONL recorder for replay events:
// - Every Event becomes one line in `<path>.partial` (append).
// - BufWriter to save syscalls.
// - Flush every 1s and/or every 1000 events.
// - Parent directory is created if missing.
// - A failed write reopens the file and retries once.
// - `commit` renames the partial file into place after a good run,
//   `discard` removes it after a failed one, so a trade log is never half-written.
//
// ENV: `RECORD_FILE=/path/to/events.jsonl` or `replay --record <path>`.
//
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

pub fn partial_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".partial");
    PathBuf::from(s)
}

async fn open_writer(path: &Path) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

/// Drains `rx` into `<path>.partial` until every sender is gone.
/// Returns the number of events written.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: PathBuf) -> std::io::Result<u64> {
    let tmp = partial_path(&path);
    // a leftover from an aborted run must not leak into this one
    if fs::try_exists(&tmp).await? {
        fs::remove_file(&tmp).await?;
    }
    let mut writer = open_writer(&tmp).await?;
    info!(path = %tmp.display(), "recorder: started");

    // Periodic flush (every second) + count-based flush
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    writer.flush().await?;
                    info!(events = written, "recorder: channel closed, stopped");
                    return Ok(written);
                };

                let mut line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                line.push('\n');

                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    writer = open_writer(&tmp).await?;
                    // one retry after reopen; a second failure ends the recording
                    writer.write_all(line.as_bytes()).await?;
                }
                written += 1;

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    writer.flush().await?;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                writer.flush().await?;
                since_last_flush = 0;
            }
        }
    }
}

/// Move the finished recording into place.
pub async fn commit(path: &Path) -> std::io::Result<()> {
    fs::rename(partial_path(path), path).await?;
    info!(path = %path.display(), "recorder: committed");
    Ok(())
}

/// Drop the recording of a failed run. Missing file is fine.
pub async fn discard(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(partial_path(path)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{px_from_f64, FeeClass, Instrument, Trade};

    fn trade(size: i64) -> Trade {
        Trade {
            timestamp: 7,
            buy_market: Instrument::Spot,
            sell_market: Instrument::Perp,
            buy_price: px_from_f64(7.5),
            sell_price: px_from_f64(7.6),
            size,
            fee_class: FeeClass::Taker,
        }
    }

    #[tokio::test]
    async fn records_then_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("trades.jsonl");
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path.clone()));

        tx.send(Event::Trade(trade(3))).await.unwrap();
        tx.send(Event::Note("done".into())).await.unwrap();
        drop(tx);
        assert_eq!(task.await.unwrap().unwrap(), 2);

        assert!(!path.exists());
        commit(&path).await.unwrap();
        assert!(!partial_path(&path).exists());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        match serde_json::from_str::<Event>(lines[0]).unwrap() {
            Event::Trade(t) => assert_eq!(t, trade(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn discard_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run(rx, path.clone()));
        tx.send(Event::Trade(trade(1))).await.unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        assert!(partial_path(&path).exists());
        discard(&path).await.unwrap();
        assert!(!partial_path(&path).exists());
        assert!(!path.exists());
        // second discard is a no-op
        discard(&path).await.unwrap();
    }
}
