// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters:
// - SnapshotReader  : JSONL full-depth snapshots, validated row by row
// - SnapshotDiffer  : snapshot stream -> action stream (first row diffed vs empty)
// - ActionReader    : JSONL persisted actions
// - write_actions   : buffered JSONL writer for actions
// - mock_session    : seeded random-walk snapshots for spot/perp/itrf
//
// Readers are lazy and hold one row at a time. The first bad row ends the
// stream with an error naming the source and line.
//
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::differ::{self, BookState, Levels};
use crate::domain::{px_checked, px_to_f64, Action, Instrument, Snapshot, TsNs};
use crate::merge::OutOfOrder;

pub const MAX_LEVELS: usize = 10;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("io error on {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("malformed snapshot in {source_name} line {line}: {reason}")]
    MalformedSnapshot { source_name: String, line: usize, reason: String },
    #[error("malformed action in {source_name} line {line}: {reason}")]
    MalformedAction { source_name: String, line: usize, reason: String },
    #[error(transparent)]
    OutOfOrder(#[from] OutOfOrder),
}

pub fn open(path: &Path) -> Result<BufReader<File>, FeedError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| FeedError::Io { path: path.display().to_string(), source })
}

/// Shared line pump: skips blank lines, tracks line numbers, fuses on error.
struct Lines<R> {
    inner: R,
    source_name: String,
    line_no: usize,
    buf: String,
    done: bool,
}

impl<R: BufRead> Lines<R> {
    fn new(inner: R, source_name: String) -> Self {
        Self { inner, source_name, line_no: 0, buf: String::new(), done: false }
    }

    fn next_line(&mut self) -> Option<Result<(usize, &str), FeedError>> {
        if self.done {
            return None;
        }
        loop {
            self.buf.clear();
            match self.inner.read_line(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    self.line_no += 1;
                    if !self.buf.trim().is_empty() {
                        return Some(Ok((self.line_no, self.buf.trim())));
                    }
                }
                Err(source) => {
                    self.done = true;
                    return Some(Err(FeedError::Io { path: self.source_name.clone(), source }));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Turn one raw row into validated levels. Zero volume is padding; negative
/// volume, a bad price, a repeated price or too many levels is an error.
pub fn validate_levels(raw: &[(f64, i64)]) -> Result<Levels, String> {
    if raw.len() > MAX_LEVELS {
        return Err(format!("{} levels, at most {MAX_LEVELS} allowed", raw.len()));
    }
    let mut out = Levels::new();
    for &(price, volume) in raw {
        if volume < 0 {
            return Err(format!("negative volume {volume} at price {price}"));
        }
        if volume == 0 {
            continue;
        }
        let px = px_checked(price)?;
        if out.insert(px, volume).is_some() {
            return Err(format!("price {price} repeated on one side"));
        }
    }
    Ok(out)
}

pub fn validate_snapshot(snap: &Snapshot) -> Result<BookState, String> {
    let bids = validate_levels(&snap.bids).map_err(|e| format!("bids: {e}"))?;
    let asks = validate_levels(&snap.asks).map_err(|e| format!("asks: {e}"))?;
    Ok(BookState { ts_ns: snap.ts_ns, bids, asks })
}

pub struct SnapshotReader<R> {
    lines: Lines<R>,
    last_ts: Option<TsNs>,
}

impl<R: BufRead> SnapshotReader<R> {
    pub fn new(inner: R, source_name: impl Into<String>) -> Self {
        Self { lines: Lines::new(inner, source_name.into()), last_ts: None }
    }

    fn parse(&mut self, line_no: usize, text: &str) -> Result<BookState, FeedError> {
        let bad = |reason: String| FeedError::MalformedSnapshot {
            source_name: self.lines.source_name.clone(),
            line: line_no,
            reason,
        };
        let snap: Snapshot = serde_json::from_str(text).map_err(|e| bad(e.to_string()))?;
        let state = validate_snapshot(&snap).map_err(bad)?;
        if let Some(prev) = self.last_ts {
            if state.ts_ns < prev {
                return Err(bad(format!("timestamp {} before previous {prev}", state.ts_ns)));
            }
        }
        Ok(state)
    }
}

impl<R: BufRead> Iterator for SnapshotReader<R> {
    type Item = Result<BookState, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (line_no, text) = match self.lines.next_line()? {
            Ok((n, t)) => (n, t.to_string()),
            Err(e) => return Some(Err(e)),
        };
        let res = self.parse(line_no, &text);
        match &res {
            Ok(state) => self.last_ts = Some(state.ts_ns),
            Err(_) => self.lines.done = true,
        }
        Some(res)
    }
}

/// Streams the diff of consecutive snapshots of one instrument.
pub struct SnapshotDiffer<I> {
    snapshots: I,
    instrument: Instrument,
    prev: BookState,
    pending: VecDeque<Action>,
    failed: bool,
}

impl<I> SnapshotDiffer<I>
where
    I: Iterator<Item = Result<BookState, FeedError>>,
{
    pub fn new(snapshots: I, instrument: Instrument) -> Self {
        Self { snapshots, instrument, prev: BookState::default(), pending: VecDeque::new(), failed: false }
    }
}

impl<I> Iterator for SnapshotDiffer<I>
where
    I: Iterator<Item = Result<BookState, FeedError>>,
{
    type Item = Result<Action, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(a) = self.pending.pop_front() {
                return Some(Ok(a));
            }
            if self.failed {
                return None;
            }
            match self.snapshots.next()? {
                Ok(next) => {
                    self.pending.extend(differ::diff(&self.prev, &next, self.instrument));
                    self.prev = next;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted actions
// ---------------------------------------------------------------------------

pub struct ActionReader<R> {
    lines: Lines<R>,
    expect: Option<Instrument>,
}

impl<R: BufRead> ActionReader<R> {
    /// `expect` rejects rows for any other instrument.
    pub fn new(inner: R, source_name: impl Into<String>, expect: Option<Instrument>) -> Self {
        Self { lines: Lines::new(inner, source_name.into()), expect }
    }

    fn parse(&self, line_no: usize, text: &str) -> Result<Action, FeedError> {
        let bad = |reason: String| FeedError::MalformedAction {
            source_name: self.lines.source_name.clone(),
            line: line_no,
            reason,
        };
        let a: Action = serde_json::from_str(text).map_err(|e| bad(e.to_string()))?;
        if a.volume <= 0 {
            return Err(bad(format!("volume must be positive, got {}", a.volume)));
        }
        if let Some(inst) = self.expect {
            if a.instrument != inst {
                return Err(bad(format!("instrument {} in a {inst} stream", a.instrument)));
            }
        }
        Ok(a)
    }
}

impl<R: BufRead> Iterator for ActionReader<R> {
    type Item = Result<Action, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (line_no, text) = match self.lines.next_line()? {
            Ok((n, t)) => (n, t.to_string()),
            Err(e) => return Some(Err(e)),
        };
        let res = self.parse(line_no, &text);
        if res.is_err() {
            self.lines.done = true;
        }
        Some(res)
    }
}

/// Writes actions as JSONL; stops at the first upstream error.
pub fn write_actions<W, I>(out: W, actions: I, path: &str) -> Result<u64, FeedError>
where
    W: Write,
    I: IntoIterator<Item = Result<Action, FeedError>>,
{
    let io = |source: std::io::Error| FeedError::Io { path: path.to_string(), source };
    let mut w = BufWriter::new(out);
    let mut n = 0u64;
    for a in actions {
        let a = a?;
        serde_json::to_writer(&mut w, &a).map_err(|e| io(e.into()))?;
        w.write_all(b"\n").map_err(io)?;
        n += 1;
    }
    w.flush().map_err(io)?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Mock session (random walk, correlated legs)
// ---------------------------------------------------------------------------

/// 2024-12-04 10:55:00 UTC
pub const MOCK_START_NS: TsNs = 1_733_309_700_000_000_000;
const MOCK_TICK: i64 = 5; // 0.0005 in price ticks
const MOCK_DEPTH: usize = 5;

fn mock_book(rng: &mut StdRng, ts_ns: TsNs, mid: i64) -> Snapshot {
    let half = MOCK_TICK * rng.gen_range(1..=2);
    let best_bid = mid - half;
    let best_ask = mid + half;
    let mut bids = Vec::with_capacity(MOCK_DEPTH);
    let mut asks = Vec::with_capacity(MOCK_DEPTH);
    for i in 0..MOCK_DEPTH as i64 {
        bids.push((px_to_f64(best_bid - i * MOCK_TICK), rng.gen_range(1..=60)));
        asks.push((px_to_f64(best_ask + i * MOCK_TICK), rng.gen_range(1..=60)));
    }
    Snapshot { ts_ns, bids, asks }
}

/// Synthetic snapshots for spot, perp and itrf (indexed like `Instrument::ALL`).
/// One common mid walk; perp and itrf carry their own wandering basis.
pub fn mock_session(n: usize, seed: u64, start_ns: TsNs, step_ns: i64) -> [Vec<Snapshot>; Instrument::COUNT] {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut mid: i64 = 135_000; // 13.5000
    let mut basis = [0i64, 20, 60];
    let mut ts = [start_ns; Instrument::COUNT];
    let mut out: [Vec<Snapshot>; Instrument::COUNT] = Default::default();

    for _ in 0..n {
        mid = (mid + MOCK_TICK * rng.gen_range(-2..=2)).max(100_000);
        for inst in Instrument::ALL {
            let i = inst.idx();
            if inst != Instrument::Spot {
                // pulled back towards a small premium
                let drift = if basis[i] > 40 { -1 } else if basis[i] < 0 { 1 } else { 0 };
                basis[i] += MOCK_TICK * (rng.gen_range(-1..=1) + drift);
            }
            // legs tick on their own clocks, sometimes on the same nanosecond
            ts[i] += step_ns + step_ns * rng.gen_range(0..=1);
            let snap = mock_book(&mut rng, ts[i], mid + basis[i]);
            out[i].push(snap);
        }
    }
    out
}
