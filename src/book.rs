// ===============================
// src/book.rs (per-instrument order book replica)
// ===============================
//
// Price levels are kept in BTreeMap so best bid/ask are O(log n) regardless of
// depth. Every stored volume is > 0 between applies.
//
// Own fills take volume the upstream feed still shows. That volume is kept per
// level in `taken`, so upstream resting = replica resting + taken at every
// level, and a later remove of it is not a liquidity error.
//
use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::{px_to_f64, Action, ActionKind, BookSide, Instrument, Px, TsNs};

/// Result of removing volume from a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Remove asked for more than was resting plus what our fills took; the
    /// level was deleted and `missing` lots could not be taken.
    Clamped { missing: i64 },
}

/// An add would push a level past `i64::MAX` lots. The book is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("volume overflow on {instrument} {} @ {}: {resting} resting + {added} added", .side.as_str(), px_to_f64(*.price))]
pub struct VolumeOverflow {
    pub instrument: Instrument,
    pub side: BookSide,
    pub price: Px,
    pub resting: i64,
    pub added: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookReplica {
    pub instrument: Instrument,
    pub ts_ns: TsNs,
    bids: BTreeMap<Px, i64>,
    asks: BTreeMap<Px, i64>,
    bids_taken: BTreeMap<Px, i64>,
    asks_taken: BTreeMap<Px, i64>,
}

impl OrderBookReplica {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            ts_ns: 0,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            bids_taken: BTreeMap::new(),
            asks_taken: BTreeMap::new(),
        }
    }

    /// Seed directly from validated level maps (non-positive volumes are skipped).
    #[cfg(test)]
    pub fn from_levels(
        instrument: Instrument,
        ts_ns: TsNs,
        bids: &BTreeMap<Px, i64>,
        asks: &BTreeMap<Px, i64>,
    ) -> Self {
        let keep = |m: &BTreeMap<Px, i64>| m.iter().filter(|(_, v)| **v > 0).map(|(p, v)| (*p, *v)).collect();
        Self { bids: keep(bids), asks: keep(asks), ts_ns, ..Self::new(instrument) }
    }

    pub fn levels(&self, side: BookSide) -> &BTreeMap<Px, i64> {
        match side { BookSide::Bid => &self.bids, BookSide::Ask => &self.asks }
    }

    fn levels_mut(&mut self, side: BookSide) -> (&mut BTreeMap<Px, i64>, &mut BTreeMap<Px, i64>) {
        match side {
            BookSide::Bid => (&mut self.bids, &mut self.bids_taken),
            BookSide::Ask => (&mut self.asks, &mut self.asks_taken),
        }
    }

    /// Volume our own fills took from a level that upstream has not removed yet.
    #[cfg(test)]
    pub fn taken_at(&self, side: BookSide, price: Px) -> i64 {
        let taken = match side { BookSide::Bid => &self.bids_taken, BookSide::Ask => &self.asks_taken };
        taken.get(&price).copied().unwrap_or(0)
    }

    pub fn apply(&mut self, action: &Action) -> Result<ApplyOutcome, VolumeOverflow> {
        debug_assert_eq!(action.instrument, self.instrument);
        let outcome = match action.action_type {
            ActionKind::Add => {
                let instrument = self.instrument;
                let (book, _) = self.levels_mut(action.side);
                let resting = book.get(&action.price).copied().unwrap_or(0);
                let total = resting.checked_add(action.volume).ok_or(VolumeOverflow {
                    instrument,
                    side: action.side,
                    price: action.price,
                    resting,
                    added: action.volume,
                })?;
                book.insert(action.price, total);
                ApplyOutcome::Applied
            }
            ActionKind::Remove => self.remove(action.side, action.price, action.volume),
        };
        self.ts_ns = self.ts_ns.max(action.timestamp);
        Ok(outcome)
    }

    /// Upstream remove. A shortfall is first set against volume our fills took.
    fn remove(&mut self, side: BookSide, price: Px, size: i64) -> ApplyOutcome {
        let (book, taken) = self.levels_mut(side);
        let resting = book.get(&price).copied().unwrap_or(0);
        if resting > size {
            book.insert(price, resting - size);
            return ApplyOutcome::Applied;
        }
        book.remove(&price);

        let shortfall = size - resting;
        if shortfall == 0 {
            return ApplyOutcome::Applied;
        }
        let ours = taken.get(&price).copied().unwrap_or(0);
        let absorbed = ours.min(shortfall);
        if ours > absorbed {
            taken.insert(price, ours - absorbed);
        } else {
            taken.remove(&price);
        }
        let missing = shortfall - absorbed;
        if missing > 0 { ApplyOutcome::Clamped { missing } } else { ApplyOutcome::Applied }
    }

    /// Take up to `size` from a level for an own fill; returns what was taken.
    pub fn consume(&mut self, side: BookSide, price: Px, size: i64) -> i64 {
        let (book, taken) = self.levels_mut(side);
        let resting = book.get(&price).copied().unwrap_or(0);
        let take = resting.min(size.max(0));
        if take == 0 {
            return 0;
        }
        if resting > take {
            book.insert(price, resting - take);
        } else {
            book.remove(&price);
        }
        // bounded by upstream resting, which fits in i64
        *taken.entry(price).or_insert(0) += take;
        take
    }

    pub fn best_bid(&self) -> Option<Px> { self.bids.keys().next_back().copied() }
    pub fn best_ask(&self) -> Option<Px> { self.asks.keys().next().copied() }

    pub fn volume_at(&self, side: BookSide, price: Px) -> i64 {
        self.levels(side).get(&price).copied().unwrap_or(0)
    }

    /// Summed in i128: each level fits in i64, the side may not.
    pub fn total_volume(&self, side: BookSide) -> i128 {
        self.levels(side).values().map(|v| *v as i128).sum()
    }

    /// (Σbid − Σask) / (Σbid + Σask); None when the book is empty.
    pub fn imbalance(&self) -> Option<f64> {
        let bid = self.total_volume(BookSide::Bid);
        let ask = self.total_volume(BookSide::Ask);
        let total = bid + ask;
        if total == 0 {
            return None;
        }
        Some((bid - ask) as f64 / total as f64)
    }
}

/// The three replicas, indexed by instrument.
#[derive(Debug, Clone)]
pub struct BookSet {
    books: [OrderBookReplica; Instrument::COUNT],
}

impl Default for BookSet {
    fn default() -> Self {
        Self { books: Instrument::ALL.map(OrderBookReplica::new) }
    }
}

impl BookSet {
    pub fn get(&self, inst: Instrument) -> &OrderBookReplica { &self.books[inst.idx()] }
    pub fn get_mut(&mut self, inst: Instrument) -> &mut OrderBookReplica { &mut self.books[inst.idx()] }

    pub fn apply(&mut self, action: &Action) -> Result<ApplyOutcome, VolumeOverflow> {
        self.get_mut(action.instrument).apply(action)
    }

    pub fn best_bid(&self, inst: Instrument) -> Option<Px> { self.get(inst).best_bid() }
    pub fn best_ask(&self, inst: Instrument) -> Option<Px> { self.get(inst).best_ask() }
}
