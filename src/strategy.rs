// ===============================
// src/strategy.rs
// ===============================
//
// Two interchangeable detection policies behind one trait, picked at config
// time (STRATEGY=threshold|imbalance):
// 1) Threshold : spread of perp/itrf bid over spot ask against δ₁ / δ₂
// 2) Imbalance : per-pair order-book imbalance divergence
//
// Plus the end-of-session unwind planner, which ignores both policies and
// only looks at open exposure.
//
// A policy reads the three books and returns signals; sizing, liquidity and
// settlement belong to the trader.
//
use crate::book::BookSet;
use crate::domain::{px_to_f64, Instrument, Px};

/// Buy `buy` at `buy_px`, sell `sell` at `sell_px`, at most `max_size` if set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub buy: Instrument,
    pub sell: Instrument,
    pub buy_px: Px,
    pub sell_px: Px,
    pub max_size: Option<i64>,
}

impl Signal {
    fn taker(books: &BookSet, buy: Instrument, sell: Instrument) -> Option<Self> {
        Some(Signal {
            buy,
            sell,
            buy_px: books.best_ask(buy)?,
            sell_px: books.best_bid(sell)?,
            max_size: None,
        })
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;
    fn on_tick(&mut self, books: &BookSet) -> Vec<Signal>;
}

// -----------------------------------------------------------------------------
// 1) THRESHOLD
//    spread = leg_bid - spot_ask for leg in {perp, itrf}
//      spread > δ₁ -> buy spot @ ask, sell leg @ bid
//      spread < δ₂ -> buy leg @ ask, sell spot @ bid
// -----------------------------------------------------------------------------
pub struct ThresholdStrategy {
    upper: f64,
    lower: f64,
}

impl ThresholdStrategy {
    /// δ₁ and δ₂ in price units; both must be positive (checked by config).
    /// Kept as floats so thresholds finer than a tick are not rounded away.
    pub fn new(delta_1: f64, delta_2: f64) -> Self {
        Self { upper: delta_1, lower: delta_2 }
    }
}

impl Strategy for ThresholdStrategy {
    fn name(&self) -> &'static str { "threshold" }

    fn on_tick(&mut self, books: &BookSet) -> Vec<Signal> {
        let mut out = Vec::new();
        let Some(spot_ask) = books.best_ask(Instrument::Spot) else { return out };
        for leg in [Instrument::Perp, Instrument::Itrf] {
            let Some(leg_bid) = books.best_bid(leg) else { continue };
            let spread = px_to_f64(leg_bid - spot_ask);
            let sig = if spread > self.upper {
                Signal::taker(books, Instrument::Spot, leg)
            } else if spread < self.lower {
                Signal::taker(books, leg, Instrument::Spot)
            } else {
                None
            };
            out.extend(sig);
        }
        out
    }
}

// -----------------------------------------------------------------------------
// 2) IMBALANCE
//    OBI = (Σbid - Σask) / (Σbid + Σask) per instrument.
//    For pair (a, b) with threshold t:
//      OBI_a > t and OBI_b < -t -> buy a, sell b
//      OBI_b > t and OBI_a < -t -> buy b, sell a
//    Does nothing while any book is empty on both sides.
// -----------------------------------------------------------------------------
pub const PAIRS: [(Instrument, Instrument); 3] = [
    (Instrument::Spot, Instrument::Perp),
    (Instrument::Spot, Instrument::Itrf),
    (Instrument::Perp, Instrument::Itrf),
];

pub struct ImbalanceStrategy {
    /// Same order as `PAIRS`.
    thresholds: [f64; 3],
}

impl ImbalanceStrategy {
    pub fn new(thresholds: [f64; 3]) -> Self { Self { thresholds } }
}

impl Strategy for ImbalanceStrategy {
    fn name(&self) -> &'static str { "imbalance" }

    fn on_tick(&mut self, books: &BookSet) -> Vec<Signal> {
        let mut obi = [0.0; Instrument::COUNT];
        for inst in Instrument::ALL {
            match books.get(inst).imbalance() {
                Some(v) => obi[inst.idx()] = v,
                None => return Vec::new(),
            }
        }
        let mut out = Vec::new();
        for ((a, b), t) in PAIRS.into_iter().zip(self.thresholds) {
            let (oa, ob) = (obi[a.idx()], obi[b.idx()]);
            let sig = if oa > t && ob < -t {
                Signal::taker(books, a, b)
            } else if ob > t && oa < -t {
                Signal::taker(books, b, a)
            } else {
                None
            };
            out.extend(sig);
        }
        out
    }
}

// -----------------------------------------------------------------------------
// UNWIND
//    positions[i] is the open exposure of instrument i. For each pair whose
//    legs point opposite ways, buy back the short leg and sell the long one,
//    capped at the smaller exposure.
// -----------------------------------------------------------------------------
pub fn unwind_signals(positions: [f64; Instrument::COUNT], books: &BookSet) -> Vec<Signal> {
    let mut out = Vec::new();
    for (a, b) in PAIRS {
        let (pa, pb) = (positions[a.idx()], positions[b.idx()]);
        let (short, long) = if pa < 0.0 && pb > 0.0 {
            (a, b)
        } else if pa > 0.0 && pb < 0.0 {
            (b, a)
        } else {
            continue;
        };
        let cap = pa.abs().min(pb.abs()).floor() as i64;
        if cap <= 0 {
            continue;
        }
        if let Some(mut sig) = Signal::taker(books, short, long) {
            sig.max_size = Some(cap);
            out.push(sig);
        }
    }
    out
}
