// ===============================
// src/differ.rs (snapshot -> action diff)
// ===============================
//
// Minimal add/remove set turning one snapshot of an instrument into the next.
// Batch order is fixed: asks then bids; within a side, removes then adds;
// within each group, ascending price.
//
use std::collections::BTreeMap;

use crate::domain::{Action, ActionKind, BookSide, Instrument, Px, TsNs};

pub type Levels = BTreeMap<Px, i64>;

/// Validated full-depth book state at one instant (all volumes > 0).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookState {
    pub ts_ns: TsNs,
    pub bids: Levels,
    pub asks: Levels,
}

impl BookState {
    pub fn levels(&self, side: BookSide) -> &Levels {
        match side { BookSide::Bid => &self.bids, BookSide::Ask => &self.asks }
    }
}

pub fn diff_side(
    old: &Levels,
    new: &Levels,
    side: BookSide,
    ts_ns: TsNs,
    instrument: Instrument,
    out: &mut Vec<Action>,
) {
    let mk = |action_type, price, volume| Action { action_type, side, price, volume, timestamp: ts_ns, instrument };

    for (&price, &old_vol) in old {
        let new_vol = new.get(&price).copied().unwrap_or(0);
        if new_vol < old_vol {
            out.push(mk(ActionKind::Remove, price, old_vol - new_vol));
        }
    }
    for (&price, &new_vol) in new {
        let old_vol = old.get(&price).copied().unwrap_or(0);
        if new_vol > old_vol {
            out.push(mk(ActionKind::Add, price, new_vol - old_vol));
        }
    }
}

/// Actions stamped with `new.ts_ns`.
pub fn diff(old: &BookState, new: &BookState, instrument: Instrument) -> Vec<Action> {
    let mut out = Vec::new();
    for side in [BookSide::Ask, BookSide::Bid] {
        diff_side(old.levels(side), new.levels(side), side, new.ts_ns, instrument, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderBookReplica;
    use proptest::prelude::*;

    fn state(ts_ns: TsNs, bids: &[(Px, i64)], asks: &[(Px, i64)]) -> BookState {
        BookState { ts_ns, bids: bids.iter().copied().collect(), asks: asks.iter().copied().collect() }
    }

    fn replay(from: &BookState, actions: &[Action]) -> OrderBookReplica {
        let mut b = OrderBookReplica::from_levels(Instrument::Spot, from.ts_ns, &from.bids, &from.asks);
        for a in actions {
            b.apply(a).unwrap();
        }
        b
    }

    #[test]
    fn level_changes_become_minimal_actions() {
        let a = state(1, &[(100, 5), (99, 3)], &[(101, 4), (102, 8)]);
        let b = state(2, &[(100, 7), (98, 1)], &[(101, 4), (102, 2)]);
        let acts = diff(&a, &b, Instrument::Spot);

        let expect = vec![
            (ActionKind::Remove, BookSide::Ask, 102, 6),
            (ActionKind::Remove, BookSide::Bid, 99, 3),
            (ActionKind::Add, BookSide::Bid, 98, 1),
            (ActionKind::Add, BookSide::Bid, 100, 2),
        ];
        let got: Vec<_> = acts.iter().map(|a| (a.action_type, a.side, a.price, a.volume)).collect();
        assert_eq!(got, expect);
        assert!(acts.iter().all(|a| a.timestamp == 2 && a.instrument == Instrument::Spot));
    }

    #[test]
    fn first_snapshot_against_empty_is_all_adds() {
        let b = state(5, &[(100, 5)], &[(101, 4)]);
        let acts = diff(&BookState::default(), &b, Instrument::Perp);
        assert_eq!(acts.len(), 2);
        assert!(acts.iter().all(|a| a.action_type == ActionKind::Add));
    }

    fn levels() -> impl Strategy<Value = Levels> {
        proptest::collection::btree_map(1i64..40, 1i64..500, 0..10)
    }

    proptest! {
        #[test]
        fn diff_transforms_a_into_b(ab in levels(), aa in levels(), bb in levels(), ba in levels()) {
            let a = BookState { ts_ns: 1, bids: ab, asks: aa };
            let b = BookState { ts_ns: 2, bids: bb, asks: ba };
            let r = replay(&a, &diff(&a, &b, Instrument::Spot));
            prop_assert_eq!(r.levels(BookSide::Bid), &b.bids);
            prop_assert_eq!(r.levels(BookSide::Ask), &b.asks);
        }

        #[test]
        fn diff_of_identical_books_is_empty(bids in levels(), asks in levels()) {
            let a = BookState { ts_ns: 1, bids, asks };
            prop_assert!(diff(&a, &a, Instrument::Itrf).is_empty());
        }

        #[test]
        fn added_minus_removed_is_net_level_change(
            chain in proptest::collection::vec(levels(), 2..6)
        ) {
            let states: Vec<BookState> = chain
                .into_iter()
                .enumerate()
                .map(|(i, bids)| BookState { ts_ns: i as TsNs, bids, asks: Levels::new() })
                .collect();
            let mut net: BTreeMap<Px, i64> = BTreeMap::new();
            for w in states.windows(2) {
                for a in diff(&w[0], &w[1], Instrument::Spot) {
                    let signed = match a.action_type { ActionKind::Add => a.volume, ActionKind::Remove => -a.volume };
                    *net.entry(a.price).or_insert(0) += signed;
                }
            }
            let first = &states[0].bids;
            let last = &states[states.len() - 1].bids;
            for (px, change) in net {
                let expected = last.get(&px).copied().unwrap_or(0) - first.get(&px).copied().unwrap_or(0);
                prop_assert_eq!(change, expected);
            }
        }
    }
}
