// ===============================
// src/risk.rs (leverage-bounded sizing)
// ===============================
//
// Constraint: leveraged(s) / U <= L, where U is the live unleveraged balance
// and leveraged(s) is measured after interest to the trade timestamp plus a
// fill of size s. leveraged(s) = Σ w_i |x_i + d_i s| is convex and piecewise
// linear in s, so the bound is found exactly by walking its breakpoints.
// Bisection over scratch copies is kept as the fallback / oracle.
//
use serde::{Deserialize, Serialize};

use crate::domain::{Asset, Trade};
use crate::portfolio::Portfolio;

pub const BISECT_TOL: f64 = 1e-3;
pub const BISECT_MAX_ITERS: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sizing { ClosedForm, Bisection }

impl Sizing {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "closed_form" | "closedform" | "exact" => Some(Sizing::ClosedForm),
            "bisection" | "bisect" => Some(Sizing::Bisection),
            _ => None,
        }
    }
}

pub fn max_size(p: &Portfolio, trade: &Trade, sizing: Sizing) -> i64 {
    if trade.size <= 0 {
        return 0;
    }
    let base = p.unleveraged_balance();
    if !(base > 0.0) {
        // trading suspended until the base recovers
        return 0;
    }
    let cap = p.leverage_limit() * base;
    let s = match sizing {
        Sizing::ClosedForm => closed_form(p, trade, cap),
        Sizing::Bisection => bisection(p, trade, cap),
    };
    (s + 1e-9).floor().clamp(0.0, trade.size as f64) as i64
}

fn accrued(p: &Portfolio, trade: &Trade) -> Portfolio {
    let mut scratch = p.clone();
    scratch.apply_interest(trade.timestamp);
    scratch
}

fn closed_form(p: &Portfolio, trade: &Trade, cap: f64) -> f64 {
    let start = accrued(p, trade);
    let slopes = start.fill_slopes(trade);
    let upper = trade.size as f64;

    let exposure = |s: f64| -> f64 {
        let mut probe = start.clone();
        probe.apply_fill(trade, s);
        probe.leveraged_balance()
    };

    let mut knots = vec![0.0, upper];
    for asset in Asset::ALL {
        let d = slopes[asset.idx()];
        if d != 0.0 {
            let s = -start.balance(asset) / d;
            if s > 0.0 && s < upper {
                knots.push(s);
            }
        }
    }
    knots.sort_by(|a, b| a.total_cmp(b));

    let values: Vec<f64> = knots.iter().map(|s| exposure(*s)).collect();
    let Some(k) = values.iter().rposition(|g| *g <= cap) else {
        return 0.0;
    };
    if k + 1 == knots.len() {
        return upper;
    }
    // linear on [knots[k], knots[k+1]], feasible at the left end only
    let (s0, s1) = (knots[k], knots[k + 1]);
    let (g0, g1) = (values[k], values[k + 1]);
    if g1 <= g0 {
        return s0;
    }
    s0 + (cap - g0) * (s1 - s0) / (g1 - g0)
}

fn bisection(p: &Portfolio, trade: &Trade, cap: f64) -> f64 {
    let feasible = |s: f64| -> bool {
        let mut scratch = accrued(p, trade);
        scratch.apply_fill(trade, s);
        scratch.leveraged_balance() <= cap
    };
    let upper = trade.size as f64;
    if feasible(upper) {
        return upper;
    }
    if !feasible(0.0) {
        return 0.0;
    }
    let (mut lo, mut hi) = (0.0, upper);
    let mut iters = 0;
    while hi - lo > BISECT_TOL && iters < BISECT_MAX_ITERS {
        let mid = (lo + hi) / 2.0;
        if feasible(mid) { lo = mid } else { hi = mid }
        iters += 1;
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{px_from_f64, FeeClass, Instrument};
    use crate::portfolio::PortfolioCfg;
    use proptest::prelude::*;

    fn portfolio(balances: [f64; Asset::COUNT], sizing: Sizing) -> Portfolio {
        let cfg = PortfolioCfg { initial: balances, sizing, ..PortfolioCfg::default() };
        Portfolio::new(&cfg)
    }

    fn trade(buy_px: f64, sell_px: f64, size: i64) -> Trade {
        Trade {
            timestamp: 0,
            buy_market: Instrument::Spot,
            sell_market: Instrument::Perp,
            buy_price: px_from_f64(buy_px),
            sell_price: px_from_f64(sell_px),
            size,
            fee_class: FeeClass::Taker,
        }
    }

    #[test]
    fn empty_portfolio_cannot_trade() {
        for sizing in [Sizing::ClosedForm, Sizing::Bisection] {
            let p = portfolio([0.0; 4], sizing);
            assert_eq!(p.can_trade(&trade(7.5, 7.6, 1)), 0);
            assert_eq!(p.can_trade(&trade(7.5, 7.6, 1_000_000)), 0);
        }
    }

    #[test]
    fn negative_base_suspends_trading() {
        // rub deeply negative: (10) * 14 - 1000 < 0
        let p = portfolio([-1_000.0, 10.0, 0.0, 0.0], Sizing::ClosedForm);
        assert!(p.unleveraged_balance() < 0.0);
        assert_eq!(p.can_trade(&trade(7.5, 7.6, 5)), 0);
    }

    #[test]
    fn small_trade_passes_in_full() {
        let p = portfolio([0.0, 1_000.0, 0.0, 0.0], Sizing::ClosedForm);
        assert_eq!(p.can_trade(&trade(7.5, 7.6, 10)), 10);
    }

    #[test]
    fn large_trade_is_capped_at_limit() {
        // base = 14_000; each lot adds ~2 * 14 of exposure
        let p = portfolio([0.0, 1_000.0, 0.0, 0.0], Sizing::ClosedForm);
        let s = p.can_trade(&trade(7.5, 7.6, 1_000_000));
        assert!(s > 0 && s < 1_000_000);

        let base = p.unleveraged_balance();
        let mut after = p.clone();
        let mut t = trade(7.5, 7.6, s);
        after.settle(&t);
        assert!(after.leveraged_balance() / base <= p.leverage_limit() + 1e-9);

        t.size = s + 1;
        let mut over = p.clone();
        over.settle(&t);
        assert!(over.leveraged_balance() / base > p.leverage_limit());
    }

    #[test]
    fn bisection_stops_within_cap() {
        let p = portfolio([0.0, 1_000.0, 0.0, 0.0], Sizing::Bisection);
        let s = p.can_trade(&trade(7.5, 7.6, i64::MAX / 4));
        let exact = portfolio([0.0, 1_000.0, 0.0, 0.0], Sizing::ClosedForm).can_trade(&trade(7.5, 7.6, i64::MAX / 4));
        assert!((s - exact).abs() <= 1);
    }

    #[test]
    fn closed_form_admits_deleveraging_trade() {
        // over the limit already, short perp / long cny; selling cny back reduces exposure
        let p = portfolio([-500.0, 4_000.0, 0.0, -3_800.0], Sizing::ClosedForm);
        assert!(p.leverage_ratio().unwrap() > p.leverage_limit());
        let unwind = Trade {
            timestamp: 0,
            buy_market: Instrument::Perp,
            sell_market: Instrument::Spot,
            buy_price: px_from_f64(7.6),
            sell_price: px_from_f64(7.5),
            size: 3_800,
            fee_class: FeeClass::Taker,
        };
        assert!(p.can_trade(&unwind) > 0);
    }

    proptest! {
        #[test]
        fn closed_form_matches_bisection(
            rub in -20_000.0f64..20_000.0,
            cny in 0.0f64..5_000.0,
            perp in -2_000.0f64..2_000.0,
            buy in 700i64..800,
            sell in 700i64..800,
            size in 1i64..50_000,
        ) {
            let balances = [rub, cny, 0.0, perp];
            let exact = portfolio(balances, Sizing::ClosedForm);
            let oracle = portfolio(balances, Sizing::Bisection);
            let t = trade(buy as f64 / 100.0, sell as f64 / 100.0, size);
            let base = exact.unleveraged_balance();
            let mut zero = exact.clone();
            zero.apply_interest(t.timestamp);
            prop_assume!(base > 0.0 && zero.leveraged_balance() <= exact.leverage_limit() * base);

            let a = exact.can_trade(&t);
            let b = oracle.can_trade(&t);
            prop_assert!((a - b).abs() <= 1, "closed {} vs bisect {}", a, b);

            let mut after = exact.clone();
            let mut filled = t.clone();
            filled.size = a;
            after.settle(&filled);
            prop_assert!(after.leveraged_balance() <= exact.leverage_limit() * base * (1.0 + 1e-9));
        }
    }
}
