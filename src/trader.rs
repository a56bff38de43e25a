// ===============================
// src/trader.rs (signal execution against the replicas)
// ===============================
//
// Execution is simulated against the replicated depth:
//   available = min(ask vol @ buy_px, bid vol @ sell_px)   (capped by signal)
//   size      = portfolio.can_trade(available)             (leverage cap)
// then settle and take `size` out of both books. Whatever is taken stays gone
// until a later action replenishes that level.
//
use tracing::debug;

use crate::book::BookSet;
use crate::domain::{Asset, BookSide, FeeClass, Instrument, Trade, TsNs};
use crate::portfolio::Portfolio;
use crate::strategy::{unwind_signals, Signal, Strategy};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Filled(Trade),
    /// Nothing resting at one of the two prices.
    NoLiquidity,
    /// Leverage cap (or a non-positive base) allowed zero lots.
    NoCapital,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraderStats {
    pub evaluations: u64,
    pub unwind_evaluations: u64,
    pub no_liquidity: u64,
    pub no_capital: u64,
}

pub struct SpreadTrader {
    portfolio: Portfolio,
    strategy: Box<dyn Strategy>,
    fee_class: FeeClass,
    trades: Vec<Trade>,
    stats: TraderStats,
}

impl SpreadTrader {
    pub fn new(portfolio: Portfolio, strategy: Box<dyn Strategy>, fee_class: FeeClass) -> Self {
        Self { portfolio, strategy, fee_class, trades: Vec::new(), stats: TraderStats::default() }
    }

    pub fn portfolio(&self) -> &Portfolio { &self.portfolio }
    pub fn trades(&self) -> &[Trade] { &self.trades }
    pub fn stats(&self) -> TraderStats { self.stats }
    pub fn strategy_name(&self) -> &'static str { self.strategy.name() }

    /// Start the interest clock; call once with the first replayed timestamp.
    pub fn start_clock(&mut self, ts: TsNs) { self.portfolio.apply_interest(ts); }

    /// Net exposure per instrument. Spot is measured against the starting CNY
    /// grown at the CNY rate, so interest alone never opens a spot position.
    pub fn positions(&self) -> [f64; Instrument::COUNT] {
        Instrument::ALL.map(|inst| {
            let asset = inst.asset();
            if inst == Instrument::Spot { self.portfolio.net_position(asset) } else { self.portfolio.balance(asset) }
        })
    }

    pub fn execute_trade(&mut self, books: &mut BookSet, ts: TsNs, sig: &Signal) -> ExecOutcome {
        let ask_vol = books.get(sig.buy).volume_at(BookSide::Ask, sig.buy_px);
        let bid_vol = books.get(sig.sell).volume_at(BookSide::Bid, sig.sell_px);
        let mut available = ask_vol.min(bid_vol);
        if let Some(cap) = sig.max_size {
            available = available.min(cap);
        }
        if available <= 0 {
            self.stats.no_liquidity += 1;
            return ExecOutcome::NoLiquidity;
        }

        let mut trade = Trade {
            timestamp: ts,
            buy_market: sig.buy,
            sell_market: sig.sell,
            buy_price: sig.buy_px,
            sell_price: sig.sell_px,
            size: available,
            fee_class: self.fee_class,
        };
        let size = self.portfolio.can_trade(&trade);
        if size <= 0 {
            self.stats.no_capital += 1;
            debug!(buy = %sig.buy, sell = %sig.sell, available, "leverage cap blocks trade");
            return ExecOutcome::NoCapital;
        }
        trade.size = size;

        self.portfolio.settle(&trade);
        books.get_mut(sig.buy).consume(BookSide::Ask, sig.buy_px, size);
        books.get_mut(sig.sell).consume(BookSide::Bid, sig.sell_px, size);
        self.trades.push(trade.clone());
        ExecOutcome::Filled(trade)
    }

    /// One strategy pass over the current books.
    pub fn evaluate(&mut self, books: &mut BookSet, ts: TsNs) -> Vec<ExecOutcome> {
        self.stats.evaluations += 1;
        let signals = self.strategy.on_tick(books);
        signals.iter().map(|sig| self.execute_trade(books, ts, sig)).collect()
    }

    /// End-of-session pass: close opposite exposures, no strategy gating.
    pub fn unwind(&mut self, books: &mut BookSet, ts: TsNs) -> Vec<ExecOutcome> {
        self.stats.unwind_evaluations += 1;
        let signals = unwind_signals(self.positions(), books);
        signals.iter().map(|sig| self.execute_trade(books, ts, sig)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{px_from_f64, Action, ActionKind};
    use crate::portfolio::PortfolioCfg;
    use crate::strategy::ThresholdStrategy;

    fn put(books: &mut BookSet, inst: Instrument, side: BookSide, px: f64, vol: i64) {
        books.apply(&Action {
            action_type: ActionKind::Add,
            side,
            price: px_from_f64(px),
            volume: vol,
            timestamp: 1,
            instrument: inst,
        })
        .unwrap();
    }

    fn trader(cny: f64, delta_1: f64) -> SpreadTrader {
        let mut cfg = PortfolioCfg::default();
        cfg.initial[Asset::Cny.idx()] = cny;
        SpreadTrader::new(
            Portfolio::new(&cfg),
            Box::new(ThresholdStrategy::new(delta_1, 0.01)),
            FeeClass::Taker,
        )
    }

    fn scenario_books() -> BookSet {
        let mut books = BookSet::default();
        put(&mut books, Instrument::Spot, BookSide::Ask, 7.50, 10);
        put(&mut books, Instrument::Spot, BookSide::Bid, 7.49, 10);
        put(&mut books, Instrument::Perp, BookSide::Bid, 7.60, 4);
        put(&mut books, Instrument::Perp, BookSide::Ask, 7.61, 4);
        books
    }

    #[test]
    fn perp_premium_fills_min_of_both_sides() {
        let mut books = scenario_books();
        let mut t = trader(10_000.0, 0.05);
        t.start_clock(1);
        let out = t.evaluate(&mut books, 2);
        assert_eq!(out.len(), 1);
        let ExecOutcome::Filled(trade) = &out[0] else { panic!("expected fill, got {:?}", out[0]) };
        assert_eq!((trade.buy_market, trade.sell_market), (Instrument::Spot, Instrument::Perp));
        assert_eq!(trade.buy_price, px_from_f64(7.50));
        assert_eq!(trade.sell_price, px_from_f64(7.60));
        assert_eq!(trade.size, 4);

        // liquidity consumed exactly
        assert_eq!(books.get(Instrument::Spot).volume_at(BookSide::Ask, px_from_f64(7.50)), 6);
        assert_eq!(books.get(Instrument::Perp).volume_at(BookSide::Bid, px_from_f64(7.60)), 0);
        assert_eq!(books.best_bid(Instrument::Perp), None);

        assert_eq!(t.portfolio().balance(Asset::Cny), 10_004.0);
        assert_eq!(t.portfolio().balance(Asset::Perp), -4.0);
        assert_eq!(t.trades().len(), 1);
        assert_eq!(t.positions(), [4.0, -4.0, 0.0]);
    }

    #[test]
    fn consumed_level_is_not_reused() {
        let mut books = scenario_books();
        let mut t = trader(10_000.0, 0.05);
        t.evaluate(&mut books, 2);
        let again = t.evaluate(&mut books, 3);
        assert!(again.is_empty(), "perp bid gone, nothing to signal: {again:?}");
        assert_eq!(t.trades().len(), 1);
        assert_eq!(t.stats().evaluations, 2);
    }

    #[test]
    fn empty_portfolio_reports_no_capital() {
        let mut books = scenario_books();
        let mut t = trader(0.0, 0.05);
        let out = t.evaluate(&mut books, 2);
        assert_eq!(out, vec![ExecOutcome::NoCapital]);
        assert_eq!(t.stats().no_capital, 1);
        // books untouched
        assert_eq!(books.get(Instrument::Perp).volume_at(BookSide::Bid, px_from_f64(7.60)), 4);
    }

    #[test]
    fn stale_price_reports_no_liquidity() {
        let mut books = scenario_books();
        let mut t = trader(10_000.0, 0.05);
        let sig = Signal {
            buy: Instrument::Spot,
            sell: Instrument::Perp,
            buy_px: px_from_f64(7.45),
            sell_px: px_from_f64(7.60),
            max_size: None,
        };
        assert_eq!(t.execute_trade(&mut books, 2, &sig), ExecOutcome::NoLiquidity);
        assert_eq!(t.stats().no_liquidity, 1);
    }

    #[test]
    fn leverage_caps_large_fill() {
        let mut books = BookSet::default();
        put(&mut books, Instrument::Spot, BookSide::Ask, 7.50, 1_000_000);
        put(&mut books, Instrument::Perp, BookSide::Bid, 7.60, 1_000_000);
        let mut t = trader(1_000.0, 0.05);
        let base = t.portfolio().unleveraged_balance();
        let out = t.evaluate(&mut books, 2);
        let ExecOutcome::Filled(trade) = &out[0] else { panic!("expected fill") };
        assert!(trade.size < 1_000_000);
        assert!(t.portfolio().leveraged_balance() / base <= t.portfolio().leverage_limit() + 1e-9);
        assert_eq!(
            books.get(Instrument::Spot).volume_at(BookSide::Ask, px_from_f64(7.50)),
            1_000_000 - trade.size
        );
    }

    #[test]
    fn unwind_flattens_without_overshoot() {
        let mut books = scenario_books();
        let mut t = trader(10_000.0, 0.05);
        t.evaluate(&mut books, 2);
        assert_eq!(t.positions(), [4.0, -4.0, 0.0]);

        // refill: perp ask to buy back, spot bid to sell into
        put(&mut books, Instrument::Perp, BookSide::Ask, 7.61, 100);
        put(&mut books, Instrument::Spot, BookSide::Bid, 7.49, 100);
        let out = t.unwind(&mut books, 3);
        assert_eq!(out.len(), 1);
        let ExecOutcome::Filled(trade) = &out[0] else { panic!("expected fill") };
        assert_eq!((trade.buy_market, trade.sell_market), (Instrument::Perp, Instrument::Spot));
        assert_eq!(trade.size, 4);
        assert_eq!(t.positions(), [0.0, 0.0, 0.0]);
        assert!(t.unwind(&mut books, 4).is_empty());
    }
}
