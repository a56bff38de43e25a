// ===============================
// src/portfolio.rs (balances, interest, settlement)
// ===============================
use crate::book::BookSet;
use crate::domain::{px_to_f64, Asset, FeeClass, Instrument, Trade, TsNs};
use crate::risk::{self, Sizing};

const NS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0 * 1e9;

#[derive(Debug, Clone)]
pub struct PortfolioCfg {
    pub initial: [f64; Asset::COUNT],
    /// Annual simple rate per leg; only cash legs accrue.
    pub rates: [f64; Asset::COUNT],
    pub leverage_limit: f64,
    /// Fixed RUB notional per lot used by the leverage base.
    pub notional_scale: f64,
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
    pub sizing: Sizing,
}

impl Default for PortfolioCfg {
    fn default() -> Self {
        let mut rates = [0.0; Asset::COUNT];
        rates[Asset::Rub.idx()] = 0.21;
        rates[Asset::Cny.idx()] = 0.05;
        Self {
            initial: [0.0; Asset::COUNT],
            rates,
            leverage_limit: 5.0,
            notional_scale: 14.0,
            taker_fee_bps: 0.55,
            maker_fee_bps: 0.0,
            sizing: Sizing::ClosedForm,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Portfolio {
    balances: [f64; Asset::COUNT],
    rates: [f64; Asset::COUNT],
    leverage_limit: f64,
    notional_scale: f64,
    taker_fee_bps: f64,
    maker_fee_bps: f64,
    sizing: Sizing,
    last_interest_update: Option<TsNs>,
    /// Initial holdings grown at each leg's rate; a leg's open position is
    /// measured against this, so accrued interest is not exposure.
    baseline: [f64; Asset::COUNT],
}

impl Portfolio {
    pub fn new(cfg: &PortfolioCfg) -> Self {
        Self {
            balances: cfg.initial,
            rates: cfg.rates,
            leverage_limit: cfg.leverage_limit,
            notional_scale: cfg.notional_scale,
            taker_fee_bps: cfg.taker_fee_bps,
            maker_fee_bps: cfg.maker_fee_bps,
            sizing: cfg.sizing,
            last_interest_update: None,
            baseline: cfg.initial,
        }
    }

    pub fn balance(&self, asset: Asset) -> f64 { self.balances[asset.idx()] }
    pub fn balances(&self) -> Vec<(Asset, f64)> { Asset::ALL.iter().map(|a| (*a, self.balance(*a))).collect() }
    pub fn leverage_limit(&self) -> f64 { self.leverage_limit }

    /// Balance minus the interest-grown initial holdings of that leg.
    pub fn net_position(&self, asset: Asset) -> f64 { self.balance(asset) - self.baseline[asset.idx()] }

    /// First call only starts the clock. Later calls grow each cash leg by
    /// rate * elapsed years (365-day year). Time never moves backwards.
    pub fn apply_interest(&mut self, now: TsNs) {
        let Some(last) = self.last_interest_update else {
            self.last_interest_update = Some(now);
            return;
        };
        if now <= last {
            return;
        }
        let years = (now - last) as f64 / NS_PER_YEAR;
        for asset in Asset::ALL.into_iter().filter(|a| a.is_cash()) {
            let growth = 1.0 + self.rates[asset.idx()] * years;
            self.balances[asset.idx()] *= growth;
            self.baseline[asset.idx()] *= growth;
        }
        self.last_interest_update = Some(now);
    }

    fn weight(&self, asset: Asset) -> f64 { if asset == Asset::Rub { 1.0 } else { self.notional_scale } }

    /// (cny + itrf + perp) * scale + rub
    pub fn unleveraged_balance(&self) -> f64 {
        Asset::ALL.iter().map(|a| self.weight(*a) * self.balance(*a)).sum()
    }

    /// (|cny| + |itrf| + |perp|) * scale + |rub|
    pub fn leveraged_balance(&self) -> f64 {
        Asset::ALL.iter().map(|a| self.weight(*a) * self.balance(*a).abs()).sum()
    }

    /// None while the unleveraged base is not positive.
    pub fn leverage_ratio(&self) -> Option<f64> {
        let base = self.unleveraged_balance();
        if base > 0.0 { Some(self.leveraged_balance() / base) } else { None }
    }

    pub fn fee_rate(&self, class: FeeClass) -> f64 {
        match class {
            FeeClass::Taker => self.taker_fee_bps / 10_000.0,
            FeeClass::Maker => self.maker_fee_bps / 10_000.0,
        }
    }

    /// Per-unit change of every leg for a fill of `trade`'s direction.
    pub fn fill_slopes(&self, trade: &Trade) -> [f64; Asset::COUNT] {
        let fee = self.fee_rate(trade.fee_class);
        let buy_px = px_to_f64(trade.buy_price);
        let sell_px = px_to_f64(trade.sell_price);
        let mut d = [0.0; Asset::COUNT];
        d[trade.buy_market.asset().idx()] += 1.0;
        d[trade.sell_market.asset().idx()] -= 1.0;
        d[Asset::Rub.idx()] += sell_px * (1.0 - fee) - buy_px * (1.0 + fee);
        d
    }

    /// Move the legs for `size` units of `trade`, no interest.
    pub fn apply_fill(&mut self, trade: &Trade, size: f64) {
        let d = self.fill_slopes(trade);
        for (b, step) in self.balances.iter_mut().zip(d) {
            *b += step * size;
        }
    }

    pub fn settle(&mut self, trade: &Trade) {
        self.apply_interest(trade.timestamp);
        self.apply_fill(trade, trade.size as f64);
    }

    /// Largest whole size of `candidate` that keeps leverage within the limit.
    /// Works on scratch copies only.
    pub fn can_trade(&self, candidate: &Trade) -> i64 {
        risk::max_size(self, candidate, self.sizing)
    }

    /// RUB value with every position leg marked at its best bid.
    /// None if a non-flat leg has no bid to mark against.
    pub fn mark_to_book(&self, books: &BookSet) -> Option<f64> {
        let mut value = self.balance(Asset::Rub);
        for inst in Instrument::ALL {
            let qty = self.balance(inst.asset());
            if qty == 0.0 {
                continue;
            }
            value += qty * px_to_f64(books.best_bid(inst)?);
        }
        Some(value)
    }
}
