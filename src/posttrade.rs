// ===============================
// src/posttrade.rs (fill log + performance series)
// ===============================
//
// Read-only projections over the run: the mark-to-book value series and the
// stats derived from it. Nothing here feeds back into trading.
//
use tracing::info;

use crate::domain::{px_to_f64, RunSummary, Trade};

pub fn log_fill(trade: &Trade) {
    info!(
        ts = trade.timestamp,
        buy = %trade.buy_market,
        sell = %trade.sell_market,
        buy_px = px_to_f64(trade.buy_price),
        sell_px = px_to_f64(trade.sell_price),
        qty = trade.size,
        "FILLED"
    );
}

pub fn log_summary(s: &RunSummary, label: &str) {
    info!(
        last_ts = s.last_ts_ns,
        actions = s.actions_applied,
        clamped = s.clamped_removes,
        evals = s.evaluations,
        trades = s.trades,
        no_liquidity = s.no_liquidity,
        no_capital = s.no_capital,
        balances = ?s.balances,
        valuation = ?s.valuation,
        pnl = ?s.pnl,
        sharpe = s.sharpe,
        max_dd = s.max_drawdown,
        "{label}"
    );
}

/// Value series with Welford stats over simple returns and a running peak.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    first: Option<f64>,
    last: Option<f64>,
    peak: f64,
    max_drawdown: f64,
    n_returns: u64,
    mean: f64,
    m2: f64,
}

impl PerformanceTracker {
    pub fn new() -> Self { Self::default() }

    /// Non-finite values are ignored.
    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let Some(prev) = self.last else {
            self.first = Some(value);
            self.last = Some(value);
            self.peak = value;
            return;
        };

        if prev != 0.0 {
            let r = (value - prev) / prev.abs();
            self.n_returns += 1;
            let delta = r - self.mean;
            self.mean += delta / self.n_returns as f64;
            self.m2 += delta * (r - self.mean);
        }

        if value > self.peak {
            self.peak = value;
        } else if self.peak > 0.0 {
            let dd = (self.peak - value) / self.peak;
            self.max_drawdown = self.max_drawdown.max(dd);
        }
        self.last = Some(value);
    }

    pub fn last(&self) -> Option<f64> { self.last }

    /// Last value minus first value.
    pub fn pnl(&self) -> Option<f64> { Some(self.last? - self.first?) }

    /// mean / sample stddev of returns; 0 below two returns or with zero spread.
    pub fn sharpe(&self) -> f64 {
        if self.n_returns < 2 {
            return 0.0;
        }
        let sd = (self.m2 / (self.n_returns - 1) as f64).sqrt();
        if sd > 0.0 { self.mean / sd } else { 0.0 }
    }

    /// Largest fall from a running peak, as a fraction of that peak.
    pub fn max_drawdown(&self) -> f64 { self.max_drawdown }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_single_value() {
        let mut p = PerformanceTracker::new();
        assert_eq!(p.pnl(), None);
        assert_eq!(p.sharpe(), 0.0);
        p.record(100.0);
        assert_eq!(p.pnl(), Some(0.0));
        assert_eq!(p.sharpe(), 0.0);
        assert_eq!(p.max_drawdown(), 0.0);
    }

    #[test]
    fn drawdown_is_fraction_of_peak() {
        let mut p = PerformanceTracker::new();
        for v in [100.0, 120.0, 90.0, 110.0, 130.0, 117.0] {
            p.record(v);
        }
        assert_eq!(p.peak, 130.0);
        assert!((p.max_drawdown() - 0.25).abs() < 1e-12);
        assert_eq!(p.pnl(), Some(17.0));
    }

    #[test]
    fn constant_returns_have_zero_sharpe() {
        let mut p = PerformanceTracker::new();
        for v in [100.0, 100.0, 100.0] {
            p.record(v);
        }
        assert_eq!(p.sharpe(), 0.0);
    }

    #[test]
    fn sharpe_matches_direct_formula() {
        let values = [100.0, 101.0, 100.5, 102.0, 103.0];
        let mut p = PerformanceTracker::new();
        for v in values {
            p.record(v);
        }
        let rets: Vec<f64> = values.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
        let mean = rets.iter().sum::<f64>() / rets.len() as f64;
        let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rets.len() - 1) as f64;
        assert!((p.sharpe() - mean / var.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn non_positive_peak_skips_drawdown() {
        let mut p = PerformanceTracker::new();
        for v in [-10.0, -20.0, f64::NAN, -5.0] {
            p.record(v);
        }
        assert_eq!(p.max_drawdown(), 0.0);
        assert_eq!(p.last(), Some(-5.0));
    }
}
