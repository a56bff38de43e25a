// ===============================
// src/replay.rs (single-pass replay loop)
// ===============================
//
// Owns the three replicas and the trader. For every merged action:
//   1) if its timestamp is past the pending one, evaluate once for the
//      pending timestamp (all of its actions are in the books by then)
//   2) apply the action; a clamped remove is counted and reported
// `finish` evaluates the last pending timestamp and builds the summary.
//
// From the unwind cutoff on, evaluation means unwinding instead of trading.
//
use chrono::{FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::book::{ApplyOutcome, BookSet, VolumeOverflow};
use crate::domain::{px_to_f64, Action, ActionKind, Clamp, Event, Instrument, RunSummary, TsNs};
use crate::feed::FeedError;
use crate::metrics;
use crate::posttrade::{self, PerformanceTracker};
use crate::trader::{ExecOutcome, SpreadTrader};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(
        "negative liquidity on {} {} @ {}: remove {} with {} missing (ts {})",
        .0.instrument, .0.side.as_str(), px_to_f64(.0.price), .0.requested, .0.missing, .0.timestamp
    )]
    NegativeLiquidity(Clamp),
    #[error(transparent)]
    VolumeOverflow(#[from] VolumeOverflow),
}

#[derive(Debug, Clone)]
pub struct ReplayCfg {
    pub unwind_at: NaiveTime,
    pub session_offset: FixedOffset,
    /// Abort on a clamped remove instead of counting it.
    pub strict_liquidity: bool,
    /// Progress summary every N applied actions; 0 turns it off.
    pub summary_every: u64,
}

impl Default for ReplayCfg {
    fn default() -> Self {
        Self {
            unwind_at: NaiveTime::from_hms_opt(11, 0, 0).expect("11:00 is a valid time"),
            session_offset: Utc.fix(),
            strict_liquidity: false,
            summary_every: 100_000,
        }
    }
}

impl ReplayCfg {
    pub fn is_unwind_time(&self, ts: TsNs) -> bool {
        self.session_offset.timestamp_nanos(ts).time() >= self.unwind_at
    }
}

pub struct ReplayEngine {
    cfg: ReplayCfg,
    books: BookSet,
    trader: SpreadTrader,
    perf: PerformanceTracker,
    events: Option<mpsc::Sender<Event>>,
    pending_ts: Option<TsNs>,
    actions_applied: u64,
    clamped_removes: u64,
    clamp_warned: [bool; Instrument::COUNT],
    unwinding: bool,
}

impl ReplayEngine {
    pub fn new(cfg: ReplayCfg, trader: SpreadTrader) -> Self {
        debug!(strategy = trader.strategy_name(), unwind_at = %cfg.unwind_at, "replay engine ready");
        Self {
            cfg,
            books: BookSet::default(),
            trader,
            perf: PerformanceTracker::new(),
            events: None,
            pending_ts: None,
            actions_applied: 0,
            clamped_removes: 0,
            clamp_warned: [false; Instrument::COUNT],
            unwinding: false,
        }
    }

    /// Trades, clamps and summaries are also sent here, in order.
    /// Sends block, so the engine must run off the async runtime.
    pub fn with_events(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn books(&self) -> &BookSet { &self.books }
    pub fn trader(&self) -> &SpreadTrader { &self.trader }

    fn emit(&mut self, ev: Event) {
        let Some(tx) = &self.events else { return };
        if tx.blocking_send(ev).is_err() {
            warn!("event receiver closed, recording stopped");
            self.events = None;
        }
    }

    pub fn on_action(&mut self, action: &Action) -> Result<(), ReplayError> {
        match self.pending_ts {
            None => self.trader.start_clock(action.timestamp),
            Some(ts) if action.timestamp > ts => self.evaluate(ts),
            Some(_) => {}
        }
        self.pending_ts = Some(action.timestamp);

        let outcome = self.books.apply(action)?;
        self.actions_applied += 1;
        metrics::ACTIONS_APPLIED.with_label_values(&[action.instrument.as_str()]).inc();

        if let ApplyOutcome::Clamped { missing } = outcome {
            debug_assert_eq!(action.action_type, ActionKind::Remove);
            self.on_clamp(Clamp {
                timestamp: action.timestamp,
                instrument: action.instrument,
                side: action.side,
                price: action.price,
                requested: action.volume,
                missing,
            })?;
        }

        if self.cfg.summary_every > 0 && self.actions_applied % self.cfg.summary_every == 0 {
            let s = self.summary();
            posttrade::log_summary(&s, "progress");
            self.emit(Event::Summary(s));
        }
        Ok(())
    }

    fn on_clamp(&mut self, clamp: Clamp) -> Result<(), ReplayError> {
        if self.cfg.strict_liquidity {
            return Err(ReplayError::NegativeLiquidity(clamp));
        }
        self.clamped_removes += 1;
        metrics::CLAMPED_REMOVES.with_label_values(&[clamp.instrument.as_str()]).inc();
        let i = clamp.instrument.idx();
        if !self.clamp_warned[i] {
            self.clamp_warned[i] = true;
            warn!(
                instrument = %clamp.instrument,
                side = clamp.side.as_str(),
                price = px_to_f64(clamp.price),
                requested = clamp.requested,
                missing = clamp.missing,
                "remove exceeds resting volume, clamped to zero (further clamps logged at debug)"
            );
        } else {
            debug!(instrument = %clamp.instrument, missing = clamp.missing, "clamped remove");
        }
        self.emit(Event::Clamp(clamp));
        Ok(())
    }

    fn evaluate(&mut self, ts: TsNs) {
        if self.perf.last().is_none() {
            // baseline once every open leg can be marked
            if let Some(v) = self.trader.portfolio().mark_to_book(&self.books) {
                self.perf.record(v);
            }
        }

        metrics::EVALUATIONS.inc();
        let outcomes = if self.cfg.is_unwind_time(ts) {
            if !self.unwinding {
                self.unwinding = true;
                info!(ts, "unwind cutoff reached, closing open exposure");
                self.emit(Event::Note(format!("unwind started at {ts}")));
            }
            self.trader.unwind(&mut self.books, ts)
        } else {
            self.trader.evaluate(&mut self.books, ts)
        };

        for out in outcomes {
            match out {
                ExecOutcome::Filled(trade) => {
                    metrics::TRADES
                        .with_label_values(&[trade.buy_market.as_str(), trade.sell_market.as_str()])
                        .inc();
                    posttrade::log_fill(&trade);
                    if let Some(v) = self.trader.portfolio().mark_to_book(&self.books) {
                        self.perf.record(v);
                    }
                    self.emit(Event::Trade(trade));
                }
                ExecOutcome::NoLiquidity => metrics::NO_LIQUIDITY.inc(),
                ExecOutcome::NoCapital => metrics::NO_CAPITAL.inc(),
            }
        }
        metrics::observe(&self.books, self.trader.portfolio());
    }

    pub fn summary(&self) -> RunSummary {
        let stats = self.trader.stats();
        let portfolio = self.trader.portfolio();
        RunSummary {
            last_ts_ns: self.pending_ts.unwrap_or(0),
            actions_applied: self.actions_applied,
            clamped_removes: self.clamped_removes,
            evaluations: stats.evaluations + stats.unwind_evaluations,
            trades: self.trader.trades().len() as u64,
            no_liquidity: stats.no_liquidity,
            no_capital: stats.no_capital,
            balances: portfolio.balances(),
            valuation: portfolio.mark_to_book(&self.books).or(self.perf.last()).unwrap_or(0.0),
            pnl: self.perf.pnl().unwrap_or(0.0),
            sharpe: self.perf.sharpe(),
            max_drawdown: self.perf.max_drawdown(),
        }
    }

    /// Evaluate the last timestamp and close the value series.
    pub fn finish(&mut self) -> RunSummary {
        if let Some(ts) = self.pending_ts {
            self.evaluate(ts);
        }
        if let Some(v) = self.trader.portfolio().mark_to_book(&self.books) {
            self.perf.record(v);
        }
        let s = self.summary();
        self.emit(Event::Summary(s.clone()));
        s
    }

    /// Drive the whole stream. The first error stops the run.
    pub fn run<I>(&mut self, actions: I) -> Result<RunSummary, ReplayError>
    where
        I: IntoIterator<Item = Result<Action, FeedError>>,
    {
        for action in actions {
            self.on_action(&action?)?;
        }
        Ok(self.finish())
    }
}
