// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : spread_replay: cross-instrument spread backtester in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Rebuilds spot / perp / itrf order books from snapshot diffs,
          replays them in one global time order, trades the spread under a
          leverage cap, unwinds at session end, exposes Prometheus metrics
          and records JSONL events.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{FixedOffset, NaiveTime};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use thiserror::Error;

use crate::domain::{Asset, FeeClass, Instrument};
use crate::portfolio::PortfolioCfg;
use crate::replay::ReplayCfg;
use crate::risk::Sizing;
use crate::strategy::{ImbalanceStrategy, Strategy, ThresholdStrategy};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

// ===== CLI =====
#[derive(Debug, Parser)]
#[command(name = "spread_replay", version, about = "Order-book replay and spread trading backtest")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Turn one instrument's snapshot JSONL into action JSONL.
    Diff {
        #[arg(long, value_parser = parse_instrument)]
        instrument: Instrument,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Replay three streams through the trader.
    Replay {
        #[arg(long)]
        spot: PathBuf,
        #[arg(long)]
        perp: PathBuf,
        #[arg(long)]
        itrf: PathBuf,
        /// Inputs are snapshot JSONL, diffed on the fly (default: action JSONL).
        #[arg(long)]
        snapshots: bool,
        /// Overrides RECORD_FILE.
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Replay a synthetic random-walk session held in memory.
    Demo {
        #[arg(long, default_value_t = 2_000)]
        snapshots: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long)]
        record: Option<PathBuf>,
    },
}

fn parse_instrument(s: &str) -> Result<Instrument, String> {
    Instrument::parse(s).ok_or_else(|| format!("expected spot|perp|itrf, got {s:?}"))
}

// ===== Strategy =====
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyMode {
    Threshold,
    Imbalance,
}

impl StrategyMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threshold" | "spread" => Some(StrategyMode::Threshold),
            "imbalance" | "obi" => Some(StrategyMode::Imbalance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self { StrategyMode::Threshold => "threshold", StrategyMode::Imbalance => "imbalance" }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // strategy
    pub strategy_mode: StrategyMode,
    pub delta_1: f64,
    pub delta_2: f64,
    /// spot/perp, spot/itrf, perp/itrf
    pub obi_thresholds: [f64; 3],

    // portfolio & execution
    pub portfolio: PortfolioCfg,
    pub fee_class: FeeClass,

    // session
    pub replay: ReplayCfg,

    // files/metrics
    pub record_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Args {
    pub fn build_strategy(&self) -> Box<dyn Strategy> {
        match self.strategy_mode {
            StrategyMode::Threshold => Box::new(ThresholdStrategy::new(self.delta_1, self.delta_2)),
            StrategyMode::Imbalance => Box::new(ImbalanceStrategy::new(self.obi_thresholds)),
        }
    }
}

/// Reads `.env` first, then the process environment.
pub fn load() -> Result<Args, ConfigError> {
    let _ = dotenv();
    load_from(|k| env::var(k).ok())
}

struct Env<F> {
    get: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &'static str) -> Option<String> {
        (self.get)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e: T::Err| invalid(key, &v, e.to_string())),
        }
    }

    fn positive(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let v = self.parse(key, default)?;
        if v.is_finite() && v > 0.0 { Ok(v) } else { Err(invalid(key, &v.to_string(), "must be positive")) }
    }

    fn non_negative(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let v = self.parse(key, default)?;
        if v.is_finite() && v >= 0.0 { Ok(v) } else { Err(invalid(key, &v.to_string(), "must be >= 0")) }
    }

    fn finite(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let v = self.parse(key, default)?;
        if v.is_finite() { Ok(v) } else { Err(invalid(key, &v.to_string(), "must be finite")) }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, &v, "expected true|false")),
            },
        }
    }

    fn choice<T>(&self, key: &'static str, default: T, parse: fn(&str) -> Option<T>, expected: &str) -> Result<T, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => parse(&v).ok_or_else(|| invalid(key, &v, format!("expected {expected}"))),
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string(), reason: reason.into() }
}

/// Same as `load` over an arbitrary key lookup.
pub fn load_from<F: Fn(&str) -> Option<String>>(get: F) -> Result<Args, ConfigError> {
    let env = Env { get };

    // ===== Strategy =====
    //   STRATEGY=threshold  DELTA_1=0.002 DELTA_2=0.001
    //   STRATEGY=imbalance  OBI_SPOT_PERP=0.1 OBI_SPOT_ITRF=0.1 OBI_PERP_ITRF=0.1
    let strategy_mode = env.choice("STRATEGY", StrategyMode::Threshold, StrategyMode::parse_one, "threshold|imbalance")?;
    let delta_1 = env.positive("DELTA_1", 0.002)?;
    let delta_2 = env.positive("DELTA_2", 0.001)?;
    let obi_thresholds = [
        env.non_negative("OBI_SPOT_PERP", 0.1)?,
        env.non_negative("OBI_SPOT_ITRF", 0.1)?,
        env.non_negative("OBI_PERP_ITRF", 0.1)?,
    ];

    // ===== Portfolio =====
    let defaults = PortfolioCfg::default();
    let mut initial = [0.0; Asset::COUNT];
    initial[Asset::Rub.idx()] = env.finite("INITIAL_RUB", 0.0)?;
    initial[Asset::Cny.idx()] = env.finite("INITIAL_CNY", 10_000_000.0)?;
    initial[Asset::Itrf.idx()] = env.finite("INITIAL_ITRF", 0.0)?;
    initial[Asset::Perp.idx()] = env.finite("INITIAL_PERP", 0.0)?;
    let mut rates = defaults.rates;
    rates[Asset::Rub.idx()] = env.non_negative("RATE_RUB", rates[Asset::Rub.idx()])?;
    rates[Asset::Cny.idx()] = env.non_negative("RATE_CNY", rates[Asset::Cny.idx()])?;

    let portfolio = PortfolioCfg {
        initial,
        rates,
        leverage_limit: env.positive("LEVERAGE_LIMIT", defaults.leverage_limit)?,
        notional_scale: env.positive("NOTIONAL_SCALE", defaults.notional_scale)?,
        taker_fee_bps: env.non_negative("TAKER_FEE_BPS", defaults.taker_fee_bps)?,
        maker_fee_bps: env.non_negative("MAKER_FEE_BPS", defaults.maker_fee_bps)?,
        sizing: env.choice("SIZING", defaults.sizing, Sizing::parse, "closed_form|bisection")?,
    };
    let fee_class = env.choice("FEE_CLASS", FeeClass::Taker, FeeClass::parse, "taker|maker")?;

    // ===== Session =====
    let replay_defaults = ReplayCfg::default();
    let unwind_at = match env.raw("UNWIND_TIME") {
        None => replay_defaults.unwind_at,
        Some(v) => NaiveTime::parse_from_str(&v, "%H:%M").map_err(|e| invalid("UNWIND_TIME", &v, e.to_string()))?,
    };
    let offset_min: i32 = env.parse("SESSION_UTC_OFFSET_MIN", 0)?;
    let session_offset = offset_min
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| invalid("SESSION_UTC_OFFSET_MIN", &offset_min.to_string(), "out of range"))?;
    let replay = ReplayCfg {
        unwind_at,
        session_offset,
        strict_liquidity: env.flag("STRICT_LIQUIDITY", false)?,
        summary_every: env.parse("SUMMARY_EVERY", replay_defaults.summary_every)?,
    };

    // ===== Output =====
    let record_file = env.raw("RECORD_FILE").map(PathBuf::from);
    let metrics_port = match env.raw("METRICS_PORT") {
        None => None,
        Some(v) => Some(v.parse::<u16>().map_err(|e| invalid("METRICS_PORT", &v, e.to_string()))?),
    };

    Ok(Args {
        strategy_mode,
        delta_1,
        delta_2,
        obi_thresholds,
        portfolio,
        fee_class,
        replay,
        record_file,
        metrics_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_map(pairs: &[(&str, &str)]) -> Result<Args, ConfigError> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        load_from(move |k| m.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let a = load_map(&[]).unwrap();
        assert_eq!(a.strategy_mode, StrategyMode::Threshold);
        assert_eq!((a.delta_1, a.delta_2), (0.002, 0.001));
        assert_eq!(a.obi_thresholds, [0.1; 3]);
        assert_eq!(a.portfolio.initial[Asset::Cny.idx()], 10_000_000.0);
        assert_eq!(a.portfolio.leverage_limit, 5.0);
        assert_eq!(a.portfolio.sizing, Sizing::ClosedForm);
        assert_eq!(a.fee_class, FeeClass::Taker);
        assert_eq!(a.replay.unwind_at, NaiveTime::from_hms_opt(11, 0, 0).unwrap());
        assert!(!a.replay.strict_liquidity);
        assert_eq!(a.metrics_port, None);
        assert_eq!(a.record_file, None);
        assert_eq!(a.build_strategy().name(), "threshold");
    }

    #[test]
    fn overrides_are_applied() {
        let a = load_map(&[
            ("STRATEGY", "imbalance"),
            ("OBI_PERP_ITRF", "0.25"),
            ("SIZING", "bisection"),
            ("UNWIND_TIME", "10:45"),
            ("SESSION_UTC_OFFSET_MIN", "180"),
            ("STRICT_LIQUIDITY", "true"),
            ("METRICS_PORT", "9898"),
            ("RECORD_FILE", "out/trades.jsonl"),
            ("FEE_CLASS", "maker"),
        ])
        .unwrap();
        assert_eq!(a.build_strategy().name(), "imbalance");
        assert_eq!(a.obi_thresholds[2], 0.25);
        assert_eq!(a.portfolio.sizing, Sizing::Bisection);
        assert_eq!(a.replay.unwind_at, NaiveTime::from_hms_opt(10, 45, 0).unwrap());
        assert_eq!(a.replay.session_offset.local_minus_utc(), 180 * 60);
        assert!(a.replay.strict_liquidity);
        assert_eq!(a.metrics_port, Some(9898));
        assert_eq!(a.record_file, Some(PathBuf::from("out/trades.jsonl")));
        assert_eq!(a.fee_class, FeeClass::Maker);
    }

    #[test]
    fn bad_values_name_the_key() {
        for (key, val) in [
            ("DELTA_1", "-0.1"),
            ("LEVERAGE_LIMIT", "abc"),
            ("STRATEGY", "momentum"),
            ("UNWIND_TIME", "25:00"),
            ("SESSION_UTC_OFFSET_MIN", "100000"),
            ("STRICT_LIQUIDITY", "maybe"),
            ("METRICS_PORT", "70000"),
        ] {
            match load_map(&[(key, val)]) {
                Err(ConfigError::Invalid { key: k, .. }) => assert_eq!(k, key),
                Ok(_) => panic!("{key}={val} accepted"),
            }
        }
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["spread_replay", "diff", "--instrument", "perp", "--input", "a", "--output", "b"]).unwrap();
        assert!(matches!(cli.command, Command::Diff { instrument: Instrument::Perp, .. }));

        let cli = Cli::try_parse_from(["spread_replay", "demo", "--seed", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Demo { snapshots: 2_000, seed: 3, record: None }));

        assert!(Cli::try_parse_from(["spread_replay", "diff", "--instrument", "fx", "--input", "a", "--output", "b"]).is_err());
    }
}
