// ===============================
// src/main.rs
// ===============================
/*
 # diff raw snapshots into persisted actions (one instrument per call)
 spread_replay diff --instrument spot --input data/spot_snapshots.jsonl --output data/spot_actions.jsonl

 # replay persisted actions, record trades, expose metrics
 METRICS_PORT=9898 spread_replay replay --spot data/spot_actions.jsonl \
     --perp data/perp_actions.jsonl --itrf data/itrf_actions.jsonl --record out/trades.jsonl
 curl -s localhost:9898/metrics | grep '^trades_total'

 # synthetic session crossing the 11:00 unwind
 STRATEGY=imbalance spread_replay demo --snapshots 5000 --seed 11
*/
/*
=============================================================================
Project : spread_replay: cross-instrument spread backtester in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Rebuilds spot / perp / itrf order books from snapshot diffs,
          replays them in one global time order, trades the spread under a
          leverage cap, unwinds at session end, exposes Prometheus metrics
          and records JSONL events.
=============================================================================
*/
mod book;
mod config;
mod differ;
mod domain;
mod feed;
mod merge;
mod metrics;
mod portfolio;
mod posttrade;
mod recorder;
mod replay;
mod risk;
mod strategy;
mod trader;

use std::fs::File;
use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, Cli, Command};
use crate::domain::{Action, Event, Instrument, RunSummary, Snapshot};
use crate::feed::FeedError;
use crate::merge::ActionMerger;
use crate::portfolio::Portfolio;
use crate::replay::{ReplayEngine, ReplayError};
use crate::trader::SpreadTrader;

type ActionStream = Box<dyn Iterator<Item = Result<Action, FeedError>> + Send>;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("recorder: {0}")]
    Recorder(#[source] std::io::Error),
    #[error("metrics endpoint: {0}")]
    Metrics(#[source] std::io::Error),
    #[error("worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "run failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Command::Diff { instrument, input, output } => {
            let n = tokio::task::spawn_blocking(move || diff_file(instrument, &input, &output)).await??;
            info!(%instrument, actions = n, "diff written");
            Ok(())
        }
        Command::Replay { spot, perp, itrf, snapshots, record } => {
            let args = config::load()?;
            let streams = open_streams([spot, perp, itrf], snapshots)?;
            replay(args, streams, record).await
        }
        Command::Demo { snapshots, seed, record } => {
            let args = config::load()?;
            let session = feed::mock_session(snapshots, seed, feed::MOCK_START_NS, 200_000_000);
            info!(snapshots, seed, "demo: synthetic session from 10:55 UTC");
            replay(args, mock_streams(session), record).await
        }
    }
}

fn diff_file(instrument: Instrument, input: &Path, output: &Path) -> Result<u64, FeedError> {
    let reader = feed::SnapshotReader::new(feed::open(input)?, input.display().to_string());
    let actions = feed::SnapshotDiffer::new(reader, instrument);
    let out_name = output.display().to_string();
    let out = File::create(output).map_err(|source| FeedError::Io { path: out_name.clone(), source })?;
    feed::write_actions(out, actions, &out_name)
}

/// Paths in `Instrument::ALL` order.
fn open_streams(paths: [PathBuf; Instrument::COUNT], snapshots: bool) -> Result<Vec<ActionStream>, FeedError> {
    let mut out: Vec<ActionStream> = Vec::with_capacity(Instrument::COUNT);
    for (inst, path) in Instrument::ALL.into_iter().zip(paths) {
        let name = path.display().to_string();
        let file = feed::open(&path)?;
        if snapshots {
            out.push(Box::new(feed::SnapshotDiffer::new(feed::SnapshotReader::new(file, name), inst)));
        } else {
            out.push(Box::new(feed::ActionReader::new(file, name, Some(inst))));
        }
    }
    Ok(out)
}

fn mock_streams(session: [Vec<Snapshot>; Instrument::COUNT]) -> Vec<ActionStream> {
    Instrument::ALL
        .into_iter()
        .zip(session)
        .map(|(inst, snaps)| {
            let states = snaps.into_iter().enumerate().map(move |(i, s)| {
                feed::validate_snapshot(&s).map_err(|reason| FeedError::MalformedSnapshot {
                    source_name: format!("mock {inst}"),
                    line: i + 1,
                    reason,
                })
            });
            Box::new(feed::SnapshotDiffer::new(states, inst)) as ActionStream
        })
        .collect()
}

async fn replay(args: Args, streams: Vec<ActionStream>, record: Option<PathBuf>) -> Result<(), AppError> {
    // ---- Startup info ----
    info!(
        strategy = args.strategy_mode.as_str(),
        delta_1 = args.delta_1,
        delta_2 = args.delta_2,
        obi = ?args.obi_thresholds,
        initial = ?args.portfolio.initial,
        leverage_limit = args.portfolio.leverage_limit,
        notional_scale = args.portfolio.notional_scale,
        sizing = ?args.portfolio.sizing,
        fee_class = ?args.fee_class,
        unwind_at = %args.replay.unwind_at,
        utc_offset = %args.replay.session_offset,
        strict_liquidity = args.replay.strict_liquidity,
        "startup config"
    );

    // ---- Metrics (optional) ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port).map_err(AppError::Metrics)?;
    }

    let trader = SpreadTrader::new(Portfolio::new(&args.portfolio), args.build_strategy(), args.fee_class);
    let mut engine = ReplayEngine::new(args.replay.clone(), trader);

    // ---- Recorder (optional) ----
    let record = record.or(args.record_file);
    let mut rec_task = None;
    if let Some(path) = record.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        engine = engine.with_events(rec_tx);
        rec_task = Some(tokio::spawn(recorder::run(rec_rx, path)));
    }

    // ---- Replay on a blocking worker; the engine (and its sender) is dropped there ----
    let result = tokio::task::spawn_blocking(move || {
        let merged = ActionMerger::new(streams);
        engine.run(merged)
    })
    .await;

    let recorded = match rec_task {
        Some(task) => Some(task.await),
        None => None,
    };

    let summary: Result<RunSummary, AppError> = match result {
        Ok(Ok(s)) => Ok(s),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    };

    if let (Some(path), Some(rec)) = (record.as_deref(), recorded) {
        let rec = rec.map_err(AppError::from).and_then(|r| r.map_err(AppError::Recorder));
        match (&summary, rec) {
            (Ok(_), Ok(events)) => {
                recorder::commit(path).await.map_err(AppError::Recorder)?;
                info!(events, path = %path.display(), "trade log written");
            }
            (Ok(_), Err(e)) => {
                recorder::discard(path).await.map_err(AppError::Recorder)?;
                return Err(e);
            }
            (Err(_), _) => {
                if let Err(e) = recorder::discard(path).await {
                    warn!(error = %e, "could not remove partial trade log");
                }
            }
        }
    }

    let summary = summary?;
    posttrade::log_summary(&summary, "final portfolio state");
    Ok(())
}
