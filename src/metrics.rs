// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use crate::book::BookSet;
use crate::domain::{px_to_f64, Instrument};
use crate::portfolio::Portfolio;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Replay --------
pub static ACTIONS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("actions_applied_total", "book actions applied per instrument"),
        &["instrument"],
    )
    .unwrap()
});

pub static CLAMPED_REMOVES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clamped_removes_total", "removes larger than resting volume"),
        &["instrument"],
    )
    .unwrap()
});

pub static EVALUATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("evaluations_total", "strategy / unwind passes").unwrap());

// -------- Execution --------
pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_total", "settled trades (labels: buy, sell)"),
        &["buy", "sell"],
    )
    .unwrap()
});

pub static NO_LIQUIDITY: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("no_liquidity_total", "signals with nothing resting").unwrap());

pub static NO_CAPITAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("no_capital_total", "signals blocked by leverage").unwrap());

// -------- Portfolio & books --------
pub static BALANCE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("balance", "balance per asset"), &["asset"]).unwrap()
});

pub static LEVERAGE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("leverage_ratio", "leveraged / unleveraged balance").unwrap());

pub static BEST_BID: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("best_bid", "best bid per instrument"), &["instrument"]).unwrap()
});

pub static BEST_ASK: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("best_ask", "best ask per instrument"), &["instrument"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(ACTIONS_APPLIED.clone())),
        REGISTRY.register(Box::new(CLAMPED_REMOVES.clone())),
        REGISTRY.register(Box::new(EVALUATIONS.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(NO_LIQUIDITY.clone())),
        REGISTRY.register(Box::new(NO_CAPITAL.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(LEVERAGE.clone())),
        REGISTRY.register(Box::new(BEST_BID.clone())),
        REGISTRY.register(Box::new(BEST_ASK.clone())),
    ] {
        let _ = m;
    }
}

/// Refresh the gauges from current state. Missing quotes leave the last value.
pub fn observe(books: &BookSet, portfolio: &Portfolio) {
    for inst in Instrument::ALL {
        if let Some(px) = books.best_bid(inst) {
            BEST_BID.with_label_values(&[inst.as_str()]).set(px_to_f64(px));
        }
        if let Some(px) = books.best_ask(inst) {
            BEST_ASK.with_label_values(&[inst.as_str()]).set(px_to_f64(px));
        }
    }
    for (asset, bal) in portfolio.balances() {
        BALANCE.with_label_values(&[asset.as_str()]).set(bal);
    }
    if let Some(r) = portfolio.leverage_ratio() {
        LEVERAGE.set(r);
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics); tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Bind now, serve on a dedicated OS thread (keeps the replay worker clean).
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    tracing::info!(%addr, "metrics listening (/ and /metrics)");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(%e, "metrics accept error"),
            }
        }
    });
    Ok(())
}
