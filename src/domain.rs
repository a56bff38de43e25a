// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

/// Fixed-point price in ticks (4 decimals, CNYRUB quotes like 13.4925).
pub type Px = i64;
pub const PX_SCALE: f64 = 10_000.0;

#[cfg(test)]
pub fn px_from_f64(px: f64) -> Px { (px * PX_SCALE).round() as Px }
pub fn px_to_f64(px: Px) -> f64 { px as f64 / PX_SCALE }

/// Float scaling noise allowed when checking that a price sits on the tick grid.
const PX_GRID_EPS: f64 = 1e-6;

/// Strict conversion for input prices: finite, on the 4-decimal grid, and at
/// least one tick.
pub fn px_checked(px: f64) -> Result<Px, String> {
    if !px.is_finite() || px <= 0.0 {
        return Err(format!("price must be positive and finite, got {px}"));
    }
    let scaled = px * PX_SCALE;
    let ticks = scaled.round();
    if (scaled - ticks).abs() > PX_GRID_EPS {
        return Err(format!("price {px} has more than 4 decimals"));
    }
    if ticks < 1.0 || ticks > i64::MAX as f64 {
        return Err(format!("price {px} is outside the tick range"));
    }
    Ok(ticks as Px)
}

/// Nanoseconds since the Unix epoch.
pub type TsNs = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument { Spot, Perp, Itrf }

impl Instrument {
    pub const ALL: [Instrument; 3] = [Instrument::Spot, Instrument::Perp, Instrument::Itrf];
    pub const COUNT: usize = 3;

    pub fn idx(self) -> usize { self as usize }

    pub fn as_str(self) -> &'static str {
        match self { Instrument::Spot => "spot", Instrument::Perp => "perp", Instrument::Itrf => "itrf" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Some(Instrument::Spot),
            "perp" => Some(Instrument::Perp),
            "itrf" => Some(Instrument::Itrf),
            _ => None,
        }
    }

    /// Portfolio leg that carries this instrument's position.
    pub fn asset(self) -> Asset {
        match self { Instrument::Spot => Asset::Cny, Instrument::Perp => Asset::Perp, Instrument::Itrf => Asset::Itrf }
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset { Rub, Cny, Itrf, Perp }

impl Asset {
    pub const ALL: [Asset; 4] = [Asset::Rub, Asset::Cny, Asset::Itrf, Asset::Perp];
    pub const COUNT: usize = 4;

    pub fn idx(self) -> usize { self as usize }

    pub fn as_str(self) -> &'static str {
        match self { Asset::Rub => "RUB", Asset::Cny => "CNY", Asset::Itrf => "ITRF", Asset::Perp => "PERP" }
    }

    pub fn is_cash(self) -> bool { matches!(self, Asset::Rub | Asset::Cny) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide { Bid, Ask }

impl BookSide {
    pub fn as_str(self) -> &'static str { match self { BookSide::Bid => "bid", BookSide::Ask => "ask" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind { Add, Remove }

/// One add/remove of volume at a price level. Persisted verbatim as a JSONL row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionKind,
    pub side: BookSide,
    #[serde(with = "px_serde")]
    pub price: Px,
    pub volume: i64,
    pub timestamp: TsNs,
    pub instrument: Instrument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeClass { Maker, Taker }

impl FeeClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maker" => Some(FeeClass::Maker),
            "taker" => Some(FeeClass::Taker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp: TsNs,
    pub buy_market: Instrument,
    pub sell_market: Instrument,
    #[serde(with = "px_serde")]
    pub buy_price: Px,
    #[serde(with = "px_serde")]
    pub sell_price: Px,
    pub size: i64,
    pub fee_class: FeeClass,
}

/// Full-depth snapshot of one instrument at one instant. Levels are (price, volume).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub ts_ns: TsNs,
    pub bids: Vec<(f64, i64)>,
    pub asks: Vec<(f64, i64)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Clamp {
    pub timestamp: TsNs,
    pub instrument: Instrument,
    pub side: BookSide,
    #[serde(with = "px_serde")]
    pub price: Px,
    pub requested: i64,
    pub missing: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub last_ts_ns: TsNs,
    pub actions_applied: u64,
    pub clamped_removes: u64,
    pub evaluations: u64,
    pub trades: u64,
    pub no_liquidity: u64,
    pub no_capital: u64,
    pub balances: Vec<(Asset, f64)>,
    pub valuation: f64,
    pub pnl: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Trade(Trade), Clamp(Clamp), Summary(RunSummary), Note(String) }

/// Prices cross the wire as floats, live in memory as ticks.
pub mod px_serde {
    use super::{px_checked, px_to_f64, Px};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(px: &Px, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(px_to_f64(*px))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Px, D::Error> {
        px_checked(f64::deserialize(d)?).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_schema_uses_plain_field_names() {
        let a = Action {
            action_type: ActionKind::Remove,
            side: BookSide::Ask,
            price: px_from_f64(13.4925),
            volume: 7,
            timestamp: 1_733_300_000_000_000_000,
            instrument: Instrument::Itrf,
        };
        let line = serde_json::to_string(&a).unwrap();
        assert!(line.contains("\"action_type\":\"remove\""));
        assert!(line.contains("\"side\":\"ask\""));
        assert!(line.contains("\"price\":13.4925"));
        assert!(line.contains("\"instrument\":\"itrf\""));
        let back: Action = serde_json::from_str(&line).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let line = r#"{"action_type":"add","side":"bid","price":-1.0,"volume":1,"timestamp":1,"instrument":"spot"}"#;
        assert!(serde_json::from_str::<Action>(line).is_err());
    }

    #[test]
    fn sub_tick_and_off_grid_prices_are_rejected() {
        let row = |px: &str| {
            format!(r#"{{"action_type":"add","side":"bid","price":{px},"volume":1,"timestamp":1,"instrument":"spot"}}"#)
        };
        let tiny = serde_json::from_str::<Action>(&row("0.00001")).unwrap_err();
        assert!(tiny.to_string().contains("more than 4 decimals"));
        assert!(serde_json::from_str::<Action>(&row("7.12345")).is_err());
        assert_eq!(serde_json::from_str::<Action>(&row("0.0001")).unwrap().price, 1);

        assert_eq!(px_checked(13.4925), Ok(134_925));
        assert_eq!(px_checked(7.6), Ok(76_000));
        assert!(px_checked(1e300).is_err());
        assert!(px_checked(0.0).is_err());
    }

    #[test]
    fn instrument_maps_to_its_leg() {
        assert_eq!(Instrument::Spot.asset(), Asset::Cny);
        assert_eq!(Instrument::Perp.asset(), Asset::Perp);
        assert_eq!(Instrument::Itrf.asset(), Asset::Itrf);
        for (i, inst) in Instrument::ALL.iter().enumerate() {
            assert_eq!(inst.idx(), i);
            assert_eq!(Instrument::parse(inst.as_str()), Some(*inst));
        }
    }
}
