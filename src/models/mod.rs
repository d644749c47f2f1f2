use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single price update from the broker stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
}

impl Tick {
    pub fn new(time: DateTime<Utc>, bid: f64, ask: f64) -> Self {
        Self { time, bid, ask }
    }

    /// Mid price: (ask + bid) / 2
    pub fn mid(&self) -> f64 {
        (self.ask + self.bid) / 2.0
    }
}

/// Closed bar, identified by its closing boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

impl Bar {
    pub fn new(timestamp: DateTime<Utc>, close: f64) -> Self {
        Self { timestamp, close }
    }
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Sign applied to order units (+1 buys, -1 sells)
    pub fn sign(self) -> i64 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Position state of the single traded instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Flat,
    Long,
    Short,
}

impl Side {
    pub fn direction(self) -> Option<Direction> {
        match self {
            Side::Flat => None,
            Side::Long => Some(Direction::Long),
            Side::Short => Some(Direction::Short),
        }
    }
}

impl From<Direction> for Side {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Long => Side::Long,
            Direction::Short => Side::Short,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Flat => write!(f, "NEUTRAL"),
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Band relation of the latest two bars
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandSnapshot {
    pub close: f64,
    pub sma: f64,
    pub upper: f64,
    pub lower: f64,
    pub prev_close: f64,
    pub prev_upper: f64,
    pub prev_lower: f64,
    /// Log return of the latest bar
    pub last_return: f64,
}

/// Trading signal derived from the closed-bar series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    Bands(BandSnapshot),
    Probability(f64),
}

/// The single open position and every broker reference attached to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub direction: Direction,
    pub trade_id: String,
    pub stop_loss_id: Option<String>,
    pub take_profit_id: Option<String>,
    pub fill_price: f64,
    pub fill_time: Option<DateTime<Utc>>,
    /// Set once the stop-loss has been tightened during this position's lifetime
    pub sl_changed: bool,
}
