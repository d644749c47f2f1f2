//! Broker-facing boundary of the trading loop.
//!
//! The trader only depends on these request/response values; the OANDA client
//! in `api::oanda` is one implementation, the tests use in-memory ones.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::execution::BarLength;
use crate::models::{Bar, Direction, Tick};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broker returned {status}: {message}")]
    Broker { status: u16, message: String },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("stream closed")]
    StreamClosed,
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}

/// Market order opening (or reversing into) a position
///
/// Entries always carry both protective orders.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub direction: Direction,
    /// 1 from flat, 2 when reversing through an opposite position
    pub multiplier: u32,
    pub take_profit: f64,
    pub stop_loss_distance: f64,
}

/// Market order closing the open position, without protective orders
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRequest {
    /// Direction of the position being closed
    pub closing: Direction,
    pub multiplier: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryFill {
    pub trade_id: String,
    pub take_profit_id: String,
    pub stop_loss_id: String,
    pub price: f64,
    pub time: DateTime<Utc>,
    pub units: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitFill {
    pub price: f64,
    pub time: DateTime<Utc>,
    pub units: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopChange {
    /// Id of the replacement stop-loss order
    pub order_id: String,
    pub time: DateTime<Utc>,
}

/// The broker's open trade on the instrument
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub direction: Direction,
    pub trade_id: String,
    pub stop_loss_id: Option<String>,
    pub take_profit_id: Option<String>,
    pub price: f64,
    pub unrealized_pl: f64,
}

/// Order execution against the broker
#[allow(async_fn_in_trait)]
pub trait OrderGateway {
    async fn open(&self, request: &EntryRequest) -> Result<EntryFill, GatewayError>;

    async fn flatten(&self, request: &ExitRequest) -> Result<ExitFill, GatewayError>;

    async fn tighten_stop(
        &self,
        trade_id: &str,
        stop_loss_id: &str,
        price: f64,
    ) -> Result<StopChange, GatewayError>;

    /// `Ok(None)` means the account is flat; errors never mean flat
    async fn query_open_position(&self) -> Result<Option<PositionSnapshot>, GatewayError>;
}

/// One message of the live price stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Heartbeat,
    Price(Tick),
}

/// Live price stream; `Ok(None)` is a clean end of stream
#[allow(async_fn_in_trait)]
pub trait PriceStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, GatewayError>;
}

/// Historical data and stream subscription for one instrument
#[allow(async_fn_in_trait)]
pub trait MarketData {
    type Stream: PriceStream;

    /// Closed bars of `bar_length` covering the last `days` days
    async fn fetch_history(&self, days: u32, bar_length: BarLength) -> Result<Vec<Bar>, GatewayError>;

    async fn open_stream(&self) -> Result<Self::Stream, GatewayError>;
}
