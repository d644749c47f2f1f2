// Tick ingestion, bar aggregation, position state and order execution
pub mod bar_aggregator;
pub mod executor;
pub mod gateway;
pub mod position_manager;
pub mod reporter;
pub mod tick_buffer;
pub mod trader;

pub use bar_aggregator::{join, resample, BarAggregator, BarLength, BarSeries, DecisionPoint, GapFill};
pub use executor::{plan_transition, ExecutionAction, ExecutionDecision};
pub use gateway::{
    EntryFill, EntryRequest, ExitFill, ExitRequest, GatewayError, MarketData, OrderGateway,
    PositionSnapshot, PriceStream, StopChange, StreamEvent,
};
pub use position_manager::{PositionManager, Reconciliation};
pub use reporter::{TradeReport, TradeReporter};
pub use tick_buffer::TickBuffer;
pub use trader::{run_session, CycleOutcome, CycleReport, SessionSettings, SessionSummary, Trader};
