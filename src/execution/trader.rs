use anyhow::Context;
use chrono::{DateTime, Utc};
use std::future::Future;

use crate::config::RiskConfig;
use crate::execution::gateway::{
    EntryRequest, ExitRequest, GatewayError, MarketData, OrderGateway, PriceStream, StreamEvent,
};
use crate::execution::{
    plan_transition, BarAggregator, BarLength, DecisionPoint, ExecutionAction, ExecutionDecision,
    PositionManager, Reconciliation, TradeReport, TradeReporter,
};
use crate::models::{Bar, Direction, Side, Signal, Tick};
use crate::strategy::Strategy;

/// How a decision cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The broker could not confirm the current position; nothing was decided
    Abandoned,
    /// Not enough history for a signal yet
    NoSignal,
    Decided {
        signal: Signal,
        decision: ExecutionDecision,
        /// The gateway confirmed the order (always false for Skip)
        filled: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub boundary: DateTime<Utc>,
    pub stop_tightened: bool,
    pub outcome: CycleOutcome,
}

/// Counters for a finished streaming session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionSummary {
    pub ticks: u64,
    pub decisions: u64,
}

/// Single-instrument live trading loop
///
/// Owns the bar aggregator, the position and the gateway. Every tick is
/// processed to completion, including any awaited order, before the next one
/// is read, so at most one order is ever in flight.
pub struct Trader<G: OrderGateway> {
    strategy: Box<dyn Strategy>,
    aggregator: BarAggregator,
    positions: PositionManager,
    gateway: G,
    risk: RiskConfig,
    reporter: TradeReporter,
}

impl<G: OrderGateway> Trader<G> {
    /// Create a trader seeded with historical bars
    ///
    /// Bars are retained for the strategy's minimum history plus `retention_margin`.
    pub fn new(
        strategy: Box<dyn Strategy>,
        gateway: G,
        bar_length: BarLength,
        historical: &[Bar],
        risk: RiskConfig,
        retention_margin: usize,
    ) -> Self {
        let retention = strategy.min_bars_required() + retention_margin;
        Self {
            aggregator: BarAggregator::new(bar_length, historical, retention),
            strategy,
            positions: PositionManager::new(),
            gateway,
            risk,
            reporter: TradeReporter,
        }
    }

    pub fn side(&self) -> Side {
        self.positions.side()
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.aggregator.bars()
    }

    /// Feed one tick; runs a decision cycle if it closed a bar
    pub async fn on_tick(&mut self, tick: Tick) -> Option<CycleReport> {
        let point = self.aggregator.on_tick(tick)?;
        Some(self.run_decision_cycle(point).await)
    }

    async fn run_decision_cycle(&mut self, point: DecisionPoint) -> CycleReport {
        let mut report = CycleReport {
            boundary: point.boundary,
            stop_tightened: false,
            outcome: CycleOutcome::Abandoned,
        };

        // Never decide on a guessed position
        let snapshot = match self.gateway.query_open_position().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Error requesting Data: {}", e);
                return report;
            }
        };

        match self.positions.reconcile(snapshot.as_ref()) {
            Reconciliation::ClosedByBroker => {
                tracing::info!("Position closed at broker (stop loss or take profit)");
            }
            Reconciliation::Adopted => {
                tracing::warn!(
                    side = %self.positions.side(),
                    "Adopted open trade reported by broker"
                );
            }
            Reconciliation::Unchanged => {}
        }

        if let Some(snap) = &snapshot {
            tracing::info!("Unrealized Profit in {} position: {:.2}", snap.direction, snap.unrealized_pl);
            report.stop_tightened = self.tighten_stop_if_due(snap.unrealized_pl).await;
        }

        let bars = self.aggregator.bars();
        let signal = match self.strategy.evaluate(&bars) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!("No signal at {}: {}", point.boundary, e);
                report.outcome = CycleOutcome::NoSignal;
                return report;
            }
        };

        let current = self.positions.side();
        let target = self.strategy.target_side(current, &signal);
        let decision = plan_transition(current, target);

        tracing::info!(
            strategy = self.strategy.name(),
            boundary = %point.boundary,
            new_bars = point.new_bars,
            from = %current,
            to = %target,
            "{}",
            decision.reason
        );

        let filled = self.execute(&decision).await;
        report.outcome = CycleOutcome::Decided {
            signal,
            decision,
            filled,
        };
        report
    }

    /// Move the stop to the entry price once profit exceeds the threshold
    async fn tighten_stop_if_due(&mut self, unrealized_pl: f64) -> bool {
        let Some((trade_id, stop_loss_id, price)) = self
            .positions
            .stop_to_tighten(unrealized_pl, self.risk.stop_tighten_threshold)
        else {
            return false;
        };

        match self.gateway.tighten_stop(&trade_id, &stop_loss_id, price).await {
            Ok(change) => {
                self.positions.record_stop_change(&change);
                self.reporter
                    .report(&TradeReport::new(change.time, "CHANGED STOP LOSS", 0, price));
                true
            }
            Err(e) => {
                tracing::error!("Error changing stop loss: {}", e);
                false
            }
        }
    }

    async fn execute(&mut self, decision: &ExecutionDecision) -> bool {
        match decision.action {
            ExecutionAction::Skip => false,
            ExecutionAction::Open {
                direction,
                multiplier,
            } => {
                let Some(quote) = self.aggregator.latest_tick().copied() else {
                    tracing::warn!("No quote available, skipping entry");
                    return false;
                };
                let take_profit = match direction {
                    Direction::Long => quote.ask + self.risk.take_profit_distance,
                    Direction::Short => quote.bid - self.risk.take_profit_distance,
                };
                let request = EntryRequest {
                    direction,
                    multiplier,
                    take_profit,
                    stop_loss_distance: self.risk.stop_loss_distance,
                };

                match self.gateway.open(&request).await {
                    Ok(fill) => {
                        self.positions.record_entry(direction, &fill);
                        self.reporter.report(&TradeReport::new(
                            fill.time,
                            format!("GOING {}", direction),
                            fill.units,
                            fill.price,
                        ));
                        true
                    }
                    Err(e) => {
                        tracing::error!("Error creating Order: {}", e);
                        false
                    }
                }
            }
            ExecutionAction::Flatten {
                closing,
                multiplier,
            } => {
                let request = ExitRequest {
                    closing,
                    multiplier,
                };

                match self.gateway.flatten(&request).await {
                    Ok(fill) => {
                        self.positions.record_exit();
                        self.reporter.report(&TradeReport::new(
                            fill.time,
                            "GOING NEUTRAL",
                            fill.units,
                            fill.price,
                        ));
                        true
                    }
                    Err(e) => {
                        tracing::error!("Error creating Order: {}", e);
                        false
                    }
                }
            }
        }
    }

    /// Consume the price stream until it ends, fails or `shutdown` resolves
    ///
    /// Shutdown is only observed between stream events, never while an order
    /// is awaited. An open position is left in place when the loop stops.
    pub async fn run<S, F>(&mut self, stream: &mut S, shutdown: F) -> Result<SessionSummary, GatewayError>
    where
        S: PriceStream,
        F: Future<Output = ()>,
    {
        let mut summary = SessionSummary::default();
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, leaving price stream");
                    self.log_leftover_position();
                    return Ok(summary);
                }
                event = stream.next_event() => event,
            };

            match event {
                Ok(Some(StreamEvent::Price(tick))) => {
                    summary.ticks += 1;
                    if self.on_tick(tick).await.is_some() {
                        summary.decisions += 1;
                    }
                }
                Ok(Some(StreamEvent::Heartbeat)) => {
                    tracing::trace!("heartbeat");
                }
                Ok(None) => {
                    tracing::warn!("Price stream ended");
                    self.log_leftover_position();
                    return Ok(summary);
                }
                Err(e) => {
                    tracing::error!("Streaming interrupted: {}", e);
                    self.log_leftover_position();
                    return Err(e);
                }
            }
        }
    }

    fn log_leftover_position(&self) {
        if let Some(open) = self.positions.open_position() {
            tracing::warn!(
                trade_id = %open.trade_id,
                "Leaving {} position open at broker",
                open.direction
            );
        }
    }
}

/// Session-level settings derived from the configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub history_days: u32,
    pub bar_length: BarLength,
    pub retention_margin: usize,
    pub risk: RiskConfig,
}

/// Fetch history, then stream and trade until the stream stops or `shutdown` resolves
///
/// A failed or empty history fetch is fatal: the stream is never opened.
pub async fn run_session<M, G, F>(
    market: &M,
    gateway: G,
    strategy: Box<dyn Strategy>,
    settings: &SessionSettings,
    shutdown: F,
) -> anyhow::Result<SessionSummary>
where
    M: MarketData,
    G: OrderGateway,
    F: Future<Output = ()>,
{
    let history = market
        .fetch_history(settings.history_days, settings.bar_length)
        .await
        .inspect_err(|e| tracing::error!("Error retrieving Data: {}", e))
        .context("Error retrieving Data")?;

    if history.is_empty() {
        tracing::error!("Error retrieving Data: no closed bars");
        anyhow::bail!("Error retrieving Data: history contains no closed bars");
    }

    tracing::info!(
        "📈 Loaded {} historical bars (last close {} at {})",
        history.len(),
        history[history.len() - 1].close,
        history[history.len() - 1].timestamp
    );

    let mut trader = Trader::new(
        strategy,
        gateway,
        settings.bar_length,
        &history,
        settings.risk.clone(),
        settings.retention_margin,
    );

    let mut stream = market.open_stream().await.context("Error starting stream")?;
    tracing::info!("🔄 Streaming prices");

    let summary = trader
        .run(&mut stream, shutdown)
        .await
        .context("Streaming interrupted")?;
    Ok(summary)
}
