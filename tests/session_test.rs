use chrono::{DateTime, Duration, TimeZone, Utc};
use fxtrader::config::RiskConfig;
use fxtrader::execution::{
    run_session, BarLength, CycleOutcome, EntryFill, EntryRequest, ExecutionAction, ExitFill,
    ExitRequest, GatewayError, MarketData, OrderGateway, PositionSnapshot, PriceStream,
    SessionSettings, StopChange, StreamEvent, Trader,
};
use fxtrader::models::{Bar, Direction, Side, Signal, Tick};
use fxtrader::strategy::{
    BollingerConfig, BollingerStrategy, Classifier, ProbabilityConfig, ProbabilityStrategy, Strategy,
};
use std::collections::VecDeque;
use std::future::{pending, ready};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const UNITS: i64 = 30_000;

// ============================================================================
// In-memory broker
// ============================================================================

#[derive(Default)]
struct BrokerState {
    position: Option<PositionSnapshot>,
    unrealized_pl: f64,
    opens: Vec<EntryRequest>,
    flattens: Vec<ExitRequest>,
    stop_changes: Vec<(String, String, f64)>,
    queries: usize,
    fail_queries: bool,
    fail_orders: bool,
    fail_stops: bool,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

#[derive(Clone, Default)]
struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    fn with_position(direction: Direction, unrealized_pl: f64) -> Self {
        let broker = Self::default();
        {
            let mut state = broker.state.lock().unwrap();
            state.position = Some(PositionSnapshot {
                direction,
                trade_id: "42".to_string(),
                stop_loss_id: Some("44".to_string()),
                take_profit_id: Some("43".to_string()),
                price: 1.1,
                unrealized_pl,
            });
            state.unrealized_pl = unrealized_pl;
        }
        broker
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }
}

fn fill_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
}

impl OrderGateway for MockBroker {
    async fn open(&self, request: &EntryRequest) -> Result<EntryFill, GatewayError> {
        let mut state = self.state();
        if state.fail_orders {
            return Err(GatewayError::Rejected("MARKET_HALTED".to_string()));
        }
        state.opens.push(request.clone());

        let trade_id = state.next_id();
        let take_profit_id = state.next_id();
        let stop_loss_id = state.next_id();
        let pl = state.unrealized_pl;
        state.position = Some(PositionSnapshot {
            direction: request.direction,
            trade_id: trade_id.clone(),
            stop_loss_id: Some(stop_loss_id.clone()),
            take_profit_id: Some(take_profit_id.clone()),
            price: 1.25,
            unrealized_pl: pl,
        });

        Ok(EntryFill {
            trade_id,
            take_profit_id,
            stop_loss_id,
            price: 1.25,
            time: fill_time(),
            units: request.direction.sign() * i64::from(request.multiplier) * UNITS,
        })
    }

    async fn flatten(&self, request: &ExitRequest) -> Result<ExitFill, GatewayError> {
        let mut state = self.state();
        if state.fail_orders {
            return Err(GatewayError::Rejected("MARKET_HALTED".to_string()));
        }
        state.flattens.push(request.clone());
        state.position = None;

        Ok(ExitFill {
            price: 1.25,
            time: fill_time(),
            units: -request.closing.sign() * UNITS,
        })
    }

    async fn tighten_stop(
        &self,
        trade_id: &str,
        stop_loss_id: &str,
        price: f64,
    ) -> Result<StopChange, GatewayError> {
        let mut state = self.state();
        if state.fail_stops {
            return Err(GatewayError::Broker {
                status: 404,
                message: "order does not exist".to_string(),
            });
        }
        state
            .stop_changes
            .push((trade_id.to_string(), stop_loss_id.to_string(), price));

        let order_id = format!("SL-{}", state.next_id());
        if let Some(position) = state.position.as_mut() {
            position.stop_loss_id = Some(order_id.clone());
        }

        Ok(StopChange {
            order_id,
            time: fill_time(),
        })
    }

    async fn query_open_position(&self) -> Result<Option<PositionSnapshot>, GatewayError> {
        let mut state = self.state();
        state.queries += 1;
        if state.fail_queries {
            return Err(GatewayError::Broker {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        Ok(state.position.clone())
    }
}

// ============================================================================
// In-memory market data
// ============================================================================

struct VecStream {
    events: VecDeque<StreamEvent>,
    fail_at_end: bool,
}

impl PriceStream for VecStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, GatewayError> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if self.fail_at_end => Err(GatewayError::StreamClosed),
            None => Ok(None),
        }
    }
}

struct MockMarket {
    /// `None` simulates a failed history request
    history: Option<Vec<Bar>>,
    events: Mutex<Vec<StreamEvent>>,
    fail_at_end: bool,
    stream_opened: AtomicBool,
}

impl MockMarket {
    fn new(history: Option<Vec<Bar>>, events: Vec<StreamEvent>) -> Self {
        Self {
            history,
            events: Mutex::new(events),
            fail_at_end: false,
            stream_opened: AtomicBool::new(false),
        }
    }
}

impl MarketData for MockMarket {
    type Stream = VecStream;

    async fn fetch_history(&self, _days: u32, _bar_length: BarLength) -> Result<Vec<Bar>, GatewayError> {
        self.history.clone().ok_or(GatewayError::Broker {
            status: 500,
            message: "candles unavailable".to_string(),
        })
    }

    async fn open_stream(&self) -> Result<VecStream, GatewayError> {
        self.stream_opened.store(true, Ordering::SeqCst);
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        Ok(VecStream {
            events: events.into(),
            fail_at_end: self.fail_at_end,
        })
    }
}

// ============================================================================
// Strategies and data helpers
// ============================================================================

/// Probabilities handed out in order, then 0.5
struct SequenceClassifier {
    values: Mutex<VecDeque<f64>>,
}

impl SequenceClassifier {
    fn new(values: &[f64]) -> Self {
        Self {
            values: Mutex::new(values.iter().copied().collect()),
        }
    }
}

impl Classifier for SequenceClassifier {
    fn predict(&self, _features: &[f64]) -> fxtrader::Result<f64> {
        Ok(self.values.lock().unwrap().pop_front().unwrap_or(0.5))
    }
}

/// Never changes side
struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn evaluate(&self, _bars: &[Bar]) -> fxtrader::Result<Signal> {
        Ok(Signal::Probability(0.5))
    }

    fn target_side(&self, current: Side, _signal: &Signal) -> Side {
        current
    }

    fn name(&self) -> &str {
        "Hold"
    }

    fn min_bars_required(&self) -> usize {
        1
    }
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, second).unwrap()
}

fn tick(time: DateTime<Utc>, mid: f64) -> Tick {
    Tick::new(time, mid - 0.0001, mid + 0.0001)
}

fn fifteen_minutes() -> BarLength {
    BarLength::from_minutes(15).unwrap()
}

/// Bars ending at 01:00, one per 15 minutes
fn history_ending_at_one(closes: &[f64]) -> Vec<Bar> {
    let last = at(1, 0, 0);
    let n = closes.len() as i64;
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Bar::new(last - Duration::minutes(15 * (n - 1 - i as i64)), c))
        .collect()
}

/// Flat history followed by a close far above the band
fn spike_history() -> Vec<Bar> {
    history_ending_at_one(&[1.0, 1.0, 1.0, 1.3])
}

fn bollinger() -> Box<dyn Strategy> {
    Box::new(BollingerStrategy::new(BollingerConfig {
        sma_window: 3,
        band_width: 1.0,
    }))
}

fn wave(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 1.10 + 0.002 * ((i as f64) / 5.0).sin() + 0.0001 * (i % 7) as f64)
        .collect()
}

fn settings() -> SessionSettings {
    SessionSettings {
        history_days: 5,
        bar_length: fifteen_minutes(),
        retention_margin: 10,
        risk: RiskConfig::default(),
    }
}

fn trader(strategy: Box<dyn Strategy>, broker: &MockBroker, history: &[Bar]) -> Trader<MockBroker> {
    Trader::new(
        strategy,
        broker.clone(),
        fifteen_minutes(),
        history,
        RiskConfig::default(),
        10,
    )
}

// ============================================================================
// Decision cycles
// ============================================================================

#[tokio::test]
async fn test_bollinger_short_entry_after_band_reversion() {
    let broker = MockBroker::default();
    let mut trader = trader(bollinger(), &broker, &spike_history());

    assert!(trader.on_tick(tick(at(1, 5, 0), 1.25)).await.is_none());
    assert!(trader.on_tick(tick(at(1, 10, 0), 1.25)).await.is_none());

    let report = trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();
    assert_eq!(report.boundary, at(1, 15, 0));

    let CycleOutcome::Decided { signal, decision, filled } = report.outcome else {
        panic!("expected a decision, got {:?}", report.outcome);
    };
    assert!(matches!(signal, Signal::Bands(_)));
    assert_eq!(
        decision.action,
        ExecutionAction::Open {
            direction: Direction::Short,
            multiplier: 1
        }
    );
    assert!(filled);

    let state = broker.state();
    assert_eq!(state.opens.len(), 1);
    let request = &state.opens[0];
    assert_eq!(request.direction, Direction::Short);
    assert_eq!(request.multiplier, 1);
    // Short take profit is measured from the bid
    assert!((request.take_profit - (1.2499 - 0.0022)).abs() < 1e-9);
    assert!((request.stop_loss_distance - 0.0013).abs() < 1e-12);
    drop(state);

    assert_eq!(trader.side(), Side::Short);
    let open = trader.positions().open_position().unwrap();
    assert_eq!(open.trade_id, "1");
    assert_eq!(open.take_profit_id.as_deref(), Some("2"));
    assert_eq!(open.stop_loss_id.as_deref(), Some("3"));
    assert!(!open.sl_changed);
}

#[tokio::test]
async fn test_one_decision_per_closed_bar() {
    let broker = MockBroker::default();
    let mut trader = trader(Box::new(HoldStrategy), &broker, &spike_history());

    let mut decisions = 0;
    for (minute, second) in [(1, 0), (5, 0), (16, 0), (17, 30), (20, 0), (29, 59)] {
        if trader.on_tick(tick(at(1, minute, second), 1.25)).await.is_some() {
            decisions += 1;
        }
    }

    assert_eq!(decisions, 1);
    assert_eq!(broker.state().queries, 1);
}

#[tokio::test]
async fn test_gap_closes_several_bars_in_one_decision() {
    let broker = MockBroker::default();
    let history = spike_history();
    let mut trader = trader(Box::new(HoldStrategy), &broker, &history);

    assert!(trader.on_tick(tick(at(1, 5, 0), 1.25)).await.is_none());
    let report = trader.on_tick(tick(at(2, 5, 0), 1.26)).await.unwrap();

    // 01:15, 01:30, 01:45 and 02:00 close together; gaps carry the last close
    assert_eq!(report.boundary, at(2, 0, 0));
    let bars = trader.bars();
    assert_eq!(bars.len(), history.len() + 4);
    assert!(bars[history.len()..].iter().all(|b| b.close == 1.25));
    assert_eq!(broker.state().queries, 1);
}

#[tokio::test]
async fn test_probability_reversal_doubles_units() {
    let broker = MockBroker::default();
    let strategy = ProbabilityStrategy::new(
        ProbabilityConfig {
            window: 10,
            lags: 1,
            long_threshold: 0.53,
            short_threshold: 0.47,
            model_path: PathBuf::from("unused.json"),
        },
        Box::new(SequenceClassifier::new(&[0.40, 0.55])),
    );
    let history = history_ending_at_one(&wave(160));
    let mut trader = trader(Box::new(strategy), &broker, &history);

    trader.on_tick(tick(at(1, 5, 0), 1.1010)).await;
    trader.on_tick(tick(at(1, 16, 0), 1.1012)).await.unwrap();
    assert_eq!(trader.side(), Side::Short);

    let report = trader.on_tick(tick(at(1, 31, 0), 1.1015)).await.unwrap();
    let CycleOutcome::Decided { decision, filled, .. } = report.outcome else {
        panic!("expected a decision");
    };
    assert_eq!(
        decision.action,
        ExecutionAction::Open {
            direction: Direction::Long,
            multiplier: 2
        }
    );
    assert!(filled);

    let state = broker.state();
    let sizes: Vec<(Direction, u32)> = state.opens.iter().map(|r| (r.direction, r.multiplier)).collect();
    assert_eq!(sizes, vec![(Direction::Short, 1), (Direction::Long, 2)]);
    assert!(state.flattens.is_empty());
    // Long take profit is measured from the ask
    assert!((state.opens[1].take_profit - (1.1016 + 0.0022)).abs() < 1e-9);
    drop(state);

    assert_eq!(trader.side(), Side::Long);
    assert_eq!(trader.positions().open_position().unwrap().trade_id, "4");
}

#[tokio::test]
async fn test_probability_without_enough_history_has_no_signal() {
    let broker = MockBroker::default();
    let strategy = ProbabilityStrategy::new(
        ProbabilityConfig {
            window: 10,
            lags: 1,
            long_threshold: 0.53,
            short_threshold: 0.47,
            model_path: PathBuf::from("unused.json"),
        },
        Box::new(SequenceClassifier::new(&[0.9])),
    );
    let history = history_ending_at_one(&wave(20));
    let mut trader = trader(Box::new(strategy), &broker, &history);

    trader.on_tick(tick(at(1, 5, 0), 1.1010)).await;
    let report = trader.on_tick(tick(at(1, 16, 0), 1.1012)).await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::NoSignal);
    assert!(broker.state().opens.is_empty());
}

#[tokio::test]
async fn test_stop_tightened_once_above_threshold() {
    let broker = MockBroker::with_position(Direction::Long, 25.0);
    let mut trader = trader(Box::new(HoldStrategy), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    let first = trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();
    assert!(first.stop_tightened);

    broker.state().position.as_mut().unwrap().unrealized_pl = 30.0;
    let second = trader.on_tick(tick(at(1, 31, 0), 1.25)).await.unwrap();
    assert!(!second.stop_tightened);

    let state = broker.state();
    assert_eq!(
        state.stop_changes,
        vec![("42".to_string(), "44".to_string(), 1.1)]
    );
    drop(state);

    let open = trader.positions().open_position().unwrap();
    assert_eq!(open.direction, Direction::Long);
    assert!(open.sl_changed);
    assert_eq!(open.stop_loss_id.as_deref(), Some("SL-1"));
}

#[tokio::test]
async fn test_stop_kept_below_threshold() {
    let broker = MockBroker::with_position(Direction::Long, 20.0);
    let mut trader = trader(Box::new(HoldStrategy), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    let report = trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();

    assert!(!report.stop_tightened);
    assert!(broker.state().stop_changes.is_empty());
    assert_eq!(trader.side(), Side::Long);
}

#[tokio::test]
async fn test_position_closed_by_broker_is_cleared() {
    let broker = MockBroker::with_position(Direction::Short, 0.0);
    let mut trader = trader(Box::new(HoldStrategy), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();
    assert_eq!(trader.side(), Side::Short);

    // Take profit filled at the broker
    broker.state().position = None;
    trader.on_tick(tick(at(1, 31, 0), 1.25)).await.unwrap();
    assert_eq!(trader.side(), Side::Flat);
}

#[tokio::test]
async fn test_rejected_order_leaves_position_unchanged() {
    let broker = MockBroker::default();
    broker.state().fail_orders = true;
    let mut trader = trader(bollinger(), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    let report = trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();

    let CycleOutcome::Decided { decision, filled, .. } = report.outcome else {
        panic!("expected a decision");
    };
    assert!(matches!(decision.action, ExecutionAction::Open { .. }));
    assert!(!filled);
    assert_eq!(trader.side(), Side::Flat);
    assert!(trader.positions().open_position().is_none());
}

#[tokio::test]
async fn test_failed_position_query_abandons_cycle() {
    let broker = MockBroker::default();
    broker.state().fail_queries = true;
    let mut trader = trader(bollinger(), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    let report = trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Abandoned);
    assert!(broker.state().opens.is_empty());
    assert_eq!(trader.side(), Side::Flat);
}

#[tokio::test]
async fn test_short_flattens_after_crossing_back_under_average() {
    let broker = MockBroker::with_position(Direction::Short, 0.0);
    let mut trader = trader(bollinger(), &broker, &spike_history());

    // Closes 1.0, 1.3, 1.0: below the 1.10 average, above the 0.927 lower band
    trader.on_tick(tick(at(1, 5, 0), 1.0)).await;
    let report = trader.on_tick(tick(at(1, 16, 0), 1.0)).await.unwrap();

    let CycleOutcome::Decided { decision, filled, .. } = report.outcome else {
        panic!("expected a decision, got {:?}", report.outcome);
    };
    assert_eq!(
        decision.action,
        ExecutionAction::Flatten {
            closing: Direction::Short,
            multiplier: 1
        }
    );
    assert!(filled);

    let state = broker.state();
    assert_eq!(
        state.flattens,
        vec![ExitRequest {
            closing: Direction::Short,
            multiplier: 1
        }]
    );
    assert!(state.opens.is_empty());
    drop(state);

    assert_eq!(trader.side(), Side::Flat);
    assert!(trader.positions().open_position().is_none());
}

#[tokio::test]
async fn test_failed_flatten_keeps_position() {
    let broker = MockBroker::with_position(Direction::Short, 0.0);
    broker.state().fail_orders = true;
    let mut trader = trader(bollinger(), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.0)).await;
    let report = trader.on_tick(tick(at(1, 16, 0), 1.0)).await.unwrap();

    let CycleOutcome::Decided { decision, filled, .. } = report.outcome else {
        panic!("expected a decision");
    };
    assert!(matches!(decision.action, ExecutionAction::Flatten { .. }));
    assert!(!filled);

    assert_eq!(trader.side(), Side::Short);
    let open = trader.positions().open_position().unwrap();
    assert_eq!(open.trade_id, "42");
    assert!(broker.state().position.is_some());
}

#[tokio::test]
async fn test_failed_stop_change_is_retried_next_bar() {
    let broker = MockBroker::with_position(Direction::Long, 25.0);
    broker.state().fail_stops = true;
    let mut trader = trader(Box::new(HoldStrategy), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    let first = trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();
    assert!(!first.stop_tightened);
    let open = trader.positions().open_position().unwrap();
    assert!(!open.sl_changed);
    assert_eq!(open.stop_loss_id.as_deref(), Some("44"));

    broker.state().fail_stops = false;
    let second = trader.on_tick(tick(at(1, 31, 0), 1.25)).await.unwrap();
    assert!(second.stop_tightened);

    let third = trader.on_tick(tick(at(1, 46, 0), 1.25)).await.unwrap();
    assert!(!third.stop_tightened);

    assert_eq!(broker.state().stop_changes.len(), 1);
    assert!(trader.positions().open_position().unwrap().sl_changed);
}

#[tokio::test]
async fn test_known_trade_picks_up_broker_stop_id() {
    let broker = MockBroker::with_position(Direction::Long, 0.0);
    let mut trader = trader(Box::new(HoldStrategy), &broker, &spike_history());

    trader.on_tick(tick(at(1, 5, 0), 1.25)).await;
    trader.on_tick(tick(at(1, 16, 0), 1.25)).await.unwrap();

    // Stop replaced outside this process
    {
        let mut state = broker.state();
        let position = state.position.as_mut().unwrap();
        position.stop_loss_id = Some("77".to_string());
        position.unrealized_pl = 25.0;
    }
    let report = trader.on_tick(tick(at(1, 31, 0), 1.25)).await.unwrap();

    assert!(report.stop_tightened);
    assert_eq!(
        broker.state().stop_changes,
        vec![("42".to_string(), "77".to_string(), 1.1)]
    );
}

// ============================================================================
// Sessions
// ============================================================================

fn spike_stream() -> Vec<StreamEvent> {
    vec![
        StreamEvent::Heartbeat,
        StreamEvent::Price(tick(at(1, 5, 0), 1.25)),
        StreamEvent::Heartbeat,
        StreamEvent::Price(tick(at(1, 16, 0), 1.25)),
        StreamEvent::Price(tick(at(1, 20, 0), 1.25)),
    ]
}

#[tokio::test]
async fn test_session_trades_from_stream() {
    let market = MockMarket::new(Some(spike_history()), spike_stream());
    let broker = MockBroker::default();

    let summary = run_session(&market, broker.clone(), bollinger(), &settings(), pending())
        .await
        .unwrap();

    assert_eq!(summary.ticks, 3);
    assert_eq!(summary.decisions, 1);
    assert_eq!(broker.state().opens.len(), 1);
}

#[tokio::test]
async fn test_session_stream_error_leaves_position_open() {
    let mut market = MockMarket::new(Some(spike_history()), spike_stream());
    market.fail_at_end = true;
    let broker = MockBroker::default();

    let result = run_session(&market, broker.clone(), bollinger(), &settings(), pending()).await;

    assert!(result.is_err());
    let state = broker.state();
    assert_eq!(state.opens.len(), 1);
    assert!(state.flattens.is_empty());
    assert!(state.position.is_some());
}

#[tokio::test]
async fn test_history_failure_never_opens_stream() {
    let market = MockMarket::new(None, spike_stream());
    let broker = MockBroker::default();

    let result = run_session(&market, broker.clone(), bollinger(), &settings(), pending()).await;

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("Error retrieving Data"));
    assert!(!market.stream_opened.load(Ordering::SeqCst));
    assert_eq!(broker.state().queries, 0);
}

#[tokio::test]
async fn test_empty_history_never_opens_stream() {
    let market = MockMarket::new(Some(Vec::new()), spike_stream());

    let result = run_session(&market, MockBroker::default(), bollinger(), &settings(), pending()).await;

    assert!(result.is_err());
    assert!(!market.stream_opened.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_shutdown_stops_before_next_event() {
    let market = MockMarket::new(Some(spike_history()), spike_stream());
    let broker = MockBroker::default();

    let summary = run_session(&market, broker.clone(), bollinger(), &settings(), ready(()))
        .await
        .unwrap();

    assert!(market.stream_opened.load(Ordering::SeqCst));
    assert_eq!(summary.ticks, 0);
    assert_eq!(summary.decisions, 0);
    assert!(broker.state().opens.is_empty());
}
