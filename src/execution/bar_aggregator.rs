use crate::execution::TickBuffer;
use crate::models::{Bar, Tick};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Hard cap on buffered ticks; compaction normally keeps far fewer
const MAX_BUFFERED_TICKS: usize = 100_000;

/// Fixed bar width, aligned to the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarLength {
    seconds: i64,
}

impl BarLength {
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::from_seconds(i64::from(minutes) * 60)
    }

    pub fn from_seconds(seconds: i64) -> Option<Self> {
        (seconds > 0).then_some(Self { seconds })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    /// Closing boundary of the window `[start, start + len)` containing `time`
    pub fn boundary(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let start = time.timestamp().div_euclid(self.seconds) * self.seconds;
        DateTime::from_timestamp(start + self.seconds, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// How windows without any price point are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapFill {
    /// Skip empty windows
    None,
    /// Repeat the previous close
    Forward,
}

/// Resample time-ordered price points into closed bars
///
/// Each bar is labelled by its closing boundary and closes at the last price
/// of its window. The window holding the latest point is still open and is
/// never emitted. Out-of-order points are ignored.
pub fn resample<I>(points: I, bar_length: BarLength, fill: GapFill) -> Vec<Bar>
where
    I: IntoIterator<Item = (DateTime<Utc>, f64)>,
{
    let step = bar_length.duration();
    let mut bars = Vec::new();
    let mut open: Option<(DateTime<Utc>, f64)> = None;

    for (time, price) in points {
        let boundary = bar_length.boundary(time);

        match open {
            Some((open_boundary, _)) if boundary < open_boundary => continue,
            Some((open_boundary, close)) if boundary > open_boundary => {
                bars.push(Bar::new(open_boundary, close));

                if fill == GapFill::Forward {
                    let mut gap = open_boundary + step;
                    while gap < boundary {
                        bars.push(Bar::new(gap, close));
                        gap += step;
                    }
                }
            }
            _ => {}
        }

        open = Some((boundary, price));
    }

    bars
}

fn extends(last: Option<&Bar>, bar: &Bar) -> bool {
    last.map_or(true, |last| bar.timestamp > last.timestamp)
}

/// Historical bars followed by the live bars strictly after them
pub fn join(historical: &[Bar], live: &[Bar]) -> Vec<Bar> {
    let mut joined: Vec<Bar> = Vec::with_capacity(historical.len() + live.len());
    for bar in historical.iter().chain(live) {
        if extends(joined.last(), bar) {
            joined.push(*bar);
        }
    }
    joined
}

/// Bounded, strictly increasing series of closed bars
pub struct BarSeries {
    bars: VecDeque<Bar>,
    capacity: usize,
    closed_count: u64,
}

impl BarSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::new(),
            capacity: capacity.max(2),
            closed_count: 0,
        }
    }

    pub fn from_historical(historical: &[Bar], capacity: usize) -> Self {
        let mut series = Self::new(capacity);
        series.append(&join(historical, &[]));
        series
    }

    /// Append bars newer than the last boundary; returns how many were added
    pub fn append(&mut self, bars: &[Bar]) -> usize {
        let mut added = 0;
        for bar in bars {
            if extends(self.bars.back(), bar) {
                self.bars.push_back(*bar);
                added += 1;
            }
        }

        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }

        self.closed_count += added as u64;
        added
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.bars.iter().copied().collect()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Total bars ever appended, unaffected by retention
    pub fn closed_count(&self) -> u64 {
        self.closed_count
    }
}

/// A newly closed bar, ready for signal evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPoint {
    pub boundary: DateTime<Utc>,
    /// Bars closed since the previous decision point
    pub new_bars: u64,
}

/// Turns the tick stream into decision points, one per bar close
pub struct BarAggregator {
    bar_length: BarLength,
    ticks: TickBuffer,
    series: BarSeries,
    decided_through: u64,
}

impl BarAggregator {
    pub fn new(bar_length: BarLength, historical: &[Bar], retention: usize) -> Self {
        let series = BarSeries::from_historical(historical, retention);
        let decided_through = series.closed_count();

        Self {
            bar_length,
            ticks: TickBuffer::new(MAX_BUFFERED_TICKS),
            series,
            decided_through,
        }
    }

    /// Ingest a tick; returns a decision point only when a new bar closed
    pub fn on_tick(&mut self, tick: Tick) -> Option<DecisionPoint> {
        self.ticks.ingest(tick);

        let live = resample(
            self.ticks.ticks().map(|t| (t.time, t.mid())),
            self.bar_length,
            GapFill::Forward,
        );
        let last_closed = live.last()?.timestamp;

        let added = self.series.append(&live);
        self.ticks.compact(last_closed);

        if added > 0 {
            tracing::debug!(
                boundary = %last_closed,
                added,
                total = self.series.closed_count(),
                "Bar closed"
            );
        }

        let closed = self.series.closed_count();
        if closed > self.decided_through {
            let new_bars = closed - self.decided_through;
            self.decided_through = closed;
            let boundary = self.series.last()?.timestamp;
            return Some(DecisionPoint { boundary, new_bars });
        }

        None
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.series.bars()
    }

    pub fn latest_tick(&self) -> Option<&Tick> {
        self.ticks.latest()
    }
}
