use crate::models::Tick;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// In-memory buffer of raw ticks feeding the bar aggregator
///
/// Only ticks of the still-open bar window are needed, plus the last tick of
/// the most recently closed window (used to forward-fill empty windows).
/// `compact` enforces that after every bar close; `max_ticks` is a hard cap on
/// top of it for pathological streams.
pub struct TickBuffer {
    ticks: VecDeque<Tick>,
    max_ticks: usize,
}

impl TickBuffer {
    /// Create a new tick buffer
    ///
    /// # Arguments
    /// * `max_ticks` - Maximum number of ticks to keep
    pub fn new(max_ticks: usize) -> Self {
        Self {
            ticks: VecDeque::new(),
            max_ticks: max_ticks.max(2),
        }
    }

    /// Append a tick; the stream delivers them in time order
    pub fn ingest(&mut self, tick: Tick) {
        self.ticks.push_back(tick);

        while self.ticks.len() > self.max_ticks {
            self.ticks.pop_front();
        }
    }

    /// Drop ticks older than `cutoff`, keeping the latest one before it
    pub fn compact(&mut self, cutoff: DateTime<Utc>) {
        let first_kept = self.ticks.iter().position(|t| t.time >= cutoff).unwrap_or(self.ticks.len());
        let drop = first_kept.saturating_sub(1);
        self.ticks.drain(..drop);
    }

    pub fn ticks(&self) -> impl Iterator<Item = &Tick> {
        self.ticks.iter()
    }

    pub fn latest(&self) -> Option<&Tick> {
        self.ticks.back()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}
