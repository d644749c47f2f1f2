// Trading strategy module
pub mod bollinger;
pub mod features;
pub mod probability;

pub use bollinger::{BollingerConfig, BollingerStrategy};
pub use probability::{Classifier, LogisticModel, ProbabilityConfig, ProbabilityStrategy};

use crate::models::{Bar, Side, Signal};
use crate::Result;

/// Signal engine plus the transition rules that go with it
///
/// `evaluate` must be a pure function of the closed-bar series. `target_side`
/// maps the current side and a fresh signal to the side the trader should hold
/// after this bar; the execution layer turns that into orders.
pub trait Strategy: Send + Sync {
    /// Compute the signal for the latest closed bar
    fn evaluate(&self, bars: &[Bar]) -> Result<Signal>;

    /// Side to hold after this bar, given the current side
    fn target_side(&self, current: Side, signal: &Signal) -> Side;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum closed bars required before `evaluate` can produce a signal
    fn min_bars_required(&self) -> usize;
}

pub(crate) fn ensure_history(name: &str, bars: &[Bar], required: usize) -> Result<()> {
    if bars.len() < required {
        return Err(format!(
            "Need at least {} bars for {} strategy, got {}",
            required,
            name,
            bars.len()
        )
        .into());
    }
    Ok(())
}
