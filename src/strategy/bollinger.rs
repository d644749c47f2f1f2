use serde::{Deserialize, Serialize};

use crate::indicators::calculate_bands;
use crate::models::{Bar, BandSnapshot, Side, Signal};
use crate::strategy::{ensure_history, Strategy};
use crate::Result;

/// Bollinger band mean-reversion strategy
///
/// Entry: the previous bar closed outside a band and the latest bar turned back
/// toward the mean, without having crossed the moving average yet.
/// Exit: price crosses back through the moving average. If it also breaks the
/// opposite band the position is reversed instead of flattened.
#[derive(Debug, Clone)]
pub struct BollingerStrategy {
    config: BollingerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BollingerConfig {
    /// Rolling window for the moving average and standard deviation
    #[serde(default = "default_sma_window")]
    pub sma_window: usize,

    /// Band distance in standard deviations
    #[serde(default = "default_band_width")]
    pub band_width: f64,
}

fn default_sma_window() -> usize {
    20
}

fn default_band_width() -> f64 {
    2.0
}

impl Default for BollingerConfig {
    fn default() -> Self {
        Self {
            sma_window: default_sma_window(),
            band_width: default_band_width(),
        }
    }
}

impl BollingerStrategy {
    pub fn new(config: BollingerConfig) -> Self {
        Self { config }
    }
}

impl Default for BollingerStrategy {
    fn default() -> Self {
        Self::new(BollingerConfig::default())
    }
}

impl Strategy for BollingerStrategy {
    fn evaluate(&self, bars: &[Bar]) -> Result<Signal> {
        ensure_history(self.name(), bars, self.min_bars_required())?;

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let n = closes.len();
        let window = self.config.sma_window;
        let width = self.config.band_width;

        let current = calculate_bands(&closes, window, width).ok_or("Failed to calculate bands")?;
        let previous = calculate_bands(&closes[..n - 1], window, width)
            .ok_or("Failed to calculate previous bands")?;

        let snapshot = BandSnapshot {
            close: closes[n - 1],
            sma: current.sma,
            upper: current.upper,
            lower: current.lower,
            prev_close: closes[n - 2],
            prev_upper: previous.upper,
            prev_lower: previous.lower,
            last_return: (closes[n - 1] / closes[n - 2]).ln(),
        };

        tracing::debug!(
            "Bands: price={:.5} upper={:.5} lower={:.5} sma={:.5} | above_upper={} below_lower={} above_sma={}",
            snapshot.close,
            snapshot.upper,
            snapshot.lower,
            snapshot.sma,
            snapshot.close > snapshot.upper,
            snapshot.close < snapshot.lower,
            snapshot.close > snapshot.sma
        );

        Ok(Signal::Bands(snapshot))
    }

    fn target_side(&self, current: Side, signal: &Signal) -> Side {
        let Signal::Bands(b) = signal else {
            return current;
        };

        match current {
            Side::Flat => {
                if b.prev_close > b.prev_upper && b.last_return < 0.0 && b.close >= b.sma {
                    Side::Short
                } else if b.prev_close < b.prev_lower && b.last_return > 0.0 && b.close <= b.sma {
                    Side::Long
                } else {
                    Side::Flat
                }
            }
            Side::Short => {
                if b.close < b.sma {
                    if b.close < b.lower {
                        Side::Long
                    } else {
                        Side::Flat
                    }
                } else {
                    Side::Short
                }
            }
            Side::Long => {
                if b.close > b.sma {
                    if b.close > b.upper {
                        Side::Short
                    } else {
                        Side::Flat
                    }
                } else {
                    Side::Long
                }
            }
        }
    }

    fn name(&self) -> &str {
        "Bollinger"
    }

    fn min_bars_required(&self) -> usize {
        // Bands for the previous bar as well
        self.config.sma_window + 1
    }
}
