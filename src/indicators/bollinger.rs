use super::moving_average::{calculate_sma, calculate_std};

/// Bollinger bands at a single bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub sma: f64,
    pub upper: f64,
    pub lower: f64,
}

/// Bands for the last value of `prices`: SMA ± `width` sample standard deviations
pub fn calculate_bands(prices: &[f64], period: usize, width: f64) -> Option<Bands> {
    let sma = calculate_sma(prices, period)?;
    let std = calculate_std(prices, period)?;

    Some(Bands {
        sma,
        upper: sma + std * width,
        lower: sma - std * width,
    })
}
