//! Lagged feature vectors for the probability classifier.
//!
//! Every bar gets seven features computed from its trailing history. The model
//! never sees the current bar's features, only lags `1..=lags` of each one,
//! laid out feature-major (`dir_lag_1, dir_lag_2, .., sma_lag_1, ..`).

use crate::indicators::{calculate_sma, calculate_std, log_returns};

/// Long moving average subtracted from the short one in the `sma` feature
pub const LONG_SMA_WINDOW: usize = 150;

/// Returns averaged in the `mom` feature
pub const MOMENTUM_WINDOW: usize = 3;

pub const FEATURE_NAMES: [&str; 7] = ["dir", "sma", "boll", "min", "max", "mom", "vol"];

/// Bars needed before a full lagged vector exists
pub fn min_bars(window: usize, lags: usize) -> usize {
    LONG_SMA_WINDOW.max(window + 1).max(MOMENTUM_WINDOW + 1) + lags
}

/// Column names in model order
pub fn column_names(lags: usize) -> Vec<String> {
    FEATURE_NAMES
        .iter()
        .flat_map(|f| (1..=lags).map(move |lag| format!("{}_lag_{}", f, lag)))
        .collect()
}

/// Features of bar `idx`, or None while its history is incomplete
fn feature_row(closes: &[f64], returns: &[f64], idx: usize, window: usize) -> Option<[f64; 7]> {
    if idx < 1 {
        return None;
    }

    let prices = &closes[..=idx];
    // returns[j] is the return into bar j + 1
    let bar_returns = &returns[..idx];
    let close = closes[idx];
    let last_return = bar_returns[idx - 1];

    let short_sma = calculate_sma(prices, window)?;
    let long_sma = calculate_sma(prices, LONG_SMA_WINDOW)?;
    let std = calculate_std(prices, window)?;
    let recent = &prices[prices.len().checked_sub(window)?..];
    let min = recent.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = recent.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mom = calculate_sma(bar_returns, MOMENTUM_WINDOW)?;
    let vol = calculate_std(bar_returns, window)?;

    let row = [
        if last_return > 0.0 { 1.0 } else { 0.0 },
        short_sma - long_sma,
        (close - short_sma) / std,
        min / close - 1.0,
        max / close - 1.0,
        mom,
        vol,
    ];

    row.iter().all(|v| v.is_finite()).then_some(row)
}

/// Lagged feature vector for the latest bar of `closes`
pub fn lagged_features(closes: &[f64], window: usize, lags: usize) -> Option<Vec<f64>> {
    if lags == 0 || closes.len() < min_bars(window, lags) {
        return None;
    }

    let returns = log_returns(closes);
    let latest = closes.len() - 1;

    let rows = (1..=lags)
        .map(|lag| feature_row(closes, &returns, latest - lag, window))
        .collect::<Option<Vec<_>>>()?;

    let mut vector = Vec::with_capacity(FEATURE_NAMES.len() * lags);
    for feature in 0..FEATURE_NAMES.len() {
        for row in &rows {
            vector.push(row[feature]);
        }
    }

    Some(vector)
}
