use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{Bar, Side, Signal};
use crate::strategy::features::{self, lagged_features};
use crate::strategy::{ensure_history, Strategy};
use crate::Result;

/// Pre-trained model mapping a lagged feature vector to P(next return > 0)
pub trait Classifier: Send + Sync {
    fn predict(&self, features: &[f64]) -> Result<f64>;
}

/// Logistic regression with built-in standardization
///
/// Loaded from a JSON export of the trained parameters:
/// `{"weights": [..], "bias": 0.0, "mu": [..], "std": [..]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub mu: Vec<f64>,
    pub std: Vec<f64>,
}

impl LogisticModel {
    pub fn from_json(json: &str) -> Result<Self> {
        let model: LogisticModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read model {}: {}", path.display(), e))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        let n = self.weights.len();
        if n == 0 || self.mu.len() != n || self.std.len() != n {
            return Err(format!(
                "Model shape mismatch: {} weights, {} mu, {} std",
                n,
                self.mu.len(),
                self.std.len()
            )
            .into());
        }
        if self.std.iter().any(|s| *s == 0.0) {
            return Err("Model std contains zero".into());
        }
        Ok(())
    }

    pub fn input_len(&self) -> usize {
        self.weights.len()
    }
}

impl Classifier for LogisticModel {
    fn predict(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.weights.len() {
            return Err(format!(
                "Model expects {} features, got {}",
                self.weights.len(),
                features.len()
            )
            .into());
        }

        let z = features
            .iter()
            .zip(&self.mu)
            .zip(&self.std)
            .zip(&self.weights)
            .fold(self.bias, |acc, (((x, mu), std), w)| acc + w * (x - mu) / std);

        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityConfig {
    /// Rolling window for the feature set
    #[serde(default = "default_window")]
    pub window: usize,

    /// Number of lags of each feature fed to the model
    #[serde(default = "default_lags")]
    pub lags: usize,

    /// Go (or flip) long above this probability
    #[serde(default = "default_long_threshold")]
    pub long_threshold: f64,

    /// Go (or flip) short below this probability
    #[serde(default = "default_short_threshold")]
    pub short_threshold: f64,

    /// JSON file with the trained model parameters
    pub model_path: PathBuf,
}

fn default_window() -> usize {
    50
}

fn default_lags() -> usize {
    5
}

fn default_long_threshold() -> f64 {
    0.53
}

fn default_short_threshold() -> f64 {
    0.47
}

/// Classifier-driven strategy: long above the upper threshold, short below
/// the lower one, hold inside the neutral band. Never flattens on its own.
pub struct ProbabilityStrategy {
    config: ProbabilityConfig,
    classifier: Box<dyn Classifier>,
}

impl ProbabilityStrategy {
    pub fn new(config: ProbabilityConfig, classifier: Box<dyn Classifier>) -> Self {
        Self { config, classifier }
    }

    /// Load the logistic model named in the config
    pub fn from_config(config: ProbabilityConfig) -> Result<Self> {
        let model = LogisticModel::from_file(&config.model_path)?;
        let expected = features::column_names(config.lags).len();
        if model.input_len() != expected {
            return Err(format!(
                "Model has {} inputs but {} lags need {}",
                model.input_len(),
                config.lags,
                expected
            )
            .into());
        }
        Ok(Self::new(config, Box::new(model)))
    }
}

impl Strategy for ProbabilityStrategy {
    fn evaluate(&self, bars: &[Bar]) -> Result<Signal> {
        ensure_history(self.name(), bars, self.min_bars_required())?;

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let vector = lagged_features(&closes, self.config.window, self.config.lags)
            .ok_or("Incomplete feature history")?;
        let proba = self.classifier.predict(&vector)?;

        tracing::info!(
            price = closes[closes.len() - 1],
            probability = proba,
            "Model prediction"
        );

        Ok(Signal::Probability(proba))
    }

    fn target_side(&self, current: Side, signal: &Signal) -> Side {
        let Signal::Probability(p) = *signal else {
            return current;
        };

        let long = p > self.config.long_threshold;
        let short = p < self.config.short_threshold;

        match current {
            Side::Flat if long => Side::Long,
            Side::Flat if short => Side::Short,
            Side::Short if long => Side::Long,
            Side::Long if short => Side::Short,
            _ => current,
        }
    }

    fn name(&self) -> &str {
        "Probability"
    }

    fn min_bars_required(&self) -> usize {
        features::min_bars(self.config.window, self.config.lags)
    }
}
