//! Trader configuration.
//!
//! Layered with the `config` crate: an optional TOML file, then
//! `FXTRADER__*` environment variables (`FXTRADER__RISK__STOP_LOSS_DISTANCE`),
//! then command-line overrides. Broker credentials are read separately from
//! `OANDA_API_KEY` / `OANDA_ACCOUNT_ID`.

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::execution::{BarLength, SessionSettings};
use crate::strategy::{
    BollingerConfig, BollingerStrategy, ProbabilityConfig, ProbabilityStrategy, Strategy,
};

const PRACTICE_REST_URL: &str = "https://api-fxpractice.oanda.com";
const PRACTICE_STREAM_URL: &str = "https://stream-fxpractice.oanda.com";
const LIVE_REST_URL: &str = "https://api-fxtrade.oanda.com";
const LIVE_STREAM_URL: &str = "https://stream-fxtrade.oanda.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Broker instrument symbol, e.g. "EUR_USD"
    pub instrument: String,

    #[serde(default = "default_bar_length_minutes")]
    pub bar_length_minutes: u32,

    /// Units per order before the entry/reversal multiplier
    #[serde(default = "default_units")]
    pub units: u64,

    /// Days of history loaded at startup
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    /// Raw candle granularity requested from the broker
    #[serde(default = "default_history_granularity")]
    pub history_granularity: String,

    /// Bars kept beyond the strategy's minimum history
    #[serde(default = "default_retention_margin")]
    pub retention_margin: usize,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    pub strategy: StrategyConfig,
}

fn default_bar_length_minutes() -> u32 {
    15
}

fn default_units() -> u64 {
    30_000
}

fn default_history_days() -> u32 {
    5
}

fn default_history_granularity() -> String {
    "M5".to_string()
}

fn default_retention_margin() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Take-profit distance from the entry quote (ask for longs, bid for shorts)
    pub take_profit_distance: f64,

    /// Stop-loss distance from the fill price
    pub stop_loss_distance: f64,

    /// Unrealized profit above which the stop moves to the entry price
    pub stop_tighten_threshold: f64,

    /// Decimals used when sending prices to the broker
    pub price_precision: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            take_profit_distance: 0.0022,
            stop_loss_distance: 0.0013,
            stop_tighten_threshold: 20.0,
            price_precision: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerEnvironment {
    #[default]
    Practice,
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub environment: BrokerEnvironment,

    /// Override for the REST endpoint (tests, proxies)
    #[serde(default)]
    pub rest_url: Option<String>,

    /// Override for the streaming endpoint
    #[serde(default)]
    pub stream_url: Option<String>,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    50
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            environment: BrokerEnvironment::default(),
            rest_url: None,
            stream_url: None,
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl BrokerConfig {
    pub fn rest_url(&self) -> String {
        self.rest_url.clone().unwrap_or_else(|| {
            match self.environment {
                BrokerEnvironment::Practice => PRACTICE_REST_URL,
                BrokerEnvironment::Live => LIVE_REST_URL,
            }
            .to_string()
        })
    }

    pub fn stream_url(&self) -> String {
        self.stream_url.clone().unwrap_or_else(|| {
            match self.environment {
                BrokerEnvironment::Practice => PRACTICE_STREAM_URL,
                BrokerEnvironment::Live => LIVE_STREAM_URL,
            }
            .to_string()
        })
    }
}

/// Signal engine selection, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StrategyConfig {
    Bollinger(BollingerConfig),
    Probability(ProbabilityConfig),
}

impl StrategyConfig {
    pub fn build(&self) -> crate::Result<Box<dyn Strategy>> {
        Ok(match self {
            StrategyConfig::Bollinger(cfg) => Box::new(BollingerStrategy::new(cfg.clone())),
            StrategyConfig::Probability(cfg) => Box::new(ProbabilityStrategy::from_config(cfg.clone())?),
        })
    }
}

/// Values given on the command line, applied last
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub instrument: Option<String>,
    pub units: Option<u64>,
    pub live: bool,
}

impl TraderConfig {
    /// Load from `path` (or `fxtrader.toml` if present), the environment and `overrides`
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let builder = Config::builder();
        let builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name("fxtrader").required(false)),
        };

        let units = overrides
            .units
            .map(|u| i64::try_from(u).map_err(|_| ConfigError::Invalid("units out of range".into())))
            .transpose()?;

        let settings = builder
            .add_source(
                Environment::with_prefix("FXTRADER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("instrument", overrides.instrument.clone())?
            .set_override_option("units", units)?
            .set_override_option("broker.environment", overrides.live.then_some("live"))?
            .build()?;

        let config: TraderConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: TraderConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.instrument.trim().is_empty() {
            return invalid("instrument must not be empty");
        }
        if self.bar_length_minutes == 0 {
            return invalid("bar_length_minutes must be positive");
        }
        if self.units == 0 {
            return invalid("units must be positive");
        }
        if self.history_days == 0 {
            return invalid("history_days must be positive");
        }
        if self.risk.take_profit_distance <= 0.0 || self.risk.stop_loss_distance <= 0.0 {
            return invalid("take-profit and stop-loss distances must be positive");
        }
        if self.broker.requests_per_second == 0 {
            return invalid("requests_per_second must be positive");
        }

        match &self.strategy {
            StrategyConfig::Bollinger(cfg) => {
                if cfg.sma_window < 2 {
                    return invalid("sma_window must be at least 2");
                }
                if cfg.band_width <= 0.0 {
                    return invalid("band_width must be positive");
                }
            }
            StrategyConfig::Probability(cfg) => {
                if cfg.window < 2 || cfg.lags == 0 {
                    return invalid("window must be at least 2 and lags positive");
                }
                if !(0.0 < cfg.short_threshold
                    && cfg.short_threshold <= cfg.long_threshold
                    && cfg.long_threshold < 1.0)
                {
                    return invalid("thresholds must satisfy 0 < short <= long < 1");
                }
            }
        }

        Ok(())
    }

    pub fn bar_length(&self) -> Result<BarLength, ConfigError> {
        BarLength::from_minutes(self.bar_length_minutes)
            .ok_or_else(|| ConfigError::Invalid("bar_length_minutes must be positive".into()))
    }

    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        Ok(SessionSettings {
            history_days: self.history_days,
            bar_length: self.bar_length()?,
            retention_margin: self.retention_margin,
            risk: self.risk.clone(),
        })
    }
}

/// OANDA account credentials
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub account_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl Credentials {
    /// Read `OANDA_API_KEY` and `OANDA_ACCOUNT_ID`
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key =
            std::env::var("OANDA_API_KEY").context("OANDA_API_KEY environment variable not set")?;
        let account_id = std::env::var("OANDA_ACCOUNT_ID")
            .context("OANDA_ACCOUNT_ID environment variable not set")?;
        Ok(Self {
            api_key,
            account_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOLLINGER_TOML: &str = r#"
instrument = "EUR_AUD"
bar_length_minutes = 15
units = 30000

[strategy]
kind = "bollinger"
sma_window = 20
band_width = 2
"#;

    #[test]
    fn test_bollinger_config_with_defaults() {
        let config = TraderConfig::from_toml_str(BOLLINGER_TOML).unwrap();

        assert_eq!(config.instrument, "EUR_AUD");
        assert_eq!(config.history_days, 5);
        assert_eq!(config.history_granularity, "M5");
        assert_eq!(config.risk, RiskConfig::default());
        assert_eq!(config.broker.environment, BrokerEnvironment::Practice);
        assert_eq!(
            config.strategy,
            StrategyConfig::Bollinger(BollingerConfig {
                sma_window: 20,
                band_width: 2.0
            })
        );
        assert_eq!(config.bar_length().unwrap().seconds(), 900);
    }

    #[test]
    fn test_probability_config() {
        let config = TraderConfig::from_toml_str(
            r#"
instrument = "EUR_USD"

[risk]
take_profit_distance = 0.0015
stop_loss_distance = 0.001
stop_tighten_threshold = 20.0
price_precision = 5

[strategy]
kind = "probability"
model_path = "model.json"
"#,
        )
        .unwrap();

        let StrategyConfig::Probability(cfg) = &config.strategy else {
            panic!("expected probability strategy");
        };
        assert_eq!(cfg.window, 50);
        assert_eq!(cfg.lags, 5);
        assert_eq!(cfg.long_threshold, 0.53);
        assert_eq!(cfg.short_threshold, 0.47);
        assert_eq!(config.risk.take_profit_distance, 0.0015);
    }

    #[test]
    fn test_rejects_zero_bar_length() {
        let toml = BOLLINGER_TOML.replace("bar_length_minutes = 15", "bar_length_minutes = 0");
        let err = TraderConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("bar_length_minutes"));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = TraderConfig::from_toml_str(
            r#"
instrument = "EUR_USD"
[strategy]
kind = "probability"
model_path = "m.json"
long_threshold = 0.4
short_threshold = 0.6
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_strategy_fails() {
        assert!(TraderConfig::from_toml_str(r#"instrument = "EUR_USD""#).is_err());
    }

    #[test]
    fn test_broker_urls() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.rest_url(), PRACTICE_REST_URL);
        assert_eq!(broker.stream_url(), PRACTICE_STREAM_URL);

        broker.environment = BrokerEnvironment::Live;
        assert_eq!(broker.rest_url(), LIVE_REST_URL);

        broker.rest_url = Some("http://127.0.0.1:1234".to_string());
        assert_eq!(broker.rest_url(), "http://127.0.0.1:1234");
    }

    #[test]
    fn test_session_settings() {
        let config = TraderConfig::from_toml_str(BOLLINGER_TOML).unwrap();
        let settings = config.session_settings().unwrap();
        assert_eq!(settings.history_days, 5);
        assert_eq!(settings.retention_margin, 50);
        assert_eq!(settings.bar_length.seconds(), 900);
    }

    #[test]
    fn test_credentials_debug_hides_key() {
        let creds = Credentials {
            api_key: "secret".to_string(),
            account_id: "001-001".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
