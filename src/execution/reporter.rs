use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// One filled or adjusted order, as printed to the console
#[derive(Debug, Clone, PartialEq)]
pub struct TradeReport {
    pub time: DateTime<Utc>,
    pub action: String,
    pub units: i64,
    pub price: f64,
}

impl TradeReport {
    pub fn new(time: DateTime<Utc>, action: impl Into<String>, units: i64, price: f64) -> Self {
        Self {
            time,
            action: action.into(),
            units,
            price,
        }
    }
}

impl fmt::Display for TradeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(100);
        let time = self.time.to_rfc3339_opts(SecondsFormat::Micros, true);
        writeln!(f, "{}", rule)?;
        writeln!(f, "{} | {}", time, self.action)?;
        writeln!(f, "{} | units = {} | price = {}", time, self.units, self.price)?;
        write!(f, "{}", rule)
    }
}

/// Stateless console reporter for fills and stop adjustments
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeReporter;

impl TradeReporter {
    pub fn report(&self, report: &TradeReport) {
        tracing::debug!(action = %report.action, units = report.units, price = report.price, "Order reported");
        println!("\n{}\n", report);
    }
}
