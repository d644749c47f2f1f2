// Technical indicators module
// Rolling mean / standard deviation and Bollinger bands over closing prices

pub mod bollinger;
pub mod moving_average;

pub use bollinger::{calculate_bands, Bands};
pub use moving_average::{calculate_sma, calculate_std, log_returns};
