pub mod oanda;

pub use oanda::{parse_stream_line, OandaClient, OandaPriceStream};
