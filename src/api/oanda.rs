use chrono::{DateTime, Duration, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::{Credentials, TraderConfig};
use crate::execution::gateway::{
    EntryFill, EntryRequest, ExitFill, ExitRequest, GatewayError, MarketData, OrderGateway,
    PositionSnapshot, PriceStream, StopChange, StreamEvent,
};
use crate::execution::{resample, BarLength, GapFill};
use crate::models::{Bar, Direction, Tick};

const REQUEST_TIMEOUT_SECS: u64 = 30;

// Type alias for the rate limiter to simplify signatures
type OandaRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for the OANDA v20 REST and streaming APIs, bound to one
/// account and one instrument
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct OandaClient {
    client: Client,
    stream_client: Client,
    rest_url: String,
    stream_url: String,
    api_key: String,
    account_id: String,
    instrument: String,
    units: i64,
    granularity: String,
    price_precision: usize,
    rate_limiter: Arc<OandaRateLimiter>,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<Candle>,
}

#[derive(Debug, Deserialize)]
struct Candle {
    time: DateTime<Utc>,
    mid: Option<CandleMid>,
}

#[derive(Debug, Deserialize)]
struct CandleMid {
    c: String,
}

#[derive(Debug, Serialize)]
struct OrderEnvelope<T> {
    order: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarketOrder {
    #[serde(rename = "type")]
    order_type: &'static str,
    instrument: String,
    units: String,
    time_in_force: &'static str,
    position_fill: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    take_profit_on_fill: Option<PriceDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_loss_on_fill: Option<DistanceDetails>,
    client_extensions: ClientExtensions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PriceDetails {
    price: String,
    time_in_force: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DistanceDetails {
    distance: String,
    time_in_force: &'static str,
}

#[derive(Debug, Serialize)]
struct ClientExtensions {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopLossOrder {
    #[serde(rename = "type")]
    order_type: &'static str,
    #[serde(rename = "tradeID")]
    trade_id: String,
    price: String,
    time_in_force: &'static str,
    trigger_condition: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreateResponse {
    order_fill_transaction: Option<FillTransaction>,
    order_cancel_transaction: Option<CancelTransaction>,
    #[serde(default, rename = "relatedTransactionIDs")]
    related_transaction_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillTransaction {
    time: DateTime<Utc>,
    price: String,
    units: String,
    trade_opened: Option<TradeOpened>,
}

#[derive(Debug, Deserialize)]
struct TradeOpened {
    #[serde(rename = "tradeID")]
    trade_id: String,
}

#[derive(Debug, Deserialize)]
struct CancelTransaction {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderReplaceResponse {
    order_create_transaction: Option<CreateTransaction>,
}

#[derive(Debug, Deserialize)]
struct CreateTransaction {
    id: String,
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct OpenTradesResponse {
    #[serde(default)]
    trades: Vec<OpenTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenTrade {
    id: String,
    instrument: String,
    price: String,
    current_units: String,
    #[serde(default)]
    state: String,
    #[serde(rename = "unrealizedPL", default)]
    unrealized_pl: Option<String>,
    take_profit_order: Option<OrderRef>,
    stop_loss_order: Option<OrderRef>,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamMessage {
    #[serde(rename = "PRICE")]
    Price {
        time: DateTime<Utc>,
        #[serde(rename = "closeoutBid")]
        closeout_bid: String,
        #[serde(rename = "closeoutAsk")]
        closeout_ask: String,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(other)]
    Other,
}

fn parse_f64(field: &str, value: &str) -> Result<f64, GatewayError> {
    value
        .parse::<f64>()
        .map_err(|_| GatewayError::Decode(format!("{} is not a number: {:?}", field, value)))
}

fn parse_units(value: &str) -> Result<i64, GatewayError> {
    Ok(parse_f64("units", value)?.round() as i64)
}

// ============================================================================
// Client
// ============================================================================

impl OandaClient {
    pub fn new(config: &TraderConfig, credentials: &Credentials) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        // The price stream is open-ended; only connecting is bounded
        let stream_client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let units = i64::try_from(config.units)
            .map_err(|_| GatewayError::Decode(format!("units out of range: {}", config.units)))?;

        let rps = NonZeroU32::new(config.broker.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            stream_client,
            rest_url: config.broker.rest_url().trim_end_matches('/').to_string(),
            stream_url: config.broker.stream_url().trim_end_matches('/').to_string(),
            api_key: credentials.api_key.clone(),
            account_id: credentials.account_id.clone(),
            instrument: config.instrument.clone(),
            units,
            granularity: config.history_granularity.clone(),
            price_precision: config.risk.price_precision,
            rate_limiter,
        })
    }

    fn account_url(&self, path: &str) -> String {
        format!("{}/v3/accounts/{}{}", self.rest_url, self.account_id, path)
    }

    fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_precision, price)
    }

    /// Rate-limited, authenticated request; non-2xx statuses become `Broker` errors
    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        self.rate_limiter.until_ready().await;

        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error_message)
            .unwrap_or(body);

        tracing::warn!("OANDA request failed with {}: {}", status, message);
        Err(GatewayError::Broker {
            status: status.as_u16(),
            message,
        })
    }

    /// `send`, then decode the body; malformed JSON is a `Decode` error
    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let body = self.send(request).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Raw mid-price candles between `from` and `to`
    pub async fn fetch_candles(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, GatewayError> {
        let url = format!("{}/v3/instruments/{}/candles", self.rest_url, self.instrument);
        let from = from.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let to = to.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let request = self.client.get(&url).query(&[
            ("granularity", self.granularity.as_str()),
            ("price", "M"),
            ("from", from.as_str()),
            ("to", to.as_str()),
        ]);

        let response: CandlesResponse = self.send_json(request).await?;

        response
            .candles
            .into_iter()
            .filter_map(|c| c.mid.map(|mid| (c.time, mid.c)))
            .map(|(time, close)| parse_f64("candle close", &close).map(|c| (time, c)))
            .collect()
    }

    async fn submit_market_order(&self, order: MarketOrder) -> Result<OrderCreateResponse, GatewayError> {
        tracing::debug!(units = %order.units, client_id = %order.client_extensions.id, "Submitting market order");

        let request = self
            .client
            .post(self.account_url("/orders"))
            .json(&OrderEnvelope { order });
        let response: OrderCreateResponse = self.send_json(request).await?;

        if let Some(cancel) = &response.order_cancel_transaction {
            return Err(GatewayError::Rejected(cancel.reason.clone()));
        }
        Ok(response)
    }

    fn market_order(
        &self,
        units: i64,
        take_profit_on_fill: Option<PriceDetails>,
        stop_loss_on_fill: Option<DistanceDetails>,
    ) -> MarketOrder {
        MarketOrder {
            order_type: "MARKET",
            instrument: self.instrument.clone(),
            units: units.to_string(),
            time_in_force: "FOK",
            position_fill: "DEFAULT",
            take_profit_on_fill,
            stop_loss_on_fill,
            client_extensions: ClientExtensions {
                id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}

impl OrderGateway for OandaClient {
    async fn open(&self, request: &EntryRequest) -> Result<EntryFill, GatewayError> {
        let units = request.direction.sign() * i64::from(request.multiplier) * self.units;
        let order = self.market_order(
            units,
            Some(PriceDetails {
                price: self.format_price(request.take_profit),
                time_in_force: "GTC",
            }),
            Some(DistanceDetails {
                distance: self.format_price(request.stop_loss_distance),
                time_in_force: "GTC",
            }),
        );

        let response = self.submit_market_order(order).await?;
        let fill = response
            .order_fill_transaction
            .ok_or_else(|| GatewayError::Decode("missing orderFillTransaction".into()))?;

        // Trailing ids: .., trade, take-profit, stop-loss
        let ids = &response.related_transaction_ids;
        if ids.len() < 3 {
            return Err(GatewayError::Decode(format!(
                "expected at least 3 related transactions, got {}",
                ids.len()
            )));
        }
        let n = ids.len();
        let trade_id = fill
            .trade_opened
            .map(|t| t.trade_id)
            .unwrap_or_else(|| ids[n - 3].clone());

        Ok(EntryFill {
            trade_id,
            take_profit_id: ids[n - 2].clone(),
            stop_loss_id: ids[n - 1].clone(),
            price: parse_f64("fill price", &fill.price)?,
            time: fill.time,
            units: parse_units(&fill.units)?,
        })
    }

    async fn flatten(&self, request: &ExitRequest) -> Result<ExitFill, GatewayError> {
        let units = -request.closing.sign() * i64::from(request.multiplier) * self.units;
        let response = self
            .submit_market_order(self.market_order(units, None, None))
            .await?;
        let fill = response
            .order_fill_transaction
            .ok_or_else(|| GatewayError::Decode("missing orderFillTransaction".into()))?;

        Ok(ExitFill {
            price: parse_f64("fill price", &fill.price)?,
            time: fill.time,
            units: parse_units(&fill.units)?,
        })
    }

    async fn tighten_stop(
        &self,
        trade_id: &str,
        stop_loss_id: &str,
        price: f64,
    ) -> Result<StopChange, GatewayError> {
        let order = StopLossOrder {
            order_type: "STOP_LOSS",
            trade_id: trade_id.to_string(),
            price: self.format_price(price),
            time_in_force: "GTC",
            trigger_condition: "DEFAULT",
        };
        let request = self
            .client
            .put(self.account_url(&format!("/orders/{}", stop_loss_id)))
            .json(&OrderEnvelope { order });

        let response: OrderReplaceResponse = self.send_json(request).await?;
        let created = response
            .order_create_transaction
            .ok_or_else(|| GatewayError::Decode("missing orderCreateTransaction".into()))?;

        Ok(StopChange {
            order_id: created.id,
            time: created.time,
        })
    }

    async fn query_open_position(&self) -> Result<Option<PositionSnapshot>, GatewayError> {
        let request = self.client.get(self.account_url("/openTrades"));
        let response: OpenTradesResponse = self.send_json(request).await?;

        let Some(trade) = response
            .trades
            .into_iter()
            .find(|t| t.instrument == self.instrument && t.state == "OPEN")
        else {
            return Ok(None);
        };

        let units = parse_f64("currentUnits", &trade.current_units)?;
        let direction = if units > 0.0 {
            Direction::Long
        } else if units < 0.0 {
            Direction::Short
        } else {
            return Ok(None);
        };

        Ok(Some(PositionSnapshot {
            direction,
            trade_id: trade.id,
            stop_loss_id: trade.stop_loss_order.map(|o| o.id),
            take_profit_id: trade.take_profit_order.map(|o| o.id),
            price: parse_f64("trade price", &trade.price)?,
            unrealized_pl: trade
                .unrealized_pl
                .as_deref()
                .map(|pl| parse_f64("unrealizedPL", pl))
                .transpose()?
                .unwrap_or(0.0),
        }))
    }
}

impl MarketData for OandaClient {
    type Stream = OandaPriceStream;

    async fn fetch_history(&self, days: u32, bar_length: BarLength) -> Result<Vec<Bar>, GatewayError> {
        let to = Utc::now();
        let from = to - Duration::days(i64::from(days));

        let candles = self.fetch_candles(from, to).await?;
        tracing::info!(
            "Fetched {} {} candles for {}",
            candles.len(),
            self.granularity,
            self.instrument
        );

        Ok(resample(candles, bar_length, GapFill::None))
    }

    async fn open_stream(&self) -> Result<OandaPriceStream, GatewayError> {
        let url = format!(
            "{}/v3/accounts/{}/pricing/stream",
            self.stream_url, self.account_id
        );
        let request = self
            .stream_client
            .get(&url)
            .query(&[("instruments", self.instrument.as_str())]);

        let response = self.send(request).await?;
        tracing::info!("Connected to price stream for {}", self.instrument);

        Ok(OandaPriceStream::new(response))
    }
}

// ============================================================================
// Price stream
// ============================================================================

/// Newline-delimited JSON price stream
pub struct OandaPriceStream {
    response: Response,
    buffer: Vec<u8>,
    finished: bool,
}

impl OandaPriceStream {
    fn new(response: Response) -> Self {
        Self {
            response,
            buffer: Vec::new(),
            finished: false,
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

/// Decode one stream line; `None` for blank lines
pub fn parse_stream_line(line: &[u8]) -> Result<Option<StreamEvent>, GatewayError> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    let event = match serde_json::from_slice::<StreamMessage>(line)? {
        StreamMessage::Price {
            time,
            closeout_bid,
            closeout_ask,
        } => StreamEvent::Price(Tick::new(
            time,
            parse_f64("closeoutBid", &closeout_bid)?,
            parse_f64("closeoutAsk", &closeout_ask)?,
        )),
        StreamMessage::Heartbeat | StreamMessage::Other => StreamEvent::Heartbeat,
    };
    Ok(Some(event))
}

impl PriceStream for OandaPriceStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, GatewayError> {
        loop {
            if let Some(line) = self.take_line() {
                match parse_stream_line(&line)? {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                }
            }

            if self.finished {
                let rest = std::mem::take(&mut self.buffer);
                return parse_stream_line(&rest);
            }

            match self.response.chunk().await? {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => self.finished = true,
            }
        }
    }
}
