use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost:8090";
pub const DEFAULT_BUCKET_WIDTH_SECS: i64 = 180;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE: &str = "frontend connected";
pub const DEFAULT_INBOUND_BUFFER: usize = 1_024;
pub const DEFAULT_SEND_SUBSCRIPTIONS: bool = false;
pub const DEFAULT_OPEN_POLICY: CandleOpenPolicy = CandleOpenPolicy::TickPrice;
pub const DEFAULT_RECONNECT_POLICY: ReconnectPolicyKind = ReconnectPolicyKind::Fixed;
pub const MIN_BUCKET_WIDTH_SECS: i64 = 60;
pub const MAX_BUCKET_WIDTH_SECS: i64 = 3_600;
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const MIN_PING_INTERVAL_MS: u64 = 1_000;
pub const MAX_PING_INTERVAL_MS: u64 = 300_000;
pub const MIN_INBOUND_BUFFER: usize = 16;
pub const MAX_INBOUND_BUFFER: usize = 65_536;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Call,
    Put,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Call, Channel::Put];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandleOpenPolicy {
    TickPrice,
    PreviousClose,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicyKind {
    Fixed,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed { delay_ms: u64 },
    Backoff { base_ms: u64, max_ms: u64 },
}

impl ReconnectPolicy {
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Backoff { base_ms, max_ms } => {
                let exponent = attempt.saturating_sub(1).min(16);
                let delay_ms = base_ms.saturating_mul(1_u64 << exponent);
                Duration::from_millis(delay_ms.min(max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedArgs {
    pub host: Option<String>,
    pub bucket_width_secs: Option<i64>,
    pub reconnect_delay_ms: Option<u64>,
    pub reconnect_policy: Option<ReconnectPolicyKind>,
    pub max_reconnect_delay_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub handshake: Option<String>,
    pub open_policy: Option<CandleOpenPolicy>,
    pub inbound_buffer: Option<usize>,
    pub send_subscriptions: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub host: String,
    pub bucket_width_secs: i64,
    pub reconnect_policy: ReconnectPolicy,
    pub ping_interval_ms: u64,
    pub handshake: String,
    pub open_policy: CandleOpenPolicy,
    pub inbound_buffer: usize,
    pub send_subscriptions: bool,
}

impl FeedConfig {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.host)
    }

    pub fn rest_base_url(&self) -> String {
        format!("http://{}", self.host)
    }
}

impl StartFeedArgs {
    pub fn normalize(self) -> Result<FeedConfig, AppError> {
        let host = self
            .host
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
            .trim()
            .to_string();

        if host.is_empty()
            || host.contains("://")
            || host.contains('/')
            || host.chars().any(char::is_whitespace)
        {
            return Err(AppError::InvalidArgument(
                "host must be a bare host[:port] without scheme or path".to_string(),
            ));
        }

        let bucket_width_secs = self.bucket_width_secs.unwrap_or(DEFAULT_BUCKET_WIDTH_SECS);
        if !(MIN_BUCKET_WIDTH_SECS..=MAX_BUCKET_WIDTH_SECS).contains(&bucket_width_secs) {
            return Err(AppError::InvalidArgument(format!(
                "bucketWidthSecs must be between {MIN_BUCKET_WIDTH_SECS} and {MAX_BUCKET_WIDTH_SECS}"
            )));
        }

        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let reconnect_policy = match self.reconnect_policy.unwrap_or(DEFAULT_RECONNECT_POLICY) {
            ReconnectPolicyKind::Fixed => ReconnectPolicy::Fixed {
                delay_ms: reconnect_delay_ms,
            },
            ReconnectPolicyKind::Backoff => {
                let max_ms = self
                    .max_reconnect_delay_ms
                    .unwrap_or(DEFAULT_MAX_RECONNECT_DELAY_MS);
                if !(reconnect_delay_ms..=MAX_RECONNECT_DELAY_MS).contains(&max_ms) {
                    return Err(AppError::InvalidArgument(format!(
                        "maxReconnectDelayMs must be between reconnectDelayMs and {MAX_RECONNECT_DELAY_MS}"
                    )));
                }
                ReconnectPolicy::Backoff {
                    base_ms: reconnect_delay_ms,
                    max_ms,
                }
            }
        };

        let ping_interval_ms = self.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS);
        if !(MIN_PING_INTERVAL_MS..=MAX_PING_INTERVAL_MS).contains(&ping_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pingIntervalMs must be between {MIN_PING_INTERVAL_MS} and {MAX_PING_INTERVAL_MS}"
            )));
        }

        let handshake = self
            .handshake
            .unwrap_or_else(|| DEFAULT_HANDSHAKE.to_string());
        if handshake.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "handshake must not be empty".to_string(),
            ));
        }

        let inbound_buffer = self.inbound_buffer.unwrap_or(DEFAULT_INBOUND_BUFFER);
        if !(MIN_INBOUND_BUFFER..=MAX_INBOUND_BUFFER).contains(&inbound_buffer) {
            return Err(AppError::InvalidArgument(format!(
                "inboundBuffer must be between {MIN_INBOUND_BUFFER} and {MAX_INBOUND_BUFFER}"
            )));
        }

        Ok(FeedConfig {
            host,
            bucket_width_secs,
            reconnect_policy,
            ping_interval_ms,
            handshake,
            open_policy: self.open_policy.unwrap_or(DEFAULT_OPEN_POLICY),
            inbound_buffer,
            send_subscriptions: self
                .send_subscriptions
                .unwrap_or(DEFAULT_SEND_SUBSCRIPTIONS),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSession {
    pub running: bool,
    pub host: String,
    pub bucket_width_secs: i64,
    pub open_policy: CandleOpenPolicy,
    pub send_subscriptions: bool,
}

impl FeedSession {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            running: true,
            host: config.host.clone(),
            bucket_width_secs: config.bucket_width_secs,
            open_policy: config.open_policy,
            send_subscriptions: config.send_subscriptions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: FeedState,
    pub host: String,
    pub bucket_width_secs: i64,
    pub call_symbol: Option<String>,
    pub put_symbol: Option<String>,
    pub reconnect_attempt: u32,
    pub retry_delay_ms: Option<u64>,
    pub ticks_applied: u64,
    pub ticks_dropped: u64,
    pub last_tick_time: Option<f64>,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn stopped(host: String, reason: Option<String>) -> Self {
        Self {
            state: FeedState::Stopped,
            host,
            bucket_width_secs: DEFAULT_BUCKET_WIDTH_SECS,
            call_symbol: None,
            put_symbol: None,
            reconnect_attempt: 0,
            retry_delay_ms: None,
            ticks_applied: 0,
            ticks_dropped: 0,
            last_tick_time: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct InstrumentToken(String);

impl InstrumentToken {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstrumentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&NumberOrText> for InstrumentToken {
    fn from(value: &NumberOrText) -> Self {
        match value {
            NumberOrText::Integer(number) => Self(number.to_string()),
            NumberOrText::Float(number) => {
                if number.is_finite() && number.fract() == 0.0 && number.abs() < 9.0e15 {
                    Self(format!("{}", *number as i64))
                } else {
                    Self(number.to_string())
                }
            }
            NumberOrText::Text(text) => Self::new(text),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NumberOrText {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl NumberOrText {
    pub fn as_finite_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Integer(number) => *number as f64,
            Self::Float(number) => *number,
            Self::Text(text) => text.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub token: InstrumentToken,
    pub price: f64,
    pub event_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentAssignment {
    pub symbol: String,
    pub token: InstrumentToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtmAssignment {
    pub call: Option<InstrumentAssignment>,
    pub put: Option<InstrumentAssignment>,
}

impl AtmAssignment {
    pub fn for_channel(&self, channel: Channel) -> Option<&InstrumentAssignment> {
        match channel {
            Channel::Call => self.call.as_ref(),
            Channel::Put => self.put.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Assignment(AtmAssignment),
    Tick(Tick),
    Passthrough { kind: String, raw: String },
}

#[derive(Debug, Deserialize)]
struct InboundFrameWire {
    #[serde(rename = "type")]
    kind: Option<String>,
    token: Option<NumberOrText>,
    price: Option<NumberOrText>,
    tt: Option<NumberOrText>,
    #[serde(rename = "ceTsym")]
    ce_symbol: Option<String>,
    #[serde(rename = "ceToken")]
    ce_token: Option<NumberOrText>,
    #[serde(rename = "peTsym")]
    pe_symbol: Option<String>,
    #[serde(rename = "peToken")]
    pe_token: Option<NumberOrText>,
}

fn assignment_from_wire(
    symbol: Option<String>,
    token: Option<&NumberOrText>,
) -> Option<InstrumentAssignment> {
    let symbol = symbol?.trim().to_string();
    let token = InstrumentToken::from(token?);
    if symbol.is_empty() || token.is_empty() {
        return None;
    }
    Some(InstrumentAssignment { symbol, token })
}

pub fn parse_inbound_frame(raw: &str) -> Result<InboundMessage, AppError> {
    let mut scratch = raw.as_bytes().to_vec();
    let wire: InboundFrameWire = simd_json::serde::from_slice(scratch.as_mut_slice())?;

    match wire.kind.as_deref() {
        Some("atm") => Ok(InboundMessage::Assignment(AtmAssignment {
            call: assignment_from_wire(wire.ce_symbol, wire.ce_token.as_ref()),
            put: assignment_from_wire(wire.pe_symbol, wire.pe_token.as_ref()),
        })),
        Some(kind) => Ok(InboundMessage::Passthrough {
            kind: kind.to_string(),
            raw: raw.to_string(),
        }),
        None => {
            let (Some(token), Some(price), Some(tt)) = (&wire.token, &wire.price, &wire.tt) else {
                return Err(AppError::InvalidArgument(
                    "frame has neither a type nor tick fields".to_string(),
                ));
            };
            let price = price.as_finite_f64().ok_or_else(|| {
                AppError::InvalidArgument("tick price must be a finite number".to_string())
            })?;
            let event_time = tt.as_finite_f64().ok_or_else(|| {
                AppError::InvalidArgument("tick tt must be a finite number".to_string())
            })?;
            let token = InstrumentToken::from(token);
            if token.is_empty() {
                return Err(AppError::InvalidArgument(
                    "tick token must not be empty".to_string(),
                ));
            }
            Ok(InboundMessage::Tick(Tick {
                token,
                price,
                event_time,
            }))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
}

#[derive(Serialize)]
struct ControlFrameWire<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    symbol: &'a str,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, AppError> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Subscribe { symbol } => Ok(serde_json::to_string(&ControlFrameWire {
                kind: "subscribe",
                symbol,
            })?),
            Self::Unsubscribe { symbol } => Ok(serde_json::to_string(&ControlFrameWire {
                kind: "unsubscribe",
                symbol,
            })?),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
}

impl Candle {
    pub fn from_tick(bucket_start: i64, price: f64) -> Self {
        Self {
            t: bucket_start,
            o: price,
            h: price,
            l: price,
            c: price,
        }
    }

    pub fn opened_at(bucket_start: i64, open: f64, price: f64) -> Self {
        Self {
            t: bucket_start,
            o: open,
            h: open.max(price),
            l: open.min(price),
            c: price,
        }
    }

    pub fn apply_price(&mut self, price: f64) {
        self.h = self.h.max(price);
        self.l = self.l.min(price);
        self.c = price;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiCandlesBootstrap {
    pub channel: Channel,
    pub symbol: String,
    pub bucket_width_secs: i64,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiCandleUpdate {
    pub channel: Channel,
    pub symbol: String,
    pub candle: Candle,
    pub created: bool,
    pub closes_in_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedFailure {
    pub channel: Channel,
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoricalBarWire {
    pub ssboe: Option<NumberOrText>,
    #[serde(rename = "into")]
    pub open: Option<NumberOrText>,
    #[serde(rename = "inth")]
    pub high: Option<NumberOrText>,
    #[serde(rename = "intl")]
    pub low: Option<NumberOrText>,
    #[serde(rename = "intc")]
    pub close: Option<NumberOrText>,
}

fn required_finite(value: Option<&NumberOrText>, field: &str) -> Result<f64, AppError> {
    value
        .and_then(NumberOrText::as_finite_f64)
        .ok_or_else(|| AppError::InvalidArgument(format!("bar field {field} must be finite")))
}

impl TryFrom<HistoricalBarWire> for Candle {
    type Error = AppError;

    fn try_from(value: HistoricalBarWire) -> Result<Self, Self::Error> {
        let bucket_start = required_finite(value.ssboe.as_ref(), "ssboe")?;
        let open = required_finite(value.open.as_ref(), "into")?;
        let high = required_finite(value.high.as_ref(), "inth")?;
        let low = required_finite(value.low.as_ref(), "intl")?;
        let close = required_finite(value.close.as_ref(), "intc")?;

        Ok(Self {
            t: bucket_start.trunc() as i64,
            o: open,
            h: high.max(open).max(close),
            l: low.min(open).min(close),
            c: close,
        })
    }
}
