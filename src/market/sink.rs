use crate::error::AppError;
use crate::market::aggregator::format_countdown;
use crate::market::types::{FeedStatusSnapshot, SeedFailure, UiCandleUpdate, UiCandlesBootstrap};
use crate::market::{
    CANDLES_BOOTSTRAP_EVENT, CANDLE_UPDATE_EVENT, FEED_STATUS_EVENT, PASSTHROUGH_EVENT,
    SEED_FAILED_EVENT,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RenderEvent {
    CandlesBootstrap(UiCandlesBootstrap),
    CandleUpdate(UiCandleUpdate),
    SeedFailed(SeedFailure),
    FeedStatus(FeedStatusSnapshot),
    Passthrough { kind: String, raw: String },
}

impl RenderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CandlesBootstrap(_) => CANDLES_BOOTSTRAP_EVENT,
            Self::CandleUpdate(_) => CANDLE_UPDATE_EVENT,
            Self::SeedFailed(_) => SEED_FAILED_EVENT,
            Self::FeedStatus(_) => FEED_STATUS_EVENT,
            Self::Passthrough { .. } => PASSTHROUGH_EVENT,
        }
    }
}

pub trait RenderSink: Send + Sync + 'static {
    fn emit(&self, event: RenderEvent) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct ChannelRenderSink {
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl ChannelRenderSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RenderSink for ChannelRenderSink {
    fn emit(&self, event: RenderEvent) -> Result<(), AppError> {
        self.tx.send(event).map_err(|_| AppError::SinkClosed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRenderSink;

impl RenderSink for TracingRenderSink {
    fn emit(&self, event: RenderEvent) -> Result<(), AppError> {
        let name = event.name();
        match &event {
            RenderEvent::CandlesBootstrap(payload) => info!(
                event = name,
                channel = %payload.channel,
                symbol = %payload.symbol,
                candles = payload.candles.len()
            ),
            RenderEvent::CandleUpdate(payload) => debug!(
                event = name,
                channel = %payload.channel,
                symbol = %payload.symbol,
                t = payload.candle.t,
                o = payload.candle.o,
                h = payload.candle.h,
                l = payload.candle.l,
                c = payload.candle.c,
                created = payload.created,
                closes_in = %format_countdown(payload.closes_in_secs)
            ),
            RenderEvent::SeedFailed(payload) => warn!(
                event = name,
                channel = %payload.channel,
                symbol = %payload.symbol,
                reason = %payload.reason
            ),
            RenderEvent::FeedStatus(payload) => debug!(
                event = name,
                state = ?payload.state,
                attempt = payload.reconnect_attempt,
                applied = payload.ticks_applied,
                dropped = payload.ticks_dropped
            ),
            RenderEvent::Passthrough { kind, .. } => debug!(event = name, kind = %kind),
        }
        Ok(())
    }
}
