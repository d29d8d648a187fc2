use crate::error::AppError;
use crate::market::types::{Candle, HistoricalBarWire};
use reqwest::{Client, Url};
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const HISTORICAL_DATA_PATH: &str = "api/fetchHistoricalData";
const FIRST_FETCH_PATH: &str = "api/firstFetch";

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn historical_data_endpoint(rest_base: &str, symbol: &str) -> Result<Url, AppError> {
    let mut url = Url::parse(rest_base)
        .map_err(|error| AppError::InvalidArgument(format!("invalid rest base url: {error}")))?;
    url.path_segments_mut()
        .map_err(|_| AppError::InvalidArgument("rest base url cannot carry a path".to_string()))?
        .pop_if_empty()
        .extend(HISTORICAL_DATA_PATH.split('/'))
        .push(symbol);
    Ok(url)
}

fn first_fetch_endpoint(rest_base: &str) -> String {
    format!("{}/{FIRST_FETCH_PATH}", rest_base.trim_end_matches('/'))
}

pub async fn connect_feed_stream(url: &str) -> Result<FeedWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

/// Best-effort import: records that do not yield five finite numbers are
/// skipped, the rest are sorted by bucket with the first record per bucket kept.
pub fn normalize_seed(records: Vec<serde_json::Value>) -> Vec<Candle> {
    let total = records.len();
    let mut candles: Vec<Candle> = records
        .into_iter()
        .filter_map(|record| serde_json::from_value::<HistoricalBarWire>(record).ok())
        .filter_map(|wire| Candle::try_from(wire).ok())
        .collect();

    candles.sort_by_key(|candle| candle.t);
    candles.dedup_by_key(|candle| candle.t);

    if candles.len() < total {
        debug!(
            kept = candles.len(),
            discarded = total - candles.len(),
            "dropped malformed or duplicate historical bars"
        );
    }
    candles
}

pub trait SeedSource: Send + Sync + 'static {
    fn load_seed(&self, symbol: &str) -> impl Future<Output = Result<Vec<Candle>, AppError>> + Send;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    rest_base: String,
}

impl BackendClient {
    pub fn new(http: Client, rest_base: impl Into<String>) -> Self {
        Self {
            http,
            rest_base: rest_base.into(),
        }
    }

    pub fn rest_base(&self) -> &str {
        &self.rest_base
    }

    pub async fn fetch_historical_data(&self, symbol: &str) -> Result<Vec<Candle>, AppError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(AppError::seed_load(
                symbol,
                AppError::InvalidArgument("symbol must not be empty".to_string()),
            ));
        }

        let fetch = async {
            let endpoint = historical_data_endpoint(&self.rest_base, symbol)?;
            let response = self.http.get(endpoint).send().await?.error_for_status()?;
            let records = response.json::<Vec<serde_json::Value>>().await?;
            Ok::<_, AppError>(normalize_seed(records))
        };

        fetch
            .await
            .map_err(|error| AppError::seed_load(symbol, error))
    }

    pub async fn trigger_first_fetch(&self) -> Result<(), AppError> {
        let endpoint = first_fetch_endpoint(&self.rest_base);
        self.http.post(endpoint).send().await?.error_for_status()?;
        Ok(())
    }

    pub fn spawn_first_fetch(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            match client.trigger_first_fetch().await {
                Ok(()) => debug!(rest_base = %client.rest_base, "first fetch triggered"),
                Err(error) => warn!(%error, "first fetch trigger failed"),
            }
        });
    }
}

impl SeedSource for BackendClient {
    fn load_seed(&self, symbol: &str) -> impl Future<Output = Result<Vec<Candle>, AppError>> + Send {
        let symbol = symbol.to_string();
        async move { self.fetch_historical_data(&symbol).await }
    }
}
