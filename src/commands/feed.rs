use crate::error::AppError;
use crate::market::backend::{BackendClient, SeedSource};
use crate::market::pipeline::run_feed;
use crate::market::sink::RenderSink;
use crate::market::transport::{Transport, TransportConfig};
use crate::market::types::{
    FeedConfig, FeedSession, FeedState, FeedStatusSnapshot, FeedStopResult, StartFeedArgs,
};
use crate::state::{AppState, FeedHandle};
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn start_feed<R: RenderSink>(
    state: &AppState,
    sink: Arc<R>,
    args: Option<StartFeedArgs>,
) -> Result<FeedSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let backend = BackendClient::new(Client::new(), config.rest_base_url());
    start_feed_with(state, config, Arc::new(backend.clone()), sink, Some(backend)).await
}

pub async fn start_feed_with<S, R>(
    state: &AppState,
    config: FeedConfig,
    seed_source: Arc<S>,
    sink: Arc<R>,
    first_fetch: Option<BackendClient>,
) -> Result<FeedSession, AppError>
where
    S: SeedSource,
    R: RenderSink,
{
    stop_running_feed(state).await;

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let status_store = Arc::clone(&state.feed_status);
    let transport = Transport::new(TransportConfig::from_feed_config(&config), first_fetch);
    let runtime_config = config.clone();

    let join_handle = tokio::spawn(async move {
        run_feed(
            runtime_config,
            transport,
            seed_source,
            sink,
            status_store,
            task_token,
        )
        .await;
    });

    {
        let mut feed_slot = state.feed.lock().await;
        *feed_slot = Some(FeedHandle {
            cancellation_token,
            join_handle,
        });
    }

    Ok(FeedSession::from_config(&config))
}

pub async fn stop_feed(state: &AppState) -> Result<FeedStopResult, AppError> {
    let stopped = stop_running_feed(state).await;

    {
        let mut writable = state.feed_status.write().await;
        writable.state = FeedState::Stopped;
        writable.reconnect_attempt = 0;
        writable.retry_delay_ms = None;
        writable.reason = Some("feed stopped by command".to_string());
    }

    Ok(FeedStopResult { stopped })
}

pub async fn feed_status(state: &AppState) -> Result<FeedStatusSnapshot, AppError> {
    let snapshot = state.feed_status.read().await.clone();
    Ok(snapshot)
}

async fn stop_running_feed(state: &AppState) -> bool {
    let existing_handle = {
        let mut feed_slot = state.feed.lock().await;
        feed_slot.take()
    };

    let Some(handle) = existing_handle else {
        return false;
    };
    handle.cancellation_token.cancel();
    if let Err(error) = handle.join_handle.await {
        warn!(%error, "feed task ended abnormally");
    }
    true
}
