use crate::market::types::FeedState;
use crate::{error::AppError, state::AppState};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub feed: FeedState,
}

pub fn build_health_response(started_at: Instant, feed: FeedState) -> HealthResponse {
    let status = match feed {
        FeedState::Reconnecting => "degraded",
        _ => "ok",
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        feed,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let feed = state.feed_status.read().await.state;
    Ok(build_health_response(state.started_at, feed))
}
