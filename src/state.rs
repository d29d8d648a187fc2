use crate::market::types::{FeedStatusSnapshot, DEFAULT_HOST};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct FeedHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub feed: Mutex<Option<FeedHandle>>,
    pub feed_status: Arc<RwLock<FeedStatusSnapshot>>,
}

impl AppState {
    pub fn new() -> Self {
        let feed_status =
            FeedStatusSnapshot::stopped(DEFAULT_HOST.to_string(), Some("feed idle".to_string()));

        Self {
            started_at: Instant::now(),
            feed: Mutex::new(None),
            feed_status: Arc::new(RwLock::new(feed_status)),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
