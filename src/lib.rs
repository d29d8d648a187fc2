pub mod commands;
pub mod error;
pub mod market;
pub mod state;

use commands::{app_info::app_info, feed::start_feed, feed::stop_feed};
use error::AppError;
use market::sink::TracingRenderSink;
use market::types::{ReconnectPolicyKind, StartFeedArgs};
use state::AppState;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const HOST_ENV: &str = "FEED_HOST";
const BUCKET_SECS_ENV: &str = "FEED_BUCKET_SECS";
const RECONNECT_MS_ENV: &str = "FEED_RECONNECT_MS";
const RECONNECT_POLICY_ENV: &str = "FEED_RECONNECT_POLICY";

pub fn args_from_env<F>(lookup: F) -> Result<StartFeedArgs, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let parse_number = |key: &str| -> Result<Option<u64>, AppError> {
        read(key)
            .map(|value| {
                value
                    .parse::<u64>()
                    .map_err(|_| AppError::InvalidArgument(format!("{key} must be a number")))
            })
            .transpose()
    };

    let reconnect_policy = match read(RECONNECT_POLICY_ENV).as_deref() {
        None => None,
        Some("fixed") => Some(ReconnectPolicyKind::Fixed),
        Some("backoff") => Some(ReconnectPolicyKind::Backoff),
        Some(other) => {
            return Err(AppError::InvalidArgument(format!(
                "{RECONNECT_POLICY_ENV} must be fixed or backoff, got {other}"
            )))
        }
    };

    let bucket_width_secs = parse_number(BUCKET_SECS_ENV)?
        .map(|secs| {
            i64::try_from(secs).map_err(|_| {
                AppError::InvalidArgument(format!("{BUCKET_SECS_ENV} is out of range"))
            })
        })
        .transpose()?;

    Ok(StartFeedArgs {
        host: read(HOST_ENV),
        bucket_width_secs,
        reconnect_delay_ms: parse_number(RECONNECT_MS_ENV)?,
        reconnect_policy,
        ..StartFeedArgs::default()
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub async fn run() -> Result<(), AppError> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let info = app_info();
    info!(product = %info.product_name, version = %info.version, "starting");

    let args = args_from_env(|key| std::env::var(key).ok())?;
    let state = AppState::new();
    let session = start_feed(&state, Arc::new(TracingRenderSink), Some(args)).await?;
    info!(host = %session.host, bucket_width_secs = session.bucket_width_secs, "feed running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    stop_feed(&state).await?;
    Ok(())
}
