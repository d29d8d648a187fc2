pub mod aggregator;
pub mod backend;
pub mod controller;
pub mod pipeline;
pub mod sink;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub const CANDLES_BOOTSTRAP_EVENT: &str = "candles_bootstrap";
pub const CANDLE_UPDATE_EVENT: &str = "candle_update";
pub const SEED_FAILED_EVENT: &str = "seed_failed";
pub const FEED_STATUS_EVENT: &str = "feed_status";
pub const PASSTHROUGH_EVENT: &str = "passthrough";
