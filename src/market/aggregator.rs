use crate::market::types::{Candle, CandleOpenPolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Created(Candle),
    Updated(Candle),
    Late,
    Invalid,
}

impl TickOutcome {
    pub fn changed_candle(&self) -> Option<(Candle, bool)> {
        match self {
            Self::Created(candle) => Some((*candle, true)),
            Self::Updated(candle) => Some((*candle, false)),
            Self::Late | Self::Invalid => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects `candles` sorted by `t`. Bars off the `W` grid are floored onto
    /// it, and bars landing in one bucket are folded together.
    pub fn from_seed(candles: Vec<Candle>, bucket_width_secs: i64) -> Self {
        let mut aligned: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            let Some(t) = candle_bucket_open_time(candle.t as f64, bucket_width_secs) else {
                continue;
            };
            match aligned.last_mut() {
                Some(current) if current.t == t => {
                    current.h = current.h.max(candle.h);
                    current.l = current.l.min(candle.l);
                    current.c = candle.c;
                }
                Some(current) if current.t > t => {}
                _ => aligned.push(Candle { t, ..candle }),
            }
        }
        Self { candles: aligned }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn apply_tick(
        &mut self,
        bucket_width_secs: i64,
        price: f64,
        event_time: f64,
        open_policy: CandleOpenPolicy,
    ) -> TickOutcome {
        if !price.is_finite() || price <= 0.0 || !event_time.is_finite() || bucket_width_secs <= 0
        {
            return TickOutcome::Invalid;
        }
        let Some(bucket_open) = candle_bucket_open_time(event_time, bucket_width_secs) else {
            return TickOutcome::Invalid;
        };

        match self.candles.last_mut() {
            Some(current) if bucket_open < current.t => TickOutcome::Late,
            Some(current) if bucket_open == current.t => {
                current.apply_price(price);
                TickOutcome::Updated(*current)
            }
            previous => {
                let previous_close = previous.map(|candle| candle.c);
                let next = match (open_policy, previous_close) {
                    (CandleOpenPolicy::PreviousClose, Some(close)) => {
                        Candle::opened_at(bucket_open, close, price)
                    }
                    _ => Candle::from_tick(bucket_open, price),
                };
                self.candles.push(next);
                TickOutcome::Created(next)
            }
        }
    }
}

/// `floor(event_time / W) * W`, or `None` when the result leaves `i64`.
pub fn candle_bucket_open_time(event_time: f64, bucket_width_secs: i64) -> Option<i64> {
    if bucket_width_secs <= 0 || !event_time.is_finite() {
        return None;
    }
    let width = bucket_width_secs as f64;
    let bucket = (event_time / width).floor() * width;
    if bucket < i64::MIN as f64 || bucket >= i64::MAX as f64 {
        return None;
    }
    Some(bucket as i64)
}

pub fn seconds_until_close(bucket_open: i64, bucket_width_secs: i64, event_time: f64) -> i64 {
    let close_at = bucket_open.saturating_add(bucket_width_secs) as f64;
    (close_at - event_time).ceil().max(0.0) as i64
}

pub fn format_countdown(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}m{}s", seconds / 60, seconds % 60)
}
