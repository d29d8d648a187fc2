use crate::error::AppError;
use crate::market::aggregator::{seconds_until_close, CandleSeries, TickOutcome};
use crate::market::types::{
    Candle, CandleOpenPolicy, Channel, InstrumentToken, SeedFailure, Tick, UiCandleUpdate,
    UiCandlesBootstrap,
};
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRequest {
    pub channel: Channel,
    pub symbol: String,
    pub generation: u64,
    pub previous_symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeedOutcome {
    Installed(UiCandlesBootstrap),
    Failed(SeedFailure),
    Superseded,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    pub active_symbol: Option<String>,
    pub active_token: Option<InstrumentToken>,
    pub series: CandleSeries,
    pub generation: u64,
    pub seed_pending: bool,
    pub last_price: Option<f64>,
    pub last_tick_time: Option<f64>,
}

impl ChannelState {
    fn accepts(&self, token: &InstrumentToken) -> bool {
        self.active_token.as_ref() == Some(token)
    }
}

#[derive(Debug)]
pub struct SubscriptionController {
    bucket_width_secs: i64,
    open_policy: CandleOpenPolicy,
    call: ChannelState,
    put: ChannelState,
    ticks_applied: u64,
    ticks_dropped: u64,
}

impl SubscriptionController {
    pub fn new(bucket_width_secs: i64, open_policy: CandleOpenPolicy) -> Self {
        Self {
            bucket_width_secs,
            open_policy,
            call: ChannelState::default(),
            put: ChannelState::default(),
            ticks_applied: 0,
            ticks_dropped: 0,
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelState {
        match channel {
            Channel::Call => &self.call,
            Channel::Put => &self.put,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelState {
        match channel {
            Channel::Call => &mut self.call,
            Channel::Put => &mut self.put,
        }
    }

    pub fn active_symbol(&self, channel: Channel) -> Option<&str> {
        self.channel(channel).active_symbol.as_deref()
    }

    pub fn series(&self, channel: Channel) -> &[Candle] {
        self.channel(channel).series.candles()
    }

    pub fn ticks_applied(&self) -> u64 {
        self.ticks_applied
    }

    pub fn ticks_dropped(&self) -> u64 {
        self.ticks_dropped
    }

    pub fn last_tick_time(&self) -> Option<f64> {
        Channel::ALL
            .into_iter()
            .filter_map(|channel| self.channel(channel).last_tick_time)
            .reduce(f64::max)
    }

    pub fn set_active_instrument(
        &mut self,
        channel: Channel,
        symbol: &str,
        token: InstrumentToken,
    ) -> Option<SeedRequest> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            debug!(%channel, "ignoring empty instrument assignment");
            return None;
        }

        let state = self.channel_mut(channel);
        if state.active_symbol.as_deref() == Some(symbol) {
            if state.active_token.as_ref() != Some(&token) {
                info!(%channel, symbol, %token, "instrument token changed, keeping series");
                state.active_token = Some(token);
            }
            return None;
        }

        let previous_symbol = state.active_symbol.replace(symbol.to_string());
        state.active_token = Some(token);
        state.series = CandleSeries::new();
        state.generation = state.generation.wrapping_add(1);
        state.seed_pending = true;
        state.last_price = None;
        state.last_tick_time = None;

        info!(
            %channel,
            symbol,
            previous = previous_symbol.as_deref().unwrap_or("-"),
            generation = state.generation,
            "switching instrument"
        );

        Some(SeedRequest {
            channel,
            symbol: symbol.to_string(),
            generation: state.generation,
            previous_symbol,
        })
    }

    pub fn apply_seed(
        &mut self,
        channel: Channel,
        generation: u64,
        result: Result<Vec<Candle>, AppError>,
    ) -> SeedOutcome {
        let bucket_width_secs = self.bucket_width_secs;
        let state = self.channel_mut(channel);
        if state.generation != generation {
            debug!(
                %channel,
                generation,
                current = state.generation,
                "discarding superseded seed load"
            );
            return SeedOutcome::Superseded;
        }

        let symbol = state.active_symbol.clone().unwrap_or_default();
        state.seed_pending = false;

        match result {
            Ok(candles) => {
                state.series = CandleSeries::from_seed(candles, bucket_width_secs);
                if let Some(last) = state.series.last() {
                    state.last_price = Some(last.c);
                }
                SeedOutcome::Installed(UiCandlesBootstrap {
                    channel,
                    symbol,
                    bucket_width_secs,
                    candles: state.series.candles().to_vec(),
                })
            }
            Err(error) => {
                state.series = CandleSeries::new();
                SeedOutcome::Failed(SeedFailure {
                    channel,
                    symbol,
                    reason: error.to_string(),
                })
            }
        }
    }

    pub fn on_tick(&mut self, tick: &Tick) -> Vec<UiCandleUpdate> {
        let bucket_width_secs = self.bucket_width_secs;
        let open_policy = self.open_policy;
        let mut updates = Vec::new();
        let mut matched = false;

        for channel in Channel::ALL {
            let state = self.channel_mut(channel);
            if !state.accepts(&tick.token) {
                continue;
            }
            matched = true;
            if state.seed_pending {
                trace!(%channel, token = %tick.token, "dropping tick during seed load");
                continue;
            }

            let outcome = state.series.apply_tick(
                bucket_width_secs,
                tick.price,
                tick.event_time,
                open_policy,
            );
            let Some((candle, created)) = outcome.changed_candle() else {
                if outcome == TickOutcome::Late {
                    trace!(%channel, event_time = tick.event_time, "dropping late tick");
                }
                continue;
            };

            state.last_price = Some(tick.price);
            state.last_tick_time = Some(tick.event_time);
            updates.push(UiCandleUpdate {
                channel,
                symbol: state.active_symbol.clone().unwrap_or_default(),
                candle,
                created,
                closes_in_secs: seconds_until_close(candle.t, bucket_width_secs, tick.event_time),
            });
        }

        if updates.is_empty() {
            if !matched {
                trace!(token = %tick.token, "dropping tick for inactive token");
            }
            self.ticks_dropped = self.ticks_dropped.saturating_add(1);
        } else {
            self.ticks_applied = self.ticks_applied.saturating_add(1);
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SubscriptionController {
        SubscriptionController::new(180, CandleOpenPolicy::TickPrice)
    }

    fn tick(token: &str, price: f64, event_time: f64) -> Tick {
        Tick {
            token: InstrumentToken::new(token),
            price,
            event_time,
        }
    }

    fn seed() -> Vec<Candle> {
        vec![
            Candle {
                t: 0,
                o: 100.0,
                h: 105.0,
                l: 95.0,
                c: 95.0,
            },
            Candle::from_tick(180, 110.0),
        ]
    }

    #[test]
    fn switch_returns_seed_request_and_resets_series() {
        let mut controller = controller();
        let first = controller
            .set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("1"))
            .expect("first assignment should request a seed");
        controller.apply_seed(Channel::Call, first.generation, Ok(seed()));
        assert_eq!(controller.series(Channel::Call).len(), 2);

        let second = controller
            .set_active_instrument(Channel::Call, "SYM2", InstrumentToken::new("2"))
            .expect("switch should request a seed");

        assert_eq!(second.symbol, "SYM2");
        assert_eq!(second.previous_symbol.as_deref(), Some("SYM1"));
        assert_eq!(second.generation, first.generation + 1);
        assert!(controller.series(Channel::Call).is_empty());
        assert!(controller.channel(Channel::Call).seed_pending);
    }

    #[test]
    fn same_symbol_is_a_noop() {
        let mut controller = controller();
        let request = controller
            .set_active_instrument(Channel::Put, "SYM1", InstrumentToken::new("1"))
            .expect("first assignment should request a seed");
        controller.apply_seed(Channel::Put, request.generation, Ok(seed()));

        assert!(controller
            .set_active_instrument(Channel::Put, "SYM1", InstrumentToken::new("1"))
            .is_none());
        assert_eq!(controller.series(Channel::Put).len(), 2);
    }

    #[test]
    fn same_symbol_with_new_token_updates_token_only() {
        let mut controller = controller();
        let request = controller
            .set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("1"))
            .expect("first assignment should request a seed");
        controller.apply_seed(Channel::Call, request.generation, Ok(seed()));

        assert!(controller
            .set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("9"))
            .is_none());

        let state = controller.channel(Channel::Call);
        assert_eq!(state.active_token, Some(InstrumentToken::new("9")));
        assert_eq!(state.generation, request.generation);
        assert_eq!(state.series.len(), 2);
    }

    #[test]
    fn empty_symbol_is_ignored() {
        let mut controller = controller();
        assert!(controller
            .set_active_instrument(Channel::Call, "  ", InstrumentToken::new("1"))
            .is_none());
        assert_eq!(controller.active_symbol(Channel::Call), None);
    }

    #[test]
    fn superseded_seed_does_not_overwrite_series() {
        let mut controller = controller();
        let sym2 = controller
            .set_active_instrument(Channel::Call, "SYM2", InstrumentToken::new("2"))
            .expect("switch should request a seed");
        let sym3 = controller
            .set_active_instrument(Channel::Call, "SYM3", InstrumentToken::new("3"))
            .expect("switch should request a seed");

        let stale = controller.apply_seed(Channel::Call, sym2.generation, Ok(seed()));
        assert_eq!(stale, SeedOutcome::Superseded);
        assert!(controller.series(Channel::Call).is_empty());
        assert!(controller.channel(Channel::Call).seed_pending);

        let fresh = controller.apply_seed(
            Channel::Call,
            sym3.generation,
            Ok(vec![Candle::from_tick(0, 7.0)]),
        );
        match fresh {
            SeedOutcome::Installed(bootstrap) => {
                assert_eq!(bootstrap.symbol, "SYM3");
                assert_eq!(bootstrap.candles, vec![Candle::from_tick(0, 7.0)]);
            }
            other => panic!("expected installed seed, got {other:?}"),
        }
    }

    #[test]
    fn seed_failure_leaves_empty_series_and_accepts_ticks() {
        let mut controller = controller();
        let request = controller
            .set_active_instrument(Channel::Put, "SYM1", InstrumentToken::new("1"))
            .expect("switch should request a seed");

        let outcome = controller.apply_seed(
            Channel::Put,
            request.generation,
            Err(AppError::seed_load("SYM1", AppError::InvalidArgument("boom".to_string()))),
        );
        match outcome {
            SeedOutcome::Failed(failure) => {
                assert_eq!(failure.channel, Channel::Put);
                assert_eq!(failure.symbol, "SYM1");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let updates = controller.on_tick(&tick("1", 100.0, 10.0));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].created);
        assert_eq!(controller.series(Channel::Put), &[Candle::from_tick(0, 100.0)]);
    }

    #[test]
    fn drops_ticks_while_seed_is_pending() {
        let mut controller = controller();
        controller.set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("1"));

        assert!(controller.on_tick(&tick("1", 100.0, 10.0)).is_empty());
        assert_eq!(controller.ticks_dropped(), 1);
        assert_eq!(controller.ticks_applied(), 0);
    }

    #[test]
    fn routes_ticks_by_normalized_token() {
        let mut controller = controller();
        let call = controller
            .set_active_instrument(Channel::Call, "CE", InstrumentToken::new("26000"))
            .expect("switch should request a seed");
        let put = controller
            .set_active_instrument(Channel::Put, "PE", InstrumentToken::new("26001"))
            .expect("switch should request a seed");
        controller.apply_seed(Channel::Call, call.generation, Ok(seed()));
        controller.apply_seed(Channel::Put, put.generation, Ok(Vec::new()));

        let updates = controller.on_tick(&tick("26000", 112.0, 200.0));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].channel, Channel::Call);
        assert!(!updates[0].created);
        assert_eq!(updates[0].candle.h, 112.0);
        assert_eq!(updates[0].closes_in_secs, 160);
        assert!(controller.series(Channel::Put).is_empty());

        assert!(controller.on_tick(&tick("999", 1.0, 200.0)).is_empty());
        assert_eq!(controller.ticks_applied(), 1);
        assert_eq!(controller.ticks_dropped(), 1);
    }

    #[test]
    fn old_token_ticks_are_dropped_after_switch() {
        let mut controller = controller();
        let first = controller
            .set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("1"))
            .expect("switch should request a seed");
        controller.apply_seed(Channel::Call, first.generation, Ok(Vec::new()));
        let second = controller
            .set_active_instrument(Channel::Call, "SYM2", InstrumentToken::new("2"))
            .expect("switch should request a seed");
        controller.apply_seed(Channel::Call, second.generation, Ok(Vec::new()));

        assert!(controller.on_tick(&tick("1", 100.0, 10.0)).is_empty());
        assert!(controller.series(Channel::Call).is_empty());
    }

    #[test]
    fn late_tick_after_seed_is_dropped() {
        let mut controller = controller();
        let request = controller
            .set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("1"))
            .expect("switch should request a seed");
        controller.apply_seed(Channel::Call, request.generation, Ok(seed()));

        assert!(controller.on_tick(&tick("1", 50.0, 179.0)).is_empty());
        assert_eq!(controller.series(Channel::Call), seed().as_slice());
    }

    #[test]
    fn misaligned_seed_keeps_live_ticks_on_the_grid() {
        let mut controller = controller();
        let request = controller
            .set_active_instrument(Channel::Call, "SYM1", InstrumentToken::new("1"))
            .expect("switch should request a seed");
        let outcome = controller.apply_seed(
            Channel::Call,
            request.generation,
            Ok(vec![Candle::from_tick(60, 1.0), Candle::from_tick(240, 2.0)]),
        );
        match outcome {
            SeedOutcome::Installed(bootstrap) => {
                assert_eq!(bootstrap.candles[0].t, 0);
                assert_eq!(bootstrap.candles[1].t, 180);
            }
            other => panic!("expected installed seed, got {other:?}"),
        }

        let updates = controller.on_tick(&tick("1", 3.0, 300.0));
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].created);
        assert_eq!(updates[0].candle.t, 180);
        assert_eq!(updates[0].candle.c, 3.0);
    }

    #[test]
    fn last_tick_time_tracks_newest_applied_tick() {
        let mut controller = controller();
        let call = controller
            .set_active_instrument(Channel::Call, "CE", InstrumentToken::new("1"))
            .expect("switch should request a seed");
        let put = controller
            .set_active_instrument(Channel::Put, "PE", InstrumentToken::new("2"))
            .expect("switch should request a seed");
        assert_eq!(controller.last_tick_time(), None);

        controller.apply_seed(Channel::Call, call.generation, Ok(Vec::new()));
        controller.apply_seed(Channel::Put, put.generation, Ok(Vec::new()));
        controller.on_tick(&tick("1", 100.0, 50.0));
        controller.on_tick(&tick("2", 90.0, 40.0));
        assert_eq!(controller.last_tick_time(), Some(50.0));

        controller.on_tick(&tick("2", 91.0, 70.0));
        assert_eq!(controller.last_tick_time(), Some(70.0));
    }
}
