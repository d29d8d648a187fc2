use crate::error::AppError;
use crate::market::backend::SeedSource;
use crate::market::controller::{SeedOutcome, SeedRequest, SubscriptionController};
use crate::market::sink::{RenderEvent, RenderSink};
use crate::market::transport::{ConnectOutcome, Transport};
use crate::market::types::{
    AtmAssignment, Candle, Channel, ConnectionStatus, FeedConfig, FeedState, FeedStatusSnapshot,
    InboundMessage, OutboundMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_HEARTBEAT_MS: u64 = 1_000;

#[derive(Debug)]
struct SeedLoaded {
    channel: Channel,
    generation: u64,
    result: Result<Vec<Candle>, AppError>,
}

struct FeedRuntimeContext<'a, S, R> {
    config: &'a FeedConfig,
    transport: &'a Transport,
    seed_source: &'a Arc<S>,
    sink: &'a R,
    status_store: &'a Arc<RwLock<FeedStatusSnapshot>>,
    seed_tx: &'a mpsc::UnboundedSender<SeedLoaded>,
    cancel_token: &'a CancellationToken,
}

pub async fn run_feed<S, R>(
    config: FeedConfig,
    transport: Transport,
    seed_source: Arc<S>,
    sink: Arc<R>,
    status_store: Arc<RwLock<FeedStatusSnapshot>>,
    cancel_token: CancellationToken,
) where
    S: SeedSource,
    R: RenderSink,
{
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(config.inbound_buffer);
    let (seed_tx, mut seed_rx) = mpsc::unbounded_channel::<SeedLoaded>();
    let mut status_rx = transport.subscribe_status();
    let mut controller = SubscriptionController::new(config.bucket_width_secs, config.open_policy);

    let context = FeedRuntimeContext {
        config: &config,
        transport: &transport,
        seed_source: &seed_source,
        sink: sink.as_ref(),
        status_store: &status_store,
        seed_tx: &seed_tx,
        cancel_token: &cancel_token,
    };

    if transport.connect(inbound_tx) == ConnectOutcome::AlreadyRunning {
        debug!("transport already running, reusing connection");
    }
    info!(host = %config.host, bucket_width_secs = config.bucket_width_secs, "feed started");
    publish_status(&context, &controller, Some("connecting to stream".to_string())).await;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            message = inbound_rx.recv() => {
                let Some(message) = message else {
                    warn!("transport stopped delivering messages");
                    break;
                };
                handle_inbound(message, &mut controller, &context);
            }
            Some(loaded) = seed_rx.recv() => {
                handle_seed_loaded(loaded, &mut controller, &context);
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let reason = status_reason(*status_rx.borrow_and_update());
                publish_status(&context, &controller, Some(reason.to_string())).await;
            }
            _ = heartbeat.tick() => {
                publish_status(&context, &controller, None).await;
            }
        }
    }

    drop(inbound_rx);
    transport.shutdown().await;

    let stopped = FeedStatusSnapshot {
        state: FeedState::Stopped,
        reason: Some("feed stopped".to_string()),
        ..build_status(&context, &controller, None)
    };
    store_and_emit_status(&context, stopped).await;
    info!(
        applied = controller.ticks_applied(),
        dropped = controller.ticks_dropped(),
        "feed stopped"
    );
}

fn handle_inbound<S, R>(
    message: InboundMessage,
    controller: &mut SubscriptionController,
    context: &FeedRuntimeContext<'_, S, R>,
) where
    S: SeedSource,
    R: RenderSink,
{
    match message {
        InboundMessage::Assignment(assignment) => {
            apply_assignment(&assignment, controller, context);
        }
        InboundMessage::Tick(tick) => {
            for update in controller.on_tick(&tick) {
                emit_event(context.sink, RenderEvent::CandleUpdate(update));
            }
        }
        InboundMessage::Passthrough { kind, raw } => {
            emit_event(context.sink, RenderEvent::Passthrough { kind, raw });
        }
    }
}

fn apply_assignment<S, R>(
    assignment: &AtmAssignment,
    controller: &mut SubscriptionController,
    context: &FeedRuntimeContext<'_, S, R>,
) where
    S: SeedSource,
    R: RenderSink,
{
    for channel in Channel::ALL {
        let Some(instrument) = assignment.for_channel(channel) else {
            continue;
        };
        let Some(request) =
            controller.set_active_instrument(channel, &instrument.symbol, instrument.token.clone())
        else {
            continue;
        };

        if context.config.send_subscriptions {
            send_subscription_change(context.transport, &request);
        }
        spawn_seed_load(context, request);
    }
}

fn send_subscription_change(transport: &Transport, request: &SeedRequest) {
    if let Some(previous) = request.previous_symbol.as_ref() {
        if let Err(error) = transport.send(OutboundMessage::Unsubscribe {
            symbol: previous.clone(),
        }) {
            debug!(%error, symbol = %previous, "unsubscribe not sent");
        }
    }
    if let Err(error) = transport.send(OutboundMessage::Subscribe {
        symbol: request.symbol.clone(),
    }) {
        debug!(%error, symbol = %request.symbol, "subscribe not sent");
    }
}

fn spawn_seed_load<S, R>(context: &FeedRuntimeContext<'_, S, R>, request: SeedRequest)
where
    S: SeedSource,
    R: RenderSink,
{
    let seed_source = Arc::clone(context.seed_source);
    let seed_tx = context.seed_tx.clone();
    let cancel_token = context.cancel_token.clone();

    tokio::spawn(async move {
        let SeedRequest {
            channel,
            symbol,
            generation,
            ..
        } = request;
        let result = tokio::select! {
            _ = cancel_token.cancelled() => return,
            result = seed_source.load_seed(&symbol) => result,
        };
        let _ = seed_tx.send(SeedLoaded {
            channel,
            generation,
            result,
        });
    });
}

fn handle_seed_loaded<S, R>(
    loaded: SeedLoaded,
    controller: &mut SubscriptionController,
    context: &FeedRuntimeContext<'_, S, R>,
) where
    S: SeedSource,
    R: RenderSink,
{
    match controller.apply_seed(loaded.channel, loaded.generation, loaded.result) {
        SeedOutcome::Installed(bootstrap) => {
            info!(
                channel = %bootstrap.channel,
                symbol = %bootstrap.symbol,
                candles = bootstrap.candles.len(),
                "historical candles loaded"
            );
            emit_event(context.sink, RenderEvent::CandlesBootstrap(bootstrap));
        }
        SeedOutcome::Failed(failure) => {
            warn!(
                channel = %failure.channel,
                symbol = %failure.symbol,
                reason = %failure.reason,
                "historical candles unavailable"
            );
            emit_event(context.sink, RenderEvent::SeedFailed(failure));
        }
        SeedOutcome::Superseded => {}
    }
}

fn emit_event<R: RenderSink>(sink: &R, event: RenderEvent) {
    let name = event.name();
    if let Err(error) = sink.emit(event) {
        warn!(%error, event = name, "failed to emit render event");
    }
}

fn feed_state(status: ConnectionStatus, reconnect_attempt: u32) -> FeedState {
    match status {
        ConnectionStatus::Open => FeedState::Live,
        ConnectionStatus::Connecting if reconnect_attempt == 0 => FeedState::Connecting,
        ConnectionStatus::Connecting | ConnectionStatus::Disconnected => FeedState::Reconnecting,
        ConnectionStatus::Closing => FeedState::Stopped,
    }
}

fn status_reason(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Open => "stream connected",
        ConnectionStatus::Connecting => "connecting to stream",
        ConnectionStatus::Disconnected => "stream disconnected, waiting to reconnect",
        ConnectionStatus::Closing => "closing stream",
    }
}

fn build_status<S, R>(
    context: &FeedRuntimeContext<'_, S, R>,
    controller: &SubscriptionController,
    reason: Option<String>,
) -> FeedStatusSnapshot {
    let reconnect_attempt = context.transport.reconnect_attempt();
    FeedStatusSnapshot {
        state: feed_state(context.transport.status(), reconnect_attempt),
        host: context.config.host.clone(),
        bucket_width_secs: context.config.bucket_width_secs,
        call_symbol: controller.active_symbol(Channel::Call).map(str::to_string),
        put_symbol: controller.active_symbol(Channel::Put).map(str::to_string),
        reconnect_attempt,
        retry_delay_ms: context.transport.retry_delay_ms(),
        ticks_applied: controller.ticks_applied(),
        ticks_dropped: controller.ticks_dropped(),
        last_tick_time: controller.last_tick_time(),
        reason,
    }
}

async fn publish_status<S, R>(
    context: &FeedRuntimeContext<'_, S, R>,
    controller: &SubscriptionController,
    reason: Option<String>,
) where
    R: RenderSink,
{
    let mut snapshot = build_status(context, controller, reason);
    if snapshot.reason.is_none() {
        let readable = context.status_store.read().await;
        if readable.state == snapshot.state {
            snapshot.reason = readable.reason.clone();
        }
    }
    store_and_emit_status(context, snapshot).await;
}

async fn store_and_emit_status<S, R>(
    context: &FeedRuntimeContext<'_, S, R>,
    snapshot: FeedStatusSnapshot,
) where
    R: RenderSink,
{
    {
        let mut writable = context.status_store.write().await;
        *writable = snapshot.clone();
    }
    emit_event(context.sink, RenderEvent::FeedStatus(snapshot));
}
