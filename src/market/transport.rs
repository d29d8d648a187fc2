use crate::error::AppError;
use crate::market::backend::{connect_feed_stream, BackendClient, FeedWsStream};
use crate::market::types::{
    parse_inbound_frame, ConnectionStatus, FeedConfig, InboundMessage, OutboundMessage,
    ReconnectPolicy,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLOSE_FRAME_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub handshake: String,
    pub reconnect_policy: ReconnectPolicy,
    pub ping_interval: Duration,
}

impl TransportConfig {
    pub fn from_feed_config(config: &FeedConfig) -> Self {
        Self {
            url: config.ws_url(),
            handshake: config.handshake.clone(),
            reconnect_policy: config.reconnect_policy,
            ping_interval: Duration::from_millis(config.ping_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyRunning,
}

enum SessionEnd {
    Cancelled,
    Dropped,
    ReceiverGone,
}

struct SessionHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

#[derive(Default)]
struct TransportSlot {
    session: Option<SessionHandle>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reconnect_attempt: u32,
    retry_delay_ms: Option<u64>,
}

struct TransportShared {
    config: TransportConfig,
    backend: Option<BackendClient>,
    slot: Mutex<TransportSlot>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl TransportShared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, url = %self.config.url, "transport status changed");
        }
    }

    fn clear_outbound(&self) {
        self.slot.lock().outbound = None;
    }
}

#[derive(Clone)]
pub struct Transport {
    shared: Arc<TransportShared>,
}

impl Transport {
    pub fn new(config: TransportConfig, backend: Option<BackendClient>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(TransportShared {
                config,
                backend,
                slot: Mutex::new(TransportSlot::default()),
                status_tx,
            }),
        }
    }

    /// Starts the supervisor unless one is already live, in which case the
    /// existing connection is kept and `on_message` is not rebound.
    pub fn connect(&self, on_message: mpsc::Sender<InboundMessage>) -> ConnectOutcome {
        let mut slot = self.shared.slot.lock();
        if let Some(session) = slot.session.as_ref() {
            if !session.join_handle.is_finished() {
                return ConnectOutcome::AlreadyRunning;
            }
        }

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let shared = Arc::clone(&self.shared);
        let join_handle = tokio::spawn(async move {
            run_transport(shared, on_message, task_token).await;
        });

        slot.session = Some(SessionHandle {
            cancellation_token,
            join_handle,
        });
        slot.reconnect_attempt = 0;
        slot.retry_delay_ms = None;
        ConnectOutcome::Started
    }

    pub fn send(&self, message: OutboundMessage) -> Result<(), AppError> {
        if self.status() != ConnectionStatus::Open {
            return Err(AppError::NotConnected);
        }
        let text = message.encode()?;
        let slot = self.shared.slot.lock();
        let outbound = slot.outbound.as_ref().ok_or(AppError::NotConnected)?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| AppError::NotConnected)
    }

    pub async fn shutdown(&self) {
        let session = self.shared.slot.lock().session.take();
        if let Some(session) = session {
            self.shared.set_status(ConnectionStatus::Closing);
            session.cancellation_token.cancel();
            if let Err(error) = session.join_handle.await {
                warn!(%error, "transport task ended abnormally");
            }
        }
        self.shared.clear_outbound();
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.slot.lock().reconnect_attempt
    }

    pub fn retry_delay_ms(&self) -> Option<u64> {
        self.shared.slot.lock().retry_delay_ms
    }
}

async fn run_transport(
    shared: Arc<TransportShared>,
    on_message: mpsc::Sender<InboundMessage>,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        shared.set_status(ConnectionStatus::Connecting);

        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_feed_stream(&shared.config.url) => result,
        };

        match connected {
            Ok(stream) => {
                reconnect_attempt = 0;
                {
                    let mut slot = shared.slot.lock();
                    slot.reconnect_attempt = 0;
                    slot.retry_delay_ms = None;
                }

                match run_session(&shared, stream, &on_message, &cancel_token).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::ReceiverGone => {
                        info!("message receiver dropped, stopping transport");
                        break;
                    }
                    SessionEnd::Dropped => {}
                }
            }
            Err(error) => {
                warn!(%error, url = %shared.config.url, "stream connect failed");
            }
        }

        if cancel_token.is_cancelled() {
            break;
        }

        shared.set_status(ConnectionStatus::Disconnected);
        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = shared.config.reconnect_policy.delay(reconnect_attempt);
        {
            let mut slot = shared.slot.lock();
            slot.reconnect_attempt = reconnect_attempt;
            slot.retry_delay_ms = Some(delay.as_millis().min(u64::MAX as u128) as u64);
        }
        info!(
            attempt = reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling stream reconnect"
        );

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.clear_outbound();
    shared.set_status(ConnectionStatus::Disconnected);
}

async fn run_session(
    shared: &TransportShared,
    stream: FeedWsStream,
    on_message: &mpsc::Sender<InboundMessage>,
    cancel_token: &CancellationToken,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    if let Err(error) = write
        .send(Message::Text(shared.config.handshake.clone()))
        .await
    {
        warn!(%error, "failed to send handshake");
        return SessionEnd::Dropped;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    shared.slot.lock().outbound = Some(outbound_tx);
    shared.set_status(ConnectionStatus::Open);
    info!(url = %shared.config.url, "stream open");

    if let Some(backend) = shared.backend.as_ref() {
        backend.spawn_first_fetch();
    }

    let ping_interval = shared.config.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let end = loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                let close = tokio::time::timeout(
                    Duration::from_millis(CLOSE_FRAME_TIMEOUT_MS),
                    write.close(),
                );
                if let Ok(Err(error)) = close.await {
                    debug!(%error, "close frame not delivered");
                }
                break SessionEnd::Cancelled;
            }
            Some(message) = outbound_rx.recv() => {
                if let Err(error) = write.send(message).await {
                    warn!(%error, "stream write failed");
                    break SessionEnd::Dropped;
                }
            }
            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("ping failed, connection likely dead");
                    break SessionEnd::Dropped;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(end) = dispatch_frame(&text, on_message, cancel_token).await {
                        break end;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if let Some(end) = dispatch_frame(&text, on_message, cancel_token).await {
                            break end;
                        }
                    }
                    Err(error) => debug!(%error, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "server closed stream");
                    break SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%error, "stream read failed");
                    break SessionEnd::Dropped;
                }
                None => break SessionEnd::Dropped,
            },
        }
    };

    shared.clear_outbound();
    end
}

/// A full inbound buffer blocks here, so cancellation must be raced.
async fn dispatch_frame(
    raw: &str,
    on_message: &mpsc::Sender<InboundMessage>,
    cancel_token: &CancellationToken,
) -> Option<SessionEnd> {
    let message = match parse_inbound_frame(raw) {
        Ok(message) => message,
        Err(error) => {
            debug!(%error, "dropping unparseable frame");
            return None;
        }
    };

    tokio::select! {
        _ = cancel_token.cancelled() => Some(SessionEnd::Cancelled),
        sent = on_message.send(message) => sent.err().map(|_| SessionEnd::ReceiverGone),
    }
}
