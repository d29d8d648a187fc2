use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub async fn serve_http_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test listener should bind");
    let address = listener.local_addr().expect("listener should have an address");
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("client should connect");
        let mut head = Vec::new();
        let mut buffer = [0_u8; 1_024];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = socket.read(&mut buffer).await.expect("request should be readable");
            if read == 0 {
                break;
            }
            head.extend_from_slice(&buffer[..read]);
        }
        socket
            .write_all(response.as_bytes())
            .await
            .expect("response should be writable");
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&head).into_owned()
    });

    (format!("http://{address}"), handle)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Accepted(usize),
    Text(usize, String),
    Closed(usize),
}

pub struct FakeFeedServer {
    pub host: String,
    pub accepted: Arc<AtomicUsize>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    push_tx: tokio::sync::broadcast::Sender<ServerPush>,
}

#[derive(Debug, Clone)]
enum ServerPush {
    Text(String),
    DropAll,
}

impl FakeFeedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("test listener should bind");
        let address = listener.local_addr().expect("listener should have an address");
        let accepted = Arc::new(AtomicUsize::new(0));
        let (events_tx, events) = mpsc::unbounded_channel();
        let (push_tx, _) = tokio::sync::broadcast::channel::<ServerPush>(64);

        let accept_counter = Arc::clone(&accepted);
        let accept_push = push_tx.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(websocket) = accept_async(stream).await else {
                    continue;
                };
                let id = accept_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = events_tx.send(ServerEvent::Accepted(id));
                let connection_events = events_tx.clone();
                let mut push_rx = accept_push.subscribe();

                tokio::spawn(async move {
                    let (mut write, mut read) = websocket.split();
                    loop {
                        tokio::select! {
                            pushed = push_rx.recv() => match pushed {
                                Ok(ServerPush::Text(text)) => {
                                    if write.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(ServerPush::DropAll) | Err(_) => {
                                    let _ = write.close().await;
                                    break;
                                }
                            },
                            incoming = read.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = connection_events.send(ServerEvent::Text(id, text));
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                    let _ = connection_events.send(ServerEvent::Closed(id));
                });
            }
        });

        Self {
            host: address.to_string(),
            accepted,
            events,
            push_tx,
        }
    }

    pub fn push(&self, text: &str) {
        let _ = self.push_tx.send(ServerPush::Text(text.to_string()));
    }

    pub fn drop_all(&self) {
        let _ = self.push_tx.send(ServerPush::DropAll);
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn wait_for<F>(&mut self, mut predicate: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("server should keep running");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected server event did not arrive in time")
    }
}
