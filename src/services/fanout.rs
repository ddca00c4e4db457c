//! Websocket fan-out server.
//!
//! Listens on its own port, keeps the connected-client set, and pushes
//! typed JSON messages to every client through a broadcast channel. Per
//! connection, message ordering is preserved; across connections it is
//! not. Slow clients that lag past the channel capacity lose messages and
//! are told nothing; the historical tables remain the source of truth.

use crate::models::messages::{ClientMessage, FanoutMessage};
use crate::services::timefmt::TimeService;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BROADCAST_CAPACITY: usize = 1024;

pub struct FanoutServer {
    tx: broadcast::Sender<FanoutMessage>,
    clients: AtomicUsize,
    time: TimeService,
}

impl FanoutServer {
    pub fn new(time: TimeService) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            clients: AtomicUsize::new(0),
            time,
        }
    }

    /// Queue a message for every connected client. Returns the number of
    /// clients that will receive it.
    pub fn broadcast(&self, msg: FanoutMessage) -> usize {
        match self.tx.send(msg) {
            Ok(receivers) => {
                debug!(receivers, "broadcast queued");
                receivers
            }
            Err(_) => {
                debug!("broadcast with no connected clients");
                0
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Serve on an already-bound listener until `stop` fires. Binding is
    /// the caller's job so a taken port fails the daemon at startup.
    pub async fn serve_on(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(self.clone());

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "fan-out server listening");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await?;
        info!("fan-out server stopped");
        Ok(())
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(server): State<Arc<FanoutServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: Arc<FanoutServer>) {
    let (mut sender, mut receiver) = socket.split();

    let count = server.clients.fetch_add(1, Ordering::SeqCst) + 1;
    info!(clients = count, "fan-out client connected");

    let welcome = FanoutMessage::Welcome {
        message: "connected to prediction market live feed".to_string(),
        timestamp: server.time.now(),
        client_count: count,
    };
    if send_json(&mut sender, &welcome).await.is_err() {
        server.clients.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    let mut rx = server.tx.subscribe();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Ok(msg) => {
                        if let Err(e) = send_json(&mut sender, &msg).await {
                            debug!(error = %e, "client send failed, dropping socket");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "slow fan-out client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Ping) = serde_json::from_str(&text) {
                            let pong = FanoutMessage::Pong {
                                timestamp: server.time.now(),
                            };
                            if send_json(&mut sender, &pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "client receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let remaining = server.clients.fetch_sub(1, Ordering::SeqCst) - 1;
    info!(clients = remaining, "fan-out client disconnected");
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &FanoutMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).unwrap_or_default();
    sender.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_without_clients_reports_zero() {
        let server = FanoutServer::new(TimeService::new(chrono_tz::Asia::Taipei));
        let sent = server.broadcast(FanoutMessage::ConnectionStatus {
            connected: true,
            timestamp: server.time.now(),
        });
        assert_eq!(sent, 0);
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_queued_messages() {
        let server = FanoutServer::new(TimeService::new(chrono_tz::Asia::Taipei));
        let mut rx = server.tx.subscribe();
        let sent = server.broadcast(FanoutMessage::RoundLock {
            epoch: 9,
            timestamp: "2024-05-01 12:00:00".to_string(),
        });
        assert_eq!(sent, 1);
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, FanoutMessage::RoundLock { epoch: 9, .. }));
    }
}
