//! WebSocket broadcast relay.
//!
//! A hub holds the connected clients and relays service broadcasts to
//! all of them as JSON frames. A client is pruned on its first failed
//! send. The handshake accepts a `correlation_id` query parameter so a
//! client's frames stay correlated with its other traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::correlation;
use crate::message::Envelope;
use crate::service::ServiceError;

/// Connected WebSocket clients and the relay into them.
#[derive(Default)]
pub struct WsHub {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: AtomicU64,
}

impl WsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn register(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients.lock().await.insert(id, tx);
        id
    }

    async fn unregister(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }

    /// Number of currently connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Send a text frame to every connected client; a client whose
    /// channel is gone is pruned on this first failed send.
    pub async fn relay(&self, text: String) {
        let mut clients = self.clients.lock().await;
        let mut dead = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.send(Message::Text(text.clone().into())).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            warn!(client = id, "Pruning disconnected WebSocket client");
            clients.remove(&id);
        }
    }

    /// Relay every message matching `pattern` (typically `broadcast.>`)
    /// from the broker into the connected clients.
    pub fn attach(self: &Arc<Self>, broker: Arc<dyn Broker>, pattern: &str) -> JoinHandle<()> {
        let hub = self.clone();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut subscription = match broker.subscribe(&pattern).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "WebSocket relay failed to subscribe");
                    return;
                }
            };

            while let Some(delivery) = subscription.next().await {
                let envelope = match Envelope::decode(&delivery.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(subject = %delivery.subject, error = %e, "Skipping undecodable broadcast");
                        continue;
                    }
                };
                let frame = serde_json::json!({
                    "subject": delivery.subject,
                    "payload": envelope.payload,
                    "correlation_id": envelope.correlation_id,
                });
                hub.relay(frame.to_string()).await;
            }
        })
    }
}

/// Router exposing the hub at `GET /ws`.
pub fn router(hub: Arc<WsHub>) -> Router {
    Router::new().route("/ws", get(upgrade)).with_state(hub)
}

/// Bind `port` and serve the `/ws` endpoint until cancelled.
pub async fn serve(hub: Arc<WsHub>, port: u16) -> Result<(), ServiceError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| {
            ServiceError::Configuration(format!("failed to bind websocket port {}: {}", port, e))
        })?;
    info!(port, "WebSocket adapter listening");

    axum::serve(listener, router(hub))
        .await
        .map_err(|e| ServiceError::Configuration(format!("websocket server failed: {}", e)))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<WsHub>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let correlation_id = params
        .get("correlation_id")
        .cloned()
        .unwrap_or_else(correlation::mint);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, correlation_id))
}

async fn handle_socket(socket: WebSocket, hub: Arc<WsHub>, correlation_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = hub.register(tx).await;
    info!(client = id, correlation_id = %correlation_id, "WebSocket client connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                // Inbound frames are accepted only to keep the socket
                // alive; this surface is broadcast-out only.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unregister(id).await;
    info!(client = id, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_relay_prunes_dead_clients() {
        let hub = WsHub::new();

        let (alive_tx, mut alive_rx) = mpsc::unbounded_channel();
        hub.register(alive_tx).await;

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        hub.register(dead_tx).await;
        drop(dead_rx);

        assert_eq!(hub.client_count().await, 2);
        hub.relay("hello".to_string()).await;
        assert_eq!(hub.client_count().await, 1);

        let frame = alive_rx.recv().await.unwrap();
        assert!(matches!(frame, Message::Text(text) if text.as_str() == "hello"));
    }

    #[tokio::test]
    async fn test_attach_relays_broker_broadcasts() {
        let hub = WsHub::new();
        let broker = Arc::new(ChannelBroker::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx).await;
        hub.attach(broker.clone() as Arc<dyn Broker>, "broadcast.>");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let bytes = Envelope::with_correlation("c0ffee", serde_json::json!({"n": 1}))
            .encode()
            .unwrap();
        broker.publish("broadcast.tick", bytes).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["subject"], "broadcast.tick");
        assert_eq!(value["correlation_id"], "c0ffee");
        assert_eq!(value["payload"], serde_json::json!({"n": 1}));
    }
}
