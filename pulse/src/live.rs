//! Live push hub.
//!
//! One registry task owns the client set and is driven entirely through a
//! control channel: register, unregister, broadcast. Producers marshal an
//! event envelope once and hand it off without blocking; each client owns a
//! bounded outbound queue and is evicted the moment it cannot keep up.
//! Clients choose channels by sending `{"channels": ["error", ...]}`; no
//! subscriptions means everything.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::Pulse;

/// Per-client outbound queue depth; a full queue evicts the client.
const CLIENT_QUEUE: usize = 256;
/// Control channel depth shared by all producers.
const CONTROL_QUEUE: usize = 1_024;
/// Largest accepted inbound message (subscriptions only).
const MAX_MESSAGE_SIZE: usize = 1_024;
/// Idle read deadline, refreshed by any inbound frame including pongs.
const READ_DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);
/// Per-frame write deadline.
const WRITE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);
/// Keepalive ping cadence.
const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Event channels a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveChannel {
    Overview,
    Request,
    Error,
    Health,
    Alert,
    Runtime,
}

impl LiveChannel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overview => "overview",
            Self::Request => "request",
            Self::Error => "error",
            Self::Health => "health",
            Self::Alert => "alert",
            Self::Runtime => "runtime",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overview" => Some(Self::Overview),
            "request" => Some(Self::Request),
            "error" => Some(Self::Error),
            "health" => Some(Self::Health),
            "alert" => Some(Self::Alert),
            "runtime" => Some(Self::Runtime),
            _ => None,
        }
    }
}

type Subscriptions = Arc<StdRwLock<HashSet<LiveChannel>>>;

pub(crate) struct ClientHandle {
    tx: mpsc::Sender<String>,
    subscriptions: Subscriptions,
}

pub(crate) enum HubCommand {
    Register {
        id: u64,
        client: ClientHandle,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        channel: LiveChannel,
        frame: String,
    },
}

/// Producer-facing half of the hub.
pub struct LiveHub {
    control: mpsc::Sender<HubCommand>,
    next_id: AtomicU64,
    clients: Arc<AtomicUsize>,
}

impl LiveHub {
    /// Build the hub; the caller spawns [`registry_loop`] with the receiver.
    pub(crate) fn new() -> (Self, mpsc::Receiver<HubCommand>) {
        let (control, rx) = mpsc::channel(CONTROL_QUEUE);
        (
            Self {
                control,
                next_id: AtomicU64::new(1),
                clients: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Marshal `payload` into the event envelope once and fan it out.
    /// Non-blocking; the event is dropped if the control queue is full.
    pub fn broadcast(&self, channel: LiveChannel, payload: serde_json::Value) {
        let envelope = serde_json::json!({
            "type": channel.as_str(),
            "payload": payload,
            "timestamp": Utc::now(),
        });
        let frame = envelope.to_string();
        if self
            .control
            .try_send(HubCommand::Broadcast { channel, frame })
            .is_err()
        {
            debug!(channel = channel.as_str(), "Live hub control queue full, event dropped");
        }
    }

    fn register(&self, client: ClientHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.control.try_send(HubCommand::Register { id, client });
        id
    }

    fn unregister(&self, id: u64) {
        let _ = self.control.try_send(HubCommand::Unregister { id });
    }

    pub(crate) fn registry_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.clients)
    }
}

/// The single task that owns the client registry.
pub(crate) async fn registry_loop(
    mut control: mpsc::Receiver<HubCommand>,
    clients_gauge: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut clients: HashMap<u64, ClientHandle> = HashMap::new();

    loop {
        let command = tokio::select! {
            () = cancel.cancelled() => break,
            command = control.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            HubCommand::Register { id, client } => {
                clients.insert(id, client);
                clients_gauge.store(clients.len(), Ordering::Relaxed);
            }
            HubCommand::Unregister { id } => {
                clients.remove(&id);
                clients_gauge.store(clients.len(), Ordering::Relaxed);
            }
            HubCommand::Broadcast { channel, frame } => {
                let mut evict = Vec::new();
                for (id, client) in &clients {
                    let wants = {
                        let subs = client
                            .subscriptions
                            .read()
                            .unwrap_or_else(|e| e.into_inner());
                        subs.is_empty() || subs.contains(&channel)
                    };
                    if wants && client.tx.try_send(frame.clone()).is_err() {
                        // Slow or gone; dropping the sender closes its
                        // writer loop and the socket with it.
                        evict.push(*id);
                    }
                }
                for id in evict {
                    debug!(client = id, "Evicting slow live client");
                    clients.remove(&id);
                }
                clients_gauge.store(clients.len(), Ordering::Relaxed);
            }
        }
    }
}

// ============================================================================
// WebSocket endpoint
// ============================================================================

/// Inbound subscription message.
#[derive(Debug, Deserialize)]
struct Subscribe {
    channels: Vec<String>,
}

/// `GET <prefix>/ws/live` upgrade handler.
pub async fn ws_live(State(pulse): State<Arc<Pulse>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| client_session(pulse, socket))
}

/// Drive one connected client: a writer task drains the outbound queue and
/// pings on a timer; the reader loop (this task) handles subscription
/// updates under an idle deadline.
async fn client_session(pulse: Arc<Pulse>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_QUEUE);
    let subscriptions: Subscriptions = Arc::new(StdRwLock::new(HashSet::new()));

    let id = pulse.hub().register(ClientHandle {
        tx,
        subscriptions: Arc::clone(&subscriptions),
    });
    debug!(client = id, "Live client connected");

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let send = sink.send(Message::Text(frame.into()));
                    match tokio::time::timeout(WRITE_DEADLINE, send).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = ping.tick() => {
                    let send = sink.send(Message::Ping(Vec::new().into()));
                    match tokio::time::timeout(WRITE_DEADLINE, send).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    loop {
        let next = tokio::time::timeout(READ_DEADLINE, stream.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(subscribe) = serde_json::from_str::<Subscribe>(&text) {
                    let parsed: HashSet<LiveChannel> = subscribe
                        .channels
                        .iter()
                        .filter_map(|s| LiveChannel::parse(s))
                        .collect();
                    *subscriptions.write().unwrap_or_else(|e| e.into_inner()) = parsed;
                }
            }
            // Pongs and pings refresh the idle deadline by arriving.
            Ok(Some(Ok(Message::Pong(_) | Message::Ping(_) | Message::Binary(_)))) => {}
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) | Err(_) => break,
        }
    }

    pulse.hub().unregister(id);
    writer.abort();
    debug!(client = id, "Live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        for channel in [
            LiveChannel::Overview,
            LiveChannel::Request,
            LiveChannel::Error,
            LiveChannel::Health,
            LiveChannel::Alert,
            LiveChannel::Runtime,
        ] {
            assert_eq!(LiveChannel::parse(channel.as_str()), Some(channel));
        }
        assert_eq!(LiveChannel::parse("nope"), None);
    }

    #[tokio::test]
    async fn broadcast_respects_subscriptions() {
        let (hub, control) = LiveHub::new();
        let cancel = CancellationToken::new();
        let registry = tokio::spawn(registry_loop(
            control,
            hub.registry_counter(),
            cancel.clone(),
        ));

        // One client subscribed to errors only, one to everything.
        let (error_tx, mut error_rx) = mpsc::channel(8);
        let error_subs: Subscriptions = Arc::new(StdRwLock::new(
            [LiveChannel::Error].into_iter().collect(),
        ));
        hub.register(ClientHandle {
            tx: error_tx,
            subscriptions: error_subs,
        });

        let (all_tx, mut all_rx) = mpsc::channel(8);
        hub.register(ClientHandle {
            tx: all_tx,
            subscriptions: Arc::new(StdRwLock::new(HashSet::new())),
        });

        hub.broadcast(LiveChannel::Request, serde_json::json!({"status": 200}));
        hub.broadcast(LiveChannel::Error, serde_json::json!({"message": "boom"}));

        // The filtered client sees only the error frame.
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), error_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["payload"]["message"], "boom");
        assert!(envelope["timestamp"].is_string());
        assert!(error_rx.try_recv().is_err());

        // The unfiltered client sees both.
        let mut seen = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(1), all_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let envelope: serde_json::Value = serde_json::from_str(&frame).unwrap();
            seen.push(envelope["type"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["request", "error"]);

        cancel.cancel();
        registry.await.unwrap();
    }

    #[tokio::test]
    async fn slow_client_is_evicted() {
        let (hub, control) = LiveHub::new();
        let cancel = CancellationToken::new();
        let gauge = hub.registry_counter();
        let registry = tokio::spawn(registry_loop(control, Arc::clone(&gauge), cancel.clone()));

        // Queue of one that nobody drains.
        let (tx, _rx) = mpsc::channel(1);
        hub.register(ClientHandle {
            tx,
            subscriptions: Arc::new(StdRwLock::new(HashSet::new())),
        });

        hub.broadcast(LiveChannel::Request, serde_json::json!({}));
        hub.broadcast(LiveChannel::Request, serde_json::json!({}));

        // Give the registry a moment to process.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hub.client_count(), 0);

        cancel.cancel();
        registry.await.unwrap();
    }
}
