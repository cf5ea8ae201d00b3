//! Streaming gateway
//!
//! One `GatewaySession` per client connection. Every subscribed game gets a
//! forwarder task that merges the game's live hot-cache updates and replay
//! messages into the connection's single bounded outbound queue, so order is
//! preserved per game. A full outbound queue, an overflowed cache
//! subscription or a lagging replay feed disconnects the client; nothing is
//! dropped silently. Malformed requests get an error frame and the connection
//! stays up.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc, mpsc::error::TrySendError, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::cache::{HotCache, Subscription};
use crate::models::{MessageSource, StreamMessage};
use crate::replay::ReplayEngine;

// ============================================================================
// Client protocol
// ============================================================================

#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    gid: Option<String>,
    ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
    Ping(Option<i64>),
}

pub fn parse_command(text: &str) -> Result<ClientCommand, String> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))?;

    if frame.kind.as_deref() == Some("ping") {
        return Ok(ClientCommand::Ping(frame.ts));
    }

    let gid = frame
        .gid
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty());
    match (frame.action.as_deref(), gid) {
        (Some("subscribe"), Some(gid)) => Ok(ClientCommand::Subscribe(gid)),
        (Some("unsubscribe"), Some(gid)) => Ok(ClientCommand::Unsubscribe(gid)),
        (Some("subscribe" | "unsubscribe"), None) => Err("missing gid".to_string()),
        (Some(other), _) => Err(format!("unknown action '{}'", other)),
        (None, _) => Err("missing action".to_string()),
    }
}

// ============================================================================
// Session
// ============================================================================

/// Why a session asked to be disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    OutboundOverflow,
    SubscriberOverflow,
    ReplayLagged,
}

struct Outbound {
    tx: mpsc::Sender<StreamMessage>,
    disconnect: Notify,
    reason: parking_lot::Mutex<Option<DisconnectReason>>,
}

impl Outbound {
    fn fail(&self, reason: DisconnectReason) {
        self.reason.lock().get_or_insert(reason);
        self.disconnect.notify_one();
    }

    /// Queue a frame without waiting. `false` means the forwarder should stop.
    fn push(&self, message: StreamMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.fail(DisconnectReason::OutboundOverflow);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub struct GatewaySession {
    cache: Arc<HotCache>,
    replay: Arc<ReplayEngine>,
    outbound: Arc<Outbound>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl GatewaySession {
    /// Returns the session and the receiving end of its outbound queue.
    pub fn new(
        cache: Arc<HotCache>,
        replay: Arc<ReplayEngine>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<StreamMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let session = Self {
            cache,
            replay,
            outbound: Arc::new(Outbound {
                tx,
                disconnect: Notify::new(),
                reason: parking_lot::Mutex::new(None),
            }),
            forwarders: HashMap::new(),
        };
        (session, rx)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut gids: Vec<String> = self.forwarders.keys().cloned().collect();
        gids.sort();
        gids
    }

    /// Resolves once the session must be torn down.
    pub async fn disconnected(&self) -> DisconnectReason {
        loop {
            if let Some(reason) = *self.outbound.reason.lock() {
                return reason;
            }
            self.outbound.disconnect.notified().await;
        }
    }

    pub fn handle_text(&mut self, text: &str) {
        match parse_command(text) {
            Ok(ClientCommand::Subscribe(gid)) => self.subscribe(gid),
            Ok(ClientCommand::Unsubscribe(gid)) => self.unsubscribe(&gid),
            Ok(ClientCommand::Ping(ts)) => {
                self.outbound.push(StreamMessage::pong(ts));
            }
            Err(e) => {
                debug!("Malformed client frame: {}", e);
                self.outbound.push(StreamMessage::error(e));
            }
        }
    }

    pub fn subscribe(&mut self, gid: String) {
        if self.forwarders.contains_key(&gid) {
            return;
        }
        // Both sources attach before the opening frame so nothing falls in between.
        let live = self.cache.subscribe(&gid);
        let replay = self.replay.feed(&gid);
        let opening = StreamMessage::game_state(&gid, self.cache.get(&gid).as_deref(), MessageSource::Live);
        if !self.outbound.push(opening) {
            return;
        }
        let task = tokio::spawn(forward(gid.clone(), live, replay, self.outbound.clone()));
        self.forwarders.insert(gid, task);
    }

    pub fn unsubscribe(&mut self, gid: &str) {
        if let Some(task) = self.forwarders.remove(gid) {
            task.abort();
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
    }
}

async fn forward(
    gid: String,
    mut live: Subscription,
    mut replay: broadcast::Receiver<StreamMessage>,
    outbound: Arc<Outbound>,
) {
    loop {
        tokio::select! {
            update = live.recv() => match update {
                Some(snapshot) => {
                    for message in StreamMessage::pair(&snapshot, MessageSource::Live) {
                        if !outbound.push(message) {
                            return;
                        }
                    }
                }
                None => {
                    warn!(gid = %gid, overflowed = live.overflowed(), "Live subscription closed");
                    outbound.fail(DisconnectReason::SubscriberOverflow);
                    return;
                }
            },
            message = replay.recv() => match message {
                Ok(message) => {
                    if !outbound.push(message) {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(gid = %gid, skipped, "Replay feed lagged");
                    outbound.fail(DisconnectReason::ReplayLagged);
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

// ============================================================================
// WebSocket transport
// ============================================================================

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let engine = state.engine.clone();
    let (mut sink, mut stream) = socket.split();
    let (mut session, mut outbound) = GatewaySession::new(
        engine.cache.clone(),
        engine.replay.clone(),
        engine.config.connection_buffer,
    );
    let conn_id = Uuid::new_v4();
    info!(%conn_id, "🔌 Stream client connected");

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                if sink.send(Message::Text(message.to_json())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_text(&text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(%conn_id, "Stream client error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            reason = session.disconnected() => {
                warn!(%conn_id, ?reason, subscriptions = ?session.subscriptions(), "Disconnecting slow stream client");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    drop(session);
    info!(%conn_id, "🔌 Stream client disconnected");
}
