// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client bookkeeping and event fanout.
//!
//! The hub subscribes once to the manager's session-event bus and tags every
//! outgoing message with its `sessionId`. Stream deltas are coalesced per
//! `(sessionId, messageId)` — never keyed by messageId alone, since sessions
//! allocate message ids independently — and flushed every 50 ms or, to keep
//! per-session ordering intact, whenever a non-delta event for the same
//! session goes out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{now_ms, SessionEvent, SessionEventEnvelope};
use crate::transport::ws_msg::{session_event_to_msg, DeviceInfo, ServerMessage, ViewMode};

/// Coalescing flush interval.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Keepalive scan interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Frames pushed to a client's writer task.
#[derive(Debug, Clone)]
pub enum OutFrame {
    Msg(ServerMessage),
    Ping,
    /// Close the socket with the given reason after flushing.
    Close(String),
}

struct ClientEntry {
    tx: mpsc::UnboundedSender<OutFrame>,
    cancel: CancellationToken,
    authenticated: bool,
    mode: ViewMode,
    active_session: String,
    alive: bool,
    device: Option<DeviceInfo>,
    addr: IpAddr,
    // Recorded for diagnostics; not consulted on any hot path.
    #[allow(dead_code)]
    authenticated_at: Option<u64>,
    #[allow(dead_code)]
    push_token: Option<String>,
}

/// Connected-client registry plus the fanout and keepalive loops.
pub struct ClientHub {
    clients: RwLock<HashMap<String, ClientEntry>>,
    /// session id → last client that wrote to it. UI hint only.
    primary: Mutex<HashMap<String, String>>,
    /// (session id, message id) → accumulated delta text.
    deltas: Mutex<IndexMap<(String, String), String>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            primary: Mutex::new(HashMap::new()),
            deltas: Mutex::new(IndexMap::new()),
        }
    }

    /// Register a socket. Clients start auth-pending unless auth is off.
    pub async fn register(
        &self,
        client_id: &str,
        addr: IpAddr,
        tx: mpsc::UnboundedSender<OutFrame>,
        cancel: CancellationToken,
        authenticated: bool,
    ) {
        let entry = ClientEntry {
            tx,
            cancel,
            authenticated,
            mode: ViewMode::default(),
            active_session: String::new(),
            alive: true,
            device: None,
            addr,
            authenticated_at: authenticated.then(now_ms),
            push_token: None,
        };
        self.clients.write().await.insert(client_id.to_owned(), entry);
    }

    /// Drop a client; announces `client_left` if it had authenticated.
    pub async fn remove(&self, client_id: &str) {
        let was_authed = {
            let mut clients = self.clients.write().await;
            clients.remove(client_id).map(|e| e.authenticated).unwrap_or(false)
        };
        self.primary.lock().retain(|_, c| c != client_id);
        if was_authed {
            self.broadcast(ServerMessage::ClientLeft { client_id: client_id.to_owned() }).await;
        }
    }

    pub async fn mark_authenticated(&self, client_id: &str, device: Option<DeviceInfo>) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(client_id) {
            entry.authenticated = true;
            entry.authenticated_at = Some(now_ms());
            entry.device = device;
        }
    }

    pub async fn is_authenticated(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|e| e.authenticated)
            .unwrap_or(false)
    }

    pub async fn set_mode(&self, client_id: &str, mode: ViewMode) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.mode = mode;
        }
    }

    pub async fn set_active_session(&self, client_id: &str, session_id: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.active_session = session_id.to_owned();
        }
    }

    pub async fn active_session(&self, client_id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|e| e.active_session.clone())
            .filter(|s| !s.is_empty())
    }

    pub async fn set_push_token(&self, client_id: &str, token: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.push_token = Some(token.to_owned());
        }
    }

    pub async fn mark_alive(&self, client_id: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.alive = true;
        }
    }

    pub async fn device_info(&self, client_id: &str) -> Option<DeviceInfo> {
        self.clients.read().await.get(client_id).and_then(|e| e.device.clone())
    }

    pub async fn addr_of(&self, client_id: &str) -> Option<IpAddr> {
        self.clients.read().await.get(client_id).map(|e| e.addr)
    }

    pub async fn authenticated_count(&self) -> usize {
        self.clients.read().await.values().filter(|e| e.authenticated).count()
    }

    /// Move clients off a destroyed session onto the fallback.
    pub async fn migrate_active(&self, from: &str, to: &str) -> Vec<String> {
        let mut migrated = vec![];
        let mut clients = self.clients.write().await;
        for (id, entry) in clients.iter_mut() {
            if entry.active_session == from {
                entry.active_session = to.to_owned();
                migrated.push(id.clone());
            }
        }
        migrated
    }

    /// Record the last writer of a session; returns true when it changed.
    pub fn set_primary(&self, session_id: &str, client_id: &str) -> bool {
        let mut primary = self.primary.lock();
        let prev = primary.insert(session_id.to_owned(), client_id.to_owned());
        prev.as_deref() != Some(client_id)
    }

    /// Deliver to every authenticated client.
    pub async fn broadcast(&self, msg: ServerMessage) {
        let clients = self.clients.read().await;
        for entry in clients.values().filter(|e| e.authenticated) {
            let _ = entry.tx.send(OutFrame::Msg(msg.clone()));
        }
    }

    /// Deliver to every authenticated client except one.
    pub async fn broadcast_except(&self, skip: &str, msg: ServerMessage) {
        let clients = self.clients.read().await;
        for (id, entry) in clients.iter().filter(|(_, e)| e.authenticated) {
            if id != skip {
                let _ = entry.tx.send(OutFrame::Msg(msg.clone()));
            }
        }
    }

    pub async fn send_to(&self, client_id: &str, msg: ServerMessage) {
        let clients = self.clients.read().await;
        if let Some(entry) = clients.get(client_id) {
            let _ = entry.tx.send(OutFrame::Msg(msg));
        }
    }

    /// Route one session event to the right clients.
    pub async fn dispatch(&self, envelope: SessionEventEnvelope) {
        let session_id = envelope.session_id;
        match envelope.event {
            SessionEvent::Raw { data } => self.dispatch_raw(&session_id, data).await,
            SessionEvent::StreamDelta { message_id, delta } => {
                self.deltas
                    .lock()
                    .entry((session_id, message_id))
                    .or_default()
                    .push_str(&delta);
            }
            SessionEvent::StreamEnd { message_id } => {
                // Flush before the end marker so no delta trails its stream.
                self.flush_session(&session_id).await;
                self.broadcast(ServerMessage::StreamEnd { session_id, message_id }).await;
            }
            event => {
                self.flush_session(&session_id).await;
                self.broadcast(session_event_to_msg(&session_id, event)).await;
            }
        }
    }

    /// Raw frames: terminal-mode viewers of the session get `raw`; chat-mode
    /// viewers of the same session get `raw_background`; everyone else gets
    /// nothing.
    async fn dispatch_raw(&self, session_id: &str, data: String) {
        let clients = self.clients.read().await;
        for entry in clients.values().filter(|e| e.authenticated) {
            if entry.active_session != session_id {
                continue;
            }
            let msg = match entry.mode {
                ViewMode::Terminal => ServerMessage::Raw {
                    session_id: session_id.to_owned(),
                    data: data.clone(),
                },
                ViewMode::Chat => ServerMessage::RawBackground {
                    session_id: session_id.to_owned(),
                    data: data.clone(),
                },
            };
            let _ = entry.tx.send(OutFrame::Msg(msg));
        }
    }

    /// Flush buffered deltas for one session, preserving buffer order.
    async fn flush_session(&self, session_id: &str) {
        let drained: Vec<((String, String), String)> = {
            let mut deltas = self.deltas.lock();
            let keys: Vec<(String, String)> = deltas
                .keys()
                .filter(|(sid, _)| sid == session_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| deltas.shift_remove(&k).map(|v| (k, v)))
                .collect()
        };
        for ((sid, message_id), delta) in drained {
            self.broadcast(ServerMessage::StreamDelta { session_id: sid, message_id, delta })
                .await;
        }
    }

    /// Flush every buffered delta (the periodic 50 ms tick).
    pub async fn flush_all(&self) {
        let drained: Vec<((String, String), String)> = {
            let mut deltas = self.deltas.lock();
            deltas.drain(..).collect()
        };
        for ((session_id, message_id), delta) in drained {
            self.broadcast(ServerMessage::StreamDelta { session_id, message_id, delta }).await;
        }
    }

    /// Fanout loop: consumes the session-event bus and ticks the coalescer.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SessionEventEnvelope>,
        shutdown: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.flush_all().await,
                event = events.recv() => match event {
                    Ok(envelope) => self.dispatch(envelope).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "fanout lagged behind session bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Keepalive loop: ping authenticated clients; terminate the unresponsive.
    ///
    /// The client set is snapshotted before scanning so concurrent joins and
    /// leaves are neither missed nor double-processed.
    pub async fn run_keepalive(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            let snapshot: Vec<String> = {
                let clients = self.clients.read().await;
                clients
                    .iter()
                    .filter(|(_, e)| e.authenticated)
                    .map(|(id, _)| id.clone())
                    .collect()
            };

            let mut dead = vec![];
            {
                let mut clients = self.clients.write().await;
                for id in &snapshot {
                    let Some(entry) = clients.get_mut(id) else {
                        continue;
                    };
                    if !entry.alive {
                        entry.cancel.cancel();
                        dead.push(id.clone());
                    } else {
                        entry.alive = false;
                        let _ = entry.tx.send(OutFrame::Ping);
                    }
                }
            }
            for id in dead {
                debug!(client_id = %id, "keepalive failed, dropping client");
                self.remove(&id).await;
            }
        }
    }
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
