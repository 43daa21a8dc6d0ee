// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint: authentication handshake, message routing, fanout
//! egress, keepalive.
//!
//! Every socket starts auth-pending (when a token is configured) and must
//! send `auth` within 10 s. Message handling is ordered per socket by the
//! single read loop; handlers for different clients are independent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Extension, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AVAILABLE_MODELS, PERMISSION_MODES};
use crate::error::ErrorCode;
use crate::event::SessionEvent;
use crate::session::PermissionMode;
use crate::transport::auth::validate_ws_auth;
use crate::transport::fanout::OutFrame;
use crate::transport::state::Store;
use crate::transport::ws_msg::{
    session_error, session_event_to_msg, ClientMessage, ServerMessage,
};

/// Unauthenticated sockets are closed after this long.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Warning text for the `auto` permission-mode confirmation round-trip.
const AUTO_MODE_WARNING: &str =
    "auto mode approves every tool use without asking; confirm to proceed";

/// WebSocket upgrade handler.
pub async fn ws_handler(
    State(store): State<Arc<Store>>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let addr = connect
        .map(|Extension(ConnectInfo(a))| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    ws.on_upgrade(move |socket| {
        let client_id = next_client_id();
        handle_connection(store, socket, client_id, addr)
    })
}

/// Per-connection loop: writer task plus ordered reader.
async fn handle_connection(store: Arc<Store>, socket: WebSocket, client_id: String, addr: IpAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutFrame>();
    let cancel = CancellationToken::new();
    let needs_auth = store.settings.auth_required();

    store
        .hub
        .register(&client_id, addr, out_tx.clone(), cancel.clone(), !needs_auth)
        .await;

    // Writer: drains the hub-fed queue onto the socket.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutFrame::Msg(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => ws_tx.send(Message::Text(text.into())).await,
                    Err(_) => continue,
                },
                OutFrame::Ping => ws_tx.send(Message::Ping(axum::body::Bytes::new())).await,
                OutFrame::Close(reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: axum::extract::ws::close_code::POLICY,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        writer_cancel.cancel();
    });

    let auth_deadline = tokio::time::Instant::now() + AUTH_TIMEOUT;
    let mut deadline_armed = needs_auth;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = tokio::time::sleep_until(auth_deadline), if deadline_armed => {
                deadline_armed = false;
                if !store.hub.is_authenticated(&client_id).await {
                    let _ = out_tx.send(OutFrame::Msg(ServerMessage::AuthFail {
                        reason: "timeout".to_owned(),
                    }));
                    let _ = out_tx.send(OutFrame::Close("timeout".to_owned()));
                    break;
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        handle_text(&store, &client_id, &out_tx, &cancel, &text).await;
                    }
                    Message::Pong(_) => store.hub.mark_alive(&client_id).await,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    writer.abort();
    store.hub.remove(&client_id).await;
}

/// Parse one frame leniently; unknown types are logged and ignored.
async fn handle_text(
    store: &Arc<Store>,
    client_id: &str,
    out_tx: &mpsc::UnboundedSender<OutFrame>,
    cancel: &CancellationToken,
    text: &str,
) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        debug!(client_id, "dropping malformed frame");
        return;
    };
    let msg: ClientMessage = match serde_json::from_value(value.clone()) {
        Ok(msg) => msg,
        Err(_) => {
            let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("<none>");
            debug!(client_id, kind, "ignoring unknown message type");
            return;
        }
    };
    handle_client_message(store, client_id, out_tx, cancel, msg).await;
}

async fn handle_client_message(
    store: &Arc<Store>,
    client_id: &str,
    out_tx: &mpsc::UnboundedSender<OutFrame>,
    cancel: &CancellationToken,
    msg: ClientMessage,
) {
    let reply = |m: ServerMessage| {
        let _ = out_tx.send(OutFrame::Msg(m));
    };

    let msg = match msg {
        ClientMessage::Auth { token, device_info } => {
            handle_auth(store, client_id, out_tx, cancel, &token, device_info).await;
            return;
        }
        other => other,
    };

    if !store.hub.is_authenticated(client_id).await {
        reply(ServerMessage::AuthFail { reason: "invalid_token".to_owned() });
        return;
    }

    // While draining, only prompt responses get through; input earns one
    // restart notice.
    if store.is_draining()
        && !matches!(
            msg,
            ClientMessage::PermissionResponse { .. } | ClientMessage::UserQuestionResponse { .. }
        )
    {
        if matches!(msg, ClientMessage::Input { .. }) {
            reply(ServerMessage::ServerStatus {
                status: "restarting".to_owned(),
                message: Some("server is restarting; your message was not delivered".to_owned()),
            });
        }
        return;
    }

    match msg {
        // Consumed above; kept for exhaustiveness.
        ClientMessage::Auth { .. } => {}

        ClientMessage::Input { data } => {
            let Some(session_id) = store.hub.active_session(client_id).await else {
                reply(session_error(ErrorCode::UnknownSession));
                return;
            };
            if store.hub.set_primary(&session_id, client_id) {
                store
                    .hub
                    .broadcast(ServerMessage::PrimaryChanged {
                        session_id: session_id.clone(),
                        client_id: client_id.to_owned(),
                    })
                    .await;
            }
            if let Err(code) = store.manager.send(&session_id, &data).await {
                reply(session_error(code));
            }
        }

        ClientMessage::Resize { .. } => {
            // Terminal geometry is owned by the attached tmux session.
        }

        ClientMessage::Mode { mode } => {
            store.hub.set_mode(client_id, mode).await;
        }

        ClientMessage::Interrupt {} => {
            let Some(session_id) = store.hub.active_session(client_id).await else {
                return;
            };
            if let Err(code) = store.manager.interrupt(&session_id).await {
                reply(session_error(code));
            }
        }

        ClientMessage::SetModel { model } => {
            if !AVAILABLE_MODELS.contains(&model.as_str()) {
                reply(session_error(ErrorCode::BadRequest));
                return;
            }
            let Some(session_id) = store.hub.active_session(client_id).await else {
                reply(session_error(ErrorCode::UnknownSession));
                return;
            };
            match store.manager.set_model(&session_id, &model).await {
                Ok(true) => {
                    store
                        .hub
                        .broadcast(ServerMessage::ModelChanged { session_id, model })
                        .await;
                }
                Ok(false) => {}
                Err(code) => reply(session_error(code)),
            }
        }

        ClientMessage::SetPermissionMode { mode, confirmed } => {
            let Some(parsed) = PermissionMode::parse(&mode) else {
                reply(session_error(ErrorCode::BadRequest));
                return;
            };
            // Auto mode needs an explicit confirmation round-trip.
            if parsed == PermissionMode::Auto && !confirmed {
                reply(ServerMessage::ConfirmPermissionMode {
                    mode,
                    warning: AUTO_MODE_WARNING.to_owned(),
                });
                return;
            }
            let Some(session_id) = store.hub.active_session(client_id).await else {
                reply(session_error(ErrorCode::UnknownSession));
                return;
            };
            match store.manager.set_permission_mode(&session_id, parsed).await {
                Ok(true) => {
                    store
                        .hub
                        .broadcast(ServerMessage::PermissionModeChanged { session_id, mode })
                        .await;
                }
                Ok(false) => {}
                Err(code) => reply(session_error(code)),
            }
        }

        ClientMessage::PermissionResponse { request_id, decision } => {
            if !store.broker.respond_permission(&request_id, &decision) {
                debug!(client_id, request_id, "response for unknown permission refused");
            }
        }

        ClientMessage::ListSessions {} => {
            reply(ServerMessage::SessionList { sessions: store.manager.list().await });
        }

        ClientMessage::SwitchSession { session_id } => {
            if !store.manager.contains(&session_id).await {
                reply(session_error(ErrorCode::UnknownSession));
                return;
            }
            store.hub.set_active_session(client_id, &session_id).await;
            reply(ServerMessage::SessionSwitched { session_id: session_id.clone() });
            replay_history(store, out_tx, &session_id).await;
        }

        ClientMessage::CreateSession { name, cwd } => {
            match store.manager.create(name, cwd.map(Into::into)).await {
                Ok(info) => {
                    let session_id = info.id.clone();
                    store
                        .hub
                        .broadcast(ServerMessage::SessionCreated { session: info })
                        .await;
                    store.hub.set_active_session(client_id, &session_id).await;
                    reply(ServerMessage::SessionSwitched { session_id });
                }
                Err(code) => reply(session_error(code)),
            }
        }

        ClientMessage::DestroySession { session_id } => {
            match store.manager.destroy(&session_id).await {
                Ok(_) => {
                    store
                        .hub
                        .broadcast(ServerMessage::SessionDestroyed {
                            session_id: session_id.clone(),
                        })
                        .await;
                    // Stranded clients land on the first remaining session.
                    if let Some(fallback) = store.manager.first_id().await {
                        let migrated = store.hub.migrate_active(&session_id, &fallback).await;
                        for migrated_client in migrated {
                            store
                                .hub
                                .send_to(
                                    &migrated_client,
                                    ServerMessage::SessionSwitched {
                                        session_id: fallback.clone(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                Err(code) => reply(session_error(code)),
            }
        }

        ClientMessage::RenameSession { session_id, name } => {
            match store.manager.rename(&session_id, &name).await {
                Ok(_) => {
                    store
                        .hub
                        .broadcast(ServerMessage::SessionList {
                            sessions: store.manager.list().await,
                        })
                        .await;
                }
                Err(code) => reply(session_error(code)),
            }
        }

        ClientMessage::DiscoverSessions {} => {
            reply(ServerMessage::DiscoveredSessions { sessions: store.manager.discover().await });
        }

        ClientMessage::TriggerDiscovery {} => {
            let sessions = store.manager.discover().await;
            store.hub.broadcast(ServerMessage::DiscoveredSessions { sessions }).await;
            reply(ServerMessage::DiscoveryTriggered {});
        }

        ClientMessage::AttachSession { tmux_session, name } => {
            match store.manager.attach(&tmux_session, name).await {
                Ok(info) => {
                    let session_id = info.id.clone();
                    store
                        .hub
                        .broadcast(ServerMessage::SessionCreated { session: info })
                        .await;
                    store.hub.set_active_session(client_id, &session_id).await;
                    reply(ServerMessage::SessionSwitched { session_id });
                }
                Err(code) => reply(session_error(code)),
            }
        }

        ClientMessage::RegisterPushToken { token } => {
            store.hub.set_push_token(client_id, &token).await;
        }

        ClientMessage::UserQuestionResponse { answer, request_id } => {
            let delivered = match request_id {
                Some(ref rid) => store.broker.respond_question(rid, &answer),
                None => match store.hub.active_session(client_id).await {
                    Some(session_id) => {
                        store.manager.respond_to_question(&session_id, &answer).await.is_ok()
                    }
                    None => false,
                },
            };
            if !delivered {
                reply(session_error(ErrorCode::BadRequest));
            }
        }
    }
}

async fn handle_auth(
    store: &Arc<Store>,
    client_id: &str,
    out_tx: &mpsc::UnboundedSender<OutFrame>,
    _cancel: &CancellationToken,
    token: &str,
    device_info: Option<crate::transport::ws_msg::DeviceInfo>,
) {
    let reply = |m: ServerMessage| {
        let _ = out_tx.send(OutFrame::Msg(m));
    };

    if store.hub.is_authenticated(client_id).await {
        return;
    }
    let addr = store
        .hub
        .addr_of(client_id)
        .await
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    // Blocked addresses are refused before any comparison happens.
    if store.limiter.is_blocked(addr) {
        reply(ServerMessage::AuthFail { reason: "rate_limited".to_owned() });
        let _ = out_tx.send(OutFrame::Close("rate_limited".to_owned()));
        return;
    }

    if validate_ws_auth(token, store.settings.token.as_deref()).is_err() {
        let failures = store.limiter.record_failure(addr);
        warn!(client_id, %addr, failures, "auth failure");
        reply(ServerMessage::AuthFail { reason: "invalid_token".to_owned() });
        let _ = out_tx.send(OutFrame::Close("invalid_token".to_owned()));
        return;
    }

    store.limiter.record_success(addr);
    store.hub.mark_authenticated(client_id, device_info.clone()).await;

    // Post-auth snapshot.
    let sessions = store.manager.list().await;
    let active = store.manager.first_id().await;
    if let Some(ref session_id) = active {
        store.hub.set_active_session(client_id, session_id).await;
    }
    reply(ServerMessage::AuthOk {
        client_id: client_id.to_owned(),
        server_mode: store.manager.default_variant().as_str().to_owned(),
        server_version: store.version.version.clone(),
        server_commit: store.version.git_commit.clone(),
        cwd: store.settings.cwd.display().to_string(),
        connected_clients: store.hub.authenticated_count().await,
    });
    reply(ServerMessage::ServerMode {
        mode: store.manager.default_variant().as_str().to_owned(),
    });
    reply(ServerMessage::Status { connected: true });
    reply(ServerMessage::AvailableModels {
        models: AVAILABLE_MODELS.iter().map(|m| (*m).to_owned()).collect(),
    });
    reply(ServerMessage::AvailablePermissionModes {
        modes: PERMISSION_MODES.iter().map(|m| (*m).to_owned()).collect(),
    });
    reply(ServerMessage::SessionList { sessions: sessions.clone() });
    if let Some(session_id) = active {
        reply(ServerMessage::SessionSwitched { session_id: session_id.clone() });
        if let Some(info) = sessions.iter().find(|s| s.id == session_id) {
            if info.ready {
                reply(ServerMessage::ClaudeReady {
                    session_id: Some(session_id.clone()),
                    model: info.model.clone(),
                    tools: vec![],
                });
            }
        }
        replay_history(store, out_tx, &session_id).await;
    }

    store
        .hub
        .broadcast_except(
            client_id,
            ServerMessage::ClientJoined { client_id: client_id.to_owned(), device_info },
        )
        .await;
}

/// Replay the most recent turn to one client, bracketed by replay markers.
async fn replay_history(
    store: &Arc<Store>,
    out_tx: &mpsc::UnboundedSender<OutFrame>,
    session_id: &str,
) {
    let events = store.manager.replay_tail(session_id).await;
    let _ = out_tx.send(OutFrame::Msg(ServerMessage::HistoryReplayStart {
        session_id: session_id.to_owned(),
    }));
    for event in events {
        if matches!(event, SessionEvent::Raw { .. }) {
            continue;
        }
        let _ = out_tx.send(OutFrame::Msg(session_event_to_msg(session_id, event)));
    }
    let _ = out_tx.send(OutFrame::Msg(ServerMessage::HistoryReplayEnd {
        session_id: session_id.to_owned(),
    }));
}

/// Unique-enough id for client tracking (not security-sensitive).
fn next_client_id() -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("ws-{ts:x}-{n}")
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
