// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::{SessionEvent, SessionEventEnvelope};
use crate::transport::fanout::{ClientHub, OutFrame};
use crate::transport::ws_msg::{ServerMessage, ViewMode};

fn addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

async fn client(
    hub: &Arc<ClientHub>,
    id: &str,
    authed: bool,
) -> mpsc::UnboundedReceiver<OutFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    hub.register(id, addr(), tx, CancellationToken::new(), authed).await;
    rx
}

fn drain_msgs(rx: &mut mpsc::UnboundedReceiver<OutFrame>) -> Vec<ServerMessage> {
    let mut out = vec![];
    while let Ok(frame) = rx.try_recv() {
        if let OutFrame::Msg(msg) = frame {
            out.push(msg);
        }
    }
    out
}

fn envelope(session: &str, event: SessionEvent) -> SessionEventEnvelope {
    SessionEventEnvelope { session_id: session.to_owned(), event }
}

fn delta(session: &str, message: &str, text: &str) -> SessionEventEnvelope {
    envelope(
        session,
        SessionEvent::StreamDelta { message_id: message.to_owned(), delta: text.to_owned() },
    )
}

#[tokio::test]
async fn adjacent_deltas_coalesce_per_session_and_message() -> anyhow::Result<()> {
    let hub = Arc::new(ClientHub::new());
    let mut rx = client(&hub, "c1", true).await;

    for _ in 0..10 {
        hub.dispatch(delta("s1", "msg-3", "a")).await;
    }
    // Same message id in another session must not merge into s1's buffer.
    hub.dispatch(delta("s2", "msg-3", "b")).await;
    hub.dispatch(envelope("s1", SessionEvent::StreamEnd { message_id: "msg-3".to_owned() }))
        .await;
    hub.flush_all().await;

    let msgs = drain_msgs(&mut rx);
    assert_eq!(msgs.len(), 3);
    assert!(matches!(
        &msgs[0],
        ServerMessage::StreamDelta { session_id, message_id, delta }
            if session_id == "s1" && message_id == "msg-3" && delta == "aaaaaaaaaa"
    ));
    assert!(matches!(
        &msgs[1],
        ServerMessage::StreamEnd { session_id, message_id }
            if session_id == "s1" && message_id == "msg-3"
    ));
    assert!(matches!(
        &msgs[2],
        ServerMessage::StreamDelta { session_id, delta, .. }
            if session_id == "s2" && delta == "b"
    ));
    Ok(())
}

#[tokio::test]
async fn non_delta_events_flush_pending_deltas_first() -> anyhow::Result<()> {
    let hub = Arc::new(ClientHub::new());
    let mut rx = client(&hub, "c1", true).await;

    hub.dispatch(delta("s1", "m1", "partial")).await;
    hub.dispatch(envelope(
        "s1",
        SessionEvent::Result { cost: None, duration: None, usage: None },
    ))
    .await;

    let msgs = drain_msgs(&mut rx);
    assert!(matches!(&msgs[0], ServerMessage::StreamDelta { delta, .. } if delta == "partial"));
    assert!(matches!(&msgs[1], ServerMessage::Result { .. }));
    Ok(())
}

#[tokio::test]
async fn raw_frames_gate_on_mode_and_active_session() -> anyhow::Result<()> {
    let hub = Arc::new(ClientHub::new());
    let mut terminal_viewer = client(&hub, "terminal-viewer", true).await;
    let mut chat_viewer = client(&hub, "chat-viewer", true).await;
    let mut elsewhere = client(&hub, "elsewhere", true).await;

    hub.set_mode("terminal-viewer", ViewMode::Terminal).await;
    hub.set_active_session("terminal-viewer", "s1").await;
    hub.set_mode("chat-viewer", ViewMode::Chat).await;
    hub.set_active_session("chat-viewer", "s1").await;
    hub.set_mode("elsewhere", ViewMode::Terminal).await;
    hub.set_active_session("elsewhere", "s2").await;

    hub.dispatch(envelope("s1", SessionEvent::Raw { data: "Zm9v".to_owned() })).await;

    let t = drain_msgs(&mut terminal_viewer);
    assert_eq!(t.len(), 1);
    assert!(matches!(&t[0], ServerMessage::Raw { session_id, data } if session_id == "s1" && data == "Zm9v"));

    let c = drain_msgs(&mut chat_viewer);
    assert_eq!(c.len(), 1);
    assert!(matches!(&c[0], ServerMessage::RawBackground { .. }));

    assert!(drain_msgs(&mut elsewhere).is_empty());
    Ok(())
}

#[tokio::test]
async fn unauthenticated_clients_receive_nothing() -> anyhow::Result<()> {
    let hub = Arc::new(ClientHub::new());
    let mut rx = client(&hub, "pending", false).await;

    hub.broadcast(ServerMessage::DiscoveryTriggered {}).await;
    hub.dispatch(envelope("s1", SessionEvent::PlanStarted)).await;
    assert!(drain_msgs(&mut rx).is_empty());

    hub.mark_authenticated("pending", None).await;
    hub.broadcast(ServerMessage::DiscoveryTriggered {}).await;
    assert_eq!(drain_msgs(&mut rx).len(), 1);
    Ok(())
}

#[tokio::test]
async fn remove_announces_client_left_to_others() -> anyhow::Result<()> {
    let hub = Arc::new(ClientHub::new());
    let mut stayer = client(&hub, "stayer", true).await;
    let _leaver = client(&hub, "leaver", true).await;

    hub.remove("leaver").await;
    let msgs = drain_msgs(&mut stayer);
    assert!(msgs
        .iter()
        .any(|m| matches!(m, ServerMessage::ClientLeft { client_id } if client_id == "leaver")));
    Ok(())
}

#[tokio::test]
async fn migrate_active_moves_stranded_clients() -> anyhow::Result<()> {
    let hub = Arc::new(ClientHub::new());
    let _a = client(&hub, "a", true).await;
    let _b = client(&hub, "b", true).await;
    hub.set_active_session("a", "doomed").await;
    hub.set_active_session("b", "other").await;

    let migrated = hub.migrate_active("doomed", "fallback").await;
    assert_eq!(migrated, vec!["a".to_owned()]);
    assert_eq!(hub.active_session("a").await.as_deref(), Some("fallback"));
    assert_eq!(hub.active_session("b").await.as_deref(), Some("other"));
    Ok(())
}

#[test]
fn primary_map_is_last_writer_wins() {
    let hub = ClientHub::new();
    assert!(hub.set_primary("s1", "c1"));
    assert!(!hub.set_primary("s1", "c1"), "same writer is not a change");
    assert!(hub.set_primary("s1", "c2"));
}
