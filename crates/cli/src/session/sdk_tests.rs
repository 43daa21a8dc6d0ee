// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use crate::broker::PermissionBroker;
use crate::error::ErrorCode;
use crate::event::{SessionEvent, SessionEventEnvelope};
use crate::session::sdk::{SdkDecision, SdkSession};
use crate::session::{PermissionMode, SessionCore, SessionVariant};
use crate::test_support::{AnyhowExt, EventCollector, ScriptedEngine};

struct Ctx {
    session: SdkSession,
    engine: Arc<ScriptedEngine>,
    events: EventCollector,
    broker: Arc<PermissionBroker>,
}

fn build() -> Ctx {
    let (event_tx, event_rx) = broadcast::channel::<SessionEventEnvelope>(256);
    let broker = Arc::new(PermissionBroker::new(event_tx.clone()));
    let core = SessionCore::new(
        "sdk1".to_owned(),
        "main".to_owned(),
        std::env::temp_dir(),
        SessionVariant::AgentSdk,
        "sonnet".to_owned(),
        PermissionMode::Approve,
        event_tx,
    );
    let engine = ScriptedEngine::new();
    let session = SdkSession::spawn(core, Arc::clone(&engine) as _, Arc::clone(&broker));
    Ctx { session, engine, events: EventCollector::new(event_rx), broker }
}

fn result_entry() -> serde_json::Value {
    json!({"type": "result", "duration_ms": 5, "session_id": "conv-sdk"})
}

#[tokio::test]
async fn announces_ready_immediately() -> anyhow::Result<()> {
    let mut ctx = build();
    let ready = ctx.events.next().await?;
    assert!(matches!(ready.event, SessionEvent::Ready { .. }));
    assert!(ctx.session.core().info().ready);
    Ok(())
}

#[tokio::test]
async fn turn_resumes_last_conversation() -> anyhow::Result<()> {
    let mut ctx = build();
    ctx.engine.script_turn(vec![result_entry()]);
    ctx.session.send("first").await.anyhow()?;
    ctx.events
        .next_matching(4, |e| matches!(e.event, SessionEvent::Result { .. }))
        .await?;

    ctx.engine.script_turn(vec![result_entry()]);
    // Busy clears asynchronously after the result.
    for _ in 0..100 {
        if !ctx.session.core().is_busy() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    ctx.session.send("second").await.anyhow()?;
    ctx.events
        .next_matching(4, |e| matches!(e.event, SessionEvent::Result { .. }))
        .await?;

    let requests = ctx.engine.requests.lock().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].resume, None);
    assert_eq!(requests[1].resume.as_deref(), Some("conv-sdk"));
    Ok(())
}

#[tokio::test]
async fn permission_callback_maps_all_three_decisions() -> anyhow::Result<()> {
    for (wire, expected) in [
        ("allow", SdkDecision::Allow),
        ("allowAlways", SdkDecision::AllowAlways),
        ("deny", SdkDecision::Deny),
    ] {
        let mut ctx = build();
        ctx.engine.script_turn(vec![
            json!({"__permission__": {"tool": "Bash", "input": {"command": "ls"}}}),
            result_entry(),
        ]);
        ctx.session.send("go").await.anyhow()?;

        let envelope = ctx
            .events
            .next_matching(4, |e| matches!(e.event, SessionEvent::PermissionRequest { .. }))
            .await?;
        let SessionEvent::PermissionRequest { request_id, .. } = envelope.event else {
            anyhow::bail!("expected permission request");
        };
        assert!(ctx.broker.respond_permission(&request_id, wire));

        ctx.events
            .next_matching(4, |e| matches!(e.event, SessionEvent::Result { .. }))
            .await?;
        let decisions = ctx.engine.decisions.lock().clone();
        assert_eq!(decisions, vec![expected], "wire decision {wire:?}");
    }
    Ok(())
}

#[tokio::test]
async fn busy_turn_rejects_second_send() -> anyhow::Result<()> {
    let ctx = build();
    // The held stream keeps the turn open.
    ctx.engine.script_turn(vec![json!({"__hold__": true})]);
    ctx.session.send("first").await.anyhow()?;
    assert_eq!(ctx.session.send("second").await, Err(ErrorCode::AgentBusy));
    assert!(ctx.session.core().is_busy());
    Ok(())
}

#[tokio::test]
async fn settings_change_without_restart() -> anyhow::Result<()> {
    let ctx = build();
    assert!(ctx.session.set_model("opus").await.anyhow()?);
    assert!(!ctx.session.set_model("opus").await.anyhow()?);
    assert!(ctx.session.set_permission_mode(PermissionMode::Plan).await.anyhow()?);
    assert!(!ctx.session.set_permission_mode(PermissionMode::Plan).await.anyhow()?);

    ctx.engine.script_turn(vec![result_entry()]);
    ctx.session.send("after change").await.anyhow()?;
    for _ in 0..100 {
        if !ctx.engine.requests.lock().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let requests = ctx.engine.requests.lock().clone();
    assert_eq!(requests[0].model, "opus");
    assert_eq!(requests[0].permission_mode, PermissionMode::Plan);
    Ok(())
}

#[tokio::test]
async fn interrupt_cancels_the_query() -> anyhow::Result<()> {
    let mut ctx = build();
    ctx.engine.script_turn(vec![json!({"__hold__": true})]);
    ctx.session.send("work").await.anyhow()?;
    // Consume the ready event so the collector starts clean.
    ctx.events
        .next_matching(4, |e| matches!(e.event, SessionEvent::Ready { .. }))
        .await
        .ok();

    ctx.session.interrupt().await.anyhow()?;
    for _ in 0..100 {
        if !ctx.session.core().is_busy() {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    anyhow::bail!("interrupt did not clear busy state")
}
