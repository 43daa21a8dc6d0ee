// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum_test::TestServer;
use serde_json::{json, Value};

use crate::event::SessionEvent;
use crate::test_support::{test_store, AnyhowExt, EventCollector};
use crate::transport::build_router;
use crate::transport::http::PERMISSION_BODY_CAP;

#[tokio::test]
async fn health_is_unauthenticated() -> anyhow::Result<()> {
    let ctx = test_store(Some("secret123"));
    let server = TestServer::new(build_router(ctx.store)).anyhow()?;

    for path in ["/", "/health"] {
        let response = server.get(path).await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "headless");
    }
    Ok(())
}

#[tokio::test]
async fn version_requires_bearer() -> anyhow::Result<()> {
    let ctx = test_store(Some("secret123"));
    let server = TestServer::new(build_router(ctx.store)).anyhow()?;

    let response = server.get("/version").await;
    response.assert_status(axum::http::StatusCode::FORBIDDEN);

    let response = server
        .get("/version")
        .add_header("authorization", "Bearer secret123")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["version"].is_string());
    assert!(body["uptime"].is_number());
    Ok(())
}

#[tokio::test]
async fn permission_hook_denies_without_bearer() -> anyhow::Result<()> {
    let ctx = test_store(Some("secret123"));
    let server = TestServer::new(build_router(ctx.store)).anyhow()?;

    let response = server
        .post("/permission")
        .json(&json!({"tool_name": "Bash", "tool_input": {}}))
        .await;
    response.assert_status(axum::http::StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["decision"], "deny");
    Ok(())
}

#[tokio::test]
async fn permission_hook_denies_malformed_and_sessionless() -> anyhow::Result<()> {
    let ctx = test_store(Some("secret123"));
    let server = TestServer::new(build_router(ctx.store)).anyhow()?;

    // Malformed body: conservative deny.
    let response = server
        .post("/permission")
        .add_header("authorization", "Bearer secret123")
        .text("not json")
        .await;
    let body: Value = response.json();
    assert_eq!(body["decision"], "deny");

    // No session to own the prompt: deny.
    let response = server
        .post("/permission")
        .add_header("authorization", "Bearer secret123")
        .json(&json!({"tool_name": "Bash", "tool_input": {}}))
        .await;
    let body: Value = response.json();
    assert_eq!(body["decision"], "deny");
    Ok(())
}

#[tokio::test]
async fn oversize_body_is_413_deny() -> anyhow::Result<()> {
    let ctx = test_store(Some("secret123"));
    let server = TestServer::new(build_router(ctx.store)).anyhow()?;

    let big = "x".repeat(PERMISSION_BODY_CAP + 1);
    let response = server
        .post("/permission")
        .add_header("authorization", "Bearer secret123")
        .text(big)
        .await;
    response.assert_status(axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json();
    assert_eq!(body["decision"], "deny");
    Ok(())
}

#[tokio::test]
async fn hook_holds_until_client_decision() -> anyhow::Result<()> {
    let ctx = test_store(Some("secret123"));
    ctx.store.manager.create(Some("main".to_owned()), None).await.anyhow()?;
    let mut events = EventCollector::new(ctx.store.manager.subscribe());
    let store = std::sync::Arc::clone(&ctx.store);
    let server = TestServer::new(build_router(std::sync::Arc::clone(&ctx.store))).anyhow()?;

    // Resolve the prompt as soon as it surfaces on the event bus.
    let resolver = tokio::spawn(async move {
        let envelope = events
            .next_matching(4, |e| matches!(e.event, SessionEvent::PermissionRequest { .. }))
            .await?;
        let SessionEvent::PermissionRequest { request_id, description, .. } = envelope.event
        else {
            anyhow::bail!("wrong event");
        };
        assert_eq!(description, "open /etc/hosts");
        assert!(store.broker.respond_permission(&request_id, "allow"));
        Ok::<(), anyhow::Error>(())
    });

    let response = server
        .post("/permission")
        .add_header("authorization", "Bearer secret123")
        .json(&json!({
            "tool_name": "Bash",
            "tool_input": {"command": "open /etc/hosts"},
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["decision"], "allow");

    resolver.await.anyhow()??;
    assert_eq!(ctx.store.broker.pending_count(), 0);
    Ok(())
}
